//! # SSE Parser
//!
//! Turns a chunked HTTP body into the `data:` payloads of its Server-Sent
//! Events. All four backend families stream this way.
//!
//! - Lines are buffered across chunk boundaries
//! - Empty lines, `:` comments and other fields are skipped
//! - `[DONE]` markers are dropped
//! - A final unterminated line is still delivered

use agent_core::error::AgentError;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tracing::warn;

/// Parse SSE lines from a byte stream and yield data payloads.
///
/// A read error is yielded once as [`AgentError::Transport`] and ends the stream.
pub fn parse_sse_lines<S, E>(byte_stream: S) -> impl Stream<Item = Result<String, AgentError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send + 'static,
{
    futures::stream::unfold(
        (byte_stream, BytesMut::with_capacity(8192), false),
        |(mut stream, mut buffer, done)| async move {
            if done {
                return None;
            }

            loop {
                if let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                    let mut line = buffer.split_to(newline_pos + 1);
                    line.truncate(line.len() - 1);
                    if line.last() == Some(&b'\r') {
                        line.truncate(line.len() - 1);
                    }

                    let Ok(line) = std::str::from_utf8(&line) else {
                        continue;
                    };
                    if let Some(data) = extract_sse_data(line) {
                        return Some((Ok(data), (stream, buffer, false)));
                    }
                    continue;
                }

                match stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        warn!(error = %e, "SSE stream read error");
                        let err = AgentError::Transport(format!("stream read failed: {e}"));
                        return Some((Err(err), (stream, buffer, true)));
                    }
                    None => {
                        let data = std::str::from_utf8(&buffer).ok().and_then(extract_sse_data);
                        buffer.clear();
                        return data.map(|d| (Ok(d), (stream, buffer, true)));
                    }
                }
            }
        },
    )
}

/// Data payload of one SSE line, if it carries one
fn extract_sse_data(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }

    let data = trimmed.strip_prefix("data:")?.trim_start();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(data.to_string())
}
