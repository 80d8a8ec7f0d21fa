//! reqwest-backed [`Transport`]
//!
//! Sends the [`HttpRequestSpec`]s built by the adapters. Non-success statuses
//! become [`AgentError::Protocol`] carrying the body text; streaming bodies
//! go through the SSE parser and come out as JSON events.
//!
//! `timeout_secs` bounds a whole non-streaming call. For a stream it bounds
//! the wait for response headers and every gap between body chunks, so a long
//! but live stream is never cut.

use std::time::Duration;

use agent_core::error::{AgentError, Result};
use agent_core::provider::{HttpMethod, HttpRequestSpec, RawEventStream, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::debug;

use crate::sse::parse_sse_lines;

/// HTTP transport over a shared `reqwest::Client`
#[derive(Clone, Debug, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured client (proxies, TLS roots, pools)
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build(&self, spec: &HttpRequestSpec) -> reqwest::RequestBuilder {
        let mut builder = match spec.method {
            HttpMethod::Get => self.client.get(&spec.url),
            HttpMethod::Post => self.client.post(&spec.url),
        };
        for (name, value) in &spec.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if spec.stream && spec.header_value("accept").is_none() {
            builder = builder.header("Accept", "text/event-stream");
        }
        if let Some(body) = &spec.body {
            builder = builder.json(body);
        }
        if let (Some(secs), false) = (spec.timeout_secs, spec.stream) {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        builder
    }

    async fn execute(&self, spec: &HttpRequestSpec) -> Result<reqwest::Response> {
        debug!(url = %spec.url, stream = spec.stream, "sending backend request");
        let pending = self.build(spec).send();
        let response = match (spec.stream, spec.timeout_secs) {
            (true, Some(secs)) => tokio::time::timeout(Duration::from_secs(secs), pending)
                .await
                .map_err(|_| AgentError::Transport(format!("no response headers within {secs}s")))?,
            _ => pending.await,
        }
        .map_err(transport_error)?;
        check_status(response).await
    }
}

fn transport_error(err: reqwest::Error) -> AgentError {
    if err.is_timeout() {
        AgentError::Transport(format!("request timed out: {err}"))
    } else {
        AgentError::Transport(err.to_string())
    }
}

/// Fail the body stream when no chunk arrives within `idle`
fn idle_timeout<S, E>(body: S, idle: Duration) -> impl Stream<Item = Result<Bytes>> + Send + 'static
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + 'static,
{
    tokio_stream::StreamExt::timeout(body, idle).map(move |item| match item {
        Ok(chunk) => chunk.map_err(|e| AgentError::Transport(e.to_string())),
        Err(_) => Err(AgentError::Transport(format!(
            "backend sent nothing for {}s",
            idle.as_secs_f32()
        ))),
    })
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(AgentError::Protocol { status, body })
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: HttpRequestSpec) -> Result<Value> {
        let response = self.execute(&request).await?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| AgentError::MalformedResponse(e.to_string()))
    }

    async fn stream(&self, request: HttpRequestSpec) -> Result<RawEventStream> {
        let response = self.execute(&request).await?;
        let body = response.bytes_stream();
        let bytes: futures::stream::BoxStream<'static, Result<Bytes>> = match request.timeout_secs {
            Some(secs) => Box::pin(idle_timeout(body, Duration::from_secs(secs))),
            None => Box::pin(body.map(|chunk| chunk.map_err(transport_error))),
        };
        let events = parse_sse_lines(bytes).filter_map(|item| async move {
            match item {
                Ok(data) => match serde_json::from_str::<Value>(&data) {
                    Ok(value) => Some(Ok(value)),
                    Err(e) => {
                        debug!(error = %e, "dropping undecodable stream event");
                        None
                    }
                },
                Err(e) => Some(Err(e)),
            }
        });
        Ok(Box::pin(events))
    }
}
