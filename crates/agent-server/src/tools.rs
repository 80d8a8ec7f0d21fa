//! Workspace Tools
//!
//! File tools rooted at one directory. Paths are workspace-relative; absolute
//! paths and `..` segments are refused before touching the filesystem.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use agent_core::error::{AgentError, Result};
use agent_core::tool::{Tool, ToolContext, ToolDeclaration, ToolRegistry};
use async_trait::async_trait;
use serde_json::{json, Value};

/// Largest file `read_file` returns
const MAX_READ_BYTES: u64 = 512 * 1024;

/// Directory the file tools operate in
#[derive(Clone, Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `WORKSPACE_DIR`, defaulting to the current directory
    pub fn from_env() -> Self {
        Self::new(std::env::var("WORKSPACE_DIR").unwrap_or_else(|_| ".".into()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Join a workspace-relative path onto the root
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let path = Path::new(relative);
        let mut resolved = self.root.clone();
        for component in path.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(AgentError::ToolValidation(format!(
                        "path must stay inside the workspace: {relative}"
                    )));
                }
            }
        }
        Ok(resolved)
    }
}

fn path_arg(args: &Value) -> Result<&str> {
    args.get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| AgentError::ToolValidation("path must be a string".into()))
}

/// Register the file tools for `workspace`
pub fn register_workspace_tools(registry: &mut ToolRegistry, workspace: &Workspace) {
    let workspace = Arc::new(workspace.clone());
    registry.register(ReadFileTool(workspace.clone()));
    registry.register(ListDirTool(workspace.clone()));
    registry.register(WriteFileTool(workspace));
}

/// Read a UTF-8 file
pub struct ReadFileTool(Arc<Workspace>);

#[async_trait]
impl Tool for ReadFileTool {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::new(
            "read_file",
            "Read a text file from the workspace",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Workspace-relative file path" }
                },
                "required": ["path"]
            }),
        )
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> Result<Value> {
        let path = self.0.resolve(path_arg(args)?)?;
        let size = tokio::fs::metadata(&path).await?.len();
        if size > MAX_READ_BYTES {
            return Err(AgentError::ToolExecution(format!(
                "file is {size} bytes, limit is {MAX_READ_BYTES}"
            )));
        }
        let text = tokio::fs::read_to_string(&path).await?;
        Ok(json!({ "path": path_arg(args)?, "content": text }))
    }
}

/// List a directory
pub struct ListDirTool(Arc<Workspace>);

#[async_trait]
impl Tool for ListDirTool {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::new(
            "list_dir",
            "List the entries of a workspace directory",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Workspace-relative directory, default \".\"" }
                }
            }),
        )
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> Result<Value> {
        let relative = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let mut entries = tokio::fs::read_dir(self.0.resolve(relative)?).await?;

        let mut listing = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let is_dir = entry.file_type().await?.is_dir();
            listing.push(json!({
                "name": entry.file_name().to_string_lossy(),
                "dir": is_dir,
            }));
        }
        listing.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        Ok(json!({ "path": relative, "entries": listing }))
    }
}

/// Create or overwrite a file
pub struct WriteFileTool(Arc<Workspace>);

#[async_trait]
impl Tool for WriteFileTool {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::new(
            "write_file",
            "Write a text file in the workspace, creating parent directories",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Workspace-relative file path" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"]
            }),
        )
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> Result<Value> {
        let path = self.0.resolve(path_arg(args)?)?;
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::ToolValidation("content must be a string".into()))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(json!({ "path": path_arg(args)?, "bytes": content.len() }))
    }
}
