//! Tool Policy
//!
//! Pure decision function over (mode, tool name, call arguments). No I/O and
//! no side effects: the loop turns a denial into a failed tool result.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Tools denied in readonly mode unless overridden
pub const DEFAULT_DANGEROUS_TOOLS: &[&str] = &[
    "write_file",
    "apply_diff",
    "delete_file",
    "create_directory",
    "execute_command",
];

/// Dangerous tools that plan mode lets through for plan documents
pub const DEFAULT_PLAN_WRITE_TOOLS: &[&str] = &["write_file", "apply_diff"];

pub const PLAN_DIR_PREFIX: &str = ".cursor/plans/";
pub const PLAN_DOC_EXTENSION: &str = ".md";

/// Permission profile for a turn
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Agent,
    Readonly,
    Plan,
    #[serde(untagged)]
    Custom(String),
}

impl std::str::FromStr for Mode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "agent" | "" => Mode::Agent,
            "readonly" | "read-only" | "ask" => Mode::Readonly,
            "plan" => Mode::Plan,
            _ => Mode::Custom(s.trim().to_string()),
        })
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Agent => write!(f, "agent"),
            Mode::Readonly => write!(f, "readonly"),
            Mode::Plan => write!(f, "plan"),
            Mode::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// Outcome of a policy check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String },
    /// Allowed only because an exception rule matched
    AllowWithException { reason: String },
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, PolicyDecision::Deny { .. })
    }
}

/// Plan-document path rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanPathPattern {
    pub prefix: String,
    pub extension: String,
}

impl Default for PlanPathPattern {
    fn default() -> Self {
        Self {
            prefix: PLAN_DIR_PREFIX.into(),
            extension: PLAN_DOC_EXTENSION.into(),
        }
    }
}

impl PlanPathPattern {
    /// Whether `path` is a plan document.
    ///
    /// Absolute paths, drive markers and `..` segments are always rejected.
    /// At most one leading `workspace-name/` segment is stripped.
    pub fn matches(&self, path: &str) -> bool {
        let normalized = path.trim().replace('\\', "/");
        if normalized.starts_with('/') || normalized.contains(':') {
            return false;
        }
        if normalized.split('/').any(|segment| segment == "..") {
            return false;
        }
        let relative = normalized.strip_prefix("./").unwrap_or(&normalized);
        if self.matches_relative(relative) {
            return true;
        }
        relative
            .split_once('/')
            .is_some_and(|(_, rest)| self.matches_relative(rest))
    }

    fn matches_relative(&self, path: &str) -> bool {
        let Some(rest) = path.strip_prefix(self.prefix.as_str()) else {
            return false;
        };
        let file_name = rest.rsplit('/').next().unwrap_or_default();
        rest.ends_with(self.extension.as_str()) && file_name.len() > self.extension.len()
    }
}

/// Inputs the policy decides on
#[derive(Clone, Debug)]
pub struct ToolPolicyContext {
    pub mode: Mode,
    pub dangerous_tools: HashSet<String>,
    pub plan_write_tools: HashSet<String>,
    pub plan_path: PlanPathPattern,
    /// Dangerous set for modes not enumerated above
    pub custom_dangerous: Option<HashSet<String>>,
}

impl ToolPolicyContext {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            dangerous_tools: DEFAULT_DANGEROUS_TOOLS.iter().map(|s| (*s).to_string()).collect(),
            plan_write_tools: DEFAULT_PLAN_WRITE_TOOLS.iter().map(|s| (*s).to_string()).collect(),
            plan_path: PlanPathPattern::default(),
            custom_dangerous: None,
        }
    }

    pub fn with_dangerous_tools(mut self, tools: HashSet<String>) -> Self {
        self.dangerous_tools = tools;
        self
    }

    pub fn with_custom_dangerous(mut self, tools: HashSet<String>) -> Self {
        self.custom_dangerous = Some(tools);
        self
    }
}

impl Default for ToolPolicyContext {
    fn default() -> Self {
        Self::new(Mode::Agent)
    }
}

/// Decide whether `tool_name` may run with `args` under `ctx`
pub fn check(ctx: &ToolPolicyContext, tool_name: &str, args: &Value) -> PolicyDecision {
    match &ctx.mode {
        Mode::Agent => PolicyDecision::Allow,
        Mode::Readonly => {
            if ctx.dangerous_tools.contains(tool_name) {
                deny(format!("'{tool_name}' is not available in readonly mode"))
            } else {
                PolicyDecision::Allow
            }
        }
        Mode::Plan => {
            if !ctx.dangerous_tools.contains(tool_name) {
                return PolicyDecision::Allow;
            }
            if !ctx.plan_write_tools.contains(tool_name) {
                return deny(format!("'{tool_name}' is not available in plan mode"));
            }
            let paths = target_paths(args);
            if paths.is_empty() {
                return deny(format!("'{tool_name}' in plan mode requires a target path"));
            }
            match paths.iter().find(|p| !ctx.plan_path.matches(p)) {
                Some(bad) => deny(format!(
                    "plan mode only allows writing {}*{} documents, got '{bad}'",
                    ctx.plan_path.prefix, ctx.plan_path.extension
                )),
                None => PolicyDecision::AllowWithException {
                    reason: "plan document write".into(),
                },
            }
        }
        Mode::Custom(name) => match &ctx.custom_dangerous {
            Some(set) if set.contains(tool_name) => {
                deny(format!("'{tool_name}' is not available in mode '{name}'"))
            }
            _ => PolicyDecision::Allow,
        },
    }
}

fn deny(reason: String) -> PolicyDecision {
    PolicyDecision::Deny { reason }
}

/// Paths a write-style call targets: `path`, `paths[]`, or `files[].path`
fn target_paths(args: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    if let Some(path) = args.get("path").and_then(Value::as_str) {
        paths.push(path.to_string());
    }
    if let Some(list) = args.get("paths").and_then(Value::as_array) {
        paths.extend(list.iter().filter_map(Value::as_str).map(str::to_string));
    }
    if let Some(files) = args.get("files").and_then(Value::as_array) {
        paths.extend(
            files
                .iter()
                .filter_map(|f| f.get("path").and_then(Value::as_str))
                .map(str::to_string),
        );
    }
    paths
}
