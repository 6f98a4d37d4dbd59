//! Error types for rofy-agent

use thiserror::Error;

/// Result type alias using rofy-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during orchestration
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the AI provider layer
    #[error(transparent)]
    Ai(#[from] rofy_ai::Error),

    /// A tool call failed
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// The durable store failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No run is registered for the session
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Tool arguments were not valid JSON once the invocation finished streaming
    #[error("Malformed arguments for {tool}: {message}")]
    MalformedToolArguments { tool: String, message: String },

    /// The model stream reported an error
    #[error("Model stream failed: {0}")]
    Stream(String),

    /// The run hit its pass limit
    #[error("Stopped after {0} passes without finishing")]
    PassLimit(u32),

    /// The model produced a plan that breaks the plan invariants
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),
}

impl Error {
    /// Errors local to one tool call; the model gets to see these and retry.
    pub fn is_tool_local(&self) -> bool {
        matches!(self, Error::Tool(_) | Error::MalformedToolArguments { .. })
    }
}

/// Failures of a single tool call
#[derive(Error, Debug)]
pub enum ToolError {
    /// Target is on the deny-list
    #[error("Writes to {rule} are forbidden (path: {path})")]
    ForbiddenWrite { path: String, rule: String },

    /// Path is absolute or climbs out of the sandbox root
    #[error("Path escapes the project root: {0}")]
    OutsideSandbox(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Cannot view directory: {0}")]
    IsADirectory(String),

    /// A patch's find pattern matched nothing
    #[error("pattern not found in {0}")]
    PatternNotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("unknown tool {0}")]
    UnknownTool(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Durable store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    #[error("Invalid id: {0}")]
    InvalidId(String),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_local_classification() {
        assert!(Error::from(ToolError::PatternNotFound("a.ts".into())).is_tool_local());
        assert!(
            Error::MalformedToolArguments {
                tool: "writeFiles".into(),
                message: "EOF".into()
            }
            .is_tool_local()
        );
        assert!(!Error::Stream("overloaded".into()).is_tool_local());
        assert!(!Error::from(rofy_ai::Error::Aborted).is_tool_local());
    }

    #[test]
    fn test_messages_match_wire_text() {
        assert_eq!(
            ToolError::NotFound("myApp/a.ts".into()).to_string(),
            "File not found: myApp/a.ts"
        );
        assert_eq!(
            ToolError::PatternNotFound("src/a.ts".into()).to_string(),
            "pattern not found in src/a.ts"
        );
    }
}
