//! Per-invocation accumulation of streamed tool arguments

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::error::Error;

static PATH_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""path"\s*:\s*"([^"]+)""#).expect("path pattern compiles"));

/// Accumulates the argument JSON of one tool call as it streams in and
/// reports each target path the first time it becomes visible.
#[derive(Debug)]
pub struct ToolCallAccumulator {
    id: String,
    name: String,
    json: String,
    seen: HashSet<String>,
}

/// A tool call whose arguments finished streaming
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCallAccumulator {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            json: String::new(),
            seen: HashSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a fragment; returns paths that completed for the first time, in order.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.json.push_str(fragment);

        let mut fresh = Vec::new();
        for caps in PATH_PATTERN.captures_iter(&self.json) {
            let path = &caps[1];
            if self.seen.insert(path.to_string()) {
                fresh.push(path.to_string());
            }
        }
        fresh
    }

    /// Parse the accumulated arguments. No fragments at all means `{}`.
    pub fn finish(self) -> Result<ParsedToolCall, Error> {
        let arguments = if self.json.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&self.json).map_err(|e| Error::MalformedToolArguments {
                tool: self.name.clone(),
                message: e.to_string(),
            })?
        };
        Ok(ParsedToolCall {
            id: self.id,
            name: self.name,
            arguments,
        })
    }
}

/// Display form of a path for progress events: drops the root and `client/` prefixes.
pub fn short_path(path: &str, root_name: &str) -> String {
    let path = path
        .strip_prefix(root_name)
        .and_then(|p| p.strip_prefix('/'))
        .unwrap_or(path);
    path.strip_prefix("client/").unwrap_or(path).to_string()
}
