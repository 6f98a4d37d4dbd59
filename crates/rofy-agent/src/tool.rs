//! Tool trait and the tool set offered to the model

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::error::ToolError;
use crate::events::Verb;

/// What a tool does to the sandbox, which decides the progress events it gets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Reads only (search, view)
    Lookup,
    /// Writes whole files
    Create,
    /// Edits existing files in place
    Update,
}

impl ToolKind {
    /// Verb announced while a file's path streams in
    pub fn pending_verb(self) -> Verb {
        match self {
            ToolKind::Create => Verb::Creating,
            _ => Verb::Updating,
        }
    }

    /// Verb reported once the file was touched
    pub fn done_verb(self) -> Verb {
        match self {
            ToolKind::Create => Verb::Created,
            _ => Verb::Updated,
        }
    }
}

/// Successful outcome of a tool call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// Structured result, serialized back to the model verbatim
    pub value: serde_json::Value,
    /// Model-facing paths the call wrote, in order
    pub files: Vec<String>,
}

impl ToolOutput {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            files: Vec::new(),
        }
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }
}

/// A sandbox operation the model can call by name
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Shown to the model alongside the schema
    fn description(&self) -> &str;

    /// JSON Schema of the arguments object
    fn schema(&self) -> serde_json::Value;

    fn kind(&self) -> ToolKind;

    /// Arguments have already passed the schema check
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError>;
}

pub type SharedTool = Arc<dyn Tool>;

#[derive(Clone)]
struct Registered {
    tool: SharedTool,
    /// `None` when the tool's own schema does not compile
    validator: Option<Arc<jsonschema::Validator>>,
}

/// The fixed set of tools a run may call, in the order they are offered
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: Vec<Registered>,
}

impl ToolSet {
    pub fn new(tools: Vec<SharedTool>) -> Self {
        Self {
            tools: tools.into_iter().map(register).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&SharedTool> {
        self.entry(name).map(|entry| &entry.tool)
    }

    /// Unknown names count as edits
    pub fn kind_of(&self, name: &str) -> ToolKind {
        self.get(name).map_or(ToolKind::Update, |tool| tool.kind())
    }

    /// Definitions sent with every request
    pub fn definitions(&self) -> Vec<rofy_ai::Tool> {
        self.tools
            .iter()
            .map(|entry| rofy_ai::Tool::new(entry.tool.name(), entry.tool.description(), entry.tool.schema()))
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|entry| entry.tool.name()).collect()
    }

    /// Check `arguments` against the tool's schema and run it
    pub async fn execute(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolOutput, ToolError> {
        let entry = self
            .entry(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        if let Some(validator) = &entry.validator {
            check_arguments(validator, &arguments)?;
        }
        entry.tool.execute(arguments).await
    }

    fn entry(&self, name: &str) -> Option<&Registered> {
        self.tools.iter().find(|entry| entry.tool.name() == name)
    }
}

fn register(tool: SharedTool) -> Registered {
    let validator = match jsonschema::validator_for(&tool.schema()) {
        Ok(validator) => Some(Arc::new(validator)),
        Err(e) => {
            warn!(tool = tool.name(), error = %e, "tool schema does not compile; arguments go unchecked");
            None
        }
    };
    Registered { tool, validator }
}

/// Every violation, each prefixed with its JSON pointer when not at the root
fn check_arguments(validator: &jsonschema::Validator, arguments: &serde_json::Value) -> Result<(), ToolError> {
    let problems: Vec<String> = validator
        .iter_errors(arguments)
        .map(|e| match e.instance_path.to_string() {
            pointer if pointer.is_empty() => e.to_string(),
            pointer => format!("{pointer}: {e}"),
        })
        .collect();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ToolError::InvalidArguments(problems.join("; ")))
    }
}
