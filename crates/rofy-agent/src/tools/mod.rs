//! Sandbox tools offered to the orchestrator model

mod patch;
mod search;
mod view;
mod write;

pub use patch::WritePatchesTool;
pub use search::{DEFAULT_INCLUDE, SearchFilesTool};
pub use view::ViewFilesTool;
pub use write::WriteFilesTool;

use std::sync::Arc;

use crate::error::ToolError;
use crate::sandbox::Sandbox;
use crate::tool::ToolSet;

/// The four sandbox tools over a shared sandbox
pub fn sandbox_tools(sandbox: Arc<Sandbox>) -> ToolSet {
    ToolSet::new(vec![
        Arc::new(SearchFilesTool::new(Arc::clone(&sandbox))),
        Arc::new(WriteFilesTool::new(Arc::clone(&sandbox))),
        Arc::new(ViewFilesTool::new(Arc::clone(&sandbox))),
        Arc::new(WritePatchesTool::new(sandbox)),
    ])
}

/// Deserialize tool arguments into their typed form
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(
    arguments: serde_json::Value,
) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}
