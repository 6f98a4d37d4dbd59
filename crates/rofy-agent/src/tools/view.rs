//! viewFiles: read whole files

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::parse_args;
use crate::error::ToolError;
use crate::sandbox::Sandbox;
use crate::tool::{Tool, ToolKind, ToolOutput};

#[derive(Debug, Deserialize)]
struct ViewArgs {
    paths: Vec<String>,
}

/// Tool for reading the full contents of files
pub struct ViewFilesTool {
    sandbox: Arc<Sandbox>,
}

impl ViewFilesTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ViewFilesTool {
    fn name(&self) -> &str {
        "viewFiles"
    }

    fn description(&self) -> &str {
        "View the content of files. Returns an object keyed by path."
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "paths": {
                    "type": "array",
                    "description": "An array of file paths to view.",
                    "items": { "type": "string", "description": "The path to the file to view." }
                }
            },
            "required": ["paths"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Lookup
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let args: ViewArgs = parse_args(arguments)?;

        let mut contents = serde_json::Map::new();
        for path in &args.paths {
            let (relative, absolute) = self.sandbox.resolve_existing_file(path).await?;
            let bytes = tokio::fs::read(&absolute)
                .await
                .map_err(|e| ToolError::io(self.sandbox.display(&relative), e))?;
            let text = String::from_utf8_lossy(&bytes).into_owned();
            contents.insert(relative, serde_json::Value::String(text));
        }

        Ok(ToolOutput::new(serde_json::Value::Object(contents)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> (tempfile::TempDir, ViewFilesTool) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("client/src")).unwrap();
        std::fs::write(dir.path().join("client/src/App.tsx"), "app").unwrap();
        std::fs::write(dir.path().join("client/src/main.tsx"), "main").unwrap();
        let tool = ViewFilesTool::new(Arc::new(Sandbox::new(dir.path())));
        (dir, tool)
    }

    #[tokio::test]
    async fn test_view_keys_by_relative_path() {
        let (_dir, tool) = project();
        let out = tool
            .execute(json!({"paths": ["myApp/client/src/App.tsx", "client/src/main.tsx"]}))
            .await
            .unwrap();
        assert_eq!(
            out.value,
            json!({"client/src/App.tsx": "app", "client/src/main.tsx": "main"})
        );
        assert!(out.files.is_empty());
    }

    #[tokio::test]
    async fn test_view_missing_and_directory() {
        let (_dir, tool) = project();
        let err = tool
            .execute(json!({"paths": ["myApp/client/src/App.tsx", "myApp/nope.ts"]}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "File not found: myApp/nope.ts");

        let err = tool
            .execute(json!({"paths": ["myApp/client"]}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot view directory: myApp/client");
    }

    #[tokio::test]
    async fn test_view_reads_write_protected_files() {
        let (dir, tool) = project();
        std::fs::create_dir_all(dir.path().join("server")).unwrap();
        std::fs::write(dir.path().join("server/routes.ts"), "routes").unwrap();
        std::fs::write(dir.path().join("package-lock.json"), "{}").unwrap();

        let out = tool
            .execute(json!({"paths": ["myApp/server/routes.ts", "package-lock.json"]}))
            .await
            .unwrap();
        assert_eq!(
            out.value,
            json!({"server/routes.ts": "routes", "package-lock.json": "{}"})
        );
    }

    #[tokio::test]
    async fn test_view_outside_root() {
        let (_dir, tool) = project();
        let err = tool
            .execute(json!({"paths": ["../secret"]}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::OutsideSandbox(_)));
    }
}
