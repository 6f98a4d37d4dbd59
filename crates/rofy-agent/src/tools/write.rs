//! writeFiles: create or overwrite whole files

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::parse_args;
use crate::error::ToolError;
use crate::sandbox::{Sandbox, write_atomic};
use crate::tool::{Tool, ToolKind, ToolOutput};

#[derive(Debug, Deserialize)]
struct WriteArgs {
    edits: Vec<FileEdit>,
}

#[derive(Debug, Deserialize)]
struct FileEdit {
    path: String,
    content: String,
}

/// Tool for writing complete file contents
pub struct WriteFilesTool {
    sandbox: Arc<Sandbox>,
}

impl WriteFilesTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for WriteFilesTool {
    fn name(&self) -> &str {
        "writeFiles"
    }

    fn description(&self) -> &str {
        "Write content to files. Creates missing directories and overwrites existing files."
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "edits": {
                    "type": "array",
                    "description": "An array of file edits to apply.",
                    "items": {
                        "type": "object",
                        "properties": {
                            "path": { "type": "string", "description": "The path to the file to write." },
                            "content": { "type": "string", "description": "The content to write to the file." }
                        },
                        "required": ["path", "content"]
                    }
                }
            },
            "required": ["edits"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Create
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let args: WriteArgs = parse_args(arguments)?;

        // Check every target before touching the disk
        let targets = args
            .edits
            .iter()
            .map(|edit| self.sandbox.resolve(&edit.path))
            .collect::<Result<Vec<_>, _>>()?;

        for ((relative, absolute), edit) in targets.iter().zip(&args.edits) {
            write_atomic(absolute, &edit.content)
                .await
                .map_err(|e| ToolError::io(self.sandbox.display(relative), e))?;
            tracing::debug!(path = %relative, bytes = edit.content.len(), "file written");
        }

        let files = args.edits.into_iter().map(|e| e.path).collect();
        Ok(ToolOutput::new(json!({ "written": targets.len() })).with_files(files))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::DENY_LIST;
    use crate::tools::ViewFilesTool;

    #[tokio::test]
    async fn test_write_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let tool = WriteFilesTool::new(Arc::new(Sandbox::new(dir.path())));
        let out = tool
            .execute(json!({"edits": [
                {"path": "myApp/client/src/pages/Home.tsx", "content": "home"},
                {"path": "shared/schema.ts", "content": "schema"}
            ]}))
            .await
            .unwrap();

        assert_eq!(out.value, json!({"written": 2}));
        assert_eq!(
            out.files,
            vec!["myApp/client/src/pages/Home.tsx", "shared/schema.ts"]
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("client/src/pages/Home.tsx")).unwrap(),
            "home"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("shared/schema.ts")).unwrap(),
            "schema"
        );
    }

    #[tokio::test]
    async fn test_denied_write_leaves_disk_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let tool = WriteFilesTool::new(Arc::new(Sandbox::new(dir.path())));
        let err = tool
            .execute(json!({"edits": [
                {"path": "myApp/client/src/ok.ts", "content": "x"},
                {"path": "myApp/server/routes.ts", "content": "pwned"}
            ]}))
            .await
            .unwrap_err();

        match err {
            ToolError::ForbiddenWrite { rule, .. } => assert_eq!(rule, "server/routes.ts"),
            other => panic!("expected ForbiddenWrite, got {:?}", other),
        }
        assert!(!dir.path().join("client/src/ok.ts").exists());
        assert!(!dir.path().join("server/routes.ts").exists());
    }

    fn tree(root: &std::path::Path) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
                    out.push((rel, std::fs::read_to_string(&path).unwrap()));
                }
            }
        }
        out.sort();
        out
    }

    #[tokio::test]
    async fn test_every_denied_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("server")).unwrap();
        std::fs::write(dir.path().join("server/routes.ts"), "original").unwrap();
        let before = tree(dir.path());
        let tool = WriteFilesTool::new(Arc::new(Sandbox::new(dir.path())));

        for rule in DENY_LIST {
            for path in [format!("myApp/{}", rule), format!("{}/nested/file.ts", rule)] {
                let result = tool
                    .execute(json!({"edits": [{"path": path, "content": "changed"}]}))
                    .await;
                assert!(
                    matches!(result, Err(ToolError::ForbiddenWrite { .. })),
                    "{} was not rejected",
                    path
                );
            }
        }
        assert_eq!(tree(dir.path()), before);
    }

    #[tokio::test]
    async fn test_written_files_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(Sandbox::new(dir.path()));
        let write = WriteFilesTool::new(Arc::clone(&sandbox));
        let view = ViewFilesTool::new(sandbox);

        let content = "export const greeting = \"héllo\";\n";
        write
            .execute(json!({"edits": [{"path": "myApp/client/src/greeting.ts", "content": content}]}))
            .await
            .unwrap();
        let out = view
            .execute(json!({"paths": ["myApp/client/src/greeting.ts"]}))
            .await
            .unwrap();
        assert_eq!(out.value, json!({"client/src/greeting.ts": content}));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let dir = tempfile::tempdir().unwrap();
        let tool = WriteFilesTool::new(Arc::new(Sandbox::new(dir.path())));
        let out = tool.execute(json!({"edits": []})).await.unwrap();
        assert_eq!(out.value, json!({"written": 0}));
    }
}
