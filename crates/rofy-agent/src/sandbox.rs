//! Path guard for the project sandbox

use std::path::{Path, PathBuf};

use crate::error::ToolError;

/// Sandbox-relative paths the model may never write.
///
/// A rule matches the path itself or anything beneath it, case-insensitively.
pub const DENY_LIST: [&str; 15] = [
    "server/index.ts",
    "server/routes.ts",
    "server/zip.ts",
    "server/vite.ts",
    "server/backend-server.ts",
    "server/backend-routes.ts",
    "server/backend-entry.ts",
    "node_modules",
    ".env",
    "fly.toml",
    "Dockerfile",
    "package-lock.json",
    ".dockerignore",
    "dist",
    "public/downloads",
];

/// The project directory the model works in.
///
/// Model-facing paths carry the `<root_name>/` prefix (`myApp/src/App.tsx`);
/// the prefix is optional on input and always present on output.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
    root_name: String,
}

impl Sandbox {
    pub const DEFAULT_ROOT_NAME: &'static str = "myApp";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            root_name: Self::DEFAULT_ROOT_NAME.to_string(),
        }
    }

    pub fn with_root_name(mut self, root_name: impl Into<String>) -> Self {
        self.root_name = root_name.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn root_name(&self) -> &str {
        &self.root_name
    }

    /// Normalize a model-supplied path into a sandbox-relative one.
    ///
    /// Strips the optional root prefix, collapses `.` and empty segments and
    /// rejects absolute paths or any `..` segment.
    pub fn relative(&self, path: &str) -> Result<String, ToolError> {
        let unified = path.trim().replace('\\', "/");
        if unified.starts_with('/') || has_drive_prefix(&unified) {
            return Err(ToolError::OutsideSandbox(path.to_string()));
        }

        let stripped = unified
            .strip_prefix(&format!("{}/", self.root_name))
            .unwrap_or(&unified);

        let mut segments = Vec::new();
        for segment in stripped.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(ToolError::OutsideSandbox(path.to_string())),
                s => segments.push(s),
            }
        }

        if segments.is_empty() {
            return Err(ToolError::InvalidArguments(format!(
                "path '{}' does not name a file",
                path
            )));
        }
        Ok(segments.join("/"))
    }

    /// Deny-list rule covering a sandbox-relative path, if any.
    pub fn denied_by(&self, relative: &str) -> Option<&'static str> {
        let lower = relative.to_lowercase();
        DENY_LIST.iter().copied().find(|rule| {
            let rule = rule.to_lowercase();
            lower == rule
                || lower
                    .strip_prefix(&rule)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Resolve a path for writing. Fails on deny-listed or escaping paths.
    pub fn resolve(&self, path: &str) -> Result<(String, PathBuf), ToolError> {
        let relative = self.relative(path)?;
        if let Some(rule) = self.denied_by(&relative) {
            let rule = if relative.to_lowercase() == rule.to_lowercase() {
                rule.to_string()
            } else {
                format!("{}/…", rule)
            };
            return Err(ToolError::ForbiddenWrite {
                path: self.display(&relative),
                rule,
            });
        }
        let absolute = self.root.join(&relative);
        Ok((relative, absolute))
    }

    /// Resolve a path for reading; the target must be an existing regular file.
    /// The deny-list only guards writes.
    pub async fn resolve_existing_file(&self, path: &str) -> Result<(String, PathBuf), ToolError> {
        let relative = self.relative(path)?;
        let absolute = self.root.join(&relative);
        match tokio::fs::metadata(&absolute).await {
            Ok(meta) if meta.is_dir() => Err(ToolError::IsADirectory(self.display(&relative))),
            Ok(_) => Ok((relative, absolute)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ToolError::NotFound(self.display(&relative)))
            }
            Err(e) => Err(ToolError::io(self.display(&relative), e)),
        }
    }

    /// Model-facing form of a sandbox-relative path.
    pub fn display(&self, relative: &str) -> String {
        format!("{}/{}", self.root_name, relative)
    }
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Write a file by renaming a sibling temp file over it.
pub(crate) async fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}
