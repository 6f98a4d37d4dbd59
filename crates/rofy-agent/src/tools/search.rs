//! searchFiles: find project files by name or content

use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

use super::parse_args;
use crate::error::ToolError;
use crate::sandbox::Sandbox;
use crate::tool::{Tool, ToolKind, ToolOutput};

/// Include pattern used when the model gives none
pub const DEFAULT_INCLUDE: &str = "**/*.{js,ts,jsx,tsx}";

/// Never searched, in addition to the deny-list
const IGNORED: [&str; 11] = [
    "**/node_modules/**",
    "**/dist/**",
    "**/build/**",
    "package-lock.json",
    "yarn.lock",
    "**/*.lock",
    "fly.toml",
    "Dockerfile*",
    ".dockerignore",
    ".gitignore",
    "zip.ts",
];

/// Directories never descended into
const SKIPPED_DIRS: [&str; 4] = ["node_modules", "dist", "build", ".git"];

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(rename = "includePattern")]
    include_pattern: Option<String>,
}

/// Tool for finding files whose name or content matches a query
pub struct SearchFilesTool {
    sandbox: Arc<Sandbox>,
}

impl SearchFilesTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        "searchFiles"
    }

    fn description(&self) -> &str {
        "Search for files matching a query. Every whitespace-separated token is matched case-insensitively against file names and contents; '*' lists all files."
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query."
                },
                "includePattern": {
                    "type": "string",
                    "description": "Glob pattern to include files.",
                    "default": DEFAULT_INCLUDE
                }
            },
            "required": ["query"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Lookup
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let args: SearchArgs = parse_args(arguments)?;
        let include = args
            .include_pattern
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_INCLUDE.to_string());

        let sandbox = Arc::clone(&self.sandbox);
        let matches = tokio::task::spawn_blocking(move || search(&sandbox, &args.query, &include))
            .await
            .map_err(|e| ToolError::io("searchFiles", std::io::Error::other(e)))??;

        Ok(ToolOutput::new(json!(matches)))
    }
}

/// What a query matches
enum Matcher {
    All,
    Tokens {
        tokens: Vec<String>,
        regexes: Vec<Regex>,
    },
}

impl Matcher {
    fn new(query: &str) -> Result<Self, ToolError> {
        let trimmed = query.trim();
        if trimmed == "*" {
            return Ok(Matcher::All);
        }
        let tokens: Vec<String> = if trimmed.is_empty() {
            vec![String::new()]
        } else {
            trimmed.split_whitespace().map(str::to_lowercase).collect()
        };
        let regexes = tokens
            .iter()
            .map(|t| Regex::new(&format!("(?i){}", regex::escape(t))))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        Ok(Matcher::Tokens { tokens, regexes })
    }

    fn matches(&self, file: &Path) -> bool {
        let (tokens, regexes) = match self {
            Matcher::All => return true,
            Matcher::Tokens { tokens, regexes } => (tokens, regexes),
        };

        let base = file
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if tokens.iter().any(|t| *t == base) {
            return true;
        }

        match std::fs::read(file) {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                regexes.iter().any(|rx| rx.is_match(&text))
            }
            Err(e) => {
                tracing::debug!("Skipping unreadable file {}: {}", file.display(), e);
                false
            }
        }
    }
}

fn search(sandbox: &Sandbox, query: &str, include: &str) -> Result<Vec<String>, ToolError> {
    let matcher = Matcher::new(query)?;
    let includes = expand_braces(include)
        .iter()
        .map(|p| Pattern::new(p))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ToolError::InvalidArguments(format!("includePattern: {}", e)))?;
    let ignored: Vec<Pattern> = IGNORED.iter().filter_map(|p| Pattern::new(p).ok()).collect();

    let mut files = Vec::new();
    collect_files(sandbox, sandbox.root(), "", &mut files)?;
    files.sort();

    let strict = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };
    let loose = MatchOptions {
        require_literal_leading_dot: false,
        ..strict
    };

    Ok(files
        .into_iter()
        .filter(|rel| includes.iter().any(|p| p.matches_with(rel, strict)))
        .filter(|rel| !ignored.iter().any(|p| p.matches_with(rel, loose)))
        .filter(|rel| sandbox.denied_by(rel).is_none())
        .filter(|rel| matcher.matches(&sandbox.root().join(rel)))
        .map(|rel| sandbox.display(&rel))
        .collect())
}

/// Walk the sandbox, collecting sandbox-relative file paths
fn collect_files(
    sandbox: &Sandbox,
    dir: &Path,
    prefix: &str,
    out: &mut Vec<String>,
) -> Result<(), ToolError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && prefix.is_empty() => return Ok(()),
        Err(e) => return Err(ToolError::io(dir.display().to_string(), e)),
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            if SKIPPED_DIRS.contains(&name.as_str()) || sandbox.denied_by(&rel).is_some() {
                continue;
            }
            collect_files(sandbox, &entry.path(), &rel, out)?;
        } else if file_type.is_file() {
            out.push(rel);
        }
    }
    Ok(())
}

/// Expand `{a,b}` alternations, which the glob crate does not support
fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };
    let Some(close) = pattern[open..].find('}').map(|i| open + i) else {
        return vec![pattern.to_string()];
    };

    let (head, tail) = (&pattern[..open], &pattern[close + 1..]);
    pattern[open + 1..close]
        .split(',')
        .flat_map(|alt| expand_braces(&format!("{}{}{}", head, alt, tail)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> (tempfile::TempDir, Arc<Sandbox>) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let files = [
            ("client/src/App.tsx", "export function App() { useState(0) }"),
            ("client/src/util.ts", "export const add = (a, b) => a + b;"),
            ("client/src/Button.jsx", "<button>Save</button>"),
            ("server/routes.ts", "useState"),
            ("server/db.ts", "export const db = connect()"),
            ("node_modules/react/index.js", "useState"),
            ("dist/main.js", "useState"),
            ("README.md", "useState"),
            (".env", "KEY=1"),
        ];
        for (path, content) in files {
            let full = root.join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }
        let sandbox = Arc::new(Sandbox::new(root));
        (dir, sandbox)
    }

    async fn run(sandbox: &Arc<Sandbox>, args: serde_json::Value) -> Vec<String> {
        let out = SearchFilesTool::new(Arc::clone(sandbox))
            .execute(args)
            .await
            .unwrap();
        serde_json::from_value(out.value).unwrap()
    }

    #[tokio::test]
    async fn test_content_match_case_insensitive() {
        let (_dir, sandbox) = project();
        let found = run(&sandbox, json!({"query": "USESTATE"})).await;
        assert_eq!(found, vec!["myApp/client/src/App.tsx"]);
    }

    #[tokio::test]
    async fn test_match_all_excludes_ignored_and_denied() {
        let (_dir, sandbox) = project();
        let found = run(&sandbox, json!({"query": "*"})).await;
        assert_eq!(
            found,
            vec![
                "myApp/client/src/App.tsx",
                "myApp/client/src/Button.jsx",
                "myApp/client/src/util.ts",
                "myApp/server/db.ts",
            ]
        );
    }

    #[tokio::test]
    async fn test_match_all_with_any_extension() {
        let (dir, sandbox) = project();
        for (path, content) in [
            ("package-lock.json", "{}"),
            ("public/downloads/app.zip", "zip"),
            ("server/index.ts", "entry"),
        ] {
            let full = dir.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }

        let found = run(&sandbox, json!({"query": "*", "includePattern": "**/*"})).await;
        assert_eq!(
            found,
            vec![
                "myApp/README.md",
                "myApp/client/src/App.tsx",
                "myApp/client/src/Button.jsx",
                "myApp/client/src/util.ts",
                "myApp/server/db.ts",
            ]
        );
    }

    #[tokio::test]
    async fn test_basename_match() {
        let (_dir, sandbox) = project();
        let found = run(&sandbox, json!({"query": "db.ts nothing-here"})).await;
        assert_eq!(found, vec!["myApp/server/db.ts"]);
    }

    #[tokio::test]
    async fn test_include_pattern() {
        let (_dir, sandbox) = project();
        let found = run(&sandbox, json!({"query": "usestate", "includePattern": "**/*.md"})).await;
        assert_eq!(found, vec!["myApp/README.md"]);
    }

    #[tokio::test]
    async fn test_missing_root_yields_nothing() {
        let sandbox = Arc::new(Sandbox::new("/definitely/not/a/real/dir"));
        assert!(run(&sandbox, json!({"query": "*"})).await.is_empty());
    }

    #[test]
    fn test_expand_braces() {
        assert_eq!(
            expand_braces("**/*.{js,ts}"),
            vec!["**/*.js".to_string(), "**/*.ts".to_string()]
        );
        assert_eq!(expand_braces("src/*.tsx"), vec!["src/*.tsx".to_string()]);
        assert_eq!(expand_braces("{a,b}/{c,d}").len(), 4);
    }
}
