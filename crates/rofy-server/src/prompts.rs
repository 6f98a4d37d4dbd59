//! System prompt lookup

use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Prompt for key '{0}' not found")]
    UnknownKey(String),

    #[error("Failed to read prompt {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

const ORCHESTRATOR: &str = "You are a senior full-stack engineer editing a React + TypeScript project rooted at myApp/. \
Use searchFiles and viewFiles to inspect the code before changing it, writeFiles to create or replace whole files, \
and writePatches for small targeted edits. Server entry files and deployment files are read-only. \
Explain what you are doing in short sentences, and stop calling tools once the requested change is complete.";

const MAKE_PLAN: &str = "You turn a user's app idea into a concise product plan. When the request describes an app, \
call emit_app_plan exactly once with the app name, a one or two sentence description, a React Icons component name, \
the features of the initial version, up to four features for a later version and the design language. \
If the request is not about building an app, reply with a JSON object whose intent is NON_INTENT; if it asks for \
something disallowed, reply with a JSON object whose intent is POLICY_BLOCK. If the idea is too vague, reply with \
short suggestions instead.";

const EXECUTE_PLAN: &str = "You implement an approved app plan in the project rooted at myApp/. Build the initial \
version's features one at a time with the file tools, keeping the design language consistent across pages.";

const BUILD_FEATURE: &str = "You add a single feature to an existing app in myApp/. Read the relevant files first, \
then make the smallest set of edits that delivers the feature.";

/// Resolves prompt keys to text from a prompt directory, falling back to
/// built-in defaults
#[derive(Debug, Clone, Default)]
pub struct PromptLibrary {
    dir: Option<PathBuf>,
}

impl PromptLibrary {
    pub const KEYS: [&'static str; 4] = ["orchestrator", "make_plan", "execute_plan", "build_feature"];

    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    /// File name for a key: `make_plan` is `make-plan.txt`
    pub fn file_name(key: &str) -> String {
        format!("{}.txt", key.replace('_', "-"))
    }

    fn builtin(key: &str) -> Option<&'static str> {
        match key {
            "orchestrator" => Some(ORCHESTRATOR),
            "make_plan" => Some(MAKE_PLAN),
            "execute_plan" => Some(EXECUTE_PLAN),
            "build_feature" => Some(BUILD_FEATURE),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Result<String, PromptError> {
        let builtin = Self::builtin(key).ok_or_else(|| PromptError::UnknownKey(key.to_string()))?;

        let Some(dir) = &self.dir else {
            return Ok(builtin.to_string());
        };
        let path = dir.join(Self::file_name(key));
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                debug!(key, path = %path.display(), "loaded prompt");
                Ok(text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(builtin.to_string()),
            Err(source) => Err(PromptError::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_defaults() {
        let prompts = PromptLibrary::default();
        for key in PromptLibrary::KEYS {
            assert!(!prompts.get(key).unwrap().is_empty());
        }
        assert!(matches!(
            prompts.get("makePlan"),
            Err(PromptError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_file_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("make-plan.txt"), "custom plan prompt").unwrap();
        let prompts = PromptLibrary::new(Some(dir.path().to_path_buf()));

        assert_eq!(prompts.get("make_plan").unwrap(), "custom plan prompt");
        assert_eq!(prompts.get("orchestrator").unwrap(), ORCHESTRATOR);
    }
}
