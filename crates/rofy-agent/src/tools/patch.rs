//! writePatches: find/replace edits inside existing files

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::parse_args;
use crate::error::ToolError;
use crate::sandbox::{Sandbox, write_atomic};
use crate::tool::{Tool, ToolKind, ToolOutput};

#[derive(Debug, Deserialize)]
struct PatchArgs {
    patches: Vec<Patch>,
}

#[derive(Debug, Deserialize)]
struct Patch {
    path: String,
    find: String,
    replace: String,
}

/// Tool for regex find/replace edits
///
/// Patches apply in order, each to its own file. A failing patch stops the
/// batch; earlier patches stay applied.
pub struct WritePatchesTool {
    sandbox: Arc<Sandbox>,
}

impl WritePatchesTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for WritePatchesTool {
    fn name(&self) -> &str {
        "writePatches"
    }

    fn description(&self) -> &str {
        "Apply patches to files. 'find' is a regex (multi-line, dot matches newline) replacing every match. Lookahead, lookbehind and backreferences such as \\1 are not supported; a pattern using them is matched as literal text. 'replace' may use $1 or $& references."
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "patches": {
                    "type": "array",
                    "description": "An array of patch objects to apply.",
                    "items": {
                        "type": "object",
                        "description": "A patch object containing the file path and the find/replace strings.",
                        "properties": {
                            "path": { "type": "string", "description": "The path to the file to patch." },
                            "find": { "type": "string", "description": "The regex pattern to find." },
                            "replace": { "type": "string", "description": "The replacement string." }
                        },
                        "required": ["path", "find", "replace"]
                    }
                }
            },
            "required": ["patches"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Update
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let args: PatchArgs = parse_args(arguments)?;

        let mut files = Vec::with_capacity(args.patches.len());
        for patch in args.patches {
            let (relative, absolute) = self.sandbox.resolve(&patch.path)?;
            let text = match tokio::fs::read_to_string(&absolute).await {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ToolError::NotFound(self.sandbox.display(&relative)));
                }
                Err(e) => return Err(ToolError::io(self.sandbox.display(&relative), e)),
            };

            let next = apply_patch(&text, &patch.find, &patch.replace);
            if next == text {
                return Err(ToolError::PatternNotFound(relative));
            }

            write_atomic(&absolute, &next)
                .await
                .map_err(|e| ToolError::io(self.sandbox.display(&relative), e))?;
            tracing::debug!(path = %relative, "patch applied");
            files.push(patch.path);
        }

        Ok(ToolOutput::new(json!({ "patched": files.len() })).with_files(files))
    }
}

/// Replace every match of `find` in `text`.
///
/// `find` compiles with multi-line and dot-all flags; when it is not a valid
/// regex it is matched literally.
fn apply_patch(text: &str, find: &str, replace: &str) -> String {
    let regex = match Regex::new(&format!("(?ms){}", find)) {
        Ok(regex) => regex,
        Err(_) => match Regex::new(&regex::escape(find)) {
            Ok(regex) => regex,
            Err(_) => return text.to_string(),
        },
    };
    let replacement = translate_replacement(replace, regex.captures_len());
    regex.replace_all(text, replacement.as_str()).into_owned()
}

/// Convert a `$`-style replacement as models write it (`$1`, `$&`, `$<name>`,
/// `$$`) into the regex crate's syntax. Anything else is taken literally.
fn translate_replacement(replace: &str, captures_len: usize) -> String {
    let chars: Vec<char> = replace.chars().collect();
    let mut out = String::with_capacity(replace.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '$' {
            out.push(chars[i]);
            i += 1;
            continue;
        }

        match chars.get(i + 1) {
            Some('$') => {
                out.push_str("$$");
                i += 2;
            }
            Some('&') => {
                out.push_str("${0}");
                i += 2;
            }
            Some(d) if d.is_ascii_digit() => {
                let one = d.to_digit(10).unwrap_or(0) as usize;
                let two = chars
                    .get(i + 2)
                    .and_then(|c| c.to_digit(10))
                    .map(|second| one * 10 + second as usize);
                match two {
                    Some(n) if n >= 1 && n < captures_len => {
                        out.push_str(&format!("${{{}}}", n));
                        i += 3;
                    }
                    _ if one >= 1 && one < captures_len => {
                        out.push_str(&format!("${{{}}}", one));
                        i += 2;
                    }
                    _ => {
                        out.push_str("$$");
                        i += 1;
                    }
                }
            }
            Some('<') => {
                let rest: String = chars[i + 2..].iter().collect();
                match rest.find('>') {
                    Some(end) => {
                        out.push_str(&format!("${{{}}}", &rest[..end]));
                        i += 2 + rest[..end].chars().count() + 1;
                    }
                    None => {
                        out.push_str("$$");
                        i += 1;
                    }
                }
            }
            _ => {
                out.push_str("$$");
                i += 1;
            }
        }
    }
    out
}
