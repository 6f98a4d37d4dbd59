//! Configuration file support

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Configuration for the rofy server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port to listen on
    pub port: u16,
    /// Address to bind
    pub bind: String,
    /// Project directory the model may edit
    pub app_root: PathBuf,
    /// Prefix the model uses for project paths
    pub root_name: String,
    /// Model id for orchestration and planning
    pub model: String,
    /// Anthropic API base URL
    pub base_url: String,
    /// API key (prefer the environment)
    pub api_key: Option<String>,
    pub orchestrator: OrchestratorSettings,
    pub plan: PlanSettings,
    /// Directory holding prompt files; built-in prompts when unset
    pub prompts_dir: Option<PathBuf>,
    /// Directory for chats and transcripts; in-memory when unset
    pub store_dir: Option<PathBuf>,
    pub auth: AuthSettings,
    /// Seconds a finished run stays in the registry
    pub run_grace_secs: u64,
    /// Seconds between pings on passive listeners
    pub heartbeat_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_passes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanSettings {
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Bearer token to user id map; empty disables authentication
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub tokens: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5001,
            bind: "0.0.0.0".to_string(),
            app_root: PathBuf::from("./myApp"),
            root_name: "myApp".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            api_key: None,
            orchestrator: OrchestratorSettings::default(),
            plan: PlanSettings::default(),
            prompts_dir: None,
            store_dir: None,
            auth: AuthSettings::default(),
            run_grace_secs: 30,
            heartbeat_secs: 25,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 20_000,
            max_passes: 64,
        }
    }
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 4000,
        }
    }
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rofy")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("ROFY_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from `path`, or from the default location.
    ///
    /// A missing file means defaults; an unreadable one is logged and ignored.
    pub fn load(path: Option<&Path>) -> Self {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::config_path);
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match Self::parse(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `ANTHROPIC_API_KEY` / `ANTHROPIC_KEY` and `PORT`
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if self.api_key.as_deref().is_none_or(str::is_empty) {
            self.api_key = ["ANTHROPIC_API_KEY", "ANTHROPIC_KEY"]
                .iter()
                .find_map(|name| var(name).filter(|v| !v.is_empty()));
        }
        if let Some(port) = var("PORT") {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(_) => warn!("Ignoring invalid PORT value: {}", port),
            }
        }
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# rofy configuration file
# Place at ~/.config/rofy/config.toml (Linux) or point ROFY_CONFIG_PATH at it

port = 5001
bind = "0.0.0.0"

# Project directory the model edits, and the prefix it uses for paths
app_root = "./myApp"
root_name = "myApp"

model = "claude-sonnet-4-20250514"
base_url = "https://api.anthropic.com"
# api_key = "sk-ant-..."   # prefer ANTHROPIC_API_KEY

# prompts_dir = "./prompts"   # make-plan.txt, orchestrator.txt, ...
# store_dir = "./data"        # omit to keep chats in memory

run_grace_secs = 30
heartbeat_secs = 25

[orchestrator]
temperature = 0.3
max_tokens = 20000
max_passes = 64

[plan]
temperature = 0.3
max_tokens = 4000

# Bearer tokens accepted by the API; leave empty to disable auth
[auth.tokens]
# "dev-token" = "user_123"
"#
}
