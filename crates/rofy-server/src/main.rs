//! rofy - backend for the rofy app builder

mod auth;
mod config;
mod prompts;
mod routes;
mod state;
mod ws;

use anyhow::Context as _;
use clap::Parser;
use rofy_ai::providers::anthropic::AnthropicProvider;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::prompts::PromptLibrary;
use crate::state::AppState;

/// rofy - streams app plans and drives sandboxed code edits
#[derive(Parser, Debug)]
#[command(name = "rofy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (default: ~/.config/rofy/config.toml)
    #[arg(short, long, env = "ROFY_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Project directory the model edits
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Model id
    #[arg(short, long)]
    model: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Print an example config file and exit
    #[arg(long)]
    print_config: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "rofy=debug,rofy_agent=debug,rofy_ai=debug,tower_http=debug"
    } else {
        "rofy=info,rofy_agent=info,rofy_ai=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", config::example_config());
        return Ok(());
    }

    init_tracing(args.verbose);

    let mut config = Config::load(args.config.as_deref());
    config.apply_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(root) = args.root {
        config.app_root = root;
    }
    if let Some(model) = args.model {
        config.model = model;
    }

    let api_key = config
        .api_key
        .clone()
        .filter(|key| !key.is_empty())
        .context("No API key: set ANTHROPIC_API_KEY or api_key in the config file")?;
    let provider = Arc::new(AnthropicProvider::new(api_key));

    let prompts = PromptLibrary::new(config.prompts_dir.clone());
    let state = AppState::from_config(&config, provider, &prompts)?;
    if config.auth.tokens.is_empty() {
        info!("no auth tokens configured; requests are attributed to 'anonymous'");
    }

    let app = routes::create_router(state);
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!(
        addr = %addr,
        root = %config.app_root.display(),
        model = %config.model,
        "rofy listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
