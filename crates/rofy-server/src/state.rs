//! Server state.

use rofy_agent::{
    DurableStore, FileStore, MemoryStore, Orchestrator, OrchestratorConfig, Planner,
    PlannerConfig, RunRegistry, Sandbox, SessionBus, tools::sandbox_tools,
};
use rofy_ai::{LlmProvider, Model};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::auth::{AuthVerifier, TokenVerifier};
use crate::config::Config;
use crate::prompts::{PromptError, PromptLibrary};

/// Shared handles for every request
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub planner: Arc<Planner>,
    pub store: Arc<dyn DurableStore>,
    pub auth: Arc<dyn AuthVerifier>,
    /// Interval between pings on passive listeners
    pub heartbeat: Duration,
}

impl AppState {
    pub fn from_config(
        config: &Config,
        provider: Arc<dyn LlmProvider>,
        prompts: &PromptLibrary,
    ) -> Result<Self, PromptError> {
        let model = Model::anthropic(&config.model).with_base_url(&config.base_url);

        let store: Arc<dyn DurableStore> = match &config.store_dir {
            Some(dir) => {
                info!(dir = %dir.display(), "using file store");
                Arc::new(FileStore::new(dir))
            }
            None => Arc::new(MemoryStore::new()),
        };

        let sandbox = Arc::new(
            Sandbox::new(&config.app_root).with_root_name(&config.root_name),
        );

        let mut orchestrator_config = OrchestratorConfig::new(model.clone(), prompts.get("orchestrator")?);
        orchestrator_config.temperature = config.orchestrator.temperature;
        orchestrator_config.max_tokens = config.orchestrator.max_tokens;
        orchestrator_config.max_passes = config.orchestrator.max_passes;
        orchestrator_config.root_name = config.root_name.clone();

        let orchestrator = Orchestrator::new(orchestrator_config, Arc::clone(&provider), sandbox_tools(sandbox))
            .with_registry(RunRegistry::with_grace(Duration::from_secs(config.run_grace_secs)))
            .with_bus(SessionBus::new())
            .with_store(Arc::clone(&store));

        let mut planner_config = PlannerConfig::new(model, prompts.get("make_plan")?);
        planner_config.temperature = config.plan.temperature;
        planner_config.max_tokens = config.plan.max_tokens;
        let planner = Planner::new(planner_config, provider, Arc::clone(&store));

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            planner: Arc::new(planner),
            store,
            auth: Arc::new(TokenVerifier::new(config.auth.tokens.clone())),
            heartbeat: Duration::from_secs(config.heartbeat_secs.max(1)),
        })
    }

    pub fn registry(&self) -> &RunRegistry {
        self.orchestrator.registry()
    }

    pub fn bus(&self) -> &SessionBus {
        self.orchestrator.bus()
    }
}
