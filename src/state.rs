//! Application state: prompts, pipeline settings, usage recorder and the optional oracle.
//!
//! The usage recorder is built once here and shared by every oracle call
//! (through `TrackedOracle`) and by the usage endpoints.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::config::{load_agent_config_from_env, AgentConfig, PipelineSettings, Prompts};
use crate::oracle::{OpenAiOracle, Oracle, TrackedOracle};
use crate::pipeline::Pipeline;
use crate::usage::{UsageRecorder, UsageTracker};

#[derive(Clone)]
pub struct AppState {
    pub oracle: Option<Arc<dyn Oracle>>,
    pub usage: Arc<dyn UsageRecorder>,
    pub prompts: Arc<Prompts>,
    pub settings: PipelineSettings,
}

impl AppState {
    /// Build state from env: load config, init the usage recorder and OpenAI.
    #[instrument(level = "info", skip_all)]
    pub fn new() -> Self {
        let cfg = load_agent_config_from_env().unwrap_or_default();
        let usage: Arc<dyn UsageRecorder> = Arc::new(UsageTracker::new());

        let oracle = OpenAiOracle::from_env();
        if let Some(oa) = &oracle {
            info!(target: "qvariant_backend", base_url = %oa.base_url, fast_model = %oa.fast_model, strong_model = %oa.strong_model, "OpenAI enabled.");
        } else {
            info!(target: "qvariant_backend", "OpenAI disabled (no OPENAI_API_KEY). Generation requests will be rejected.");
        }
        let oracle = oracle.map(|oa| Arc::new(oa) as Arc<dyn Oracle>);

        Self::from_parts(oracle, usage, cfg)
    }

    /// Wrap `oracle` so every call lands on `usage`.
    pub fn from_parts(oracle: Option<Arc<dyn Oracle>>, usage: Arc<dyn UsageRecorder>, cfg: AgentConfig) -> Self {
        info!(
            target: "qvariant_backend",
            max_retries = cfg.pipeline.max_retries,
            max_auto_retry = cfg.pipeline.max_auto_retry,
            target_verified = cfg.pipeline.target_verified,
            "Pipeline settings"
        );
        let oracle =
            oracle.map(|inner| Arc::new(TrackedOracle::new(inner, usage.clone())) as Arc<dyn Oracle>);
        Self { oracle, usage, prompts: Arc::new(cfg.prompts), settings: cfg.pipeline }
    }

    /// A pipeline for one request. `max_retries` overrides the configured attempt count.
    pub fn pipeline(&self, max_retries: Option<u32>) -> Option<Pipeline> {
        let oracle = self.oracle.clone()?;
        let mut settings = self.settings.clone();
        if let Some(n) = max_retries {
            settings.max_retries = n.max(1);
        }
        Some(Pipeline::new(oracle, self.prompts.clone(), settings))
    }
}
