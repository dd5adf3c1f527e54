use std::env;
use std::path::Path;
use std::str::FromStr;

use crate::capability::{flags, Capabilities};
use crate::error::ConfigError;

use super::types::Config;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|v| v.parse().ok())
}

impl Config {
    /// Parse config from a TOML string, apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus environment overrides (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// File if given, otherwise environment only.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        load_dotenv();
        match path {
            Some(p) => Self::from_file(p),
            None => Self::from_env(),
        }
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `COGWHEEL_SECTION_KEY` overrides `section.key`, e.g.
    /// `COGWHEEL_EXECUTOR_MAX_WORKERS` -> `executor.max_workers`.
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(v) = env_opt("COGWHEEL_NODE_PEER_ID") {
            self.node.peer_id = v;
        }
        if let Some(v) = env_opt("COGWHEEL_NODE_CAPABILITIES") {
            self.node.capabilities = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(v) = env_parse("COGWHEEL_NODE_CPU_CORES") {
            self.node.cpu_cores = v;
        }
        if let Some(v) = env_parse("COGWHEEL_NODE_GPU_COUNT") {
            self.node.gpu_count = v;
        }
        if let Some(v) = env_parse("COGWHEEL_NODE_MEMORY_MB") {
            self.node.memory_mb = v;
        }

        if let Some(v) = env_parse("COGWHEEL_SCHEDULER_AGING_WINDOW_MS") {
            self.scheduler.aging_window_ms = v;
        }
        if let Some(v) = env_parse("COGWHEEL_SCHEDULER_AGING_WEIGHT") {
            self.scheduler.aging_weight = v;
        }
        if let Some(v) = env_parse("COGWHEEL_SCHEDULER_DEPENDENCY_WEIGHT") {
            self.scheduler.dependency_weight = v;
        }
        if let Some(v) = env_parse("COGWHEEL_SCHEDULER_URGENCY_BOOST") {
            self.scheduler.urgency_boost = v;
        }
        if let Some(v) = env_parse("COGWHEEL_SCHEDULER_TICK_INTERVAL_MS") {
            self.scheduler.tick_interval_ms = v;
        }
        if let Some(v) = env_opt("COGWHEEL_SCHEDULER_STRATEGY") {
            self.scheduler.strategy = v;
        }

        if let Some(v) = env_parse("COGWHEEL_EXECUTOR_MAX_WORKERS") {
            self.executor.max_workers = v;
        }
        if let Some(v) = env_parse("COGWHEEL_EXECUTOR_MAX_RETRIES") {
            self.executor.max_retries = v;
        }
        if let Some(v) = env_parse("COGWHEEL_EXECUTOR_TASK_TIMEOUT_MS") {
            self.executor.task_timeout_ms = v;
        }
        if let Some(v) = env_parse("COGWHEEL_EXECUTOR_BACKOFF_BASE_MS") {
            self.executor.backoff_base_ms = v;
        }
        if let Some(v) = env_parse("COGWHEEL_EXECUTOR_BACKOFF_MAX_MS") {
            self.executor.backoff_max_ms = v;
        }
        if let Some(v) = env_parse("COGWHEEL_EXECUTOR_CANCEL_GRACE_MS") {
            self.executor.cancel_grace_ms = v;
        }

        if let Some(v) = env_parse("COGWHEEL_MESH_HEARTBEAT_INTERVAL_MS") {
            self.mesh.heartbeat_interval_ms = v;
        }
        if let Some(v) = env_parse("COGWHEEL_MESH_HEARTBEAT_MISS_LIMIT") {
            self.mesh.heartbeat_miss_limit = v;
        }
        if let Some(v) = env_parse("COGWHEEL_MESH_LOAD_PENALTY") {
            self.mesh.load_penalty = v;
        }
        if let Some(v) = env_parse("COGWHEEL_MESH_CLOCK_HISTORY") {
            self.mesh.clock_history = v;
        }

        if let Some(v) = env_parse("COGWHEEL_GRAPH_RETENTION_SECS") {
            self.graph.retention_secs = v;
        }
        if let Some(v) = env_opt("COGWHEEL_GRAPH_SYNTHESIS_POLICY") {
            self.graph.synthesis_policy = v;
        }
        if let Some(v) = env_opt("COGWHEEL_GRAPH_BEST_EFFORT_FALLBACK") {
            self.graph.best_effort_fallback = v;
        }
        if let Some(v) = env_opt("COGWHEEL_GRAPH_SUBSTITUTE_PAYLOAD") {
            self.graph.substitute_payload = Some(v);
        }
        if let Some(v) = env_parse("COGWHEEL_GRAPH_FAN_OUT") {
            self.graph.fan_out = v;
        }
    }

    /// Capabilities the local node advertises to peers.
    ///
    /// Unknown flag names are rejected by [`Config::validate`].
    pub fn local_capabilities(&self) -> Capabilities {
        let flag_bits = self
            .node
            .capabilities
            .iter()
            .filter_map(|name| flags::parse(name))
            .fold(0, |acc, f| acc | f);
        Capabilities {
            flags: flag_bits,
            cpu_cores: self.node.cpu_cores,
            gpu_count: self.node.gpu_count,
            memory_mb: self.node.memory_mb,
            load: 0.0,
            max_tasks: self.executor.resolved_max_workers() as u32,
        }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (peer: {}):", self.node.peer_id);
        tracing::info!(
            "  scheduler:  strategy={}, W={}ms, Cw={}, Cd={}",
            self.scheduler.strategy,
            self.scheduler.aging_window_ms,
            self.scheduler.aging_weight,
            self.scheduler.dependency_weight
        );
        tracing::info!(
            "  executor:   workers={}, retries={}, timeout={}ms",
            self.executor.resolved_max_workers(),
            self.executor.max_retries,
            self.executor.task_timeout_ms
        );
        tracing::info!(
            "  mesh:       heartbeat={}ms, miss_limit={}",
            self.mesh.heartbeat_interval_ms,
            self.mesh.heartbeat_miss_limit
        );
        tracing::info!(
            "  graph:      retention={}s, synthesis={}, fallback={}",
            self.graph.retention_secs,
            self.graph.synthesis_policy,
            self.graph.best_effort_fallback
        );
    }
}
