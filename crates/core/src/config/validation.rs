use crate::capability::flags;
use crate::error::ConfigError;

use super::types::Config;

impl Config {
    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_scheduler()?;
        self.validate_mesh()?;
        self.validate_graph()?;
        self.validate_capabilities()?;
        Ok(())
    }

    fn validate_scheduler(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        if s.aging_window_ms == 0 {
            return Err(ConfigError::Invalid("scheduler.aging_window_ms must be > 0".into()));
        }
        if s.aging_weight < 0.0 || s.dependency_weight < 0.0 || s.urgency_boost < 0.0 {
            return Err(ConfigError::Invalid(
                "scheduler weights must not be negative".into(),
            ));
        }
        match s.strategy.as_str() {
            "aging" | "static" => Ok(()),
            other => Err(ConfigError::Invalid(format!(
                "invalid scheduler strategy '{other}', expected 'aging' or 'static'"
            ))),
        }
    }

    fn validate_mesh(&self) -> Result<(), ConfigError> {
        if self.mesh.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid("mesh.heartbeat_interval_ms must be > 0".into()));
        }
        if self.mesh.heartbeat_miss_limit == 0 {
            return Err(ConfigError::Invalid("mesh.heartbeat_miss_limit must be > 0".into()));
        }
        Ok(())
    }

    fn validate_graph(&self) -> Result<(), ConfigError> {
        match self.graph.synthesis_policy.as_str() {
            "latest" | "majority" | "manual" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "invalid synthesis policy '{other}', expected 'latest', 'majority' or 'manual'"
                )))
            }
        }
        match self.graph.best_effort_fallback.as_str() {
            "proceed" => Ok(()),
            "substitute" if self.graph.substitute_payload.is_some() => Ok(()),
            "substitute" => Err(ConfigError::Invalid(
                "best_effort_fallback 'substitute' requires graph.substitute_payload".into(),
            )),
            other => Err(ConfigError::Invalid(format!(
                "invalid best_effort_fallback '{other}', expected 'proceed' or 'substitute'"
            ))),
        }
    }

    fn validate_capabilities(&self) -> Result<(), ConfigError> {
        for name in &self.node.capabilities {
            if flags::parse(name).is_none() {
                return Err(ConfigError::Invalid(format!("unknown capability '{name}'")));
            }
        }
        Ok(())
    }
}
