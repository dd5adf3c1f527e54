use serde::{Deserialize, Serialize};

/// Top-level configuration, typically parsed from `cogwheel.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub mesh: MeshSettings,
    #[serde(default)]
    pub graph: GraphSettings,
}

// ── Node ──────────────────────────────────────────────────────

/// Identity and advertised resources of the local node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_peer_id")]
    pub peer_id: String,
    /// Capability flag names, e.g. `["gpu", "llm_access"]`.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: u32,
    #[serde(default)]
    pub gpu_count: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
}

fn default_peer_id() -> String {
    "local".into()
}

fn default_cpu_cores() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4)
}

fn default_memory_mb() -> u64 {
    4096
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: default_peer_id(),
            capabilities: Vec::new(),
            cpu_cores: default_cpu_cores(),
            gpu_count: 0,
            memory_mb: default_memory_mb(),
        }
    }
}

// ── Scheduler ─────────────────────────────────────────────────

/// Priority computation constants.
///
/// `effective = base - min(wait / W, 1) * Cw - (done / max(total, 1)) * Cd`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// W: waiting time after which the aging bonus saturates.
    #[serde(default = "default_aging_window")]
    pub aging_window_ms: u64,
    /// Cw: maximum aging bonus.
    #[serde(default = "default_aging_weight")]
    pub aging_weight: f64,
    /// Cd: maximum dependency-progress bonus.
    #[serde(default = "default_dependency_weight")]
    pub dependency_weight: f64,
    /// Key reduction applied to a task that lost its peer.
    #[serde(default = "default_urgency_boost")]
    pub urgency_boost: f64,
    /// Periodic recomputation tick.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// "aging" or "static".
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

fn default_aging_window() -> u64 {
    60_000
}
fn default_aging_weight() -> f64 {
    1.0
}
fn default_dependency_weight() -> f64 {
    0.5
}
fn default_urgency_boost() -> f64 {
    2.0
}
fn default_tick_interval() -> u64 {
    1_000
}
fn default_strategy() -> String {
    "aging".into()
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            aging_window_ms: default_aging_window(),
            aging_weight: default_aging_weight(),
            dependency_weight: default_dependency_weight(),
            urgency_boost: default_urgency_boost(),
            tick_interval_ms: default_tick_interval(),
            strategy: default_strategy(),
        }
    }
}

// ── Executor ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Worker pool size. 0 = available parallelism.
    #[serde(default)]
    pub max_workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_ms: u64,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
    /// How long a timed-out payload may keep running after its cancel signal.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_task_timeout() -> u64 {
    300_000
}
fn default_backoff_base() -> u64 {
    200
}
fn default_backoff_max() -> u64 {
    30_000
}
fn default_cancel_grace() -> u64 {
    2_000
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_workers: 0,
            max_retries: default_max_retries(),
            task_timeout_ms: default_task_timeout(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            cancel_grace_ms: default_cancel_grace(),
        }
    }
}

impl ExecutorSettings {
    /// Resolve worker count (0 means use available parallelism).
    pub fn resolved_max_workers(&self) -> usize {
        if self.max_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.max_workers
        }
    }
}

// ── Mesh ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSettings {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeats before an assignment is considered lost.
    #[serde(default = "default_heartbeat_miss_limit")]
    pub heartbeat_miss_limit: u32,
    /// Score penalty per task already assigned to a peer.
    #[serde(default = "default_load_penalty")]
    pub load_penalty: f64,
    /// Clock events carried in each outgoing message.
    #[serde(default = "default_clock_history")]
    pub clock_history: usize,
}

fn default_heartbeat_interval() -> u64 {
    5_000
}
fn default_heartbeat_miss_limit() -> u32 {
    3
}
fn default_load_penalty() -> f64 {
    0.1
}
fn default_clock_history() -> usize {
    64
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_miss_limit: default_heartbeat_miss_limit(),
            load_penalty: default_load_penalty(),
            clock_history: default_clock_history(),
        }
    }
}

// ── Graph ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSettings {
    /// Terminal nodes older than this are garbage-collected.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    /// "latest", "majority" or "manual".
    #[serde(default = "default_synthesis_policy")]
    pub synthesis_policy: String,
    /// "proceed" or "substitute".
    #[serde(default = "default_fallback")]
    pub best_effort_fallback: String,
    /// Payload used when `best_effort_fallback = "substitute"`.
    #[serde(default)]
    pub substitute_payload: Option<String>,
    /// Children created by the fixed fan-out decomposition.
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
}

fn default_retention() -> u64 {
    3_600
}
fn default_synthesis_policy() -> String {
    "latest".into()
}
fn default_fallback() -> String {
    "proceed".into()
}
fn default_fan_out() -> usize {
    3
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            retention_secs: default_retention(),
            synthesis_policy: default_synthesis_policy(),
            best_effort_fallback: default_fallback(),
            substitute_payload: None,
            fan_out: default_fan_out(),
        }
    }
}
