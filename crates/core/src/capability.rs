//! Peer capability descriptors and per-task hard requirements.
//!
//! Discrete capabilities are encoded as bit flags so that two descriptors can
//! be compared with a Hamming distance; continuous resources are plain numbers.

use serde::{Deserialize, Serialize};

/// Bit flags describing discrete peer capabilities.
pub mod flags {
    pub const GPU: u32 = 1 << 0;
    pub const CUDA: u32 = 1 << 1;
    pub const LARGE_MEMORY: u32 = 1 << 2;
    pub const FAST_DISK: u32 = 1 << 3;
    pub const NETWORK_EGRESS: u32 = 1 << 4;
    pub const LLM_ACCESS: u32 = 1 << 5;

    /// Number of flag bits considered when computing similarity.
    pub const WIDTH: u32 = 6;

    /// Parse a flag name as it appears in config files.
    pub fn parse(name: &str) -> Option<u32> {
        match name.to_ascii_lowercase().as_str() {
            "gpu" => Some(GPU),
            "cuda" => Some(CUDA),
            "large_memory" => Some(LARGE_MEMORY),
            "fast_disk" => Some(FAST_DISK),
            "network_egress" => Some(NETWORK_EGRESS),
            "llm_access" => Some(LLM_ACCESS),
            _ => None,
        }
    }
}

/// What a peer advertises about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub flags: u32,
    pub cpu_cores: u32,
    pub gpu_count: u32,
    pub memory_mb: u64,
    /// Current load in `[0.0, 1.0]`.
    pub load: f64,
    /// Maximum number of concurrently assigned tasks the peer accepts.
    pub max_tasks: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            flags: 0,
            cpu_cores: 1,
            gpu_count: 0,
            memory_mb: 1024,
            load: 0.0,
            max_tasks: 4,
        }
    }
}

impl Capabilities {
    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag == flag
    }
}

/// Constraints a task places on the peer that executes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    /// Flags the peer must have.
    pub required_flags: u32,
    /// Flags that improve the score but are not mandatory.
    pub preferred_flags: u32,
    pub min_cpu_cores: u32,
    pub min_memory_mb: u64,
}

impl Requirements {
    pub fn gpu() -> Self {
        Self {
            required_flags: flags::GPU,
            ..Default::default()
        }
    }

    /// Hard-requirement check; scoring only ranks peers that pass this.
    pub fn satisfied_by(&self, caps: &Capabilities) -> bool {
        caps.has(self.required_flags)
            && caps.cpu_cores >= self.min_cpu_cores
            && caps.memory_mb >= self.min_memory_mb
            && (self.required_flags & flags::GPU == 0 || caps.gpu_count > 0)
    }
}
