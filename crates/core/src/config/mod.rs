//! Configuration for a cogwheel node.
//!
//! Split into focused submodules:
//! - `types`: config structs and serde defaults
//! - `loading`: TOML parsing, `.env` and environment overrides
//! - `validation`: rejecting unusable settings

mod loading;
mod types;
mod validation;

pub use loading::load_dotenv;
pub use types::{
    Config, ExecutorSettings, GraphSettings, MeshSettings, NodeConfig, SchedulerSettings,
};
