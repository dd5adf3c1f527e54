pub mod capability;
pub mod config;
pub mod error;
pub mod ids;
pub mod storage;
pub mod task;

pub use capability::{Capabilities, Requirements};
pub use config::Config;
pub use error::*;
pub use ids::*;
pub use storage::{MemoryStore, PayloadStore};
pub use task::*;
