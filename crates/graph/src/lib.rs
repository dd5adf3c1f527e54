//! Graph-of-Thought dependency graph with decomposition and synthesis.

pub mod dag;
pub mod decompose;
pub mod error;
pub mod synthesis;

pub use dag::{DependencyGraph, DependencyInput, Edge, EdgeType, Settled};
pub use decompose::{DecompositionRegistry, DecompositionStrategy, FixedFanOut};
pub use error::GraphError;
pub use synthesis::{ChildResult, Synthesis, SynthesisPolicy, SynthesisStrategy};
