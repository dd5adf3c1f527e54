use cogwheel_core::PeerId;
use thiserror::Error;

/// Errors raised by the delegation mesh.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("peer unavailable: {0}")]
    PeerUnavailable(PeerId),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("clock event {0} does not match its content")]
    InvalidClock(String),

    #[error("unexpected topic: {0}")]
    UnknownTopic(String),
}
