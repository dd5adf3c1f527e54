pub mod clock;
pub mod coordinator;
pub mod error;
pub mod message;
pub mod protocol;
pub mod score;
pub mod transport;

pub use clock::{CausalOrder, ClockEvent, ClockHash, ClockSnapshot, MerkleClock};
pub use coordinator::{
    Arbitration, Delegation, DelegationState, DistributedCoordinator, ForeignTask, LedgerEntry,
    PeerInfo, Placement, ReportOutcome,
};
pub use error::MeshError;
pub use message::Message;
pub use protocol::topics;
pub use transport::{MemoryHub, MemoryTransport, PeerTransport, TransportEvent};
