//! Parley peer engine.
//!
//! Connection handshake, key exchange and encrypted delivery between two
//! peers over a lock-step request/reply transport.

#![forbid(unsafe_code)]

pub mod config;
pub mod coordinator;
pub mod directory;
pub mod events;
pub mod transport;

pub use config::PeerConfig;
pub use coordinator::{Coordinator, CONNECTION_LOST, DECISION_TIMEOUT_REASON};
pub use directory::{ConnectionState, PeerAddress, PeerDirectory, PeerRecord};
pub use events::{EventSubscription, PeerEvent};
pub use transport::TransportEndpoint;
