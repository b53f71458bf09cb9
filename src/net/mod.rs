//! Networking layer: peer transport, connection routing, rendezvous

pub mod connection;
pub mod handshake;
pub mod peer;
pub mod registry;
pub mod uri;

pub use connection::{Connection, ReceiverFn, ReceiverHandle};
pub use peer::{DispatchCmd, PeerSender, PeerStream};
pub use registry::{Registry, REGISTRY_PARTICIPANT_ID, REGISTRY_PARTICIPANT_NAME};
pub use uri::AcceptorUri;
