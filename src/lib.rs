//! simbus — distributed co-simulation middleware
//!
//! Independent participants (one per OS process) exchange typed bus traffic
//! (CAN, Ethernet, FlexRay, LIN), publish/subscribe data, and RPC calls
//! while optionally coordinating a shared virtual clock and a global
//! lifecycle. A central registry bootstraps the overlay; once peers are
//! connected, all data flows peer-to-peer.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod net;
pub mod participant;
pub mod services;
pub mod wire;

pub use config::ParticipantConfiguration;
pub use descriptor::{EndpointAddress, NetworkType, ServiceDescriptor, ServiceType};
pub use error::{SilKitError, SilKitResult};
pub use net::{Registry, REGISTRY_PARTICIPANT_ID, REGISTRY_PARTICIPANT_NAME};
pub use participant::Participant;
pub use services::matching::{LabelKind, MatchingLabel, PubSubSpec};
pub use services::orchestration::{
    OperationMode, ParticipantState, ParticipantStatus, SystemState, TimeAdvanceMode,
};
pub use wire::message::{CanFrame, DataMessageEvent, ProtocolVersion, PROTOCOL_VERSION};
