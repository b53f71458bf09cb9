//! Services: discovery, matching, controllers, orchestration, observability

pub mod can;
pub mod discovery;
pub mod ethernet;
pub mod flexray;
pub mod handlers;
pub mod lin;
pub mod logging;
pub mod matching;
pub mod metrics;
pub mod orchestration;
pub mod pubsub;
pub mod rpc;

pub use can::{CanController, CanControllerState};
pub use discovery::ServiceDiscovery;
pub use ethernet::EthernetController;
pub use flexray::FlexrayController;
pub use handlers::{HandlerId, Handlers};
pub use lin::{LinController, LinControllerMode};
pub use matching::{LabelKind, MatchingLabel, PubSubSpec};
pub use metrics::MetricsManager;
pub use pubsub::{DataPublisher, DataSubscriber};
pub use rpc::{RpcCallHandle, RpcClient, RpcServer, RpcSpec};
