//! Service descriptors: the identity of every controller and endpoint

use siphasher::sip::SipHasher13;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;

/// Discriminator keys carried in a descriptor's supplemental data.
/// The matching layer reads these to pair publishers with subscribers.
pub mod keys {
    pub const CONTROLLER_TYPE: &str = "controllerType";

    pub const CONTROLLER_TYPE_CAN: &str = "can";
    pub const CONTROLLER_TYPE_ETHERNET: &str = "ethernet";
    pub const CONTROLLER_TYPE_FLEXRAY: &str = "flexray";
    pub const CONTROLLER_TYPE_LIN: &str = "lin";
    pub const CONTROLLER_TYPE_DATA_PUBLISHER: &str = "dataPublisher";
    pub const CONTROLLER_TYPE_DATA_SUBSCRIBER: &str = "dataSubscriber";
    pub const CONTROLLER_TYPE_DATA_SUBSCRIBER_INTERNAL: &str = "dataSubscriberInternal";
    pub const CONTROLLER_TYPE_RPC_CLIENT: &str = "rpcClient";
    pub const CONTROLLER_TYPE_RPC_SERVER: &str = "rpcServer";
    pub const CONTROLLER_TYPE_RPC_SERVER_INTERNAL: &str = "rpcServerInternal";
    pub const CONTROLLER_TYPE_LIFECYCLE_SERVICE: &str = "lifecycleService";
    pub const CONTROLLER_TYPE_TIME_SYNC_SERVICE: &str = "timeSyncService";
    pub const CONTROLLER_TYPE_SYSTEM_MONITOR: &str = "systemMonitor";
    pub const CONTROLLER_TYPE_SYSTEM_CONTROLLER: &str = "systemController";
    pub const CONTROLLER_TYPE_SERVICE_DISCOVERY: &str = "serviceDiscovery";
    pub const CONTROLLER_TYPE_LOG_MSG_SENDER: &str = "logMsgSender";
    pub const CONTROLLER_TYPE_METRICS_SENDER: &str = "metricsSender";

    pub const DATA_PUBLISHER_TOPIC: &str = "dataPublisherTopic";
    pub const DATA_PUBLISHER_PUB_UUID: &str = "dataPublisherPubUUID";
    pub const DATA_PUBLISHER_MEDIA_TYPE: &str = "dataPublisherMediaType";
    pub const DATA_PUBLISHER_PUB_LABELS: &str = "dataPublisherPubLabels";

    pub const RPC_CLIENT_FUNCTION_NAME: &str = "rpcClientFunctionName";
    pub const RPC_CLIENT_MEDIA_TYPE: &str = "rpcClientMediaType";
    pub const RPC_CLIENT_LABELS: &str = "rpcClientLabels";
    pub const RPC_CLIENT_UUID: &str = "rpcClientUUID";

    pub const TIME_SYNC_ACTIVE: &str = "timeSyncActive";
}

/// Role a service plays inside a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    Controller,
    InternalController,
    Link,
    SimulatedNetwork,
}

impl ServiceType {
    pub fn as_u8(self) -> u8 {
        match self {
            ServiceType::Controller => 1,
            ServiceType::InternalController => 2,
            ServiceType::Link => 3,
            ServiceType::SimulatedNetwork => 4,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ServiceType::Controller),
            2 => Some(ServiceType::InternalController),
            3 => Some(ServiceType::Link),
            4 => Some(ServiceType::SimulatedNetwork),
            _ => None,
        }
    }
}

/// Kind of network a link belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NetworkType {
    #[default]
    Undefined,
    Can,
    Ethernet,
    Flexray,
    Lin,
    Data,
    Rpc,
}

impl NetworkType {
    pub fn as_u8(self) -> u8 {
        match self {
            NetworkType::Undefined => 0,
            NetworkType::Can => 1,
            NetworkType::Ethernet => 2,
            NetworkType::Flexray => 3,
            NetworkType::Lin => 4,
            NetworkType::Data => 5,
            NetworkType::Rpc => 6,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(NetworkType::Undefined),
            1 => Some(NetworkType::Can),
            2 => Some(NetworkType::Ethernet),
            3 => Some(NetworkType::Flexray),
            4 => Some(NetworkType::Lin),
            5 => Some(NetworkType::Data),
            6 => Some(NetworkType::Rpc),
            _ => None,
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkType::Undefined => "Undefined",
            NetworkType::Can => "CAN",
            NetworkType::Ethernet => "Ethernet",
            NetworkType::Flexray => "FlexRay",
            NetworkType::Lin => "LIN",
            NetworkType::Data => "Data",
            NetworkType::Rpc => "RPC",
        };
        f.write_str(s)
    }
}

/// Stable numeric participant id derived from the participant name.
///
/// The hash is keyed with a fixed key so every participant computes the same
/// id for the same name, across processes and platforms.
pub fn participant_id_of(participant_name: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0x5349_4c4b_4954_0001, 0x7061_7274_6963_6970);
    hasher.write(participant_name.as_bytes());
    hasher.finish()
}

/// Address of a service endpoint in wire messages and routing maps.
/// Messages carry ids, never names or pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointAddress {
    pub participant_id: u64,
    pub service_id: u64,
}

/// Full identity of a controller or internal endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub participant_name: String,
    pub participant_id: u64,
    pub network_name: String,
    pub service_name: String,
    pub service_type: ServiceType,
    pub network_type: NetworkType,
    pub service_id: u64,
    pub supplemental_data: BTreeMap<String, String>,
}

impl ServiceDescriptor {
    pub fn new(participant_name: &str, network_name: &str, service_name: &str, service_id: u64) -> Self {
        Self {
            participant_name: participant_name.to_string(),
            participant_id: participant_id_of(participant_name),
            network_name: network_name.to_string(),
            service_name: service_name.to_string(),
            service_type: ServiceType::Controller,
            network_type: NetworkType::Undefined,
            service_id,
            supplemental_data: BTreeMap::new(),
        }
    }

    pub fn endpoint_address(&self) -> EndpointAddress {
        EndpointAddress {
            participant_id: self.participant_id,
            service_id: self.service_id,
        }
    }

    pub fn supplemental(&self, key: &str) -> Option<&str> {
        self.supplemental_data.get(key).map(String::as_str)
    }

    pub fn set_supplemental(&mut self, key: &str, value: impl Into<String>) {
        self.supplemental_data.insert(key.to_string(), value.into());
    }

    /// Controller type discriminator, if present.
    pub fn controller_type(&self) -> Option<&str> {
        self.supplemental(keys::CONTROLLER_TYPE)
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} (id {})",
            self.participant_name, self.network_name, self.service_name, self.service_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_id_is_stable() {
        let a = participant_id_of("CanWriter");
        let b = participant_id_of("CanWriter");
        assert_eq!(a, b);
        assert_ne!(a, participant_id_of("CanReader"));
    }

    #[test]
    fn service_type_round_trip() {
        for st in [
            ServiceType::Controller,
            ServiceType::InternalController,
            ServiceType::Link,
            ServiceType::SimulatedNetwork,
        ] {
            assert_eq!(ServiceType::from_u8(st.as_u8()), Some(st));
        }
        assert_eq!(ServiceType::from_u8(0), None);
    }

    #[test]
    fn network_type_round_trip() {
        for nt in [
            NetworkType::Undefined,
            NetworkType::Can,
            NetworkType::Ethernet,
            NetworkType::Flexray,
            NetworkType::Lin,
            NetworkType::Data,
            NetworkType::Rpc,
        ] {
            assert_eq!(NetworkType::from_u8(nt.as_u8()), Some(nt));
        }
        assert_eq!(NetworkType::from_u8(200), None);
    }

    #[test]
    fn descriptor_endpoint_address_uses_ids() {
        let mut sd = ServiceDescriptor::new("P1", "CAN1", "CanController1", 7);
        sd.set_supplemental(keys::CONTROLLER_TYPE, keys::CONTROLLER_TYPE_CAN);
        let ea = sd.endpoint_address();
        assert_eq!(ea.participant_id, participant_id_of("P1"));
        assert_eq!(ea.service_id, 7);
        assert_eq!(sd.controller_type(), Some(keys::CONTROLLER_TYPE_CAN));
    }
}
