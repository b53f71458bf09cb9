//! Typed wire messages
//!
//! One integer tag per message kind. Handshake frames (announcement,
//! announcement reply, known participants) carry a registry header with the
//! protocol version; every other frame is a routed message prefixed with the
//! sender's endpoint address and the link name, so the connection layer can
//! resolve `(kind, link)` to local receivers without touching the payload.

use super::buffer::{MessageBuffer, MessageReader, WireError};
use crate::descriptor::{EndpointAddress, NetworkType, ServiceDescriptor, ServiceType};
use std::collections::BTreeMap;
use std::fmt;

/// Magic preamble of handshake frames.
pub const REGISTRY_PREAMBLE: [u8; 4] = *b"SBUS";

/// Current protocol version. Minor bumps are additive (trailing fields);
/// major bumps are incompatible.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 3, minor: 1 };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    ParticipantAnnouncement = 1,
    ParticipantAnnouncementReply = 2,
    KnownParticipants = 3,
    SubscriptionAnnouncement = 5,
    SubscriptionAcknowledge = 6,

    ServiceDiscoveryEvent = 10,
    ParticipantDiscoveryEvent = 11,

    NextSimTask = 20,
    ParticipantStatus = 21,
    SystemCommand = 22,
    WorkflowConfiguration = 23,

    LogMsg = 30,
    MetricsUpdate = 31,

    CanFrameEvent = 40,
    CanFrameTransmitEvent = 41,
    CanControllerStatus = 42,
    CanConfigureBaudrate = 43,
    CanSetControllerMode = 44,

    EthernetFrameEvent = 50,
    EthernetFrameTransmitEvent = 51,

    LinSendFrameRequest = 60,
    LinTransmission = 61,

    FlexrayFrameEvent = 70,
    FlexrayFrameTransmitEvent = 71,

    DataMessageEvent = 80,

    FunctionCall = 90,
    FunctionCallResponse = 91,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        use MessageKind::*;
        Some(match v {
            1 => ParticipantAnnouncement,
            2 => ParticipantAnnouncementReply,
            3 => KnownParticipants,
            5 => SubscriptionAnnouncement,
            6 => SubscriptionAcknowledge,
            10 => ServiceDiscoveryEvent,
            11 => ParticipantDiscoveryEvent,
            20 => NextSimTask,
            21 => ParticipantStatus,
            22 => SystemCommand,
            23 => WorkflowConfiguration,
            30 => LogMsg,
            31 => MetricsUpdate,
            40 => CanFrameEvent,
            41 => CanFrameTransmitEvent,
            42 => CanControllerStatus,
            43 => CanConfigureBaudrate,
            44 => CanSetControllerMode,
            50 => EthernetFrameEvent,
            51 => EthernetFrameTransmitEvent,
            60 => LinSendFrameRequest,
            61 => LinTransmission,
            70 => FlexrayFrameEvent,
            71 => FlexrayFrameTransmitEvent,
            80 => DataMessageEvent,
            90 => FunctionCall,
            91 => FunctionCallResponse,
            _ => return None,
        })
    }

    /// Control-plane kinds are broadcast to every peer; data-plane kinds only
    /// to peers that announced a subscription for the link.
    pub fn is_control_plane(self) -> bool {
        use MessageKind::*;
        matches!(
            self,
            ServiceDiscoveryEvent
                | ParticipantDiscoveryEvent
                | NextSimTask
                | ParticipantStatus
                | SystemCommand
                | WorkflowConfiguration
        )
    }
}

// =============================================================================
// HANDSHAKE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryMsgHeader {
    pub preamble: [u8; 4],
    pub version: ProtocolVersion,
}

impl RegistryMsgHeader {
    pub fn new(version: ProtocolVersion) -> Self {
        Self { preamble: REGISTRY_PREAMBLE, version }
    }

    fn encode(&self, w: &mut MessageBuffer) {
        w.put_raw(&self.preamble);
        w.put_u16(self.version.major);
        w.put_u16(self.version.minor);
    }

    fn decode(r: &mut MessageReader<'_>) -> Result<Self, WireError> {
        let mut preamble = [0u8; 4];
        for b in preamble.iter_mut() {
            *b = r.get_u8()?;
        }
        let major = r.get_u16()?;
        let minor = r.get_u16()?;
        Ok(Self { preamble, version: ProtocolVersion { major, minor } })
    }
}

/// What a peer advertises about itself during rendezvous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub participant_name: String,
    pub participant_id: u64,
    pub acceptor_uris: Vec<String>,
    pub capabilities: Vec<String>,
}

impl PeerInfo {
    fn encode(&self, w: &mut MessageBuffer) {
        w.put_string(&self.participant_name);
        w.put_u64(self.participant_id);
        w.put_string_seq(&self.acceptor_uris);
        w.put_string_seq(&self.capabilities);
    }

    fn decode(r: &mut MessageReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            participant_name: r.get_string()?,
            participant_id: r.get_u64()?,
            acceptor_uris: r.get_string_seq()?,
            capabilities: r.get_string_seq()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantAnnouncement {
    pub header: RegistryMsgHeader,
    pub peer_info: PeerInfo,
    pub simulation_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnouncementStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantAnnouncementReply {
    pub header: RegistryMsgHeader,
    pub status: AnnouncementStatus,
    pub diagnostic: String,
    /// The responder's own peer info, so the initiator can register the peer
    /// without a second round trip.
    pub peer_info: PeerInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownParticipants {
    pub header: RegistryMsgHeader,
    pub peer_infos: Vec<PeerInfo>,
}

/// "I have a local receiver for `(kind, link)`" — sent when a receiver is
/// registered, and replayed to every newly connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionAnnouncement {
    pub kind: MessageKind,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionAcknowledge {
    pub kind: MessageKind,
    pub link: String,
}

// =============================================================================
// DISCOVERY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceDiscoveryEventKind {
    ServiceCreated,
    ServiceRemoved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDiscoveryEvent {
    pub kind: ServiceDiscoveryEventKind,
    pub descriptor: ServiceDescriptor,
}

/// Snapshot of a participant's live services, sent to a peer right after the
/// announcement exchange. Late joiners learn pre-existing services this way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantDiscoveryEvent {
    pub descriptors: Vec<ServiceDescriptor>,
}

fn encode_descriptor(sd: &ServiceDescriptor, w: &mut MessageBuffer) {
    w.put_string(&sd.participant_name);
    w.put_u64(sd.participant_id);
    w.put_string(&sd.network_name);
    w.put_string(&sd.service_name);
    w.put_u8(sd.service_type.as_u8());
    w.put_u8(sd.network_type.as_u8());
    w.put_u64(sd.service_id);
    w.put_string_map(&sd.supplemental_data);
}

fn decode_descriptor(r: &mut MessageReader<'_>) -> Result<ServiceDescriptor, WireError> {
    let participant_name = r.get_string()?;
    let participant_id = r.get_u64()?;
    let network_name = r.get_string()?;
    let service_name = r.get_string()?;
    let service_type_raw = r.get_u8()?;
    let service_type = ServiceType::from_u8(service_type_raw)
        .ok_or(WireError::InvalidValue { what: "serviceType", value: service_type_raw as u64 })?;
    let network_type_raw = r.get_u8()?;
    let network_type = NetworkType::from_u8(network_type_raw)
        .ok_or(WireError::InvalidValue { what: "networkType", value: network_type_raw as u64 })?;
    let service_id = r.get_u64()?;
    let supplemental_data = r.get_string_map()?;
    Ok(ServiceDescriptor {
        participant_name,
        participant_id,
        network_name,
        service_name,
        service_type,
        network_type,
        service_id,
        supplemental_data,
    })
}

// =============================================================================
// ORCHESTRATION
// =============================================================================

/// One barrier entry: the next simulation step a participant intends to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextSimTask {
    pub time_point_ns: i64,
    pub duration_ns: i64,
}

/// Raw participant status as it travels on the wire. The orchestration layer
/// converts the state tag; unknown tags from newer peers map to Invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantStatusMsg {
    pub participant_name: String,
    pub state: u8,
    pub enter_reason: String,
    pub enter_time_ns: i64,
    pub refresh_time_ns: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCommandKind {
    AbortSimulation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemCommand {
    pub kind: SystemCommandKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowConfiguration {
    pub required_participant_names: Vec<String>,
}

// =============================================================================
// LOGGING / METRICS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMsg {
    pub logger_name: String,
    pub level: u8,
    pub time_ns: i64,
    pub body: String,
    pub key_values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Counter(u64),
    Statistic { count: u64, min: f64, max: f64, mean: f64 },
    StringList(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricData {
    pub timestamp_ns: i64,
    pub name: String,
    pub value: MetricValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsUpdate {
    pub metrics: Vec<MetricData>,
}

// =============================================================================
// CAN
// =============================================================================

/// Explicit flag bits of a CAN frame. Reserved bits must be zero.
pub mod can_flags {
    pub const RTR: u32 = 1 << 4;
    pub const IDE: u32 = 1 << 9;
    pub const FDF: u32 = 1 << 12;
    pub const BRS: u32 = 1 << 13;
    pub const ESI: u32 = 1 << 14;
    pub const XLF: u32 = 1 << 15;
    pub const SEC: u32 = 1 << 16;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CanFrame {
    pub can_id: u32,
    pub flags: u32,
    pub dlc: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitDirection {
    Tx,
    Rx,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrameEvent {
    pub timestamp_ns: i64,
    pub frame: CanFrame,
    pub direction: TransmitDirection,
    pub user_context: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanTransmitStatus {
    Transmitted,
    Canceled,
    TransmitQueueFull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrameTransmitEvent {
    pub timestamp_ns: i64,
    pub can_id: u32,
    pub status: CanTransmitStatus,
    pub user_context: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanControllerStatus {
    pub timestamp_ns: i64,
    pub controller_state: u8,
    pub error_state: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanConfigureBaudrate {
    pub rate: u32,
    pub fd_rate: u32,
    pub xl_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanSetControllerMode {
    pub mode: u8,
}

// =============================================================================
// ETHERNET / LIN / FLEXRAY
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrameEvent {
    pub timestamp_ns: i64,
    pub raw_frame: Vec<u8>,
    pub direction: TransmitDirection,
    pub user_context: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrameTransmitEvent {
    pub timestamp_ns: i64,
    pub status: u8,
    pub user_context: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinFrame {
    pub id: u8,
    pub checksum_model: u8,
    pub data_length: u8,
    pub data: [u8; 8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinSendFrameRequest {
    pub frame: LinFrame,
    pub response_type: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinTransmission {
    pub timestamp_ns: i64,
    pub frame: LinFrame,
    pub status: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlexrayHeader {
    pub flags: u8,
    pub frame_id: u16,
    pub payload_length: u8,
    pub header_crc: u16,
    pub cycle_count: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlexrayFrameEvent {
    pub timestamp_ns: i64,
    pub channel: u8,
    pub header: FlexrayHeader,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlexrayFrameTransmitEvent {
    pub timestamp_ns: i64,
    pub channel: u8,
    pub frame_id: u16,
    pub cycle_count: u8,
}

// =============================================================================
// PUBSUB / RPC
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessageEvent {
    pub timestamp_ns: i64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub timestamp_ns: i64,
    pub call_id: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCallResponse {
    pub timestamp_ns: i64,
    pub call_id: u64,
    pub data: Vec<u8>,
}

// =============================================================================
// ENVELOPES
// =============================================================================

/// Payload of every non-handshake frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutedMessage {
    ServiceDiscoveryEvent(ServiceDiscoveryEvent),
    ParticipantDiscoveryEvent(ParticipantDiscoveryEvent),
    NextSimTask(NextSimTask),
    ParticipantStatus(ParticipantStatusMsg),
    SystemCommand(SystemCommand),
    WorkflowConfiguration(WorkflowConfiguration),
    LogMsg(LogMsg),
    MetricsUpdate(MetricsUpdate),
    CanFrameEvent(CanFrameEvent),
    CanFrameTransmitEvent(CanFrameTransmitEvent),
    CanControllerStatus(CanControllerStatus),
    CanConfigureBaudrate(CanConfigureBaudrate),
    CanSetControllerMode(CanSetControllerMode),
    EthernetFrameEvent(EthernetFrameEvent),
    EthernetFrameTransmitEvent(EthernetFrameTransmitEvent),
    LinSendFrameRequest(LinSendFrameRequest),
    LinTransmission(LinTransmission),
    FlexrayFrameEvent(FlexrayFrameEvent),
    FlexrayFrameTransmitEvent(FlexrayFrameTransmitEvent),
    DataMessageEvent(DataMessageEvent),
    FunctionCall(FunctionCall),
    FunctionCallResponse(FunctionCallResponse),
}

impl RoutedMessage {
    pub fn kind(&self) -> MessageKind {
        use RoutedMessage::*;
        match self {
            ServiceDiscoveryEvent(_) => MessageKind::ServiceDiscoveryEvent,
            ParticipantDiscoveryEvent(_) => MessageKind::ParticipantDiscoveryEvent,
            NextSimTask(_) => MessageKind::NextSimTask,
            ParticipantStatus(_) => MessageKind::ParticipantStatus,
            SystemCommand(_) => MessageKind::SystemCommand,
            WorkflowConfiguration(_) => MessageKind::WorkflowConfiguration,
            LogMsg(_) => MessageKind::LogMsg,
            MetricsUpdate(_) => MessageKind::MetricsUpdate,
            CanFrameEvent(_) => MessageKind::CanFrameEvent,
            CanFrameTransmitEvent(_) => MessageKind::CanFrameTransmitEvent,
            CanControllerStatus(_) => MessageKind::CanControllerStatus,
            CanConfigureBaudrate(_) => MessageKind::CanConfigureBaudrate,
            CanSetControllerMode(_) => MessageKind::CanSetControllerMode,
            EthernetFrameEvent(_) => MessageKind::EthernetFrameEvent,
            EthernetFrameTransmitEvent(_) => MessageKind::EthernetFrameTransmitEvent,
            LinSendFrameRequest(_) => MessageKind::LinSendFrameRequest,
            LinTransmission(_) => MessageKind::LinTransmission,
            FlexrayFrameEvent(_) => MessageKind::FlexrayFrameEvent,
            FlexrayFrameTransmitEvent(_) => MessageKind::FlexrayFrameTransmitEvent,
            DataMessageEvent(_) => MessageKind::DataMessageEvent,
            FunctionCall(_) => MessageKind::FunctionCall,
            FunctionCallResponse(_) => MessageKind::FunctionCallResponse,
        }
    }

    /// Timestamp field for trace logging, when the kind carries one.
    pub fn timestamp_ns(&self) -> Option<i64> {
        use RoutedMessage::*;
        match self {
            CanFrameEvent(m) => Some(m.timestamp_ns),
            CanFrameTransmitEvent(m) => Some(m.timestamp_ns),
            CanControllerStatus(m) => Some(m.timestamp_ns),
            EthernetFrameEvent(m) => Some(m.timestamp_ns),
            EthernetFrameTransmitEvent(m) => Some(m.timestamp_ns),
            LinTransmission(m) => Some(m.timestamp_ns),
            FlexrayFrameEvent(m) => Some(m.timestamp_ns),
            FlexrayFrameTransmitEvent(m) => Some(m.timestamp_ns),
            DataMessageEvent(m) => Some(m.timestamp_ns),
            FunctionCall(m) => Some(m.timestamp_ns),
            FunctionCallResponse(m) => Some(m.timestamp_ns),
            _ => None,
        }
    }
}

/// A routed frame: sender address, link, payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedFrame {
    pub from: EndpointAddress,
    pub link: String,
    pub msg: RoutedMessage,
}

/// Everything that can arrive on a peer stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Announcement(ParticipantAnnouncement),
    AnnouncementReply(ParticipantAnnouncementReply),
    KnownParticipants(KnownParticipants),
    SubscriptionAnnouncement(SubscriptionAnnouncement),
    SubscriptionAcknowledge(SubscriptionAcknowledge),
    Routed(RoutedFrame),
}

// =============================================================================
// SERIALIZATION
// =============================================================================

impl Frame {
    pub fn kind(&self) -> MessageKind {
        match self {
            Frame::Announcement(_) => MessageKind::ParticipantAnnouncement,
            Frame::AnnouncementReply(_) => MessageKind::ParticipantAnnouncementReply,
            Frame::KnownParticipants(_) => MessageKind::KnownParticipants,
            Frame::SubscriptionAnnouncement(_) => MessageKind::SubscriptionAnnouncement,
            Frame::SubscriptionAcknowledge(_) => MessageKind::SubscriptionAcknowledge,
            Frame::Routed(rf) => rf.msg.kind(),
        }
    }

    /// Serialize to `<u8 kind><payload>` (without the outer length prefix).
    pub fn encode(&self) -> Vec<u8> {
        let mut w = MessageBuffer::new();
        w.put_u8(self.kind() as u8);
        match self {
            Frame::Announcement(m) => {
                m.header.encode(&mut w);
                m.peer_info.encode(&mut w);
                w.put_string(&m.simulation_name);
            }
            Frame::AnnouncementReply(m) => {
                m.header.encode(&mut w);
                w.put_u8(match m.status {
                    AnnouncementStatus::Ok => 0,
                    AnnouncementStatus::Failed => 1,
                });
                w.put_string(&m.diagnostic);
                m.peer_info.encode(&mut w);
            }
            Frame::KnownParticipants(m) => {
                m.header.encode(&mut w);
                w.put_u32(m.peer_infos.len() as u32);
                for pi in &m.peer_infos {
                    pi.encode(&mut w);
                }
            }
            Frame::SubscriptionAnnouncement(m) => {
                w.put_u8(m.kind as u8);
                w.put_string(&m.link);
            }
            Frame::SubscriptionAcknowledge(m) => {
                w.put_u8(m.kind as u8);
                w.put_string(&m.link);
            }
            Frame::Routed(rf) => {
                w.put_u64(rf.from.participant_id);
                w.put_u64(rf.from.service_id);
                w.put_string(&rf.link);
                encode_routed(&rf.msg, &mut w);
            }
        }
        w.into_inner()
    }

    /// Parse `<u8 kind><payload>`; `data` must be exactly one frame.
    pub fn decode(data: &[u8]) -> Result<Frame, WireError> {
        let mut r = MessageReader::new(data);
        let kind_raw = r.get_u8()?;
        let kind = MessageKind::from_u8(kind_raw).ok_or(WireError::UnknownKind(kind_raw))?;
        match kind {
            MessageKind::ParticipantAnnouncement => {
                let header = RegistryMsgHeader::decode(&mut r)?;
                let peer_info = PeerInfo::decode(&mut r)?;
                let simulation_name = r.get_string()?;
                Ok(Frame::Announcement(ParticipantAnnouncement { header, peer_info, simulation_name }))
            }
            MessageKind::ParticipantAnnouncementReply => {
                let header = RegistryMsgHeader::decode(&mut r)?;
                let status = match r.get_u8()? {
                    0 => AnnouncementStatus::Ok,
                    _ => AnnouncementStatus::Failed,
                };
                let diagnostic = r.get_string()?;
                let peer_info = PeerInfo::decode(&mut r)?;
                Ok(Frame::AnnouncementReply(ParticipantAnnouncementReply {
                    header,
                    status,
                    diagnostic,
                    peer_info,
                }))
            }
            MessageKind::KnownParticipants => {
                let header = RegistryMsgHeader::decode(&mut r)?;
                let count = r.get_u32()? as usize;
                if count > super::buffer::MAX_SEQUENCE_LEN {
                    return Err(WireError::Oversize { what: "peerInfos", len: count });
                }
                let mut peer_infos = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    peer_infos.push(PeerInfo::decode(&mut r)?);
                }
                Ok(Frame::KnownParticipants(KnownParticipants { header, peer_infos }))
            }
            MessageKind::SubscriptionAnnouncement => {
                let k = r.get_u8()?;
                let kind = MessageKind::from_u8(k).ok_or(WireError::UnknownKind(k))?;
                let link = r.get_string()?;
                Ok(Frame::SubscriptionAnnouncement(SubscriptionAnnouncement { kind, link }))
            }
            MessageKind::SubscriptionAcknowledge => {
                let k = r.get_u8()?;
                let kind = MessageKind::from_u8(k).ok_or(WireError::UnknownKind(k))?;
                let link = r.get_string()?;
                Ok(Frame::SubscriptionAcknowledge(SubscriptionAcknowledge { kind, link }))
            }
            routed_kind => {
                let participant_id = r.get_u64()?;
                let service_id = r.get_u64()?;
                let link = r.get_string()?;
                let msg = decode_routed(routed_kind, &mut r)?;
                Ok(Frame::Routed(RoutedFrame {
                    from: EndpointAddress { participant_id, service_id },
                    link,
                    msg,
                }))
            }
        }
    }
}

fn encode_transmit_direction(d: TransmitDirection, w: &mut MessageBuffer) {
    w.put_u8(match d {
        TransmitDirection::Tx => 1,
        TransmitDirection::Rx => 2,
    });
}

fn decode_transmit_direction(r: &mut MessageReader<'_>) -> Result<TransmitDirection, WireError> {
    match r.get_u8()? {
        1 => Ok(TransmitDirection::Tx),
        2 => Ok(TransmitDirection::Rx),
        v => Err(WireError::InvalidValue { what: "direction", value: v as u64 }),
    }
}

fn encode_lin_frame(f: &LinFrame, w: &mut MessageBuffer) {
    w.put_u8(f.id);
    w.put_u8(f.checksum_model);
    w.put_u8(f.data_length);
    w.put_raw(&f.data);
}

fn decode_lin_frame(r: &mut MessageReader<'_>) -> Result<LinFrame, WireError> {
    let id = r.get_u8()?;
    let checksum_model = r.get_u8()?;
    let data_length = r.get_u8()?;
    let mut data = [0u8; 8];
    for b in data.iter_mut() {
        *b = r.get_u8()?;
    }
    Ok(LinFrame { id, checksum_model, data_length, data })
}

fn encode_routed(msg: &RoutedMessage, w: &mut MessageBuffer) {
    use RoutedMessage::*;
    match msg {
        ServiceDiscoveryEvent(m) => {
            w.put_u8(match m.kind {
                ServiceDiscoveryEventKind::ServiceCreated => 1,
                ServiceDiscoveryEventKind::ServiceRemoved => 2,
            });
            encode_descriptor(&m.descriptor, w);
        }
        ParticipantDiscoveryEvent(m) => {
            w.put_u32(m.descriptors.len() as u32);
            for sd in &m.descriptors {
                encode_descriptor(sd, w);
            }
        }
        NextSimTask(m) => {
            w.put_i64(m.time_point_ns);
            w.put_i64(m.duration_ns);
        }
        ParticipantStatus(m) => {
            w.put_string(&m.participant_name);
            w.put_u8(m.state);
            w.put_string(&m.enter_reason);
            w.put_i64(m.enter_time_ns);
            w.put_i64(m.refresh_time_ns);
        }
        SystemCommand(m) => {
            w.put_u8(match m.kind {
                SystemCommandKind::AbortSimulation => 1,
            });
        }
        WorkflowConfiguration(m) => {
            w.put_string_seq(&m.required_participant_names);
        }
        LogMsg(m) => {
            w.put_string(&m.logger_name);
            w.put_u8(m.level);
            w.put_i64(m.time_ns);
            w.put_string(&m.body);
            w.put_string_map(&m.key_values);
        }
        MetricsUpdate(m) => {
            w.put_u32(m.metrics.len() as u32);
            for d in &m.metrics {
                w.put_i64(d.timestamp_ns);
                w.put_string(&d.name);
                match &d.value {
                    MetricValue::Counter(v) => {
                        w.put_u8(1);
                        w.put_u64(*v);
                    }
                    MetricValue::Statistic { count, min, max, mean } => {
                        w.put_u8(2);
                        w.put_u64(*count);
                        w.put_f64(*min);
                        w.put_f64(*max);
                        w.put_f64(*mean);
                    }
                    MetricValue::StringList(items) => {
                        w.put_u8(3);
                        w.put_string_seq(items);
                    }
                }
            }
        }
        CanFrameEvent(m) => {
            w.put_i64(m.timestamp_ns);
            w.put_u32(m.frame.can_id);
            w.put_u32(m.frame.flags);
            w.put_u16(m.frame.dlc);
            w.put_bytes(&m.frame.data);
            encode_transmit_direction(m.direction, w);
            w.put_u64(m.user_context);
        }
        CanFrameTransmitEvent(m) => {
            w.put_i64(m.timestamp_ns);
            w.put_u32(m.can_id);
            w.put_u8(match m.status {
                CanTransmitStatus::Transmitted => 1,
                CanTransmitStatus::Canceled => 2,
                CanTransmitStatus::TransmitQueueFull => 3,
            });
            w.put_u64(m.user_context);
        }
        CanControllerStatus(m) => {
            w.put_i64(m.timestamp_ns);
            w.put_u8(m.controller_state);
            w.put_u8(m.error_state);
        }
        CanConfigureBaudrate(m) => {
            w.put_u32(m.rate);
            w.put_u32(m.fd_rate);
            w.put_u32(m.xl_rate);
        }
        CanSetControllerMode(m) => {
            w.put_u8(m.mode);
        }
        EthernetFrameEvent(m) => {
            w.put_i64(m.timestamp_ns);
            w.put_bytes(&m.raw_frame);
            encode_transmit_direction(m.direction, w);
            w.put_u64(m.user_context);
        }
        EthernetFrameTransmitEvent(m) => {
            w.put_i64(m.timestamp_ns);
            w.put_u8(m.status);
            w.put_u64(m.user_context);
        }
        LinSendFrameRequest(m) => {
            encode_lin_frame(&m.frame, w);
            w.put_u8(m.response_type);
        }
        LinTransmission(m) => {
            w.put_i64(m.timestamp_ns);
            encode_lin_frame(&m.frame, w);
            w.put_u8(m.status);
        }
        FlexrayFrameEvent(m) => {
            w.put_i64(m.timestamp_ns);
            w.put_u8(m.channel);
            w.put_u8(m.header.flags);
            w.put_u16(m.header.frame_id);
            w.put_u8(m.header.payload_length);
            w.put_u16(m.header.header_crc);
            w.put_u8(m.header.cycle_count);
            w.put_bytes(&m.payload);
        }
        FlexrayFrameTransmitEvent(m) => {
            w.put_i64(m.timestamp_ns);
            w.put_u8(m.channel);
            w.put_u16(m.frame_id);
            w.put_u8(m.cycle_count);
        }
        DataMessageEvent(m) => {
            w.put_i64(m.timestamp_ns);
            w.put_bytes(&m.data);
        }
        FunctionCall(m) => {
            w.put_i64(m.timestamp_ns);
            w.put_u64(m.call_id);
            w.put_bytes(&m.data);
        }
        FunctionCallResponse(m) => {
            w.put_i64(m.timestamp_ns);
            w.put_u64(m.call_id);
            w.put_bytes(&m.data);
        }
    }
}

fn decode_routed(kind: MessageKind, r: &mut MessageReader<'_>) -> Result<RoutedMessage, WireError> {
    Ok(match kind {
        MessageKind::ServiceDiscoveryEvent => {
            let kind_raw = r.get_u8()?;
            let kind = match kind_raw {
                1 => ServiceDiscoveryEventKind::ServiceCreated,
                2 => ServiceDiscoveryEventKind::ServiceRemoved,
                v => return Err(WireError::InvalidValue { what: "discoveryEventKind", value: v as u64 }),
            };
            let descriptor = decode_descriptor(r)?;
            RoutedMessage::ServiceDiscoveryEvent(ServiceDiscoveryEvent { kind, descriptor })
        }
        MessageKind::ParticipantDiscoveryEvent => {
            let count = r.get_u32()? as usize;
            if count > super::buffer::MAX_SEQUENCE_LEN {
                return Err(WireError::Oversize { what: "descriptors", len: count });
            }
            let mut descriptors = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                descriptors.push(decode_descriptor(r)?);
            }
            RoutedMessage::ParticipantDiscoveryEvent(ParticipantDiscoveryEvent { descriptors })
        }
        MessageKind::NextSimTask => RoutedMessage::NextSimTask(NextSimTask {
            time_point_ns: r.get_i64()?,
            duration_ns: r.get_i64()?,
        }),
        MessageKind::ParticipantStatus => RoutedMessage::ParticipantStatus(ParticipantStatusMsg {
            participant_name: r.get_string()?,
            state: r.get_u8()?,
            enter_reason: r.get_string()?,
            enter_time_ns: r.get_i64()?,
            refresh_time_ns: r.get_i64()?,
        }),
        MessageKind::SystemCommand => {
            let kind_raw = r.get_u8()?;
            let kind = match kind_raw {
                1 => SystemCommandKind::AbortSimulation,
                v => return Err(WireError::InvalidValue { what: "systemCommand", value: v as u64 }),
            };
            RoutedMessage::SystemCommand(SystemCommand { kind })
        }
        MessageKind::WorkflowConfiguration => RoutedMessage::WorkflowConfiguration(WorkflowConfiguration {
            required_participant_names: r.get_string_seq()?,
        }),
        MessageKind::LogMsg => RoutedMessage::LogMsg(LogMsg {
            logger_name: r.get_string()?,
            level: r.get_u8()?,
            time_ns: r.get_i64()?,
            body: r.get_string()?,
            key_values: r.get_string_map()?,
        }),
        MessageKind::MetricsUpdate => {
            let count = r.get_u32()? as usize;
            if count > super::buffer::MAX_SEQUENCE_LEN {
                return Err(WireError::Oversize { what: "metrics", len: count });
            }
            let mut metrics = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let timestamp_ns = r.get_i64()?;
                let name = r.get_string()?;
                let value = match r.get_u8()? {
                    1 => MetricValue::Counter(r.get_u64()?),
                    2 => MetricValue::Statistic {
                        count: r.get_u64()?,
                        min: r.get_f64()?,
                        max: r.get_f64()?,
                        mean: r.get_f64()?,
                    },
                    3 => MetricValue::StringList(r.get_string_seq()?),
                    v => return Err(WireError::InvalidValue { what: "metricKind", value: v as u64 }),
                };
                metrics.push(MetricData { timestamp_ns, name, value });
            }
            RoutedMessage::MetricsUpdate(MetricsUpdate { metrics })
        }
        MessageKind::CanFrameEvent => {
            let timestamp_ns = r.get_i64()?;
            let can_id = r.get_u32()?;
            let flags = r.get_u32()?;
            let dlc = r.get_u16()?;
            let data = r.get_bytes()?;
            let direction = decode_transmit_direction(r)?;
            let user_context = r.get_u64()?;
            RoutedMessage::CanFrameEvent(CanFrameEvent {
                timestamp_ns,
                frame: CanFrame { can_id, flags, dlc, data },
                direction,
                user_context,
            })
        }
        MessageKind::CanFrameTransmitEvent => {
            let timestamp_ns = r.get_i64()?;
            let can_id = r.get_u32()?;
            let status = match r.get_u8()? {
                1 => CanTransmitStatus::Transmitted,
                2 => CanTransmitStatus::Canceled,
                3 => CanTransmitStatus::TransmitQueueFull,
                v => return Err(WireError::InvalidValue { what: "canTransmitStatus", value: v as u64 }),
            };
            let user_context = r.get_u64()?;
            RoutedMessage::CanFrameTransmitEvent(CanFrameTransmitEvent {
                timestamp_ns,
                can_id,
                status,
                user_context,
            })
        }
        MessageKind::CanControllerStatus => RoutedMessage::CanControllerStatus(CanControllerStatus {
            timestamp_ns: r.get_i64()?,
            controller_state: r.get_u8()?,
            error_state: r.get_u8()?,
        }),
        MessageKind::CanConfigureBaudrate => RoutedMessage::CanConfigureBaudrate(CanConfigureBaudrate {
            rate: r.get_u32()?,
            fd_rate: r.get_u32()?,
            xl_rate: r.get_u32()?,
        }),
        MessageKind::CanSetControllerMode => {
            RoutedMessage::CanSetControllerMode(CanSetControllerMode { mode: r.get_u8()? })
        }
        MessageKind::EthernetFrameEvent => RoutedMessage::EthernetFrameEvent(EthernetFrameEvent {
            timestamp_ns: r.get_i64()?,
            raw_frame: r.get_bytes()?,
            direction: decode_transmit_direction(r)?,
            user_context: r.get_u64()?,
        }),
        MessageKind::EthernetFrameTransmitEvent => {
            RoutedMessage::EthernetFrameTransmitEvent(EthernetFrameTransmitEvent {
                timestamp_ns: r.get_i64()?,
                status: r.get_u8()?,
                user_context: r.get_u64()?,
            })
        }
        MessageKind::LinSendFrameRequest => RoutedMessage::LinSendFrameRequest(LinSendFrameRequest {
            frame: decode_lin_frame(r)?,
            response_type: r.get_u8()?,
        }),
        MessageKind::LinTransmission => RoutedMessage::LinTransmission(LinTransmission {
            timestamp_ns: r.get_i64()?,
            frame: decode_lin_frame(r)?,
            status: r.get_u8()?,
        }),
        MessageKind::FlexrayFrameEvent => {
            let timestamp_ns = r.get_i64()?;
            let channel = r.get_u8()?;
            let header = FlexrayHeader {
                flags: r.get_u8()?,
                frame_id: r.get_u16()?,
                payload_length: r.get_u8()?,
                header_crc: r.get_u16()?,
                cycle_count: r.get_u8()?,
            };
            let payload = r.get_bytes()?;
            RoutedMessage::FlexrayFrameEvent(FlexrayFrameEvent { timestamp_ns, channel, header, payload })
        }
        MessageKind::FlexrayFrameTransmitEvent => {
            RoutedMessage::FlexrayFrameTransmitEvent(FlexrayFrameTransmitEvent {
                timestamp_ns: r.get_i64()?,
                channel: r.get_u8()?,
                frame_id: r.get_u16()?,
                cycle_count: r.get_u8()?,
            })
        }
        MessageKind::DataMessageEvent => RoutedMessage::DataMessageEvent(DataMessageEvent {
            timestamp_ns: r.get_i64()?,
            data: r.get_bytes()?,
        }),
        MessageKind::FunctionCall => RoutedMessage::FunctionCall(FunctionCall {
            timestamp_ns: r.get_i64()?,
            call_id: r.get_u64()?,
            data: r.get_bytes()?,
        }),
        MessageKind::FunctionCallResponse => RoutedMessage::FunctionCallResponse(FunctionCallResponse {
            timestamp_ns: r.get_i64()?,
            call_id: r.get_u64()?,
            data: r.get_bytes()?,
        }),
        // Handshake kinds are handled in Frame::decode.
        MessageKind::ParticipantAnnouncement
        | MessageKind::ParticipantAnnouncementReply
        | MessageKind::KnownParticipants
        | MessageKind::SubscriptionAnnouncement
        | MessageKind::SubscriptionAcknowledge => {
            return Err(WireError::UnknownKind(kind as u8));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::keys;

    fn addr() -> EndpointAddress {
        EndpointAddress { participant_id: 11, service_id: 7 }
    }

    fn round_trip(frame: Frame) {
        let encoded = frame.encode();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn announcement_round_trip() {
        round_trip(Frame::Announcement(ParticipantAnnouncement {
            header: RegistryMsgHeader::new(PROTOCOL_VERSION),
            peer_info: PeerInfo {
                participant_name: "P1".into(),
                participant_id: 42,
                acceptor_uris: vec!["silkit://127.0.0.1:8500".into(), "local:///tmp/p1.sock".into()],
                capabilities: vec!["autonomous-synchronous".into()],
            },
            simulation_name: "default".into(),
        }));
    }

    #[test]
    fn known_participants_round_trip() {
        round_trip(Frame::KnownParticipants(KnownParticipants {
            header: RegistryMsgHeader::new(PROTOCOL_VERSION),
            peer_infos: vec![PeerInfo {
                participant_name: "P2".into(),
                participant_id: 43,
                acceptor_uris: vec!["silkit://10.0.0.2:4242".into()],
                capabilities: vec![],
            }],
        }));
    }

    #[test]
    fn discovery_event_round_trip() {
        let mut sd = ServiceDescriptor::new("Pub", "9f1b2c", "DataPublisher1", 3);
        sd.service_type = ServiceType::Controller;
        sd.network_type = NetworkType::Data;
        sd.set_supplemental(keys::CONTROLLER_TYPE, keys::CONTROLLER_TYPE_DATA_PUBLISHER);
        sd.set_supplemental(keys::DATA_PUBLISHER_TOPIC, "T");
        round_trip(Frame::Routed(RoutedFrame {
            from: addr(),
            link: "default".into(),
            msg: RoutedMessage::ServiceDiscoveryEvent(ServiceDiscoveryEvent {
                kind: ServiceDiscoveryEventKind::ServiceCreated,
                descriptor: sd,
            }),
        }));
    }

    #[test]
    fn next_sim_task_round_trip() {
        round_trip(Frame::Routed(RoutedFrame {
            from: addr(),
            link: "default".into(),
            msg: RoutedMessage::NextSimTask(NextSimTask { time_point_ns: -1, duration_ns: 1_000_000 }),
        }));
    }

    #[test]
    fn can_frame_event_round_trip() {
        round_trip(Frame::Routed(RoutedFrame {
            from: addr(),
            link: "CAN1".into(),
            msg: RoutedMessage::CanFrameEvent(CanFrameEvent {
                timestamp_ns: 17,
                frame: CanFrame {
                    can_id: 3,
                    flags: can_flags::IDE | can_flags::FDF,
                    dlc: 8,
                    data: b"Test Message 3".to_vec(),
                },
                direction: TransmitDirection::Tx,
                user_context: 4,
            }),
        }));
    }

    #[test]
    fn metrics_update_round_trip() {
        round_trip(Frame::Routed(RoutedFrame {
            from: addr(),
            link: "default".into(),
            msg: RoutedMessage::MetricsUpdate(MetricsUpdate {
                metrics: vec![
                    MetricData {
                        timestamp_ns: 1,
                        name: "SimStepCount".into(),
                        value: MetricValue::Counter(5000),
                    },
                    MetricData {
                        timestamp_ns: 2,
                        name: "SimStep/execution_duration/[s]".into(),
                        value: MetricValue::Statistic { count: 10, min: 0.001, max: 0.25, mean: 0.02 },
                    },
                ],
            }),
        }));
    }

    #[test]
    fn unknown_kind_rejected() {
        let data = vec![0xee, 0, 0, 0];
        assert_eq!(Frame::decode(&data), Err(WireError::UnknownKind(0xee)));
    }

    #[test]
    fn truncated_payload_rejected() {
        let frame = Frame::Routed(RoutedFrame {
            from: addr(),
            link: "T".into(),
            msg: RoutedMessage::DataMessageEvent(DataMessageEvent { timestamp_ns: 0, data: vec![1, 2, 3] }),
        });
        let mut encoded = frame.encode();
        encoded.truncate(encoded.len() - 2);
        assert!(matches!(Frame::decode(&encoded), Err(WireError::Truncated { .. })));
    }

    #[test]
    fn trailing_fields_from_newer_minor_versions_tolerated() {
        let frame = Frame::Routed(RoutedFrame {
            from: addr(),
            link: "default".into(),
            msg: RoutedMessage::NextSimTask(NextSimTask { time_point_ns: 5, duration_ns: 10 }),
        });
        let mut encoded = frame.encode();
        encoded.extend_from_slice(&[0xff; 12]);
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }
}
