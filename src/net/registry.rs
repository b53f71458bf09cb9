//! Registry: rendezvous for a simulation's participants
//!
//! A standalone participant with the fixed id 0. It accepts announcements,
//! enforces `(simulation, participant)` uniqueness, and answers each joiner
//! with the list of already-known peers in the same simulation — with
//! acceptor URIs rewritten to be reachable from the joiner. After the
//! handshake it never forwards data; all traffic flows peer-to-peer.

use super::connection::Connection;
use super::handshake::{read_announcement, spawn_accept_loops, version_compatible, Acceptors};
use super::peer::PeerStream;
use super::uri::{transform_acceptor_uris, AcceptorUri};
use crate::config::ParticipantConfiguration;
use crate::descriptor::EndpointAddress;
use crate::error::{SilKitError, SilKitResult};
use crate::wire::message::{
    AnnouncementStatus, Frame, KnownParticipants, MessageKind, ParticipantAnnouncement,
    ParticipantAnnouncementReply, PeerInfo, RegistryMsgHeader, RoutedMessage, PROTOCOL_VERSION,
};
use crate::wire::write_frame;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

pub const REGISTRY_PARTICIPANT_NAME: &str = "SilKitRegistry";
pub const REGISTRY_PARTICIPANT_ID: u64 = 0;

type ConnectedHandler = Box<dyn Fn() + Send>;

struct ConnectedParticipant {
    peer_info: PeerInfo,
    observed_host: Option<String>,
}

struct RegistryInner {
    connection: Arc<Connection>,
    /// simulation name -> participant name -> membership entry
    membership: Mutex<HashMap<String, HashMap<String, ConnectedParticipant>>>,
    /// simulation name -> required participant names (from workflow config)
    required: Mutex<HashMap<String, Vec<String>>>,
    on_all_connected: Mutex<Option<ConnectedHandler>>,
    on_all_disconnected: Mutex<Option<ConnectedHandler>>,
    local_socket: Mutex<Option<PathBuf>>,
}

/// A running registry instance.
pub struct Registry {
    inner: Arc<RegistryInner>,
    listen_uri: String,
}

impl Registry {
    /// Bind acceptors and start serving. Returns once listening; the
    /// effective TCP URI (after port resolution) is available via
    /// [`Registry::listen_uri`].
    pub async fn start(config: &ParticipantConfiguration, listen_uri: &str) -> SilKitResult<Registry> {
        let uri = AcceptorUri::parse(listen_uri)?;
        let AcceptorUri::Tcp { host, port } = uri else {
            return Err(SilKitError::configuration(format!(
                "registry listen uri must be silkit://host:port, got '{}'",
                listen_uri
            )));
        };

        let acceptors = Acceptors::bind(&host, port, config.middleware.enable_domain_sockets, None).await?;
        let tcp_port = acceptors
            .tcp_port()
            .ok_or_else(|| SilKitError::transport("registry has no tcp acceptor"))?;
        let effective_uri = format!("silkit://{}:{}", host, tcp_port);

        #[cfg(unix)]
        let local_socket = acceptors.local.as_ref().map(|(_, path)| path.clone());
        #[cfg(not(unix))]
        let local_socket: Option<PathBuf> = None;

        let connection = Connection::new(REGISTRY_PARTICIPANT_NAME, REGISTRY_PARTICIPANT_ID, "");
        let inner = Arc::new(RegistryInner {
            connection: connection.clone(),
            membership: Mutex::new(HashMap::new()),
            required: Mutex::new(HashMap::new()),
            on_all_connected: Mutex::new(None),
            on_all_disconnected: Mutex::new(None),
            local_socket: Mutex::new(local_socket),
        });

        inner.register_receivers(config);

        {
            let inner = inner.clone();
            connection.register_peer_shutdown_callback(Arc::new(move |peer_info, simulation| {
                inner.on_peer_shutdown(peer_info, simulation);
            }));
        }

        {
            let inner = inner.clone();
            spawn_accept_loops(acceptors, move |stream| {
                let inner = inner.clone();
                tokio::spawn(async move {
                    inner.handle_incoming(stream).await;
                });
            });
        }

        info!(uri = %effective_uri, "registry listening");
        Ok(Registry { inner, listen_uri: effective_uri })
    }

    /// Effective TCP URI after port resolution.
    pub fn listen_uri(&self) -> &str {
        &self.listen_uri
    }

    /// Fires when every required participant of a simulation is connected.
    /// Requires a workflow configuration to have been observed.
    pub fn set_all_connected_handler(&self, handler: impl Fn() + Send + 'static) {
        *self.inner.on_all_connected.lock().expect("handler lock") = Some(Box::new(handler));
    }

    /// Fires when the last participant of the last simulation disconnects.
    pub fn set_all_disconnected_handler(&self, handler: impl Fn() + Send + 'static) {
        *self.inner.on_all_disconnected.lock().expect("handler lock") = Some(Box::new(handler));
    }

    pub fn connected_participant_count(&self) -> usize {
        self.inner
            .membership
            .lock()
            .expect("membership lock")
            .values()
            .map(|sim| sim.len())
            .sum()
    }

    pub fn is_connected(&self, simulation_name: &str, participant_name: &str) -> bool {
        self.inner
            .membership
            .lock()
            .expect("membership lock")
            .get(simulation_name)
            .map(|sim| sim.contains_key(participant_name))
            .unwrap_or(false)
    }

    pub fn shutdown(&self) {
        self.inner.connection.shutdown();
        if let Some(path) = self.inner.local_socket.lock().expect("socket lock").take() {
            std::fs::remove_file(path).ok();
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if let Some(path) = self.inner.local_socket.lock().expect("socket lock").take() {
            std::fs::remove_file(path).ok();
        }
    }
}

impl RegistryInner {
    fn register_receivers(self: &Arc<Self>, config: &ParticipantConfiguration) {
        let me = EndpointAddress { participant_id: REGISTRY_PARTICIPANT_ID, service_id: 0 };

        self.connection.register_receiver(
            MessageKind::ParticipantStatus,
            "default",
            me,
            Arc::new(move |_, msg| {
                if let RoutedMessage::ParticipantStatus(status) = msg {
                    debug!(
                        participant = %status.participant_name,
                        state = status.state,
                        reason = %status.enter_reason,
                        "participant status update"
                    );
                }
            }),
        );

        {
            let inner = self.clone();
            self.connection.register_receiver(
                MessageKind::WorkflowConfiguration,
                "default",
                me,
                Arc::new(move |from, msg| {
                    if let RoutedMessage::WorkflowConfiguration(wf) = msg {
                        inner.on_workflow_configuration(from, &wf.required_participant_names);
                    }
                }),
            );
        }

        {
            self.connection.register_receiver(
                MessageKind::ServiceDiscoveryEvent,
                "default",
                me,
                Arc::new(move |_, msg| {
                    if let RoutedMessage::ServiceDiscoveryEvent(ev) = msg {
                        debug!(kind = ?ev.kind, descriptor = %ev.descriptor, "service discovery event");
                    }
                }),
            );
        }

        if config.experimental.metrics.collect_from_remote {
            let connection = self.connection.clone();
            self.connection.register_receiver(
                MessageKind::MetricsUpdate,
                "default",
                me,
                Arc::new(move |from, msg| {
                    if let RoutedMessage::MetricsUpdate(update) = msg {
                        let participant = connection
                            .participant_name_of(from.participant_id)
                            .unwrap_or_else(|| format!("id:{}", from.participant_id));
                        info!(
                            participant = %participant,
                            count = update.metrics.len(),
                            "remote metrics update"
                        );
                        for data in &update.metrics {
                            info!(
                                name = %data.name,
                                value = ?data.value,
                                timestamp_ns = data.timestamp_ns,
                                participant = %participant,
                                "metric"
                            );
                        }
                    }
                }),
            );
        }
    }

    async fn handle_incoming(self: Arc<Self>, stream: PeerStream) {
        let observed_host = stream.remote_host();
        match stream {
            PeerStream::Tcp(mut s) => {
                if let Some(announcement) = self.accept_participant(&mut s, &observed_host).await {
                    self.register_participant(PeerStream::Tcp(s), announcement, observed_host);
                }
            }
            #[cfg(unix)]
            PeerStream::Local(mut s) => {
                if let Some(announcement) = self.accept_participant(&mut s, &observed_host).await {
                    self.register_participant(PeerStream::Local(s), announcement, observed_host);
                }
            }
        }
    }

    /// Run the announcement exchange. Returns the announcement when the
    /// joiner was accepted and the known-participants reply has been written.
    /// Admission (uniqueness check, membership reservation, known-peer
    /// snapshot) is one atomic step, so two concurrent joiners always see
    /// each other.
    async fn accept_participant<S>(
        &self,
        stream: &mut S,
        observed_host: &Option<String>,
    ) -> Option<ParticipantAnnouncement>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let announcement = match read_announcement(stream).await {
            Ok(a) => a,
            Err(e) => {
                debug!(error = %e, "rejecting connection without valid announcement");
                return None;
            }
        };
        let name = announcement.peer_info.participant_name.clone();
        let simulation = announcement.simulation_name.clone();

        if !version_compatible(announcement.header.version) {
            let diagnostic = format!(
                "protocol version {} is not compatible with registry version {}",
                announcement.header.version, PROTOCOL_VERSION
            );
            warn!(participant = %name, %diagnostic, "rejecting participant");
            self.reply_failed(stream, &diagnostic).await;
            return None;
        }

        let known_peers = match self.try_admit(&announcement, observed_host) {
            Ok(known) => known,
            Err(diagnostic) => {
                warn!(%diagnostic, "rejecting participant");
                self.reply_failed(stream, &diagnostic).await;
                return None;
            }
        };

        info!(
            participant = %name,
            simulation = %simulation,
            version = %announcement.header.version,
            "sending known participants"
        );
        let reply = Frame::KnownParticipants(KnownParticipants {
            header: RegistryMsgHeader::new(PROTOCOL_VERSION),
            peer_infos: known_peers,
        });
        if let Err(e) = write_frame(stream, &reply).await {
            debug!(error = %e, "known participants write failed");
            self.evict(&simulation, &name);
            return None;
        }
        Some(announcement)
    }

    /// Uniqueness check, membership reservation, and known-peer snapshot
    /// under one lock.
    fn try_admit(
        &self,
        announcement: &ParticipantAnnouncement,
        observed_host: &Option<String>,
    ) -> Result<Vec<PeerInfo>, String> {
        let name = &announcement.peer_info.participant_name;
        let simulation = &announcement.simulation_name;
        let mut membership = self.membership.lock().expect("membership lock");

        let sim = membership.entry(simulation.clone()).or_default();
        if sim.contains_key(name) {
            return Err(format!(
                "a participant with the same name '{}' already exists in simulation '{}'",
                name, simulation
            ));
        }

        let known = sim
            .values()
            .map(|member| {
                let same_host = host_key(&member.observed_host) == host_key(observed_host);
                let advertiser_host = match &member.observed_host {
                    Some(host) if !is_loopback(host) => host.clone(),
                    _ => "127.0.0.1".to_string(),
                };
                let mut info = member.peer_info.clone();
                info.acceptor_uris =
                    transform_acceptor_uris(&info.acceptor_uris, &advertiser_host, same_host);
                info
            })
            .collect();

        sim.insert(
            name.clone(),
            ConnectedParticipant {
                peer_info: announcement.peer_info.clone(),
                observed_host: observed_host.clone(),
            },
        );
        Ok(known)
    }

    fn evict(&self, simulation: &str, name: &str) {
        let mut membership = self.membership.lock().expect("membership lock");
        if let Some(sim) = membership.get_mut(simulation) {
            sim.remove(name);
            if sim.is_empty() {
                membership.remove(simulation);
            }
        }
    }

    async fn reply_failed<S>(&self, stream: &mut S, diagnostic: &str)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let reply = Frame::AnnouncementReply(ParticipantAnnouncementReply {
            header: RegistryMsgHeader::new(PROTOCOL_VERSION),
            status: AnnouncementStatus::Failed,
            diagnostic: diagnostic.to_string(),
            peer_info: self.own_peer_info(),
        });
        let _ = write_frame(stream, &reply).await;
    }

    fn own_peer_info(&self) -> PeerInfo {
        PeerInfo {
            participant_name: REGISTRY_PARTICIPANT_NAME.to_string(),
            participant_id: REGISTRY_PARTICIPANT_ID,
            acceptor_uris: vec![],
            capabilities: vec![],
        }
    }

    /// The joiner is already admitted; start its peer tasks.
    fn register_participant(
        self: &Arc<Self>,
        stream: PeerStream,
        announcement: ParticipantAnnouncement,
        observed_host: Option<String>,
    ) {
        let name = announcement.peer_info.participant_name.clone();
        let simulation = announcement.simulation_name.clone();
        let peer_key = format!("{}/{}", simulation, name);

        self.connection.add_peer(
            stream,
            peer_key,
            announcement.peer_info,
            simulation.clone(),
            observed_host,
        );

        self.check_all_connected(&simulation);
    }

    fn on_workflow_configuration(&self, from: &EndpointAddress, required: &[String]) {
        let simulation = self.find_simulation_of(from.participant_id);
        let Some(simulation) = simulation else {
            return;
        };
        debug!(simulation = %simulation, required = ?required, "workflow configuration received");
        self.required
            .lock()
            .expect("required lock")
            .insert(simulation.clone(), required.to_vec());
        self.check_all_connected(&simulation);
    }

    fn find_simulation_of(&self, participant_id: u64) -> Option<String> {
        let membership = self.membership.lock().expect("membership lock");
        for (simulation, members) in membership.iter() {
            if members.values().any(|m| m.peer_info.participant_id == participant_id) {
                return Some(simulation.clone());
            }
        }
        None
    }

    fn check_all_connected(&self, simulation: &str) {
        let required = self.required.lock().expect("required lock");
        let Some(required_names) = required.get(simulation) else {
            return;
        };
        if required_names.is_empty() {
            return;
        }
        let membership = self.membership.lock().expect("membership lock");
        let all_connected = membership
            .get(simulation)
            .map(|sim| required_names.iter().all(|name| sim.contains_key(name)))
            .unwrap_or(false);
        drop(membership);
        drop(required);
        if all_connected {
            info!(simulation = %simulation, "all participants are online");
            if let Some(handler) = self.on_all_connected.lock().expect("handler lock").as_ref() {
                handler();
            }
        }
    }

    fn on_peer_shutdown(&self, peer_info: &PeerInfo, simulation: &str) {
        let mut membership = self.membership.lock().expect("membership lock");
        let removed = membership
            .get_mut(simulation)
            .map(|sim| sim.remove(&peer_info.participant_name).is_some())
            .unwrap_or(false);
        if !removed {
            debug!(
                participant = %peer_info.participant_name,
                "peer without membership entry has shut down"
            );
            return;
        }
        debug!(participant = %peer_info.participant_name, simulation = %simulation, "peer has shut down");
        if membership.get(simulation).map(|sim| sim.is_empty()).unwrap_or(false) {
            membership.remove(simulation);
        }
        let empty = membership.is_empty();
        drop(membership);
        if empty {
            info!("all participants are shut down");
            if let Some(handler) = self.on_all_disconnected.lock().expect("handler lock").as_ref() {
                handler();
            }
        }
    }
}

fn host_key(host: &Option<String>) -> String {
    match host {
        None => "local".to_string(),
        Some(h) if is_loopback(h) => "local".to_string(),
        Some(h) => h.clone(),
    }
}

fn is_loopback(host: &str) -> bool {
    host == "localhost"
        || host.parse::<std::net::IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}
