//! Participant: the owner of the connection and every controller
//!
//! A participant joins a simulation through the registry, opens direct links
//! to every known peer, and then creates controllers on demand. It owns all
//! controllers and the connection; controllers reference back through `Arc`s
//! handed out at creation. Service ids are allocated from one monotonically
//! increasing counter and never reused.

use crate::config::ParticipantConfiguration;
use crate::descriptor::{
    keys, participant_id_of, EndpointAddress, NetworkType, ServiceDescriptor, ServiceType,
};
use crate::error::{SilKitError, SilKitResult};
use crate::net::handshake::{
    announce, connect_first_reachable, local_socket_path, read_announcement, spawn_accept_loops,
    version_compatible, Acceptors, HANDSHAKE_TIMEOUT,
};
use crate::net::peer::PeerStream;
use crate::net::uri::AcceptorUri;
use crate::net::Connection;
use crate::services::can::CanController;
use crate::services::discovery::ServiceDiscovery;
use crate::services::ethernet::EthernetController;
use crate::services::flexray::FlexrayController;
use crate::services::lin::LinController;
use crate::services::logging;
use crate::services::matching::PubSubSpec;
use crate::services::metrics::MetricsManager;
use crate::services::orchestration::{
    LifecycleService, OperationMode, SystemController, SystemMonitor, TimeProvider,
    TimeSyncService,
};
use crate::services::pubsub::{self, DataMessageHandler, DataPublisher, DataSubscriber};
use crate::services::rpc::{self, CallHandler, RpcClient, RpcServer, RpcSpec};
use crate::wire::message::{
    AnnouncementStatus, Frame, ParticipantAnnouncement, ParticipantAnnouncementReply, PeerInfo,
    RegistryMsgHeader, PROTOCOL_VERSION,
};
use crate::wire::write_frame;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capability every participant currently advertises: it tolerates peers
/// that run an autonomous lifecycle with active time synchronization.
pub const CAPABILITY_AUTONOMOUS_SYNCHRONOUS: &str = "autonomous-synchronous";

pub struct Participant {
    config: ParticipantConfiguration,
    participant_name: String,
    participant_id: u64,
    connection: Arc<Connection>,
    discovery: Arc<ServiceDiscovery>,
    monitor: Arc<SystemMonitor>,
    time_provider: Arc<TimeProvider>,
    metrics: Arc<MetricsManager>,
    service_ids: Arc<AtomicU64>,
    service_names: Mutex<HashSet<String>>,
    lifecycle: Mutex<Option<Arc<LifecycleService>>>,
    time_sync: Mutex<Option<Arc<TimeSyncService>>>,
    own_peer_info: PeerInfo,
}

impl Participant {
    /// Join the simulation: rendezvous with the registry, connect to every
    /// known peer, and exchange service snapshots.
    pub async fn connect(
        config: ParticipantConfiguration,
        participant_name: &str,
        registry_uri: &str,
    ) -> SilKitResult<Arc<Participant>> {
        let participant_name = match &config.participant_name {
            Some(configured) if configured != participant_name => {
                info!(
                    configured = %configured,
                    api = %participant_name,
                    "configuration overrides participant name"
                );
                configured.clone()
            }
            Some(configured) => configured.clone(),
            None => participant_name.to_string(),
        };
        if participant_name.is_empty() {
            return Err(SilKitError::configuration("participant name must not be empty"));
        }
        logging::init(&config.logging);

        let participant_id = participant_id_of(&participant_name);
        let simulation_name = config.middleware.simulation_name.clone();
        let connection = Connection::new(&participant_name, participant_id, &simulation_name);
        let time_provider = Arc::new(TimeProvider::new());
        let metrics = MetricsManager::new(&participant_name);
        let service_ids = Arc::new(AtomicU64::new(1));

        // Own acceptors, advertised to the registry for later joiners.
        let (bind_host, bind_port) = own_acceptor_address(&config)?;
        let local_path = std::env::temp_dir().join(format!(
            "simbus-{:016x}-{:08x}.sock",
            participant_id,
            rand::random::<u32>()
        ));
        let acceptors = Acceptors::bind(
            &bind_host,
            bind_port,
            config.middleware.enable_domain_sockets,
            Some(local_path),
        )
        .await?;
        let acceptor_uris = acceptors.acceptor_uris.clone();

        let own_peer_info = PeerInfo {
            participant_name: participant_name.clone(),
            participant_id,
            acceptor_uris,
            capabilities: vec![CAPABILITY_AUTONOMOUS_SYNCHRONOUS.to_string()],
        };

        let discovery = ServiceDiscovery::new(
            connection.clone(),
            EndpointAddress {
                participant_id,
                service_id: service_ids.fetch_add(1, Ordering::Relaxed),
            },
        );
        let monitor = SystemMonitor::new(
            connection.clone(),
            EndpointAddress {
                participant_id,
                service_id: service_ids.fetch_add(1, Ordering::Relaxed),
            },
        );

        if config.logging.log_from_remotes {
            logging::RemoteLogReceiver::install(
                &connection,
                EndpointAddress {
                    participant_id,
                    service_id: service_ids.fetch_add(1, Ordering::Relaxed),
                },
            );
        }

        let participant = Arc::new(Participant {
            config: config.clone(),
            participant_name: participant_name.clone(),
            participant_id,
            connection: connection.clone(),
            discovery: discovery.clone(),
            monitor: monitor.clone(),
            time_provider,
            metrics: metrics.clone(),
            service_ids: service_ids.clone(),
            service_names: Mutex::new(HashSet::new()),
            lifecycle: Mutex::new(None),
            time_sync: Mutex::new(None),
            own_peer_info: own_peer_info.clone(),
        });

        // Accept loop for peers that join after us.
        {
            let p = participant.clone();
            spawn_accept_loops(acceptors, move |stream| {
                let p = p.clone();
                tokio::spawn(async move {
                    p.handle_incoming_peer(stream).await;
                });
            });
        }

        participant.join_via_registry(registry_uri).await?;

        // Metrics sinks may need the connection for remote updates.
        {
            let endpoint = EndpointAddress {
                participant_id,
                service_id: service_ids.fetch_add(1, Ordering::Relaxed),
            };
            metrics.setup(
                &config.experimental.metrics,
                Some((connection.clone(), endpoint)),
            );
        }

        info!(
            participant = %participant_name,
            simulation = %simulation_name,
            "joined simulation"
        );
        Ok(participant)
    }

    pub fn participant_name(&self) -> &str {
        &self.participant_name
    }

    pub fn participant_id(&self) -> u64 {
        self.participant_id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn metrics(&self) -> &Arc<MetricsManager> {
        &self.metrics
    }

    pub fn time_provider(&self) -> &Arc<TimeProvider> {
        &self.time_provider
    }

    /// Run a closure on the connection's dispatch context.
    pub fn execute_deferred(&self, f: impl FnOnce() + Send + 'static) {
        self.connection.execute_deferred(f);
    }

    /// Leave the simulation and close every peer link.
    pub fn disconnect(&self) {
        self.connection.shutdown();
    }

    // =========================================================================
    // RENDEZVOUS
    // =========================================================================

    async fn join_via_registry(self: &Arc<Self>, registry_uri: &str) -> SilKitResult<()> {
        let uri = AcceptorUri::parse(registry_uri)?;
        let AcceptorUri::Tcp { host, port } = &uri else {
            return Err(SilKitError::configuration(format!(
                "registry uri must be silkit://host:port, got '{}'",
                registry_uri
            )));
        };
        let connect_timeout =
            Duration::from_secs_f64(self.config.middleware.connect_timeout_seconds);

        // Local IPC first when enabled, then TCP.
        let mut candidates = Vec::new();
        if self.config.middleware.enable_domain_sockets {
            let path = local_socket_path(&format!("silkit://{}:{}", host, port));
            candidates.push(format!("local://{}", path.display()));
        }
        candidates.push(uri.to_string());

        let mut stream = connect_first_reachable(&candidates, connect_timeout).await?;
        let remote_host = stream.remote_host();

        let announcement = ParticipantAnnouncement {
            header: RegistryMsgHeader::new(PROTOCOL_VERSION),
            peer_info: self.own_peer_info.clone(),
            simulation_name: self.config.middleware.simulation_name.clone(),
        };

        let reply = match &mut stream {
            PeerStream::Tcp(s) => announce(s, &announcement).await?,
            #[cfg(unix)]
            PeerStream::Local(s) => announce(s, &announcement).await?,
        };

        let known = match reply {
            Frame::KnownParticipants(known) => known,
            Frame::AnnouncementReply(reply) if reply.status == AnnouncementStatus::Failed => {
                return Err(SilKitError::Protocol(format!(
                    "registry rejected the announcement: {}",
                    reply.diagnostic
                )));
            }
            other => {
                return Err(SilKitError::Protocol(format!(
                    "unexpected handshake reply {:?}",
                    other.kind()
                )));
            }
        };

        info!(known_peers = known.peer_infos.len(), "registry rendezvous complete");
        self.connection.add_peer(
            stream,
            crate::net::REGISTRY_PARTICIPANT_NAME.to_string(),
            PeerInfo {
                participant_name: crate::net::REGISTRY_PARTICIPANT_NAME.to_string(),
                participant_id: crate::net::REGISTRY_PARTICIPANT_ID,
                acceptor_uris: vec![],
                capabilities: vec![],
            },
            self.config.middleware.simulation_name.clone(),
            remote_host,
        );

        for peer_info in known.peer_infos {
            self.connect_to_peer(peer_info, connect_timeout).await?;
        }
        Ok(())
    }

    async fn connect_to_peer(
        self: &Arc<Self>,
        peer_info: PeerInfo,
        connect_timeout: Duration,
    ) -> SilKitResult<()> {
        debug!(peer = %peer_info.participant_name, uris = ?peer_info.acceptor_uris, "connecting to peer");
        let mut stream = connect_first_reachable(&peer_info.acceptor_uris, connect_timeout).await?;
        let remote_host = stream.remote_host();

        let announcement = ParticipantAnnouncement {
            header: RegistryMsgHeader::new(PROTOCOL_VERSION),
            peer_info: self.own_peer_info.clone(),
            simulation_name: self.config.middleware.simulation_name.clone(),
        };
        let reply = match &mut stream {
            PeerStream::Tcp(s) => announce(s, &announcement).await?,
            #[cfg(unix)]
            PeerStream::Local(s) => announce(s, &announcement).await?,
        };
        let reply = match reply {
            Frame::AnnouncementReply(reply) => reply,
            other => {
                return Err(SilKitError::Protocol(format!(
                    "unexpected peer handshake reply {:?}",
                    other.kind()
                )));
            }
        };
        if reply.status != AnnouncementStatus::Ok {
            return Err(SilKitError::Protocol(format!(
                "peer '{}' rejected the announcement: {}",
                peer_info.participant_name, reply.diagnostic
            )));
        }

        let peer_name = reply.peer_info.participant_name.clone();
        self.connection.add_peer(
            stream,
            peer_name.clone(),
            reply.peer_info,
            self.config.middleware.simulation_name.clone(),
            remote_host,
        );
        self.on_peer_ready(&peer_name);
        Ok(())
    }

    async fn handle_incoming_peer(self: Arc<Self>, stream: PeerStream) {
        let remote_host = stream.remote_host();
        match stream {
            PeerStream::Tcp(mut s) => {
                if let Some(a) = self.accept_peer(&mut s, &remote_host).await {
                    self.finish_accept(PeerStream::Tcp(s), a, remote_host);
                }
            }
            #[cfg(unix)]
            PeerStream::Local(mut s) => {
                if let Some(a) = self.accept_peer(&mut s, &remote_host).await {
                    self.finish_accept(PeerStream::Local(s), a, remote_host);
                }
            }
        }
    }

    async fn accept_peer<S>(
        &self,
        stream: &mut S,
        _remote_host: &Option<String>,
    ) -> Option<ParticipantAnnouncement>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let announcement = match read_announcement(stream).await {
            Ok(a) => a,
            Err(e) => {
                debug!(error = %e, "dropping peer without valid announcement");
                return None;
            }
        };
        let peer_name = announcement.peer_info.participant_name.clone();

        let (status, diagnostic) = if !version_compatible(announcement.header.version) {
            (
                AnnouncementStatus::Failed,
                format!(
                    "protocol version {} is not compatible with {}",
                    announcement.header.version, PROTOCOL_VERSION
                ),
            )
        } else if announcement.simulation_name != self.config.middleware.simulation_name {
            (
                AnnouncementStatus::Failed,
                format!("different simulation '{}'", announcement.simulation_name),
            )
        } else if self.connection.has_peer(&peer_name) {
            (AnnouncementStatus::Failed, format!("peer '{}' is already connected", peer_name))
        } else {
            (AnnouncementStatus::Ok, String::new())
        };

        let reply = Frame::AnnouncementReply(ParticipantAnnouncementReply {
            header: RegistryMsgHeader::new(PROTOCOL_VERSION),
            status,
            diagnostic: diagnostic.clone(),
            peer_info: self.own_peer_info.clone(),
        });
        let write_ok = tokio::time::timeout(HANDSHAKE_TIMEOUT, write_frame(stream, &reply))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);

        if status != AnnouncementStatus::Ok {
            warn!(peer = %peer_name, %diagnostic, "rejecting peer");
            return None;
        }
        if !write_ok {
            return None;
        }
        Some(announcement)
    }

    fn finish_accept(
        self: &Arc<Self>,
        stream: PeerStream,
        announcement: ParticipantAnnouncement,
        remote_host: Option<String>,
    ) {
        let peer_name = announcement.peer_info.participant_name.clone();
        self.connection.add_peer(
            stream,
            peer_name.clone(),
            announcement.peer_info,
            announcement.simulation_name,
            remote_host,
        );
        self.on_peer_ready(&peer_name);
    }

    /// Both sides run this after the announcement exchange: replay our
    /// service snapshot so the peer learns pre-existing services.
    fn on_peer_ready(self: &Arc<Self>, peer_name: &str) {
        self.monitor.on_participant_connected(peer_name);
        self.discovery.send_snapshot_to(peer_name);
    }

    // =========================================================================
    // CONTROLLER CREATION
    // =========================================================================

    fn claim_service_name(&self, name: &str) -> SilKitResult<()> {
        let mut names = self.service_names.lock().expect("name lock");
        if !names.insert(name.to_string()) {
            return Err(SilKitError::configuration(format!(
                "a service named '{}' already exists in this participant",
                name
            )));
        }
        Ok(())
    }

    fn next_service_id(&self) -> u64 {
        self.service_ids.fetch_add(1, Ordering::Relaxed)
    }

    fn make_descriptor(
        &self,
        network_name: &str,
        service_name: &str,
        service_type: ServiceType,
        network_type: NetworkType,
        supplemental: &[(String, String)],
    ) -> ServiceDescriptor {
        let mut sd = ServiceDescriptor::new(
            &self.participant_name,
            network_name,
            service_name,
            self.next_service_id(),
        );
        sd.service_type = service_type;
        sd.network_type = network_type;
        for (k, v) in supplemental {
            sd.set_supplemental(k, v.clone());
        }
        sd
    }

    pub fn create_can_controller(
        &self,
        name: &str,
        network: &str,
    ) -> SilKitResult<Arc<CanController>> {
        self.claim_service_name(name)?;
        let network = crate::config::resolve_configured(
            "network",
            name,
            self.config.find_can_controller(name).and_then(|c| c.network.as_ref()),
            network.to_string(),
        );
        let sd = self.make_descriptor(
            &network,
            name,
            ServiceType::Controller,
            NetworkType::Can,
            &[(keys::CONTROLLER_TYPE.to_string(), keys::CONTROLLER_TYPE_CAN.to_string())],
        );
        let controller = CanController::new(
            sd.clone(),
            self.connection.clone(),
            self.time_provider.clone(),
            network,
        );
        self.discovery.notify_service_created(&sd);
        Ok(controller)
    }

    pub fn create_ethernet_controller(
        &self,
        name: &str,
        network: &str,
    ) -> SilKitResult<Arc<EthernetController>> {
        self.claim_service_name(name)?;
        let sd = self.make_descriptor(
            network,
            name,
            ServiceType::Controller,
            NetworkType::Ethernet,
            &[(keys::CONTROLLER_TYPE.to_string(), keys::CONTROLLER_TYPE_ETHERNET.to_string())],
        );
        let controller = EthernetController::new(
            sd.clone(),
            self.connection.clone(),
            self.time_provider.clone(),
            network.to_string(),
        );
        self.discovery.notify_service_created(&sd);
        Ok(controller)
    }

    pub fn create_lin_controller(
        &self,
        name: &str,
        network: &str,
    ) -> SilKitResult<Arc<LinController>> {
        self.claim_service_name(name)?;
        let sd = self.make_descriptor(
            network,
            name,
            ServiceType::Controller,
            NetworkType::Lin,
            &[(keys::CONTROLLER_TYPE.to_string(), keys::CONTROLLER_TYPE_LIN.to_string())],
        );
        let controller = LinController::new(
            sd.clone(),
            self.connection.clone(),
            self.time_provider.clone(),
            network.to_string(),
        );
        self.discovery.notify_service_created(&sd);
        Ok(controller)
    }

    pub fn create_flexray_controller(
        &self,
        name: &str,
        network: &str,
    ) -> SilKitResult<Arc<FlexrayController>> {
        self.claim_service_name(name)?;
        let sd = self.make_descriptor(
            network,
            name,
            ServiceType::Controller,
            NetworkType::Flexray,
            &[(keys::CONTROLLER_TYPE.to_string(), keys::CONTROLLER_TYPE_FLEXRAY.to_string())],
        );
        let controller = FlexrayController::new(
            sd.clone(),
            self.connection.clone(),
            self.time_provider.clone(),
            network.to_string(),
        );
        self.discovery.notify_service_created(&sd);
        Ok(controller)
    }

    /// History depth 0 or 1; the publisher allocates a fresh UUID link.
    pub fn create_data_publisher(
        &self,
        name: &str,
        spec: PubSubSpec,
        history: usize,
    ) -> SilKitResult<Arc<DataPublisher>> {
        self.claim_service_name(name)?;
        let (spec, history) = {
            let config = self.config.find_data_publisher(name);
            let topic = crate::config::resolve_configured(
                "topic",
                name,
                config.and_then(|c| c.topic.as_ref()),
                spec.topic.clone(),
            );
            let history = crate::config::resolve_configured(
                "history",
                name,
                config.and_then(|c| c.history.as_ref()),
                history,
            );
            (PubSubSpec { topic, ..spec }, history)
        };
        if history > 1 {
            return Err(SilKitError::configuration(format!(
                "data publisher '{}': history {} not supported (must be 0 or 1)",
                name, history
            )));
        }
        let link = Uuid::new_v4().to_string();
        let sd = self.make_descriptor(
            &link,
            name,
            ServiceType::Controller,
            NetworkType::Data,
            &pubsub::publisher_supplemental(&spec, &link),
        );
        let publisher = DataPublisher::new(
            sd.clone(),
            self.connection.clone(),
            self.time_provider.clone(),
            link,
            history,
        );
        self.discovery.notify_service_created(&sd);
        Ok(publisher)
    }

    pub fn create_data_subscriber(
        &self,
        name: &str,
        spec: PubSubSpec,
        handler: Option<DataMessageHandler>,
    ) -> SilKitResult<Arc<DataSubscriber>> {
        self.claim_service_name(name)?;
        let spec = {
            let config = self.config.find_data_subscriber(name);
            let topic = crate::config::resolve_configured(
                "topic",
                name,
                config.and_then(|c| c.topic.as_ref()),
                spec.topic.clone(),
            );
            PubSubSpec { topic, ..spec }
        };
        let sd = self.make_descriptor(
            "default",
            name,
            ServiceType::Controller,
            NetworkType::Data,
            &[
                (keys::CONTROLLER_TYPE.to_string(), keys::CONTROLLER_TYPE_DATA_SUBSCRIBER.to_string()),
                (keys::DATA_PUBLISHER_TOPIC.to_string(), spec.topic.clone()),
            ],
        );
        let subscriber = DataSubscriber::new(
            sd.clone(),
            self.connection.clone(),
            self.discovery.clone(),
            self.service_ids.clone(),
            spec,
            handler,
        );
        self.discovery.notify_service_created(&sd);
        Ok(subscriber)
    }

    pub fn create_rpc_client(
        &self,
        name: &str,
        spec: RpcSpec,
    ) -> SilKitResult<Arc<RpcClient>> {
        self.claim_service_name(name)?;
        let link = Uuid::new_v4().to_string();
        let sd = self.make_descriptor(
            &link,
            name,
            ServiceType::Controller,
            NetworkType::Rpc,
            &rpc::client_supplemental(&spec, &link),
        );
        let client = RpcClient::new(
            sd.clone(),
            self.connection.clone(),
            self.time_provider.clone(),
            link,
            None,
        );
        self.discovery.notify_service_created(&sd);
        Ok(client)
    }

    pub fn create_rpc_server(
        &self,
        name: &str,
        spec: RpcSpec,
        handler: Option<CallHandler>,
    ) -> SilKitResult<Arc<RpcServer>> {
        self.claim_service_name(name)?;
        let sd = self.make_descriptor(
            "default",
            name,
            ServiceType::Controller,
            NetworkType::Rpc,
            &[
                (keys::CONTROLLER_TYPE.to_string(), keys::CONTROLLER_TYPE_RPC_SERVER.to_string()),
                (keys::RPC_CLIENT_FUNCTION_NAME.to_string(), spec.topic.clone()),
            ],
        );
        let server = RpcServer::new(
            sd.clone(),
            self.connection.clone(),
            self.discovery.clone(),
            self.service_ids.clone(),
            self.time_provider.clone(),
            spec,
            handler,
        );
        self.discovery.notify_service_created(&sd);
        Ok(server)
    }

    // =========================================================================
    // ORCHESTRATION SERVICES
    // =========================================================================

    pub fn create_lifecycle_service(
        &self,
        mode: OperationMode,
    ) -> SilKitResult<Arc<LifecycleService>> {
        let mut slot = self.lifecycle.lock().expect("lifecycle lock");
        if slot.is_some() {
            return Err(SilKitError::state("lifecycle service was already created"));
        }
        let sd = self.make_descriptor(
            "default",
            "LifecycleService",
            ServiceType::InternalController,
            NetworkType::Undefined,
            &[(
                keys::CONTROLLER_TYPE.to_string(),
                keys::CONTROLLER_TYPE_LIFECYCLE_SERVICE.to_string(),
            )],
        );
        let lifecycle =
            LifecycleService::new(self.connection.clone(), sd.clone(), self.monitor.clone(), mode)?;
        *slot = Some(lifecycle.clone());
        drop(slot);
        self.discovery.notify_service_created(&sd);
        Ok(lifecycle)
    }

    pub fn lifecycle_service(&self) -> Option<Arc<LifecycleService>> {
        self.lifecycle.lock().expect("lifecycle lock").clone()
    }

    /// Synchronized virtual time; requires a lifecycle service first.
    pub fn create_time_sync_service(&self) -> SilKitResult<Arc<TimeSyncService>> {
        let lifecycle = self
            .lifecycle_service()
            .ok_or_else(|| SilKitError::state("create the lifecycle service first"))?;
        let mut slot = self.time_sync.lock().expect("time sync lock");
        if slot.is_some() {
            return Err(SilKitError::state("time sync service was already created"));
        }
        let sd = self.make_descriptor(
            "default",
            "TimeSyncService",
            ServiceType::InternalController,
            NetworkType::Undefined,
            &[
                (
                    keys::CONTROLLER_TYPE.to_string(),
                    keys::CONTROLLER_TYPE_TIME_SYNC_SERVICE.to_string(),
                ),
                (keys::TIME_SYNC_ACTIVE.to_string(), "1".to_string()),
            ],
        );
        let time_sync = TimeSyncService::new(
            self.connection.clone(),
            sd.clone(),
            lifecycle,
            self.monitor.clone(),
            self.discovery.clone(),
            self.time_provider.clone(),
            &self.config.health_check,
            self.config.experimental.time_synchronization.animation_factor,
            self.config.experimental.time_synchronization.enable_message_aggregation,
            &self.metrics,
        );
        *slot = Some(time_sync.clone());
        drop(slot);
        self.discovery.notify_service_created(&sd);
        Ok(time_sync)
    }

    pub fn time_sync_service(&self) -> Option<Arc<TimeSyncService>> {
        self.time_sync.lock().expect("time sync lock").clone()
    }

    /// The system monitor exists from creation; this hands out the handle.
    pub fn system_monitor(&self) -> Arc<SystemMonitor> {
        self.monitor.clone()
    }

    pub fn create_system_controller(&self) -> SilKitResult<Arc<SystemController>> {
        self.claim_service_name("SystemController")?;
        let sd = self.make_descriptor(
            "default",
            "SystemController",
            ServiceType::InternalController,
            NetworkType::Undefined,
            &[(
                keys::CONTROLLER_TYPE.to_string(),
                keys::CONTROLLER_TYPE_SYSTEM_CONTROLLER.to_string(),
            )],
        );
        let controller = SystemController::new(self.connection.clone(), sd.clone());
        self.discovery.notify_service_created(&sd);
        Ok(controller)
    }
}

fn own_acceptor_address(config: &ParticipantConfiguration) -> SilKitResult<(String, u16)> {
    match config.middleware.acceptor_uris.first() {
        Some(raw) => match AcceptorUri::parse(raw)? {
            AcceptorUri::Tcp { host, port } => Ok((host, port)),
            AcceptorUri::Local { .. } => Err(SilKitError::configuration(
                "acceptorUris must start with a silkit:// uri",
            )),
        },
        None => Ok(("127.0.0.1".to_string(), 0)),
    }
}
