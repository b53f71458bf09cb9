//! Connection layer: peers, receiver table, typed routing
//!
//! Owns the map of handshaken peers and the in-process receiver table keyed
//! by `(message kind, link)`. Outbound broadcasts go to every peer that
//! announced a matching subscription (control-plane kinds go to every peer);
//! local receivers on the same link are invoked synchronously during the
//! send, so self-delivery respects program order.
//!
//! All inbound dispatch runs on a single dispatch task per participant; user
//! API calls mutate the router state under its mutex and never touch peer
//! sockets directly.

use super::peer::{spawn_peer_tasks, DispatchCmd, PeerSender, PeerStream};
use crate::descriptor::EndpointAddress;
use crate::wire::message::{
    Frame, MessageKind, PeerInfo, RoutedFrame, RoutedMessage, SubscriptionAcknowledge,
    SubscriptionAnnouncement,
};
use crate::wire::to_wire;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub type ReceiverFn = Arc<dyn Fn(&EndpointAddress, &RoutedMessage) + Send + Sync>;
pub type PeerShutdownFn = Arc<dyn Fn(&PeerInfo, &str) + Send + Sync>;

/// Handle for removing a registered receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverHandle {
    pub kind: MessageKind,
    pub link: String,
    pub id: u64,
}

struct PeerEntry {
    info: PeerInfo,
    simulation_name: String,
    remote_host: Option<String>,
    sender: PeerSender,
    subscriptions: HashSet<(MessageKind, String)>,
}

struct RouterState {
    peers: HashMap<String, PeerEntry>,
    receivers: HashMap<(MessageKind, String), Vec<ReceiverEntry>>,
    /// Links with history depth 1: last routed data message retained per link.
    history_links: HashSet<String>,
    history: HashMap<String, RoutedFrame>,
    /// Subscriptions to replay to every newly connected peer.
    local_subscriptions: HashSet<(MessageKind, String)>,
    id_to_name: HashMap<u64, String>,
}

struct ReceiverEntry {
    id: u64,
    owner: EndpointAddress,
    f: ReceiverFn,
}

pub struct Connection {
    participant_name: String,
    participant_id: u64,
    simulation_name: String,
    state: Mutex<RouterState>,
    dispatch_tx: mpsc::UnboundedSender<DispatchCmd>,
    aggregate: Arc<AtomicBool>,
    next_receiver_id: AtomicU64,
    peer_shutdown_handlers: Mutex<Vec<PeerShutdownFn>>,
}

impl Connection {
    /// Create the connection and start its dispatch task.
    pub fn new(participant_name: &str, participant_id: u64, simulation_name: &str) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let mut id_to_name = HashMap::new();
        id_to_name.insert(participant_id, participant_name.to_string());
        let conn = Arc::new(Self {
            participant_name: participant_name.to_string(),
            participant_id,
            simulation_name: simulation_name.to_string(),
            state: Mutex::new(RouterState {
                peers: HashMap::new(),
                receivers: HashMap::new(),
                history_links: HashSet::new(),
                history: HashMap::new(),
                local_subscriptions: HashSet::new(),
                id_to_name,
            }),
            dispatch_tx,
            aggregate: Arc::new(AtomicBool::new(false)),
            next_receiver_id: AtomicU64::new(1),
            peer_shutdown_handlers: Mutex::new(Vec::new()),
        });
        tokio::spawn(dispatch_loop(conn.clone(), dispatch_rx));
        conn
    }

    pub fn participant_name(&self) -> &str {
        &self.participant_name
    }

    pub fn participant_id(&self) -> u64 {
        self.participant_id
    }

    pub fn simulation_name(&self) -> &str {
        &self.simulation_name
    }

    pub fn dispatch_sender(&self) -> mpsc::UnboundedSender<DispatchCmd> {
        self.dispatch_tx.clone()
    }

    /// Flip outbound frame aggregation on every peer.
    pub fn set_aggregation(&self, on: bool) {
        self.aggregate.store(on, Ordering::Relaxed);
    }

    // =========================================================================
    // PEERS
    // =========================================================================

    /// Register a handshaken stream as a peer and start its I/O tasks.
    /// Local subscriptions are replayed to the new peer immediately.
    ///
    /// `peer_key` identifies the peer in the map; participants use the bare
    /// participant name, the registry scopes it by simulation.
    pub fn add_peer(
        &self,
        stream: PeerStream,
        peer_key: String,
        info: PeerInfo,
        simulation_name: String,
        remote_host: Option<String>,
    ) {
        let key = peer_key;
        let sender = spawn_peer_tasks(stream, key.clone(), self.dispatch_tx.clone(), self.aggregate.clone());

        let mut state = self.state.lock().expect("router lock");
        for (kind, link) in &state.local_subscriptions {
            let frame = Frame::SubscriptionAnnouncement(SubscriptionAnnouncement {
                kind: *kind,
                link: link.clone(),
            });
            sender.send_frame(to_wire(&frame));
        }
        state.id_to_name.insert(info.participant_id, key.clone());
        let previous = state.peers.insert(
            key.clone(),
            PeerEntry {
                info,
                simulation_name,
                remote_host,
                sender,
                subscriptions: HashSet::new(),
            },
        );
        drop(state);
        if let Some(previous) = previous {
            warn!(peer = %key, "replacing existing peer entry");
            previous.sender.close();
        }
        debug!(peer = %key, "peer added");
    }

    pub fn has_peer(&self, participant_name: &str) -> bool {
        self.state.lock().expect("router lock").peers.contains_key(participant_name)
    }

    pub fn peer_names(&self) -> Vec<String> {
        self.state.lock().expect("router lock").peers.keys().cloned().collect()
    }

    pub fn peer_info(&self, participant_name: &str) -> Option<PeerInfo> {
        self.state
            .lock()
            .expect("router lock")
            .peers
            .get(participant_name)
            .map(|p| p.info.clone())
    }

    /// Peer infos with their simulation names and observed hosts, for the
    /// registry's known-participants reply.
    pub fn peer_entries(&self) -> Vec<(PeerInfo, String, Option<String>)> {
        self.state
            .lock()
            .expect("router lock")
            .peers
            .values()
            .map(|p| (p.info.clone(), p.simulation_name.clone(), p.remote_host.clone()))
            .collect()
    }

    pub fn participant_name_of(&self, participant_id: u64) -> Option<String> {
        self.state.lock().expect("router lock").id_to_name.get(&participant_id).cloned()
    }

    /// Close a peer's transport. The dispatch task finishes the removal when
    /// the reader loop ends.
    pub fn close_peer(&self, participant_name: &str) {
        let state = self.state.lock().expect("router lock");
        if let Some(peer) = state.peers.get(participant_name) {
            peer.sender.close();
        }
    }

    pub fn register_peer_shutdown_callback(&self, f: PeerShutdownFn) {
        self.peer_shutdown_handlers.lock().expect("handler lock").push(f);
    }

    /// Runs on the dispatch task when a peer transport ends. Shutdown
    /// callbacks run exactly once per peer: the entry is removed first, and a
    /// second close of the same peer finds nothing.
    fn handle_peer_closed(&self, peer_key: &str) {
        let removed = {
            let mut state = self.state.lock().expect("router lock");
            state.peers.remove(peer_key)
        };
        let Some(entry) = removed else {
            return;
        };
        debug!(peer = %peer_key, "peer removed");
        entry.sender.close();
        let handlers: Vec<PeerShutdownFn> =
            self.peer_shutdown_handlers.lock().expect("handler lock").clone();
        for h in handlers {
            h(&entry.info, &entry.simulation_name);
        }
    }

    // =========================================================================
    // RECEIVERS
    // =========================================================================

    /// Register a local receiver for `(kind, link)`.
    ///
    /// Data-plane registrations are announced to all peers so their
    /// broadcasts start flowing here; the announcement is also replayed to
    /// every later-connecting peer.
    pub fn register_receiver(
        &self,
        kind: MessageKind,
        link: &str,
        owner: EndpointAddress,
        f: ReceiverFn,
    ) -> ReceiverHandle {
        let id = self.next_receiver_id.fetch_add(1, Ordering::Relaxed);
        let local_replay = {
            let mut state = self.state.lock().expect("router lock");
            state
                .receivers
                .entry((kind, link.to_string()))
                .or_default()
                .push(ReceiverEntry { id, owner, f: f.clone() });
            let newly_announced = state.local_subscriptions.insert((kind, link.to_string()));
            if newly_announced {
                let frame = Frame::SubscriptionAnnouncement(SubscriptionAnnouncement {
                    kind,
                    link: link.to_string(),
                });
                let bytes = to_wire(&frame);
                for peer in state.peers.values() {
                    peer.sender.send_frame(bytes.clone());
                }
            }
            // A locally retained message is replayed to the newly matched
            // receiver right away, before any later live message.
            if kind == MessageKind::DataMessageEvent {
                state.history.get(link).cloned()
            } else {
                None
            }
        };
        if let Some(retained) = local_replay {
            f(&retained.from, &retained.msg);
        }
        ReceiverHandle { kind, link: link.to_string(), id }
    }

    /// Remove a receiver. Removing an unknown handle is a no-op.
    pub fn remove_receiver(&self, handle: &ReceiverHandle) {
        let mut state = self.state.lock().expect("router lock");
        if let Some(list) = state.receivers.get_mut(&(handle.kind, handle.link.clone())) {
            list.retain(|e| e.id != handle.id);
            if list.is_empty() {
                state.receivers.remove(&(handle.kind, handle.link.clone()));
            }
        }
    }

    /// Retain the last sent data message on this link and replay it to newly
    /// matched subscribers. One slot per link, regardless of receiver count.
    pub fn enable_history(&self, link: &str) {
        self.state.lock().expect("router lock").history_links.insert(link.to_string());
    }

    pub fn number_of_remote_receivers(&self, kind: MessageKind, link: &str) -> usize {
        let state = self.state.lock().expect("router lock");
        state
            .peers
            .values()
            .filter(|p| p.subscriptions.contains(&(kind, link.to_string())))
            .count()
    }

    pub fn participant_names_of_remote_receivers(&self, kind: MessageKind, link: &str) -> Vec<String> {
        let state = self.state.lock().expect("router lock");
        state
            .peers
            .values()
            .filter(|p| p.subscriptions.contains(&(kind, link.to_string())))
            .map(|p| p.info.participant_name.clone())
            .collect()
    }

    // =========================================================================
    // SENDING
    // =========================================================================

    /// Broadcast on the link: all peers with a matching remote receiver, plus
    /// synchronous local delivery to receivers other than the sender itself.
    pub fn send_msg(&self, from: EndpointAddress, link: &str, msg: RoutedMessage) {
        let kind = msg.kind();
        trace!(
            kind = ?kind,
            link = %link,
            from_participant = from.participant_id,
            from_service = from.service_id,
            timestamp_ns = msg.timestamp_ns(),
            "TX"
        );
        let frame = RoutedFrame { from, link: link.to_string(), msg };
        let bytes = to_wire(&Frame::Routed(frame.clone()));

        let local: Vec<ReceiverFn> = {
            let mut state = self.state.lock().expect("router lock");
            if kind == MessageKind::DataMessageEvent && state.history_links.contains(link) {
                state.history.insert(link.to_string(), frame.clone());
            }
            for peer in state.peers.values() {
                if kind.is_control_plane() || peer.subscriptions.contains(&(kind, link.to_string())) {
                    peer.sender.send_frame(bytes.clone());
                }
            }
            state
                .receivers
                .get(&(kind, link.to_string()))
                .map(|list| {
                    list.iter()
                        .filter(|e| e.owner != from)
                        .map(|e| e.f.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        for f in local {
            f(&frame.from, &frame.msg);
        }
    }

    /// Unicast to one participant. Subscription state is not consulted; the
    /// caller knows the receiver exists (history replay, targeted commands).
    pub fn send_msg_to(
        &self,
        from: EndpointAddress,
        target_participant_name: &str,
        link: &str,
        msg: RoutedMessage,
    ) {
        if target_participant_name == self.participant_name {
            let kind = msg.kind();
            let frame = RoutedFrame { from, link: link.to_string(), msg };
            let local: Vec<ReceiverFn> = {
                let state = self.state.lock().expect("router lock");
                state
                    .receivers
                    .get(&(kind, link.to_string()))
                    .map(|list| {
                        list.iter().filter(|e| e.owner != from).map(|e| e.f.clone()).collect()
                    })
                    .unwrap_or_default()
            };
            for f in local {
                f(&frame.from, &frame.msg);
            }
            return;
        }
        let frame = RoutedFrame { from, link: link.to_string(), msg };
        let bytes = to_wire(&Frame::Routed(frame));
        let state = self.state.lock().expect("router lock");
        match state.peers.get(target_participant_name) {
            Some(peer) => {
                peer.sender.send_frame(bytes);
            }
            None => {
                debug!(target = %target_participant_name, "unicast target not connected");
            }
        }
    }

    // =========================================================================
    // DISPATCH CONTEXT
    // =========================================================================

    /// Run `f` on the dispatch context, after everything queued before it.
    pub fn execute_deferred(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.dispatch_tx.send(DispatchCmd::Deferred(Box::new(f)));
    }

    /// Fire `f` (on the dispatch context) once the outbound queues of all
    /// current peers have drained past the current write cursor.
    pub fn on_all_messages_delivered(self: &Arc<Self>, f: impl FnOnce() + Send + 'static) {
        let barriers: Vec<_> = {
            let state = self.state.lock().expect("router lock");
            state.peers.values().filter_map(|p| p.sender.barrier()).collect()
        };
        let conn = self.clone();
        tokio::spawn(async move {
            for b in barriers {
                let _ = b.await;
            }
            conn.execute_deferred(f);
        });
    }

    /// Stop the dispatch task and close every peer.
    pub fn shutdown(&self) {
        let state = self.state.lock().expect("router lock");
        for peer in state.peers.values() {
            peer.sender.close();
        }
        drop(state);
        let _ = self.dispatch_tx.send(DispatchCmd::Shutdown);
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    fn handle_inbound(&self, peer_key: &str, frame: Frame) {
        match frame {
            Frame::SubscriptionAnnouncement(sub) => {
                let mut state = self.state.lock().expect("router lock");
                let Some(peer) = state.peers.get_mut(peer_key) else {
                    return;
                };
                peer.subscriptions.insert((sub.kind, sub.link.clone()));
                let ack = to_wire(&Frame::SubscriptionAcknowledge(SubscriptionAcknowledge {
                    kind: sub.kind,
                    link: sub.link.clone(),
                }));
                peer.sender.send_frame(ack);
                // The retained message goes out before any later live send:
                // both pass through the same peer queue.
                if sub.kind == MessageKind::DataMessageEvent {
                    if let Some(retained) = state.history.get(&sub.link) {
                        trace!(peer = %peer_key, link = %sub.link, "replaying retained message");
                        let bytes = to_wire(&Frame::Routed(retained.clone()));
                        if let Some(peer) = state.peers.get(peer_key) {
                            peer.sender.send_frame(bytes);
                        }
                    }
                }
            }
            Frame::SubscriptionAcknowledge(ack) => {
                trace!(peer = %peer_key, kind = ?ack.kind, link = %ack.link, "subscription acknowledged");
            }
            Frame::Routed(rf) => {
                trace!(
                    kind = ?rf.msg.kind(),
                    link = %rf.link,
                    from_participant = rf.from.participant_id,
                    from_service = rf.from.service_id,
                    timestamp_ns = rf.msg.timestamp_ns(),
                    "RX"
                );
                let local: Vec<ReceiverFn> = {
                    let state = self.state.lock().expect("router lock");
                    state
                        .receivers
                        .get(&(rf.msg.kind(), rf.link.clone()))
                        .map(|list| list.iter().map(|e| e.f.clone()).collect())
                        .unwrap_or_default()
                };
                for f in local {
                    f(&rf.from, &rf.msg);
                }
            }
            Frame::Announcement(_) | Frame::AnnouncementReply(_) | Frame::KnownParticipants(_) => {
                warn!(peer = %peer_key, "handshake frame after handshake; closing peer");
                self.close_peer(peer_key);
            }
        }
    }
}

async fn dispatch_loop(conn: Arc<Connection>, mut rx: mpsc::UnboundedReceiver<DispatchCmd>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            DispatchCmd::Inbound { peer, frame } => conn.handle_inbound(&peer, frame),
            DispatchCmd::PeerClosed { peer } => conn.handle_peer_closed(&peer),
            DispatchCmd::Deferred(f) => f(),
            DispatchCmd::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::participant_id_of;
    use crate::wire::message::{DataMessageEvent, NextSimTask};
    use std::sync::atomic::AtomicUsize;
    use tokio::net::{TcpListener, TcpStream};

    fn test_info(name: &str) -> PeerInfo {
        PeerInfo {
            participant_name: name.to_string(),
            participant_id: participant_id_of(name),
            acceptor_uris: vec![],
            capabilities: vec![],
        }
    }

    async fn connected_pair(a: &Arc<Connection>, b: &Arc<Connection>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        a.add_peer(
            PeerStream::Tcp(client),
            b.participant_name().to_string(),
            test_info(b.participant_name()),
            "default".into(),
            None,
        );
        b.add_peer(
            PeerStream::Tcp(server),
            a.participant_name().to_string(),
            test_info(a.participant_name()),
            "default".into(),
            None,
        );
        // Let subscription replays settle.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    fn ep(conn: &Connection, service_id: u64) -> EndpointAddress {
        EndpointAddress { participant_id: conn.participant_id(), service_id }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn broadcast_reaches_subscribed_peer() {
        let a = Connection::new("A", participant_id_of("A"), "default");
        let b = Connection::new("B", participant_id_of("B"), "default");

        let got = Arc::new(AtomicUsize::new(0));
        let got2 = got.clone();
        b.register_receiver(
            MessageKind::DataMessageEvent,
            "L1",
            ep(&b, 1),
            Arc::new(move |_, msg| {
                if let RoutedMessage::DataMessageEvent(ev) = msg {
                    assert_eq!(ev.data, vec![1]);
                    got2.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        connected_pair(&a, &b).await;
        assert_eq!(a.number_of_remote_receivers(MessageKind::DataMessageEvent, "L1"), 1);

        a.send_msg(
            ep(&a, 5),
            "L1",
            RoutedMessage::DataMessageEvent(DataMessageEvent { timestamp_ns: 0, data: vec![1] }),
        );

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(got.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn self_delivery_is_synchronous_and_skips_sender() {
        let a = Connection::new("A", participant_id_of("A"), "default");
        let got = Arc::new(AtomicUsize::new(0));

        let got2 = got.clone();
        a.register_receiver(
            MessageKind::DataMessageEvent,
            "L1",
            ep(&a, 2),
            Arc::new(move |_, _| {
                got2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        // The sender's own endpoint must not observe its own message.
        let got3 = got.clone();
        a.register_receiver(
            MessageKind::DataMessageEvent,
            "L1",
            ep(&a, 5),
            Arc::new(move |_, _| {
                got3.fetch_add(100, Ordering::SeqCst);
            }),
        );

        a.send_msg(
            ep(&a, 5),
            "L1",
            RoutedMessage::DataMessageEvent(DataMessageEvent { timestamp_ns: 0, data: vec![9] }),
        );
        // Synchronous: observable immediately after send_msg returns.
        assert_eq!(got.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn history_replayed_to_late_subscriber() {
        let a = Connection::new("A", participant_id_of("A"), "default");
        let b = Connection::new("B", participant_id_of("B"), "default");

        a.enable_history("LH");
        a.send_msg(
            ep(&a, 5),
            "LH",
            RoutedMessage::DataMessageEvent(DataMessageEvent { timestamp_ns: 0, data: vec![7] }),
        );

        connected_pair(&a, &b).await;

        let got = Arc::new(AtomicUsize::new(0));
        let got2 = got.clone();
        b.register_receiver(
            MessageKind::DataMessageEvent,
            "LH",
            ep(&b, 1),
            Arc::new(move |_, msg| {
                if let RoutedMessage::DataMessageEvent(ev) = msg {
                    assert_eq!(ev.data, vec![7]);
                    got2.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        assert_eq!(got.load(Ordering::SeqCst), 1, "retained message arrives exactly once");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn peer_shutdown_callback_runs_once() {
        let a = Connection::new("A", participant_id_of("A"), "default");
        let b = Connection::new("B", participant_id_of("B"), "default");
        connected_pair(&a, &b).await;

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        a.register_peer_shutdown_callback(Arc::new(move |info, simulation| {
            assert_eq!(info.participant_name, "B");
            assert_eq!(simulation, "default");
            count2.fetch_add(1, Ordering::SeqCst);
        }));

        b.shutdown();
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!a.has_peer("B"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn control_plane_broadcast_needs_no_subscription() {
        let a = Connection::new("A", participant_id_of("A"), "default");
        let b = Connection::new("B", participant_id_of("B"), "default");
        connected_pair(&a, &b).await;

        let got = Arc::new(AtomicUsize::new(0));
        let got2 = got.clone();
        b.register_receiver(
            MessageKind::NextSimTask,
            "default",
            ep(&b, 1),
            Arc::new(move |_, _| {
                got2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        a.send_msg(
            ep(&a, 5),
            "default",
            RoutedMessage::NextSimTask(NextSimTask { time_point_ns: 0, duration_ns: 1 }),
        );
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(got.load(Ordering::SeqCst), 1);
    }
}
