//! Service discovery
//!
//! Every participant owns one discovery controller. Created and removed
//! services are broadcast as `ServiceDiscoveryEvent`s; a snapshot of the
//! currently-live services (`ParticipantDiscoveryEvent`) goes to every newly
//! connected peer, which is how late joiners learn pre-existing services.
//! Peer disconnects synthesize removal events for that peer's services.
//!
//! Handlers registered here see every event, including a replay of the
//! currently known set at registration time. Dispatch is queue-based, so a
//! handler may create or remove services (which raises further events)
//! without losing notifications.

use crate::descriptor::{EndpointAddress, ServiceDescriptor};
use crate::net::Connection;
use crate::wire::message::{
    MessageKind, ParticipantDiscoveryEvent, RoutedMessage, ServiceDiscoveryEvent,
    ServiceDiscoveryEventKind,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

pub type DiscoveryHandlerFn =
    Arc<Mutex<Box<dyn FnMut(ServiceDiscoveryEventKind, &ServiceDescriptor) + Send>>>;

struct DiscoveryState {
    /// Everything currently known, local services included.
    known: HashMap<(u64, u64), ServiceDescriptor>,
    /// Our own live services, replayed to newly connected peers.
    own: Vec<ServiceDescriptor>,
    handlers: Vec<(u64, DiscoveryHandlerFn)>,
}

pub struct ServiceDiscovery {
    connection: Arc<Connection>,
    endpoint: EndpointAddress,
    state: Mutex<DiscoveryState>,
    next_handler_id: AtomicU64,
    queue: Mutex<VecDeque<(ServiceDiscoveryEventKind, ServiceDescriptor)>>,
    dispatching: AtomicBool,
}

impl ServiceDiscovery {
    pub fn new(connection: Arc<Connection>, endpoint: EndpointAddress) -> Arc<Self> {
        let discovery = Arc::new(Self {
            connection: connection.clone(),
            endpoint,
            state: Mutex::new(DiscoveryState {
                known: HashMap::new(),
                own: Vec::new(),
                handlers: Vec::new(),
            }),
            next_handler_id: AtomicU64::new(1),
            queue: Mutex::new(VecDeque::new()),
            dispatching: AtomicBool::new(false),
        });

        {
            let d = discovery.clone();
            connection.register_receiver(
                MessageKind::ServiceDiscoveryEvent,
                "default",
                endpoint,
                Arc::new(move |_, msg| {
                    if let RoutedMessage::ServiceDiscoveryEvent(ev) = msg {
                        d.on_remote_event(ev.kind, &ev.descriptor);
                    }
                }),
            );
        }
        {
            let d = discovery.clone();
            connection.register_receiver(
                MessageKind::ParticipantDiscoveryEvent,
                "default",
                endpoint,
                Arc::new(move |_, msg| {
                    if let RoutedMessage::ParticipantDiscoveryEvent(ev) = msg {
                        for sd in &ev.descriptors {
                            d.on_remote_event(ServiceDiscoveryEventKind::ServiceCreated, sd);
                        }
                    }
                }),
            );
        }
        {
            let d = discovery.clone();
            connection.register_peer_shutdown_callback(Arc::new(move |info, _| {
                d.on_peer_departed(info.participant_id);
            }));
        }

        discovery
    }

    /// Announce a locally created service to all peers and local handlers.
    pub fn notify_service_created(&self, descriptor: &ServiceDescriptor) {
        trace!(descriptor = %descriptor, "service created");
        {
            let mut state = self.state.lock().expect("discovery lock");
            state
                .known
                .insert((descriptor.participant_id, descriptor.service_id), descriptor.clone());
            state.own.push(descriptor.clone());
        }
        self.connection.send_msg(
            self.endpoint,
            "default",
            RoutedMessage::ServiceDiscoveryEvent(ServiceDiscoveryEvent {
                kind: ServiceDiscoveryEventKind::ServiceCreated,
                descriptor: descriptor.clone(),
            }),
        );
        self.dispatch(ServiceDiscoveryEventKind::ServiceCreated, descriptor.clone());
    }

    /// Announce teardown of a locally owned service.
    pub fn notify_service_removed(&self, descriptor: &ServiceDescriptor) {
        trace!(descriptor = %descriptor, "service removed");
        {
            let mut state = self.state.lock().expect("discovery lock");
            state.known.remove(&(descriptor.participant_id, descriptor.service_id));
            state.own.retain(|sd| sd.service_id != descriptor.service_id);
        }
        self.connection.send_msg(
            self.endpoint,
            "default",
            RoutedMessage::ServiceDiscoveryEvent(ServiceDiscoveryEvent {
                kind: ServiceDiscoveryEventKind::ServiceRemoved,
                descriptor: descriptor.clone(),
            }),
        );
        self.dispatch(ServiceDiscoveryEventKind::ServiceRemoved, descriptor.clone());
    }

    /// Replay our live services to one newly connected peer.
    pub fn send_snapshot_to(&self, peer_participant_name: &str) {
        let descriptors = {
            let state = self.state.lock().expect("discovery lock");
            state.own.clone()
        };
        debug!(
            peer = %peer_participant_name,
            services = descriptors.len(),
            "sending service snapshot"
        );
        self.connection.send_msg_to(
            self.endpoint,
            peer_participant_name,
            "default",
            RoutedMessage::ParticipantDiscoveryEvent(ParticipantDiscoveryEvent { descriptors }),
        );
    }

    /// Register a handler; the current known set is replayed to it first.
    /// Events the replay provokes (a handler creating services) queue up and
    /// drain afterwards.
    pub fn register_handler(
        &self,
        f: impl FnMut(ServiceDiscoveryEventKind, &ServiceDescriptor) + Send + 'static,
    ) -> u64 {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let handler: DiscoveryHandlerFn = Arc::new(Mutex::new(Box::new(f)));
        let replay: Vec<ServiceDescriptor> = {
            let mut state = self.state.lock().expect("discovery lock");
            state.handlers.push((id, handler.clone()));
            state.known.values().cloned().collect()
        };
        let was_dispatching = self.dispatching.swap(true, Ordering::AcqRel);
        {
            let mut f = handler.lock().expect("handler lock");
            for sd in replay {
                f(ServiceDiscoveryEventKind::ServiceCreated, &sd);
            }
        }
        if !was_dispatching {
            self.drain_queue();
            self.dispatching.store(false, Ordering::Release);
            self.drain_if_idle();
        }
        id
    }

    pub fn remove_handler(&self, id: u64) {
        let mut state = self.state.lock().expect("discovery lock");
        state.handlers.retain(|(hid, _)| *hid != id);
    }

    pub fn known_services(&self) -> Vec<ServiceDescriptor> {
        self.state.lock().expect("discovery lock").known.values().cloned().collect()
    }

    fn on_remote_event(&self, kind: ServiceDiscoveryEventKind, descriptor: &ServiceDescriptor) {
        let fresh = {
            let mut state = self.state.lock().expect("discovery lock");
            match kind {
                ServiceDiscoveryEventKind::ServiceCreated => state
                    .known
                    .insert((descriptor.participant_id, descriptor.service_id), descriptor.clone())
                    .is_none(),
                ServiceDiscoveryEventKind::ServiceRemoved => state
                    .known
                    .remove(&(descriptor.participant_id, descriptor.service_id))
                    .is_some(),
            }
        };
        // Snapshot replays can repeat what a live event already delivered.
        if fresh {
            self.dispatch(kind, descriptor.clone());
        }
    }

    fn on_peer_departed(&self, participant_id: u64) {
        let departed: Vec<ServiceDescriptor> = {
            let mut state = self.state.lock().expect("discovery lock");
            let departed: Vec<ServiceDescriptor> = state
                .known
                .values()
                .filter(|sd| sd.participant_id == participant_id)
                .cloned()
                .collect();
            for sd in &departed {
                state.known.remove(&(sd.participant_id, sd.service_id));
            }
            departed
        };
        for sd in departed {
            debug!(descriptor = %sd, "synthesizing removal for departed peer");
            self.dispatch(ServiceDiscoveryEventKind::ServiceRemoved, sd);
        }
    }

    /// Queue-based dispatch: events raised by handlers are appended and
    /// drained by the outermost invocation, preserving order.
    fn dispatch(&self, kind: ServiceDiscoveryEventKind, descriptor: ServiceDescriptor) {
        self.queue.lock().expect("queue lock").push_back((kind, descriptor));
        self.drain_if_idle();
    }

    /// Claim the drain role unless someone above the call stack (or on
    /// another thread) already has it. Re-checks the queue after releasing:
    /// an event pushed during the release window must not get stuck.
    fn drain_if_idle(&self) {
        loop {
            if self.dispatching.swap(true, Ordering::AcqRel) {
                return;
            }
            self.drain_queue();
            self.dispatching.store(false, Ordering::Release);
            if self.queue.lock().expect("queue lock").is_empty() {
                return;
            }
        }
    }

    fn drain_queue(&self) {
        loop {
            let next = self.queue.lock().expect("queue lock").pop_front();
            let Some((kind, descriptor)) = next else {
                break;
            };
            let handlers: Vec<DiscoveryHandlerFn> = {
                let state = self.state.lock().expect("discovery lock");
                state.handlers.iter().map(|(_, h)| h.clone()).collect()
            };
            for handler in handlers {
                if let Ok(mut f) = handler.lock() {
                    f(kind, &descriptor);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{keys, participant_id_of};
    use std::sync::atomic::AtomicUsize;

    fn descriptor(participant: &str, service_name: &str, service_id: u64) -> ServiceDescriptor {
        let mut sd = ServiceDescriptor::new(participant, "default", service_name, service_id);
        sd.set_supplemental(keys::CONTROLLER_TYPE, keys::CONTROLLER_TYPE_CAN);
        sd
    }

    #[tokio::test]
    async fn handler_replay_covers_known_set() {
        let conn = Connection::new("A", participant_id_of("A"), "default");
        let endpoint = EndpointAddress { participant_id: participant_id_of("A"), service_id: 0 };
        let discovery = ServiceDiscovery::new(conn, endpoint);

        discovery.notify_service_created(&descriptor("A", "Can1", 1));
        discovery.notify_service_created(&descriptor("A", "Can2", 2));

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        discovery.register_handler(move |kind, _| {
            assert_eq!(kind, ServiceDiscoveryEventKind::ServiceCreated);
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn removal_reaches_handlers() {
        let conn = Connection::new("A", participant_id_of("A"), "default");
        let endpoint = EndpointAddress { participant_id: participant_id_of("A"), service_id: 0 };
        let discovery = ServiceDiscovery::new(conn, endpoint);

        let removed = Arc::new(AtomicUsize::new(0));
        let removed2 = removed.clone();
        discovery.register_handler(move |kind, _| {
            if kind == ServiceDiscoveryEventKind::ServiceRemoved {
                removed2.fetch_add(1, Ordering::SeqCst);
            }
        });

        let sd = descriptor("A", "Can1", 1);
        discovery.notify_service_created(&sd);
        discovery.notify_service_removed(&sd);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert!(discovery.known_services().is_empty());
    }

    #[tokio::test]
    async fn handler_creating_services_does_not_lose_events() {
        let conn = Connection::new("A", participant_id_of("A"), "default");
        let endpoint = EndpointAddress { participant_id: participant_id_of("A"), service_id: 0 };
        let discovery = ServiceDiscovery::new(conn.clone(), endpoint);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let d2 = discovery.clone();
        discovery.register_handler(move |kind, sd| {
            if kind == ServiceDiscoveryEventKind::ServiceCreated {
                seen2.fetch_add(1, Ordering::SeqCst);
                // A matching layer reacting to a publisher creates its
                // internal endpoint from inside the handler.
                if sd.service_name == "Trigger" {
                    d2.notify_service_created(&descriptor("A", "Reaction", 99));
                }
            }
        });

        discovery.notify_service_created(&descriptor("A", "Trigger", 5));
        // Both the trigger and the reaction were observed.
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
