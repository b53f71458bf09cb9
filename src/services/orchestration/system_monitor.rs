//! System monitor: participant statuses and the derived system state
//!
//! Ingests `ParticipantStatus` from all peers (and the local lifecycle via
//! self-delivery), tracks the required-participant set, and recomputes the
//! system state as a pure function of the current status map: `Error` if any
//! required participant is in `Error`, otherwise the minimum state under the
//! lifecycle ordering. Handlers fire on every change; registration replays
//! the current values.

use super::types::{ParticipantState, ParticipantStatus, SystemState};
use crate::descriptor::EndpointAddress;
use crate::net::Connection;
use crate::services::handlers::{HandlerId, Handlers};
use crate::wire::message::{MessageKind, RoutedMessage};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

struct TrackerState {
    required: Vec<String>,
    statuses: HashMap<String, ParticipantStatus>,
    system_state: SystemState,
    connected: HashSet<String>,
}

pub struct SystemMonitor {
    state: Mutex<TrackerState>,
    system_state_handlers: Handlers<SystemState>,
    participant_status_handlers: Handlers<ParticipantStatus>,
}

/// Pure computation of the system state over the required participants.
fn compute_system_state(
    required: &[String],
    statuses: &HashMap<String, ParticipantStatus>,
) -> SystemState {
    if required.is_empty() {
        return SystemState::Invalid;
    }
    let mut minimum: Option<ParticipantState> = None;
    for name in required {
        let state = statuses.get(name).map(|s| s.state).unwrap_or(ParticipantState::Invalid);
        if state == ParticipantState::Error {
            return SystemState::Error;
        }
        minimum = Some(match minimum {
            Some(current) if current.rank() <= state.rank() => current,
            _ => state,
        });
    }
    minimum.map(SystemState::from).unwrap_or(SystemState::Invalid)
}

impl SystemMonitor {
    pub fn new(connection: Arc<Connection>, endpoint: EndpointAddress) -> Arc<Self> {
        let monitor = Arc::new(Self {
            state: Mutex::new(TrackerState {
                required: Vec::new(),
                statuses: HashMap::new(),
                system_state: SystemState::Invalid,
                connected: HashSet::new(),
            }),
            system_state_handlers: Handlers::new(),
            participant_status_handlers: Handlers::new(),
        });

        {
            let m = monitor.clone();
            connection.register_receiver(
                MessageKind::ParticipantStatus,
                "default",
                endpoint,
                Arc::new(move |_, msg| {
                    if let RoutedMessage::ParticipantStatus(status) = msg {
                        m.on_participant_status(ParticipantStatus::from_wire(status));
                    }
                }),
            );
        }
        {
            let m = monitor.clone();
            connection.register_receiver(
                MessageKind::WorkflowConfiguration,
                "default",
                endpoint,
                Arc::new(move |_, msg| {
                    if let RoutedMessage::WorkflowConfiguration(wf) = msg {
                        m.update_required_participants(wf.required_participant_names.clone());
                    }
                }),
            );
        }
        {
            let m = monitor.clone();
            connection.register_peer_shutdown_callback(Arc::new(move |info, _| {
                m.on_participant_disconnected(&info.participant_name);
            }));
        }

        monitor
    }

    pub fn system_state(&self) -> SystemState {
        self.state.lock().expect("monitor lock").system_state
    }

    pub fn participant_status(&self, participant_name: &str) -> Option<ParticipantStatus> {
        self.state.lock().expect("monitor lock").statuses.get(participant_name).cloned()
    }

    pub fn required_participants(&self) -> Vec<String> {
        self.state.lock().expect("monitor lock").required.clone()
    }

    pub fn is_participant_connected(&self, participant_name: &str) -> bool {
        self.state.lock().expect("monitor lock").connected.contains(participant_name)
    }

    /// The handler sees the current system state immediately.
    pub fn add_system_state_handler(
        &self,
        mut f: impl FnMut(&SystemState) + Send + 'static,
    ) -> HandlerId {
        let current = self.system_state();
        f(&current);
        self.system_state_handlers.add(f)
    }

    pub fn remove_system_state_handler(&self, id: HandlerId) {
        if !self.system_state_handlers.remove(id) {
            warn!("remove_system_state_handler: unknown handler id");
        }
    }

    /// The handler sees every currently known status immediately.
    pub fn add_participant_status_handler(
        &self,
        mut f: impl FnMut(&ParticipantStatus) + Send + 'static,
    ) -> HandlerId {
        let replay: Vec<ParticipantStatus> = {
            let state = self.state.lock().expect("monitor lock");
            state
                .statuses
                .values()
                .filter(|s| s.state != ParticipantState::Invalid)
                .cloned()
                .collect()
        };
        for status in &replay {
            f(status);
        }
        self.participant_status_handlers.add(f)
    }

    pub fn remove_participant_status_handler(&self, id: HandlerId) {
        if !self.participant_status_handlers.remove(id) {
            warn!("remove_participant_status_handler: unknown handler id");
        }
    }

    pub fn update_required_participants(&self, required: Vec<String>) {
        let change = {
            let mut state = self.state.lock().expect("monitor lock");
            debug!(required = ?required, "required participants updated");
            state.required = required;
            let new_state = compute_system_state(&state.required, &state.statuses);
            if new_state != state.system_state {
                state.system_state = new_state;
                Some(new_state)
            } else {
                None
            }
        };
        if let Some(new_state) = change {
            self.system_state_handlers.invoke_all(&new_state);
        }
    }

    pub fn on_participant_status(&self, status: ParticipantStatus) {
        let (state_changed, system_change) = {
            let mut state = self.state.lock().expect("monitor lock");
            let previous = state.statuses.get(&status.participant_name).map(|s| s.state);
            let state_changed = previous != Some(status.state);
            state.statuses.insert(status.participant_name.clone(), status.clone());
            let new_state = compute_system_state(&state.required, &state.statuses);
            let system_change = if new_state != state.system_state {
                state.system_state = new_state;
                Some(new_state)
            } else {
                None
            };
            (state_changed, system_change)
        };
        if state_changed {
            self.participant_status_handlers.invoke_all(&status);
        }
        if let Some(new_state) = system_change {
            info!(system_state = %new_state, "system state changed");
            self.system_state_handlers.invoke_all(&new_state);
        }
    }

    pub fn on_participant_connected(&self, participant_name: &str) {
        self.state.lock().expect("monitor lock").connected.insert(participant_name.to_string());
    }

    /// A lost connection from a participant whose lifecycle was running is an
    /// Error; a graceful Shutdown disconnect is only logged.
    pub fn on_participant_disconnected(&self, participant_name: &str) {
        let last_state = {
            let mut state = self.state.lock().expect("monitor lock");
            state.connected.remove(participant_name);
            state.statuses.get(participant_name).map(|s| s.state)
        };
        match last_state {
            Some(ParticipantState::Shutdown) => {
                info!(participant = %participant_name, "disconnected after gracefully shutting down");
            }
            Some(ParticipantState::Invalid) | None => {
                debug!(participant = %participant_name, "disconnected without a started lifecycle");
            }
            Some(_) => {
                let now = Utc::now();
                self.on_participant_status(ParticipantStatus {
                    participant_name: participant_name.to_string(),
                    state: ParticipantState::Error,
                    enter_reason: "Connection Lost".to_string(),
                    enter_time: now,
                    refresh_time: now,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::participant_id_of;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn status(name: &str, state: ParticipantState) -> ParticipantStatus {
        let now = Utc::now();
        ParticipantStatus {
            participant_name: name.to_string(),
            state,
            enter_reason: "test".into(),
            enter_time: now,
            refresh_time: now,
        }
    }

    fn monitor() -> Arc<SystemMonitor> {
        let conn = Connection::new("Mon", participant_id_of("Mon"), "default");
        let endpoint = EndpointAddress { participant_id: participant_id_of("Mon"), service_id: 1 };
        SystemMonitor::new(conn, endpoint)
    }

    #[test]
    fn system_state_is_minimum_over_required() {
        let mut statuses = HashMap::new();
        statuses.insert("A".to_string(), status("A", ParticipantState::Running));
        statuses.insert("B".to_string(), status("B", ParticipantState::ReadyToRun));
        let required = vec!["A".to_string(), "B".to_string()];
        assert_eq!(compute_system_state(&required, &statuses), SystemState::ReadyToRun);
    }

    #[test]
    fn error_dominates() {
        let mut statuses = HashMap::new();
        statuses.insert("A".to_string(), status("A", ParticipantState::Error));
        statuses.insert("B".to_string(), status("B", ParticipantState::ServicesCreated));
        let required = vec!["A".to_string(), "B".to_string()];
        assert_eq!(compute_system_state(&required, &statuses), SystemState::Error);
    }

    #[test]
    fn non_required_participants_are_ignored() {
        let mut statuses = HashMap::new();
        statuses.insert("A".to_string(), status("A", ParticipantState::Running));
        statuses.insert("X".to_string(), status("X", ParticipantState::Error));
        let required = vec!["A".to_string()];
        assert_eq!(compute_system_state(&required, &statuses), SystemState::Running);
    }

    #[test]
    fn empty_required_set_keeps_state_invalid() {
        let statuses = HashMap::new();
        assert_eq!(compute_system_state(&[], &statuses), SystemState::Invalid);
    }

    #[test]
    fn missing_required_participant_pins_state_at_invalid() {
        let mut statuses = HashMap::new();
        statuses.insert("A".to_string(), status("A", ParticipantState::Running));
        let required = vec!["A".to_string(), "NotYetJoined".to_string()];
        assert_eq!(compute_system_state(&required, &statuses), SystemState::Invalid);
    }

    #[tokio::test]
    async fn handlers_fire_on_changes_only() {
        let monitor = monitor();
        monitor.update_required_participants(vec!["A".to_string()]);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        monitor.add_system_state_handler(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        let initial = fired.load(Ordering::SeqCst); // replay of the current state

        monitor.on_participant_status(status("A", ParticipantState::Running));
        monitor.on_participant_status(status("A", ParticipantState::Running));
        assert_eq!(fired.load(Ordering::SeqCst), initial + 1);
        assert_eq!(monitor.system_state(), SystemState::Running);
    }

    #[tokio::test]
    async fn disconnect_with_running_lifecycle_synthesizes_error() {
        let monitor = monitor();
        monitor.update_required_participants(vec!["A".to_string()]);
        monitor.on_participant_connected("A");
        monitor.on_participant_status(status("A", ParticipantState::Running));
        assert!(monitor.is_participant_connected("A"));

        monitor.on_participant_disconnected("A");
        assert!(!monitor.is_participant_connected("A"));
        assert_eq!(monitor.system_state(), SystemState::Error);
        let got = monitor.participant_status("A").unwrap();
        assert_eq!(got.state, ParticipantState::Error);
        assert_eq!(got.enter_reason, "Connection Lost");
    }

    #[tokio::test]
    async fn graceful_shutdown_disconnect_stays_clean() {
        let monitor = monitor();
        monitor.update_required_participants(vec!["A".to_string()]);
        monitor.on_participant_status(status("A", ParticipantState::Shutdown));
        monitor.on_participant_disconnected("A");
        assert_eq!(monitor.system_state(), SystemState::Shutdown);
    }
}
