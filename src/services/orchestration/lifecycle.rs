//! Per-participant lifecycle state machine
//!
//! Drives the state chain `ServicesCreated → CommunicationInitializing →
//! CommunicationInitialized → ReadyToRun → Running ⇄ Paused → Stopping →
//! Stopped → ShuttingDown → Shutdown`, with `Error` reachable from any
//! non-terminal state and `Aborting` from anywhere. Every transition is
//! broadcast as a `ParticipantStatus`; the local system monitor observes the
//! same broadcast through self-delivery.
//!
//! Coordinated participants advance only when the derived system state shows
//! every required participant has caught up; autonomous participants walk
//! the chain on their own. Messages published inside the stop, shutdown, and
//! abort handlers are flushed to all peers before the next state is
//! announced, so remote lifecycles observe them before reaching `Shutdown`.
//!
//! Transitions are compare-and-swap on the current state under the FSM lock;
//! a progression that lost the race (a status arriving on the dispatch task
//! while the user thread advances) is simply dropped.

use super::system_monitor::SystemMonitor;
use super::time_sync::TimeSyncService;
use super::types::{OperationMode, ParticipantState, ParticipantStatus, SystemState};
use crate::descriptor::ServiceDescriptor;
use crate::error::{SilKitError, SilKitResult};
use crate::net::Connection;
use crate::wire::message::{MessageKind, RoutedMessage, SystemCommandKind};
use chrono::Utc;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

type Hook = Box<dyn FnMut() + Send>;
type AbortHook = Box<dyn FnMut(ParticipantState) + Send>;

#[derive(Default)]
struct LifecycleHandlers {
    communication_ready: Option<Hook>,
    communication_ready_is_async: bool,
    starting: Option<Hook>,
    stop: Option<Hook>,
    shutdown: Option<Hook>,
    abort: Option<AbortHook>,
}

struct FsmState {
    state: ParticipantState,
    started: bool,
    stop_requested: bool,
    pause_requested: bool,
    comm_ready_fired: bool,
    comm_ready_completed: bool,
    starting_fired: bool,
    stop_fired: bool,
    shutdown_fired: bool,
    abort_fired: bool,
}

pub struct LifecycleService {
    connection: Arc<Connection>,
    descriptor: ServiceDescriptor,
    monitor: Arc<SystemMonitor>,
    mode: OperationMode,
    fsm: Mutex<FsmState>,
    handlers: Mutex<LifecycleHandlers>,
    time_sync: Mutex<Option<Weak<TimeSyncService>>>,
    state_tx: watch::Sender<ParticipantState>,
}

impl LifecycleService {
    pub fn new(
        connection: Arc<Connection>,
        descriptor: ServiceDescriptor,
        monitor: Arc<SystemMonitor>,
        mode: OperationMode,
    ) -> SilKitResult<Arc<Self>> {
        if mode == OperationMode::Invalid {
            return Err(SilKitError::configuration("lifecycle operation mode must be set"));
        }
        let (state_tx, _) = watch::channel(ParticipantState::Invalid);
        let lifecycle = Arc::new(Self {
            connection: connection.clone(),
            descriptor: descriptor.clone(),
            monitor: monitor.clone(),
            mode,
            fsm: Mutex::new(FsmState {
                state: ParticipantState::Invalid,
                started: false,
                stop_requested: false,
                pause_requested: false,
                comm_ready_fired: false,
                comm_ready_completed: false,
                starting_fired: false,
                stop_fired: false,
                shutdown_fired: false,
                abort_fired: false,
            }),
            handlers: Mutex::new(LifecycleHandlers::default()),
            time_sync: Mutex::new(None),
            state_tx,
        });

        {
            let lc = lifecycle.clone();
            connection.register_receiver(
                MessageKind::SystemCommand,
                "default",
                descriptor.endpoint_address(),
                Arc::new(move |_, msg| {
                    if let RoutedMessage::SystemCommand(cmd) = msg {
                        if cmd.kind == SystemCommandKind::AbortSimulation {
                            lc.abort_simulation();
                        }
                    }
                }),
            );
        }

        if mode == OperationMode::Coordinated {
            let lc = lifecycle.clone();
            monitor.add_system_state_handler(move |sys| {
                lc.on_system_state(*sys);
            });
            // Stop propagation: a required participant entering Stopping or
            // Stopped drags the rest of the coordinated run down with it.
            let lc = lifecycle.clone();
            monitor.add_participant_status_handler(move |status| {
                lc.on_required_participant_status(status);
            });
        }

        Ok(lifecycle)
    }

    pub fn operation_mode(&self) -> OperationMode {
        self.mode
    }

    pub fn state(&self) -> ParticipantState {
        self.fsm.lock().expect("fsm lock").state
    }

    pub fn stop_requested(&self) -> bool {
        self.fsm.lock().expect("fsm lock").stop_requested
    }

    pub fn pause_requested(&self) -> bool {
        self.fsm.lock().expect("fsm lock").pause_requested
    }

    pub(crate) fn attach_time_sync(&self, time_sync: &Arc<TimeSyncService>) {
        *self.time_sync.lock().expect("time sync lock") = Some(Arc::downgrade(time_sync));
    }

    fn time_sync(&self) -> Option<Arc<TimeSyncService>> {
        self.time_sync.lock().expect("time sync lock").as_ref().and_then(Weak::upgrade)
    }

    /// Subscribe to state transitions, for waiting on a target state.
    pub fn subscribe_state(&self) -> watch::Receiver<ParticipantState> {
        self.state_tx.subscribe()
    }

    /// Wait until the lifecycle reaches `target` (or a terminal state).
    pub async fn wait_for_state(&self, target: ParticipantState) -> ParticipantState {
        let mut rx = self.state_tx.subscribe();
        loop {
            let current = *rx.borrow();
            if current == target || current.is_terminal() {
                return current;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    pub async fn wait_for_shutdown(&self) -> ParticipantState {
        self.wait_for_state(ParticipantState::Shutdown).await
    }

    // =========================================================================
    // HANDLER REGISTRATION
    // =========================================================================

    pub fn set_communication_ready_handler(&self, f: impl FnMut() + Send + 'static) {
        let mut handlers = self.handlers.lock().expect("handler lock");
        handlers.communication_ready = Some(Box::new(f));
        handlers.communication_ready_is_async = false;
    }

    /// Async variant: the lifecycle stays in `CommunicationInitialized` until
    /// [`LifecycleService::complete_communication_ready_handler_async`].
    pub fn set_communication_ready_handler_async(&self, f: impl FnMut() + Send + 'static) {
        let mut handlers = self.handlers.lock().expect("handler lock");
        handlers.communication_ready = Some(Box::new(f));
        handlers.communication_ready_is_async = true;
    }

    pub fn set_starting_handler(&self, f: impl FnMut() + Send + 'static) {
        self.handlers.lock().expect("handler lock").starting = Some(Box::new(f));
    }

    pub fn set_stop_handler(&self, f: impl FnMut() + Send + 'static) {
        self.handlers.lock().expect("handler lock").stop = Some(Box::new(f));
    }

    pub fn set_shutdown_handler(&self, f: impl FnMut() + Send + 'static) {
        self.handlers.lock().expect("handler lock").shutdown = Some(Box::new(f));
    }

    pub fn set_abort_handler(&self, f: impl FnMut(ParticipantState) + Send + 'static) {
        self.handlers.lock().expect("handler lock").abort = Some(Box::new(f));
    }

    // =========================================================================
    // API
    // =========================================================================

    pub fn start_lifecycle(self: &Arc<Self>) -> SilKitResult<()> {
        {
            let mut fsm = self.fsm.lock().expect("fsm lock");
            if fsm.started {
                return Err(SilKitError::state("lifecycle was already started"));
            }
            fsm.started = true;
        }
        info!(mode = ?self.mode, "lifecycle starting");
        if self
            .transition_from(&[ParticipantState::Invalid], ParticipantState::ServicesCreated, "lifecycle started")
            .is_none()
        {
            return Err(SilKitError::state("lifecycle cannot start from the current state"));
        }
        self.evaluate();
        Ok(())
    }

    pub fn stop(self: &Arc<Self>, reason: &str) -> SilKitResult<()> {
        {
            let mut fsm = self.fsm.lock().expect("fsm lock");
            if fsm.stop_requested {
                return Ok(());
            }
            if !matches!(fsm.state, ParticipantState::Running | ParticipantState::Paused) {
                return Err(SilKitError::state(format!("stop() called in state {}", fsm.state)));
            }
            fsm.stop_requested = true;
        }
        if self
            .transition_from(
                &[ParticipantState::Running, ParticipantState::Paused],
                ParticipantState::Stopping,
                reason,
            )
            .is_some()
        {
            self.run_stop_chain();
        }
        Ok(())
    }

    pub fn pause(self: &Arc<Self>, reason: &str) -> SilKitResult<()> {
        {
            let mut fsm = self.fsm.lock().expect("fsm lock");
            if fsm.state != ParticipantState::Running {
                return Err(SilKitError::state(format!("pause() called in state {}", fsm.state)));
            }
            fsm.pause_requested = true;
        }
        self.transition_from(&[ParticipantState::Running], ParticipantState::Paused, reason);
        Ok(())
    }

    pub fn continue_simulation(self: &Arc<Self>) -> SilKitResult<()> {
        {
            let mut fsm = self.fsm.lock().expect("fsm lock");
            if fsm.state != ParticipantState::Paused {
                return Err(SilKitError::state(format!(
                    "continue_simulation() called in state {}",
                    fsm.state
                )));
            }
            fsm.pause_requested = false;
        }
        self.transition_from(
            &[ParticipantState::Paused],
            ParticipantState::Running,
            "continuing after pause",
        );
        if let Some(ts) = self.time_sync() {
            ts.request_next_step();
        }
        Ok(())
    }

    /// Escalate the participant to `Error`. Steps already in flight run to
    /// completion; no further steps are granted.
    pub fn report_error(self: &Arc<Self>, reason: &str) {
        let changed = {
            let mut fsm = self.fsm.lock().expect("fsm lock");
            if matches!(
                fsm.state,
                ParticipantState::Error | ParticipantState::Shutdown | ParticipantState::Aborting
            ) {
                warn!(reason = %reason, state = %fsm.state, "report_error ignored in current state");
                false
            } else {
                fsm.state = ParticipantState::Error;
                true
            }
        };
        if changed {
            error!(reason = %reason, "participant error");
            let _ = self.state_tx.send(ParticipantState::Error);
            self.publish_status(ParticipantState::Error, reason);
        }
    }

    /// Flip the state machine to `Aborting`, fire the abort handler with the
    /// pre-abort state, flush, and finish in `Shutdown`.
    pub fn abort_simulation(self: &Arc<Self>) {
        let last_state = {
            let mut fsm = self.fsm.lock().expect("fsm lock");
            if matches!(fsm.state, ParticipantState::Aborting | ParticipantState::Shutdown)
                || fsm.abort_fired
            {
                return;
            }
            fsm.abort_fired = true;
            let last = fsm.state;
            fsm.state = ParticipantState::Aborting;
            last
        };
        info!(last_state = %last_state, "aborting simulation");
        let _ = self.state_tx.send(ParticipantState::Aborting);
        self.publish_status(ParticipantState::Aborting, "abort requested");
        {
            let mut handlers = self.handlers.lock().expect("handler lock");
            if let Some(f) = handlers.abort.as_mut() {
                f(last_state);
            }
        }
        let this = self.clone();
        self.connection.on_all_messages_delivered(move || {
            this.transition_from(
                &[ParticipantState::Aborting],
                ParticipantState::Shutdown,
                "abort complete",
            );
        });
    }

    /// Completes the async communication-ready handler and releases the
    /// lifecycle towards `ReadyToRun`.
    pub fn complete_communication_ready_handler_async(self: &Arc<Self>) {
        {
            let mut fsm = self.fsm.lock().expect("fsm lock");
            if fsm.state != ParticipantState::CommunicationInitialized || fsm.comm_ready_completed {
                return;
            }
            fsm.comm_ready_completed = true;
        }
        let this = self.clone();
        self.connection.execute_deferred(move || {
            this.enter_ready_to_run();
        });
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn publish_status(&self, state: ParticipantState, reason: &str) {
        let now = Utc::now();
        let status = ParticipantStatus {
            participant_name: self.descriptor.participant_name.clone(),
            state,
            enter_reason: reason.to_string(),
            enter_time: now,
            refresh_time: now,
        };
        self.connection.send_msg(
            self.descriptor.endpoint_address(),
            "default",
            RoutedMessage::ParticipantStatus(status.to_wire()),
        );
    }

    /// Compare-and-swap transition: succeeds only when the current state is
    /// one of `allowed`. Returns the previous state on success.
    fn transition_from(
        self: &Arc<Self>,
        allowed: &[ParticipantState],
        to: ParticipantState,
        reason: &str,
    ) -> Option<ParticipantState> {
        let from = {
            let mut fsm = self.fsm.lock().expect("fsm lock");
            if !allowed.contains(&fsm.state) {
                return None;
            }
            let from = fsm.state;
            fsm.state = to;
            from
        };
        debug!(from = %from, to = %to, reason = %reason, "state transition");
        let _ = self.state_tx.send(to);
        self.publish_status(to, reason);
        Some(from)
    }

    /// One pass over the progression rules; re-entered on every local
    /// transition and every system-state change.
    fn evaluate(self: &Arc<Self>) {
        loop {
            let state = self.state();
            let sys = self.monitor.system_state();
            let advanced = match state {
                ParticipantState::ServicesCreated => {
                    self.may_advance(sys, SystemState::ServicesCreated)
                        && self
                            .transition_from(
                                &[ParticipantState::ServicesCreated],
                                ParticipantState::CommunicationInitializing,
                                "all required participants created services",
                            )
                            .is_some()
                }
                ParticipantState::CommunicationInitializing => {
                    if self.may_advance(sys, SystemState::CommunicationInitializing)
                        && self
                            .transition_from(
                                &[ParticipantState::CommunicationInitializing],
                                ParticipantState::CommunicationInitialized,
                                "communication initialized",
                            )
                            .is_some()
                    {
                        self.fire_communication_ready();
                        true
                    } else {
                        false
                    }
                }
                ParticipantState::ReadyToRun => {
                    if self.may_advance(sys, SystemState::ReadyToRun) {
                        self.enter_running()
                    } else {
                        false
                    }
                }
                ParticipantState::Stopped => {
                    if self.may_advance(sys, SystemState::Stopped) {
                        self.run_shutdown_chain()
                    } else {
                        false
                    }
                }
                _ => false,
            };
            if !advanced {
                break;
            }
        }
    }

    fn may_advance(&self, sys: SystemState, gate: SystemState) -> bool {
        match self.mode {
            OperationMode::Autonomous => true,
            OperationMode::Coordinated => sys.rank() >= gate.rank() && sys != SystemState::Error,
            OperationMode::Invalid => false,
        }
    }

    fn fire_communication_ready(self: &Arc<Self>) {
        let proceed = {
            let mut fsm = self.fsm.lock().expect("fsm lock");
            if fsm.comm_ready_fired {
                false
            } else {
                fsm.comm_ready_fired = true;
                true
            }
        };
        if !proceed {
            return;
        }
        let is_async = {
            let mut handlers = self.handlers.lock().expect("handler lock");
            let is_async = handlers.communication_ready_is_async;
            if let Some(f) = handlers.communication_ready.as_mut() {
                f();
            }
            is_async
        };
        if !is_async {
            self.enter_ready_to_run();
        }
        // Async: complete_communication_ready_handler_async() continues.
    }

    fn enter_ready_to_run(self: &Arc<Self>) {
        if self
            .transition_from(
                &[ParticipantState::CommunicationInitialized],
                ParticipantState::ReadyToRun,
                "communication ready",
            )
            .is_some()
        {
            self.evaluate();
        }
    }

    fn enter_running(self: &Arc<Self>) -> bool {
        if self
            .transition_from(&[ParticipantState::ReadyToRun], ParticipantState::Running, "starting simulation")
            .is_none()
        {
            return false;
        }
        let fire_starting = {
            let mut fsm = self.fsm.lock().expect("fsm lock");
            if fsm.starting_fired {
                false
            } else {
                fsm.starting_fired = true;
                true
            }
        };
        if fire_starting {
            let mut handlers = self.handlers.lock().expect("handler lock");
            if let Some(f) = handlers.starting.as_mut() {
                f();
            }
        }
        if let Some(ts) = self.time_sync() {
            ts.start_time();
        }
        true
    }

    /// Stopping → (stop handler) → flush → Stopped, then either shut down
    /// directly (autonomous) or wait for the system gate (coordinated).
    fn run_stop_chain(self: &Arc<Self>) {
        let fire = {
            let mut fsm = self.fsm.lock().expect("fsm lock");
            if fsm.stop_fired {
                false
            } else {
                fsm.stop_fired = true;
                true
            }
        };
        if fire {
            let mut handlers = self.handlers.lock().expect("handler lock");
            if let Some(f) = handlers.stop.as_mut() {
                f();
            }
        }
        if let Some(ts) = self.time_sync() {
            ts.stop_time();
        }
        let this = self.clone();
        self.connection.on_all_messages_delivered(move || {
            if this
                .transition_from(&[ParticipantState::Stopping], ParticipantState::Stopped, "stop complete")
                .is_some()
            {
                this.evaluate();
            }
        });
    }

    /// Stopped (or Error) → ShuttingDown → (shutdown handler) → flush →
    /// Shutdown. Returns false when another thread already took the chain.
    fn run_shutdown_chain(self: &Arc<Self>) -> bool {
        if self
            .transition_from(
                &[ParticipantState::Stopped, ParticipantState::Error],
                ParticipantState::ShuttingDown,
                "shutting down",
            )
            .is_none()
        {
            return false;
        }
        let fire = {
            let mut fsm = self.fsm.lock().expect("fsm lock");
            if fsm.shutdown_fired {
                false
            } else {
                fsm.shutdown_fired = true;
                true
            }
        };
        if fire {
            let mut handlers = self.handlers.lock().expect("handler lock");
            if let Some(f) = handlers.shutdown.as_mut() {
                f();
            }
        }
        let this = self.clone();
        self.connection.on_all_messages_delivered(move || {
            this.transition_from(
                &[ParticipantState::ShuttingDown],
                ParticipantState::Shutdown,
                "shutdown complete",
            );
        });
        true
    }

    fn on_system_state(self: &Arc<Self>, sys: SystemState) {
        debug!(system_state = %sys, "system state observed");
        if sys == SystemState::Error {
            // A required participant failed; coordinated runs treat this as
            // terminal and wind down from the running states.
            let state = self.state();
            if matches!(state, ParticipantState::Running | ParticipantState::Paused) {
                let _ = self.stop("required participant in error state");
                return;
            }
        }
        self.evaluate();
    }

    fn on_required_participant_status(self: &Arc<Self>, status: &ParticipantStatus) {
        if status.participant_name == self.descriptor.participant_name {
            return;
        }
        if !self.monitor.required_participants().contains(&status.participant_name) {
            return;
        }
        if matches!(status.state, ParticipantState::Stopping | ParticipantState::Stopped) {
            let my_state = self.state();
            if matches!(my_state, ParticipantState::Running | ParticipantState::Paused)
                && !self.stop_requested()
            {
                info!(
                    participant = %status.participant_name,
                    "required participant is stopping; stopping too"
                );
                let _ = self.stop("coordinated stop");
            }
        }
    }
}
