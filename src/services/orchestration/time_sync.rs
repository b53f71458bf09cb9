//! Distributed virtual-time synchronization
//!
//! Synchronized participants run a next-step barrier: each broadcasts the
//! step it intends to execute next and advances only once no peer announced
//! an earlier one. The step handler runs on the dispatch context, either
//! blocking (the next announcement goes out when the handler returns) or
//! asynchronously (the user releases the step with
//! [`TimeSyncService::complete_simulation_step`]; exactly one step is
//! outstanding at any time).
//!
//! Participants discover each other's time-sync services through service
//! discovery; a late joiner triggers a resend of our current announcement
//! and, when it is we who join late, the hop-on rule aligns our first step
//! with the earliest announced peer step. Coordinated participants must not
//! join a running simulation and abort instead.

use super::lifecycle::LifecycleService;
use super::system_monitor::SystemMonitor;
use super::time_config::{TimeAdvanceMode, TimeConfiguration};
use super::time_provider::TimeProvider;
use super::types::{OperationMode, ParticipantState, SystemState};
use crate::config::AggregationMode;
use crate::descriptor::{keys, ServiceDescriptor};
use crate::error::{SilKitError, SilKitResult};
use crate::net::Connection;
use crate::services::discovery::ServiceDiscovery;
use crate::services::handlers::{HandlerId, Handlers};
use crate::services::metrics::{CounterMetric, MetricsManager, StatisticMetric};
use crate::services::orchestration::watchdog::Watchdog;
use crate::wire::message::{
    MessageKind, NextSimTask, RoutedMessage, ServiceDiscoveryEventKind, SystemCommand,
    SystemCommandKind,
};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

type SimStepHandler = Box<dyn FnMut(i64, i64) + Send>;

struct WallClock {
    running: Arc<AtomicBool>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    current_sync_point_ns: Arc<AtomicI64>,
    reached_before_completion: AtomicBool,
}

pub struct TimeSyncService {
    connection: Arc<Connection>,
    descriptor: ServiceDescriptor,
    lifecycle: Arc<LifecycleService>,
    monitor: Arc<SystemMonitor>,
    time_provider: Arc<TimeProvider>,
    config: Mutex<TimeConfiguration>,
    sim_task: Mutex<Option<SimStepHandler>>,
    executing_sim_step: AtomicBool,
    hop_on_evaluated: AtomicBool,
    last_sent_next_sim_task_ns: AtomicI64,
    other_steps_completed_handlers: Handlers<()>,
    watchdog: Watchdog,
    aggregation: AggregationMode,
    animation_factor: f64,
    coupled_to_wall_clock: bool,
    wall: WallClock,
    sim_step_count: Arc<CounterMetric>,
    sim_step_execution_time: Arc<StatisticMetric>,
    sim_step_waiting_time: Arc<StatisticMetric>,
    last_step_finished_at: Mutex<Option<Instant>>,
}

impl TimeSyncService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection: Arc<Connection>,
        descriptor: ServiceDescriptor,
        lifecycle: Arc<LifecycleService>,
        monitor: Arc<SystemMonitor>,
        discovery: Arc<ServiceDiscovery>,
        time_provider: Arc<TimeProvider>,
        health_check: &crate::config::HealthCheck,
        animation_factor: f64,
        aggregation: AggregationMode,
        metrics: &Arc<MetricsManager>,
    ) -> Arc<Self> {
        let coupled = animation_factor != 0.0;
        if coupled {
            debug!(animation_factor, "coupled to the local wall clock");
        }

        let warn_handler: crate::services::orchestration::watchdog::TimeoutHandler =
            Arc::new(|timeout: Duration| {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "simulation step did not finish within the soft time limit"
                );
            });
        let lc_error = lifecycle.clone();
        let error_handler: crate::services::orchestration::watchdog::TimeoutHandler =
            Arc::new(move |timeout: Duration| {
                lc_error.report_error(&format!(
                    "simulation step did not finish within the hard time limit of {} ms",
                    timeout.as_millis()
                ));
            });

        let service = Arc::new(Self {
            connection: connection.clone(),
            descriptor: descriptor.clone(),
            lifecycle: lifecycle.clone(),
            monitor,
            time_provider: time_provider.clone(),
            config: Mutex::new(TimeConfiguration::new()),
            sim_task: Mutex::new(None),
            executing_sim_step: AtomicBool::new(false),
            hop_on_evaluated: AtomicBool::new(false),
            last_sent_next_sim_task_ns: AtomicI64::new(i64::MIN),
            other_steps_completed_handlers: Handlers::new(),
            watchdog: Watchdog::new(health_check, warn_handler, error_handler),
            aggregation,
            animation_factor,
            coupled_to_wall_clock: coupled,
            wall: WallClock {
                running: Arc::new(AtomicBool::new(false)),
                handle: Mutex::new(None),
                current_sync_point_ns: Arc::new(AtomicI64::new(0)),
                reached_before_completion: AtomicBool::new(false),
            },
            sim_step_count: metrics.counter("SimStepCount"),
            sim_step_execution_time: metrics.statistic("SimStep/execution_duration/[s]"),
            sim_step_waiting_time: metrics.statistic("SimStep/waiting_duration/[s]"),
            last_step_finished_at: Mutex::new(None),
        });

        time_provider.set_synchronized(true);
        lifecycle.attach_time_sync(&service);

        {
            let ts = service.clone();
            connection.register_receiver(
                MessageKind::NextSimTask,
                "default",
                descriptor.endpoint_address(),
                Arc::new(move |from, msg| {
                    if let RoutedMessage::NextSimTask(task) = msg {
                        let name = ts
                            .connection
                            .participant_name_of(from.participant_id)
                            .unwrap_or_else(|| format!("id:{}", from.participant_id));
                        ts.receive_next_sim_task(&name, *task);
                    }
                }),
            );
        }

        // Track which participants take part in the barrier. A service
        // removal re-evaluates the advance condition immediately.
        {
            let ts = service.clone();
            let own_name = descriptor.participant_name.clone();
            discovery.register_handler(move |event_kind, sd| {
                if sd.controller_type() != Some(keys::CONTROLLER_TYPE_TIME_SYNC_SERVICE) {
                    return;
                }
                if sd.participant_name == own_name {
                    return;
                }
                if sd.supplemental(keys::TIME_SYNC_ACTIVE) != Some("1") {
                    return;
                }
                match event_kind {
                    ServiceDiscoveryEventKind::ServiceCreated => {
                        ts.on_synchronized_participant_joined(&sd.participant_name);
                    }
                    ServiceDiscoveryEventKind::ServiceRemoved => {
                        ts.on_synchronized_participant_left(&sd.participant_name);
                    }
                }
            });
        }

        service
    }

    pub fn is_coupled_to_wall_clock(&self) -> bool {
        self.coupled_to_wall_clock
    }

    /// Names of the peers currently taking part in the barrier.
    pub fn synchronized_participants(&self) -> Vec<String> {
        self.config.lock().expect("config lock").synchronized_participant_names()
    }

    pub fn now_ns(&self) -> i64 {
        self.time_provider.now_ns()
    }

    /// Blocking step handler: the step completes when the handler returns.
    pub fn set_simulation_step_handler(
        &self,
        f: impl FnMut(i64, i64) + Send + 'static,
        step_size_ns: i64,
    ) -> SilKitResult<()> {
        *self.sim_task.lock().expect("task lock") = Some(Box::new(f));
        {
            let mut config = self.config.lock().expect("config lock");
            config.set_blocking_mode(true);
            config
                .set_step_duration(step_size_ns)
                .map_err(SilKitError::configuration)?;
        }
        // Aggregation Auto keys off the blocking handler.
        match self.aggregation {
            AggregationMode::On | AggregationMode::Auto => self.connection.set_aggregation(true),
            AggregationMode::Off => {}
        }
        Ok(())
    }

    /// Async step handler: the step stays outstanding until
    /// [`TimeSyncService::complete_simulation_step`].
    pub fn set_simulation_step_handler_async(
        &self,
        f: impl FnMut(i64, i64) + Send + 'static,
        step_size_ns: i64,
    ) -> SilKitResult<()> {
        *self.sim_task.lock().expect("task lock") = Some(Box::new(f));
        {
            let mut config = self.config.lock().expect("config lock");
            config.set_blocking_mode(false);
            config
                .set_step_duration(step_size_ns)
                .map_err(SilKitError::configuration)?;
        }
        if self.aggregation == AggregationMode::On {
            self.connection.set_aggregation(true);
        }
        Ok(())
    }

    pub fn set_period(&self, step_size_ns: i64) -> SilKitResult<()> {
        self.config
            .lock()
            .expect("config lock")
            .set_step_duration(step_size_ns)
            .map_err(SilKitError::configuration)
    }

    pub fn set_time_advance_mode(&self, mode: TimeAdvanceMode) {
        self.config.lock().expect("config lock").set_advance_mode(mode);
    }

    pub fn add_other_simulation_steps_completed_handler(
        &self,
        f: impl FnMut(&()) + Send + 'static,
    ) -> HandlerId {
        self.other_steps_completed_handlers.add(f)
    }

    pub fn remove_other_simulation_steps_completed_handler(&self, id: HandlerId) {
        self.other_steps_completed_handlers.remove(id);
    }

    /// Kick off the barrier; called by the lifecycle on entering `Running`.
    pub(crate) fn start_time(self: &Arc<Self>) {
        self.request_next_step();
    }

    pub(crate) fn stop_time(&self) {
        if self.coupled_to_wall_clock {
            self.stop_wall_clock_thread();
        }
    }

    pub(crate) fn request_next_step(self: &Arc<Self>) {
        let ts = self.clone();
        self.connection.execute_deferred(move || {
            ts.do_request_next_step();
        });
    }

    /// Send our next announcement (suppressing duplicates) and schedule one
    /// advance-condition evaluation. The evaluation bootstrap covers the
    /// no-other-participant case.
    fn do_request_next_step(self: &Arc<Self>) {
        if self.lifecycle.state() != ParticipantState::Running
            || self.lifecycle.stop_requested()
            || self.lifecycle.pause_requested()
        {
            return;
        }
        let next = self.config.lock().expect("config lock").next_sim_step();
        if self.last_sent_next_sim_task_ns.swap(next.time_point_ns, Ordering::Relaxed)
            != next.time_point_ns
        {
            self.send_next_sim_task(next);
        }
        let ts = self.clone();
        self.connection.execute_deferred(move || {
            ts.process_simulation_time_update();
        });
    }

    fn send_next_sim_task(&self, task: NextSimTask) {
        trace!(
            time_point_ns = task.time_point_ns,
            duration_ns = task.duration_ns,
            "announcing next simulation step"
        );
        self.connection.send_msg(
            self.descriptor.endpoint_address(),
            "default",
            RoutedMessage::NextSimTask(task),
        );
    }

    fn receive_next_sim_task(self: &Arc<Self>, from_participant: &str, task: NextSimTask) {
        self.config
            .lock()
            .expect("config lock")
            .on_receive_next_sim_task(from_participant, task);

        match self.lifecycle.state() {
            ParticipantState::Running | ParticipantState::Paused => {
                self.process_simulation_time_update();
            }
            // Pre-run states only record the announcement; terminal and
            // winding-down states ignore it.
            _ => {}
        }
    }

    fn process_simulation_time_update(self: &Arc<Self>) {
        if !self.is_time_advance_possible() {
            return;
        }
        let blocking = self.config.lock().expect("config lock").is_blocking();
        if blocking {
            self.advance_time_sim_step_sync();
        } else {
            self.advance_time_sim_step_async();
        }
    }

    fn is_time_advance_possible(&self) -> bool {
        // Deferred evaluation may arrive after the simulation stopped.
        if self.lifecycle.state() != ParticipantState::Running {
            return false;
        }
        if self.lifecycle.stop_requested() || self.lifecycle.pause_requested() {
            return false;
        }
        if self.lifecycle.operation_mode() == OperationMode::Coordinated
            && self.monitor.system_state() == SystemState::Error
        {
            return false;
        }
        let config = self.config.lock().expect("config lock");
        if config.other_participant_has_lower_timepoint() {
            return false;
        }
        if self.coupled_to_wall_clock
            && config.next_sim_step().time_point_ns
                > self.wall.current_sync_point_ns.load(Ordering::Relaxed)
        {
            return false;
        }
        true
    }

    fn advance_time_sim_step_sync(self: &Arc<Self>) {
        self.advance_time_and_execute_sim_step();
        if !self.lifecycle.pause_requested() && !self.coupled_to_wall_clock {
            // The blocking handler returned: the next announcement goes out
            // right away. With wall-clock coupling the real-time thread
            // signals readiness instead.
            let ts = self.clone();
            self.connection.execute_deferred(move || {
                ts.do_request_next_step();
            });
        }
    }

    fn advance_time_sim_step_async(self: &Arc<Self>) {
        if self.executing_sim_step.swap(true, Ordering::AcqRel) {
            // One step is already outstanding; tell observers that every
            // other participant finished theirs.
            self.other_steps_completed_handlers.invoke_all(&());
            return;
        }
        self.advance_time_and_execute_sim_step();
        // Nothing more happens until complete_simulation_step().
    }

    fn advance_time_and_execute_sim_step(self: &Arc<Self>) {
        let state = self.lifecycle.state();
        if !matches!(state, ParticipantState::Running | ParticipantState::Paused) {
            return;
        }
        if !self.hop_on_evaluated.swap(true, Ordering::AcqRel) {
            let hopped_on = self.config.lock().expect("config lock").is_hop_on();
            if hopped_on && self.abort_hop_on_for_coordinated() {
                return;
            }
            if self.coupled_to_wall_clock {
                let offset = self.config.lock().expect("config lock").next_sim_step().time_point_ns;
                self.start_wall_clock_thread(offset);
            }
        }
        let current = {
            let mut config = self.config.lock().expect("config lock");
            config.advance_time_step();
            config.current_sim_step()
        };
        self.execute_sim_step(current.time_point_ns, current.duration_ns);
    }

    /// A coordinated participant cannot join a running simulation.
    fn abort_hop_on_for_coordinated(&self) -> bool {
        if self.lifecycle.operation_mode() == OperationMode::Coordinated {
            error!(
                "this participant is coordinated and synchronized and wants to join an already \
                 running simulation; aborting"
            );
            self.connection.send_msg(
                self.descriptor.endpoint_address(),
                "default",
                RoutedMessage::SystemCommand(SystemCommand {
                    kind: SystemCommandKind::AbortSimulation,
                }),
            );
            self.lifecycle.abort_simulation();
            return true;
        }
        false
    }

    fn execute_sim_step(self: &Arc<Self>, time_point_ns: i64, duration_ns: i64) {
        if let Some(finished) = *self.last_step_finished_at.lock().expect("time lock") {
            self.sim_step_waiting_time.take(finished.elapsed().as_secs_f64());
        }
        trace!(virtual_time_ns = time_point_ns, "starting next simulation step");
        self.time_provider.set_time(time_point_ns, duration_ns);

        let started = Instant::now();
        self.watchdog.start();
        {
            let mut task = self.sim_task.lock().expect("task lock");
            if let Some(f) = task.as_mut() {
                f(time_point_ns, duration_ns);
            } else {
                warn!("no simulation step handler installed");
            }
        }
        self.watchdog.reset();
        let execution = started.elapsed();
        self.sim_step_execution_time.take(execution.as_secs_f64());

        let blocking = self.config.lock().expect("config lock").is_blocking();
        if blocking {
            self.logical_sim_step_completed(execution);
        }
    }

    fn logical_sim_step_completed(&self, elapsed: Duration) {
        self.sim_step_count.add(1);
        trace!(
            execution_ms = elapsed.as_secs_f64() * 1e3,
            virtual_time_ns = self.time_provider.now_ns(),
            "finished simulation step"
        );
        *self.last_step_finished_at.lock().expect("time lock") = Some(Instant::now());
    }

    /// Finishes the asynchronous step: the next announcement goes out and a
    /// new step becomes possible.
    pub fn complete_simulation_step(self: &Arc<Self>) {
        if !self.executing_sim_step.load(Ordering::Acquire) {
            warn!("complete_simulation_step() called before the step handler was invoked");
        } else {
            debug!("complete_simulation_step()");
        }
        let ts = self.clone();
        self.connection.execute_deferred(move || {
            ts.logical_sim_step_completed(Duration::ZERO);
            ts.executing_sim_step.store(false, Ordering::Release);
            // With wall-clock coupling the next step is normally requested by
            // the real-time thread; catch up here when it fired early.
            if !ts.coupled_to_wall_clock
                || ts.wall.reached_before_completion.swap(false, Ordering::AcqRel)
            {
                ts.do_request_next_step();
            }
        });
    }

    fn on_synchronized_participant_joined(self: &Arc<Self>, participant_name: &str) {
        if !self.participant_supports_autonomous_synchronous(participant_name) {
            error!(
                participant = %participant_name,
                "participant does not support simulations with autonomous lifecycles and \
                 virtual time synchronization; aborting"
            );
            self.connection.send_msg(
                self.descriptor.endpoint_address(),
                "default",
                RoutedMessage::SystemCommand(SystemCommand {
                    kind: SystemCommandKind::AbortSimulation,
                }),
            );
            self.lifecycle.abort_simulation();
            return;
        }
        let (added, current, next, time_advanced) = {
            let mut config = self.config.lock().expect("config lock");
            let added = config.add_synchronized_participant(participant_name);
            (
                added,
                config.current_sim_step(),
                config.next_sim_step(),
                config.current_sim_step().time_point_ns >= 0,
            )
        };
        if !added {
            return;
        }
        debug!(participant = %participant_name, "added to distributed time synchronization");
        if time_advanced {
            // The late joiner has not necessarily seen our last announcement.
            if self.executing_sim_step.load(Ordering::Acquire) {
                debug!("late joiner: resending the currently executing step");
                self.send_next_sim_task(current);
            } else {
                debug!("late joiner: resending our next step");
                self.send_next_sim_task(next);
            }
        }
    }

    /// Hop-on and hop-off only work when the remote side advertised the
    /// capability; an autonomous synchronized run must refuse peers that
    /// lack it. Unknown peers (not yet handshaken) pass: the check reruns
    /// when their announcement arrives through discovery.
    fn participant_supports_autonomous_synchronous(&self, participant_name: &str) -> bool {
        if self.lifecycle.operation_mode() != OperationMode::Autonomous {
            return true;
        }
        match self.connection.peer_info(participant_name) {
            Some(info) => info
                .capabilities
                .iter()
                .any(|c| c == crate::participant::CAPABILITY_AUTONOMOUS_SYNCHRONOUS),
            None => true,
        }
    }

    fn on_synchronized_participant_left(self: &Arc<Self>, participant_name: &str) {
        let removed = self
            .config
            .lock()
            .expect("config lock")
            .remove_synchronized_participant(participant_name);
        if removed {
            info!(
                participant = %participant_name,
                "no longer part of the distributed time synchronization"
            );
            // The barrier set shrank; our step may be due now.
            self.process_simulation_time_update();
        }
    }

    // =========================================================================
    // WALL-CLOCK COUPLING
    // =========================================================================

    fn start_wall_clock_thread(self: &Arc<Self>, start_offset_ns: i64) {
        if self.wall.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wall.current_sync_point_ns.store(start_offset_ns, Ordering::Relaxed);
        let ts = self.clone();
        let running = self.wall.running.clone();
        let sync_point = self.wall.current_sync_point_ns.clone();
        let animation_factor = self.animation_factor;
        let handle = std::thread::Builder::new()
            .name("sb-wallclk".to_string())
            .spawn(move || {
                let start_time = Instant::now();
                let first_duration =
                    ts.config.lock().expect("config lock").next_sim_step().duration_ns;
                let mut next_wall_point_s = first_duration as f64 * 1e-9 * animation_factor;

                while running.load(Ordering::Relaxed) {
                    let elapsed = start_time.elapsed().as_secs_f64();
                    let wait = next_wall_point_s - elapsed;
                    if wait > 0.0 {
                        hybrid_wait(Duration::from_secs_f64(wait));
                    }
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                    if ts.lifecycle.state() == ParticipantState::Running {
                        let duration_ns =
                            ts.config.lock().expect("config lock").next_sim_step().duration_ns;
                        sync_point.fetch_add(duration_ns, Ordering::Relaxed);
                        next_wall_point_s += duration_ns as f64 * 1e-9 * animation_factor;

                        if ts.executing_sim_step.load(Ordering::Acquire) {
                            warn!("simulation step was not completed in time for wall clock coupling");
                            ts.wall.reached_before_completion.store(true, Ordering::Release);
                        } else {
                            let inner = ts.clone();
                            ts.connection.execute_deferred(move || {
                                inner.do_request_next_step();
                            });
                        }
                    }
                }
            })
            .expect("spawn wall clock thread");
        *self.wall.handle.lock().expect("wall lock") = Some(handle);
    }

    fn stop_wall_clock_thread(&self) {
        if self.wall.running.swap(false, Ordering::AcqRel) {
            if let Some(handle) = self.wall.handle.lock().expect("wall lock").take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for TimeSyncService {
    fn drop(&mut self) {
        self.wall.running.store(false, Ordering::Relaxed);
    }
}

/// Coarse sleep plus a spin for the tail, for sub-timer-resolution waits.
fn hybrid_wait(target: Duration) {
    const TIMER_RESOLUTION: Duration = Duration::from_millis(1);
    if target < TIMER_RESOLUTION {
        busy_wait(target);
        return;
    }
    let before = Instant::now();
    std::thread::sleep(target - TIMER_RESOLUTION);
    let remainder = target.saturating_sub(before.elapsed());
    busy_wait(remainder);
}

fn busy_wait(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hybrid_wait_reaches_target() {
        let start = Instant::now();
        hybrid_wait(Duration::from_millis(3));
        assert!(start.elapsed() >= Duration::from_millis(3));
    }
}
