//! Barrier bookkeeping for distributed time synchronization
//!
//! Tracks the next announced step of every synchronized peer, plus our own
//! current and next step. The advance decision, adaptive step clamping, and
//! hop-on detection all read this state. Timestamps are nanoseconds; -1 marks
//! "before the first step".

use crate::wire::message::NextSimTask;
use std::collections::HashMap;
use tracing::{debug, error};

/// How the step duration behaves when peers run different periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeAdvanceMode {
    /// Always advance by the configured step duration.
    #[default]
    ByStepDuration,
    /// Clamp the step so it ends at the earliest point any peer could act.
    ByMinimalDuration,
}

pub struct TimeConfiguration {
    blocking: bool,
    step_duration_ns: i64,
    advance_mode: TimeAdvanceMode,
    current_task: NextSimTask,
    my_next_task: NextSimTask,
    other_next_tasks: HashMap<String, NextSimTask>,
    hopped_on: bool,
}

pub const DEFAULT_STEP_DURATION_NS: i64 = 1_000_000; // 1ms when SetPeriod is never called

impl TimeConfiguration {
    pub fn new() -> Self {
        let mut cfg = Self {
            blocking: false,
            step_duration_ns: DEFAULT_STEP_DURATION_NS,
            advance_mode: TimeAdvanceMode::ByStepDuration,
            current_task: NextSimTask { time_point_ns: -1, duration_ns: 0 },
            my_next_task: NextSimTask { time_point_ns: 0, duration_ns: DEFAULT_STEP_DURATION_NS },
            other_next_tasks: HashMap::new(),
            hopped_on: false,
        };
        cfg.initialize();
        cfg
    }

    pub fn initialize(&mut self) {
        self.current_task = NextSimTask { time_point_ns: -1, duration_ns: 0 };
        self.my_next_task = NextSimTask { time_point_ns: 0, duration_ns: self.step_duration_ns };
        self.hopped_on = false;
    }

    pub fn set_blocking_mode(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn set_advance_mode(&mut self, mode: TimeAdvanceMode) {
        self.advance_mode = mode;
    }

    pub fn advance_mode(&self) -> TimeAdvanceMode {
        self.advance_mode
    }

    /// Step duration must be positive.
    pub fn set_step_duration(&mut self, duration_ns: i64) -> Result<(), &'static str> {
        if duration_ns <= 0 {
            return Err("attempted to set step duration to zero");
        }
        self.step_duration_ns = duration_ns;
        self.my_next_task.duration_ns = duration_ns;
        Ok(())
    }

    pub fn step_duration_ns(&self) -> i64 {
        self.step_duration_ns
    }

    /// Already-known participants are ignored; fresh ones start before the
    /// first step.
    pub fn add_synchronized_participant(&mut self, participant_name: &str) -> bool {
        if self.other_next_tasks.contains_key(participant_name) {
            return false;
        }
        self.other_next_tasks.insert(
            participant_name.to_string(),
            NextSimTask { time_point_ns: -1, duration_ns: 0 },
        );
        true
    }

    pub fn remove_synchronized_participant(&mut self, participant_name: &str) -> bool {
        self.other_next_tasks.remove(participant_name).is_some()
    }

    pub fn synchronized_participant_names(&self) -> Vec<String> {
        self.other_next_tasks.keys().cloned().collect()
    }

    /// Record a peer's announced next step. Unknown senders and chronology
    /// violations are logged and ignored.
    pub fn on_receive_next_sim_task(&mut self, participant_name: &str, task: NextSimTask) {
        let Some(known) = self.other_next_tasks.get_mut(participant_name) else {
            error!(participant = %participant_name, "received NextSimTask from unknown participant");
            return;
        };
        if task.time_point_ns < known.time_point_ns {
            error!(
                participant = %participant_name,
                received_ns = task.time_point_ns,
                known_ns = known.time_point_ns,
                "chronology error: NextSimTask with lower time point than last known"
            );
            return;
        }
        *known = task;
        debug!(
            participant = %participant_name,
            time_point_ns = task.time_point_ns,
            "updated next sim task"
        );
    }

    pub fn current_sim_step(&self) -> NextSimTask {
        self.current_task
    }

    pub fn next_sim_step(&self) -> NextSimTask {
        self.my_next_task
    }

    /// True while any peer still has to catch up to our next step.
    pub fn other_participant_has_lower_timepoint(&self) -> bool {
        for (name, task) in &self.other_next_tasks {
            if self.my_next_task.time_point_ns > task.time_point_ns {
                debug!(
                    participant = %name,
                    their_ns = task.time_point_ns,
                    "not advancing: participant has lower time point"
                );
                return true;
            }
        }
        false
    }

    /// Distance from our current time to the earliest point any peer's next
    /// step could start or end. Both bounds matter: a peer's step may begin
    /// after ours, or end before our full duration elapses.
    fn minimal_aligned_duration_ns(&self) -> i64 {
        if self.other_next_tasks.is_empty() {
            return i64::MAX;
        }
        let mut earliest = i64::MAX;
        for task in self.other_next_tasks.values() {
            let start = task.time_point_ns;
            let end = task.time_point_ns.saturating_add(task.duration_ns);
            if start > self.current_task.time_point_ns && start < earliest {
                earliest = start;
            } else if end < earliest {
                earliest = end;
            }
        }
        let min_aligned = earliest.saturating_sub(self.current_task.time_point_ns);
        if min_aligned < 0 {
            error!(
                min_aligned_ns = min_aligned,
                "chronology error: non-positive minimal aligned duration"
            );
            return i64::MAX;
        }
        min_aligned
    }

    /// `current ← next`, clamped when configured, then `next ← current + dur`.
    pub fn advance_time_step(&mut self) {
        self.current_task = self.my_next_task;
        if self.advance_mode == TimeAdvanceMode::ByMinimalDuration {
            let min_aligned = self.minimal_aligned_duration_ns();
            if min_aligned < self.current_task.duration_ns {
                self.current_task.duration_ns = min_aligned;
            }
        }
        self.my_next_task.time_point_ns =
            self.current_task.time_point_ns + self.current_task.duration_ns;
    }

    pub fn hopped_on(&self) -> bool {
        self.hopped_on
    }

    /// One-shot hop-on check before the first step: when any peer has
    /// already advanced past its own duration, simulation time is running
    /// and we join at the earliest announced step.
    pub fn is_hop_on(&mut self) -> bool {
        if self.current_task.time_point_ns != -1 {
            return false;
        }
        let mut minimal_other_ns = i64::MAX;
        for task in self.other_next_tasks.values() {
            if task.time_point_ns > task.duration_ns {
                self.hopped_on = true;
                if task.time_point_ns < minimal_other_ns {
                    minimal_other_ns = task.time_point_ns;
                }
            }
        }
        if self.hopped_on {
            self.my_next_task.time_point_ns = minimal_other_ns;
            debug!(start_ns = minimal_other_ns, "simulation time already advanced, hopping on");
            return true;
        }
        false
    }
}

impl Default for TimeConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(time_point_ns: i64, duration_ns: i64) -> NextSimTask {
        NextSimTask { time_point_ns, duration_ns }
    }

    #[test]
    fn initial_tasks() {
        let cfg = TimeConfiguration::new();
        assert_eq!(cfg.current_sim_step(), task(-1, 0));
        assert_eq!(cfg.next_sim_step(), task(0, DEFAULT_STEP_DURATION_NS));
    }

    #[test]
    fn zero_step_duration_rejected() {
        let mut cfg = TimeConfiguration::new();
        assert!(cfg.set_step_duration(0).is_err());
        assert!(cfg.set_step_duration(-5).is_err());
        assert!(cfg.set_step_duration(1).is_ok());
    }

    #[test]
    fn advance_moves_current_and_next() {
        let mut cfg = TimeConfiguration::new();
        cfg.set_step_duration(1_000_000).unwrap();
        cfg.advance_time_step();
        assert_eq!(cfg.current_sim_step(), task(0, 1_000_000));
        assert_eq!(cfg.next_sim_step().time_point_ns, 1_000_000);
        cfg.advance_time_step();
        assert_eq!(cfg.current_sim_step().time_point_ns, 1_000_000);
        assert_eq!(cfg.next_sim_step().time_point_ns, 2_000_000);
    }

    #[test]
    fn lower_peer_timepoint_blocks_advance() {
        let mut cfg = TimeConfiguration::new();
        cfg.add_synchronized_participant("P2");
        // P2 still at -1, our next is 0: 0 > -1, blocked.
        assert!(cfg.other_participant_has_lower_timepoint());
        cfg.on_receive_next_sim_task("P2", task(0, 1_000_000));
        assert!(!cfg.other_participant_has_lower_timepoint());
    }

    #[test]
    fn chronology_violation_ignored() {
        let mut cfg = TimeConfiguration::new();
        cfg.add_synchronized_participant("P2");
        cfg.on_receive_next_sim_task("P2", task(5_000_000, 1_000_000));
        cfg.on_receive_next_sim_task("P2", task(2_000_000, 1_000_000));
        // The regression was dropped.
        assert!(!cfg.other_participant_has_lower_timepoint());
    }

    #[test]
    fn minimal_duration_clamps_step() {
        let mut cfg = TimeConfiguration::new();
        cfg.set_step_duration(7).unwrap();
        cfg.set_advance_mode(TimeAdvanceMode::ByMinimalDuration);
        cfg.add_synchronized_participant("P2");
        // P2 announces a 3ns step at t=0: our first step may only span 3ns.
        cfg.on_receive_next_sim_task("P2", task(0, 3));
        cfg.advance_time_step();
        assert_eq!(cfg.current_sim_step(), task(0, 3));
        assert_eq!(cfg.next_sim_step().time_point_ns, 3);
    }

    #[test]
    fn hop_on_starts_at_earliest_advanced_peer() {
        let mut cfg = TimeConfiguration::new();
        cfg.add_synchronized_participant("P2");
        cfg.add_synchronized_participant("P3");
        cfg.on_receive_next_sim_task("P2", task(9_000_000, 1_000_000));
        cfg.on_receive_next_sim_task("P3", task(7_000_000, 1_000_000));
        assert!(cfg.is_hop_on());
        assert!(cfg.hopped_on());
        assert_eq!(cfg.next_sim_step().time_point_ns, 7_000_000);
    }

    #[test]
    fn no_hop_on_at_simulation_start() {
        let mut cfg = TimeConfiguration::new();
        cfg.add_synchronized_participant("P2");
        cfg.on_receive_next_sim_task("P2", task(0, 1_000_000));
        assert!(!cfg.is_hop_on());
    }

    #[test]
    fn peer_departure_unblocks_advance() {
        let mut cfg = TimeConfiguration::new();
        cfg.add_synchronized_participant("P2");
        assert!(cfg.other_participant_has_lower_timepoint());
        assert!(cfg.remove_synchronized_participant("P2"));
        assert!(!cfg.other_participant_has_lower_timepoint());
        assert!(!cfg.remove_synchronized_participant("P2"));
    }
}
