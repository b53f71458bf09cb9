//! Orchestration state types

use crate::wire::message::ParticipantStatusMsg;
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;

/// Per-participant lifecycle states, in transition order. The numeric rank
/// doubles as the ordering the system-state computation minimizes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ParticipantState {
    #[default]
    Invalid,
    ServicesCreated,
    CommunicationInitializing,
    CommunicationInitialized,
    ReadyToRun,
    Running,
    Paused,
    Stopping,
    Stopped,
    ShuttingDown,
    Shutdown,
    Error,
    Aborting,
}

impl ParticipantState {
    pub fn rank(self) -> u8 {
        match self {
            ParticipantState::Invalid => 0,
            ParticipantState::ServicesCreated => 1,
            ParticipantState::CommunicationInitializing => 2,
            ParticipantState::CommunicationInitialized => 3,
            ParticipantState::ReadyToRun => 4,
            ParticipantState::Running => 5,
            ParticipantState::Paused => 6,
            ParticipantState::Stopping => 7,
            ParticipantState::Stopped => 8,
            ParticipantState::ShuttingDown => 9,
            ParticipantState::Shutdown => 10,
            ParticipantState::Error => 11,
            ParticipantState::Aborting => 12,
        }
    }

    pub fn from_rank(v: u8) -> Self {
        match v {
            1 => ParticipantState::ServicesCreated,
            2 => ParticipantState::CommunicationInitializing,
            3 => ParticipantState::CommunicationInitialized,
            4 => ParticipantState::ReadyToRun,
            5 => ParticipantState::Running,
            6 => ParticipantState::Paused,
            7 => ParticipantState::Stopping,
            8 => ParticipantState::Stopped,
            9 => ParticipantState::ShuttingDown,
            10 => ParticipantState::Shutdown,
            11 => ParticipantState::Error,
            12 => ParticipantState::Aborting,
            _ => ParticipantState::Invalid,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ParticipantState::Shutdown)
    }
}

impl fmt::Display for ParticipantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a participant's lifecycle relates to the rest of the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationMode {
    #[default]
    Invalid,
    Autonomous,
    Coordinated,
}

/// Derived system-wide state over the required participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemState {
    #[default]
    Invalid,
    ServicesCreated,
    CommunicationInitializing,
    CommunicationInitialized,
    ReadyToRun,
    Running,
    Paused,
    Stopping,
    Stopped,
    ShuttingDown,
    Shutdown,
    Error,
    Aborting,
}

impl SystemState {
    pub fn rank(self) -> u8 {
        match self {
            SystemState::Invalid => 0,
            SystemState::ServicesCreated => 1,
            SystemState::CommunicationInitializing => 2,
            SystemState::CommunicationInitialized => 3,
            SystemState::ReadyToRun => 4,
            SystemState::Running => 5,
            SystemState::Paused => 6,
            SystemState::Stopping => 7,
            SystemState::Stopped => 8,
            SystemState::ShuttingDown => 9,
            SystemState::Shutdown => 10,
            SystemState::Error => 11,
            SystemState::Aborting => 12,
        }
    }
}

impl From<ParticipantState> for SystemState {
    fn from(state: ParticipantState) -> Self {
        match state {
            ParticipantState::Invalid => SystemState::Invalid,
            ParticipantState::ServicesCreated => SystemState::ServicesCreated,
            ParticipantState::CommunicationInitializing => SystemState::CommunicationInitializing,
            ParticipantState::CommunicationInitialized => SystemState::CommunicationInitialized,
            ParticipantState::ReadyToRun => SystemState::ReadyToRun,
            ParticipantState::Running => SystemState::Running,
            ParticipantState::Paused => SystemState::Paused,
            ParticipantState::Stopping => SystemState::Stopping,
            ParticipantState::Stopped => SystemState::Stopped,
            ParticipantState::ShuttingDown => SystemState::ShuttingDown,
            ParticipantState::Shutdown => SystemState::Shutdown,
            ParticipantState::Error => SystemState::Error,
            ParticipantState::Aborting => SystemState::Aborting,
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A participant's announced lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantStatus {
    pub participant_name: String,
    pub state: ParticipantState,
    pub enter_reason: String,
    pub enter_time: DateTime<Utc>,
    pub refresh_time: DateTime<Utc>,
}

impl ParticipantStatus {
    pub fn to_wire(&self) -> ParticipantStatusMsg {
        ParticipantStatusMsg {
            participant_name: self.participant_name.clone(),
            state: self.state.rank(),
            enter_reason: self.enter_reason.clone(),
            enter_time_ns: self.enter_time.timestamp_nanos_opt().unwrap_or(0),
            refresh_time_ns: self.refresh_time.timestamp_nanos_opt().unwrap_or(0),
        }
    }

    pub fn from_wire(msg: &ParticipantStatusMsg) -> Self {
        Self {
            participant_name: msg.participant_name.clone(),
            state: ParticipantState::from_rank(msg.state),
            enter_reason: msg.enter_reason.clone(),
            enter_time: ns_to_datetime(msg.enter_time_ns),
            refresh_time: ns_to_datetime(msg.refresh_time_ns),
        }
    }
}

fn ns_to_datetime(ns: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(ns)
}
