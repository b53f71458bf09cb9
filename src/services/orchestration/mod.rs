//! Orchestration: lifecycle, time synchronization, system state

pub mod lifecycle;
pub mod system_controller;
pub mod system_monitor;
pub mod time_config;
pub mod time_provider;
pub mod time_sync;
pub mod types;
pub mod watchdog;

pub use lifecycle::LifecycleService;
pub use system_controller::SystemController;
pub use system_monitor::SystemMonitor;
pub use time_config::{TimeAdvanceMode, TimeConfiguration};
pub use time_provider::TimeProvider;
pub use time_sync::TimeSyncService;
pub use types::{OperationMode, ParticipantState, ParticipantStatus, SystemState};
pub use watchdog::Watchdog;
