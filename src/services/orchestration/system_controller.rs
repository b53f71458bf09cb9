//! System controller: workflow configuration and simulation-wide commands
//!
//! One designated participant installs the required-participant set and can
//! abort the whole simulation. Both actions are broadcasts; the sender's own
//! monitor and lifecycle observe them through self-delivery.

use crate::descriptor::ServiceDescriptor;
use crate::net::Connection;
use crate::wire::message::{
    RoutedMessage, SystemCommand, SystemCommandKind, WorkflowConfiguration,
};
use std::sync::Arc;
use tracing::info;

pub struct SystemController {
    connection: Arc<Connection>,
    descriptor: ServiceDescriptor,
}

impl SystemController {
    pub fn new(connection: Arc<Connection>, descriptor: ServiceDescriptor) -> Arc<Self> {
        Arc::new(Self { connection, descriptor })
    }

    /// Declare which participants the system state is computed over. The
    /// local monitor observes the broadcast through self-delivery.
    pub fn set_workflow_configuration(&self, required_participant_names: Vec<String>) {
        info!(required = ?required_participant_names, "installing workflow configuration");
        self.connection.send_msg(
            self.descriptor.endpoint_address(),
            "default",
            RoutedMessage::WorkflowConfiguration(WorkflowConfiguration {
                required_participant_names,
            }),
        );
    }

    /// Abort every lifecycle in the simulation, ours included.
    pub fn abort_simulation(&self) {
        info!("sending abort simulation command");
        self.connection.send_msg(
            self.descriptor.endpoint_address(),
            "default",
            RoutedMessage::SystemCommand(SystemCommand { kind: SystemCommandKind::AbortSimulation }),
        );
    }
}
