//! LIN controller
//!
//! Master/slave skeleton: a master transmits complete frames or requests a
//! slave response by id; slaves answer header requests from their configured
//! frame responses. Scheduling and checksum semantics stay outside the core.

use crate::descriptor::ServiceDescriptor;
use crate::net::Connection;
use crate::services::handlers::{HandlerId, Handlers};
use crate::services::orchestration::TimeProvider;
use crate::wire::message::{
    LinFrame, LinSendFrameRequest, LinTransmission, MessageKind, RoutedMessage,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::trace;

pub const LIN_TRANSMIT_OK: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinControllerMode {
    Inactive,
    Master,
    Slave,
}

/// Master sends the data itself (MasterResponse) or only the header
/// (SlaveResponse, a configured slave answers).
pub const LIN_RESPONSE_TYPE_MASTER: u8 = 1;
pub const LIN_RESPONSE_TYPE_SLAVE: u8 = 2;

pub struct LinController {
    descriptor: ServiceDescriptor,
    connection: Arc<Connection>,
    time_provider: Arc<TimeProvider>,
    link: String,
    mode: Mutex<LinControllerMode>,
    frame_responses: Mutex<HashMap<u8, LinFrame>>,
    frame_status_handlers: Handlers<LinTransmission>,
}

impl LinController {
    pub(crate) fn new(
        descriptor: ServiceDescriptor,
        connection: Arc<Connection>,
        time_provider: Arc<TimeProvider>,
        link: String,
    ) -> Arc<Self> {
        let controller = Arc::new(Self {
            descriptor: descriptor.clone(),
            connection: connection.clone(),
            time_provider,
            link: link.clone(),
            mode: Mutex::new(LinControllerMode::Inactive),
            frame_responses: Mutex::new(HashMap::new()),
            frame_status_handlers: Handlers::new(),
        });

        {
            let ctrl = controller.clone();
            connection.register_receiver(
                MessageKind::LinTransmission,
                &link,
                descriptor.endpoint_address(),
                Arc::new(move |_, msg| {
                    if let RoutedMessage::LinTransmission(tx) = msg {
                        ctrl.frame_status_handlers.invoke_all(tx);
                    }
                }),
            );
        }
        {
            let ctrl = controller.clone();
            connection.register_receiver(
                MessageKind::LinSendFrameRequest,
                &link,
                descriptor.endpoint_address(),
                Arc::new(move |_, msg| {
                    if let RoutedMessage::LinSendFrameRequest(req) = msg {
                        ctrl.on_send_frame_request(req);
                    }
                }),
            );
        }

        controller
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn init(&self, mode: LinControllerMode) {
        *self.mode.lock().expect("mode lock") = mode;
    }

    pub fn mode(&self) -> LinControllerMode {
        *self.mode.lock().expect("mode lock")
    }

    /// Configure the response this node provides when a master requests the
    /// frame id.
    pub fn set_frame_response(&self, frame: LinFrame) {
        self.frame_responses.lock().expect("response lock").insert(frame.id, frame);
    }

    /// Master transmission: the full frame goes onto the bus.
    pub fn send_frame(&self, frame: LinFrame) {
        trace!(controller = %self.descriptor.service_name, id = frame.id, "lin transmission");
        self.connection.send_msg(
            self.descriptor.endpoint_address(),
            &self.link,
            RoutedMessage::LinTransmission(LinTransmission {
                timestamp_ns: self.time_provider.now_ns(),
                frame,
                status: LIN_TRANSMIT_OK,
            }),
        );
    }

    /// Master header-only transmission: a slave with a configured response
    /// for the id answers with the data.
    pub fn send_frame_header(&self, id: u8) {
        self.connection.send_msg(
            self.descriptor.endpoint_address(),
            &self.link,
            RoutedMessage::LinSendFrameRequest(LinSendFrameRequest {
                frame: LinFrame { id, checksum_model: 0, data_length: 0, data: [0; 8] },
                response_type: LIN_RESPONSE_TYPE_SLAVE,
            }),
        );
    }

    fn on_send_frame_request(&self, req: &LinSendFrameRequest) {
        if req.response_type != LIN_RESPONSE_TYPE_SLAVE {
            return;
        }
        if self.mode() != LinControllerMode::Slave {
            return;
        }
        let response = self.frame_responses.lock().expect("response lock").get(&req.frame.id).cloned();
        if let Some(frame) = response {
            trace!(controller = %self.descriptor.service_name, id = frame.id, "answering header");
            self.send_frame(frame);
        }
    }

    pub fn add_frame_status_handler(
        &self,
        f: impl FnMut(&LinTransmission) + Send + 'static,
    ) -> HandlerId {
        self.frame_status_handlers.add(f)
    }

    pub fn remove_frame_status_handler(&self, id: HandlerId) {
        self.frame_status_handlers.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::participant_id_of;

    #[tokio::test]
    async fn slave_answers_header_requests_from_configured_responses() {
        let conn = Connection::new("L1", participant_id_of("L1"), "default");
        let descriptor = ServiceDescriptor::new("L1", "LIN1", "LinSlave", 1);
        let ctrl = LinController::new(
            descriptor,
            conn,
            Arc::new(TimeProvider::new()),
            "LIN1".to_string(),
        );
        ctrl.init(LinControllerMode::Slave);
        ctrl.set_frame_response(LinFrame {
            id: 0x10,
            checksum_model: 1,
            data_length: 4,
            data: [1, 2, 3, 4, 0, 0, 0, 0],
        });

        // A header request for an unconfigured id stays unanswered.
        ctrl.on_send_frame_request(&LinSendFrameRequest {
            frame: LinFrame { id: 0x22, checksum_model: 0, data_length: 0, data: [0; 8] },
            response_type: LIN_RESPONSE_TYPE_SLAVE,
        });
        // A configured id produces a transmission (observable only by peers;
        // the sending controller does not hear itself).
        ctrl.on_send_frame_request(&LinSendFrameRequest {
            frame: LinFrame { id: 0x10, checksum_model: 0, data_length: 0, data: [0; 8] },
            response_type: LIN_RESPONSE_TYPE_SLAVE,
        });
    }
}
