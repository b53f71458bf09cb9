//! FlexRay controller
//!
//! Frames are opaque payloads under a small static header; cycle and slot
//! arithmetic belong to a simulated network, not the core.

use crate::descriptor::ServiceDescriptor;
use crate::net::Connection;
use crate::services::handlers::{HandlerId, Handlers};
use crate::services::orchestration::TimeProvider;
use crate::wire::message::{
    FlexrayFrameEvent, FlexrayFrameTransmitEvent, FlexrayHeader, MessageKind, RoutedMessage,
};
use std::sync::Arc;
use tracing::trace;

pub struct FlexrayController {
    descriptor: ServiceDescriptor,
    connection: Arc<Connection>,
    time_provider: Arc<TimeProvider>,
    link: String,
    frame_handlers: Handlers<FlexrayFrameEvent>,
    frame_transmit_handlers: Handlers<FlexrayFrameTransmitEvent>,
}

impl FlexrayController {
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
            frame_handlers: Handlers::new(),
            frame_transmit_handlers: Handlers::new(),
        });

        {
            let ctrl = controller.clone();
            connection.register_receiver(
                MessageKind::FlexrayFrameEvent,
                &link,
                descriptor.endpoint_address(),
                Arc::new(move |_, msg| {
                    if let RoutedMessage::FlexrayFrameEvent(ev) = msg {
                        ctrl.frame_handlers.invoke_all(ev);
                    }
                }),
            );
        }

        controller
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn send_frame(&self, channel: u8, header: FlexrayHeader, payload: &[u8]) {
        let timestamp_ns = self.time_provider.now_ns();
        trace!(
            controller = %self.descriptor.service_name,
            frame_id = header.frame_id,
            "sending flexray frame"
        );
        let frame_id = header.frame_id;
        let cycle_count = header.cycle_count;
        self.connection.send_msg(
            self.descriptor.endpoint_address(),
            &self.link,
            RoutedMessage::FlexrayFrameEvent(FlexrayFrameEvent {
                timestamp_ns,
                channel,
                header,
                payload: payload.to_vec(),
            }),
        );
        self.frame_transmit_handlers.invoke_all(&FlexrayFrameTransmitEvent {
            timestamp_ns,
            channel,
            frame_id,
            cycle_count,
        });
    }

    pub fn add_frame_handler(
        &self,
        f: impl FnMut(&FlexrayFrameEvent) + Send + 'static,
    ) -> HandlerId {
        self.frame_handlers.add(f)
    }

    pub fn remove_frame_handler(&self, id: HandlerId) {
        self.frame_handlers.remove(id);
    }

    pub fn add_frame_transmit_handler(
        &self,
        f: impl FnMut(&FlexrayFrameTransmitEvent) + Send + 'static,
    ) -> HandlerId {
        self.frame_transmit_handlers.add(f)
    }

    pub fn remove_frame_transmit_handler(&self, id: HandlerId) {
        self.frame_transmit_handlers.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::participant_id_of;

    #[tokio::test]
    async fn transmit_ack_carries_frame_identity() {
        let conn = Connection::new("F1", participant_id_of("F1"), "default");
        let descriptor = ServiceDescriptor::new("F1", "FR1", "FlexrayController1", 1);
        let ctrl = FlexrayController::new(
            descriptor,
            conn,
            Arc::new(TimeProvider::new()),
            "FR1".to_string(),
        );
        let acks = Arc::new(std::sync::Mutex::new(Vec::new()));
        let acks2 = acks.clone();
        ctrl.add_frame_transmit_handler(move |ev| {
            acks2.lock().unwrap().push((ev.frame_id, ev.cycle_count));
        });
        ctrl.send_frame(
            1,
            FlexrayHeader { flags: 0, frame_id: 42, payload_length: 2, header_crc: 0, cycle_count: 7 },
            &[0xaa, 0xbb],
        );
        assert_eq!(*acks.lock().unwrap(), vec![(42, 7)]);
    }
}
