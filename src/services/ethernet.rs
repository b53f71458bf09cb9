//! Ethernet controller
//!
//! Raw frames travel opaque on the named link; activation gates sending.

use crate::descriptor::ServiceDescriptor;
use crate::net::Connection;
use crate::services::handlers::{HandlerId, Handlers};
use crate::services::orchestration::TimeProvider;
use crate::wire::message::{
    EthernetFrameEvent, EthernetFrameTransmitEvent, MessageKind, RoutedMessage, TransmitDirection,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

pub const ETHERNET_TRANSMIT_OK: u8 = 1;
pub const ETHERNET_TRANSMIT_CONTROLLER_INACTIVE: u8 = 2;

pub struct EthernetController {
    descriptor: ServiceDescriptor,
    connection: Arc<Connection>,
    time_provider: Arc<TimeProvider>,
    link: String,
    active: AtomicBool,
    frame_handlers: Handlers<EthernetFrameEvent>,
    frame_transmit_handlers: Handlers<EthernetFrameTransmitEvent>,
}

impl EthernetController {
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
            active: AtomicBool::new(false),
            frame_handlers: Handlers::new(),
            frame_transmit_handlers: Handlers::new(),
        });

        {
            let ctrl = controller.clone();
            connection.register_receiver(
                MessageKind::EthernetFrameEvent,
                &link,
                descriptor.endpoint_address(),
                Arc::new(move |_, msg| {
                    if let RoutedMessage::EthernetFrameEvent(ev) = msg {
                        let mut rx = ev.clone();
                        rx.direction = TransmitDirection::Rx;
                        ctrl.frame_handlers.invoke_all(&rx);
                    }
                }),
            );
        }

        controller
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn activate(&self) {
        self.active.store(true, Ordering::Relaxed);
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    pub fn send_frame(&self, raw_frame: &[u8], user_context: u64) {
        let timestamp_ns = self.time_provider.now_ns();
        if !self.active.load(Ordering::Relaxed) {
            warn!(controller = %self.descriptor.service_name, "send on inactive controller");
            self.frame_transmit_handlers.invoke_all(&EthernetFrameTransmitEvent {
                timestamp_ns,
                status: ETHERNET_TRANSMIT_CONTROLLER_INACTIVE,
                user_context,
            });
            return;
        }
        trace!(controller = %self.descriptor.service_name, bytes = raw_frame.len(), "sending frame");
        self.connection.send_msg(
            self.descriptor.endpoint_address(),
            &self.link,
            RoutedMessage::EthernetFrameEvent(EthernetFrameEvent {
                timestamp_ns,
                raw_frame: raw_frame.to_vec(),
                direction: TransmitDirection::Tx,
                user_context,
            }),
        );
        self.frame_transmit_handlers.invoke_all(&EthernetFrameTransmitEvent {
            timestamp_ns,
            status: ETHERNET_TRANSMIT_OK,
            user_context,
        });
    }

    pub fn add_frame_handler(
        &self,
        f: impl FnMut(&EthernetFrameEvent) + Send + 'static,
    ) -> HandlerId {
        self.frame_handlers.add(f)
    }

    pub fn remove_frame_handler(&self, id: HandlerId) {
        self.frame_handlers.remove(id);
    }

    pub fn add_frame_transmit_handler(
        &self,
        f: impl FnMut(&EthernetFrameTransmitEvent) + Send + 'static,
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
    async fn inactive_controller_rejects_sends() {
        let conn = Connection::new("E1", participant_id_of("E1"), "default");
        let descriptor = ServiceDescriptor::new("E1", "ETH1", "EthController1", 1);
        let ctrl = EthernetController::new(
            descriptor,
            conn,
            Arc::new(TimeProvider::new()),
            "ETH1".to_string(),
        );
        let statuses = Arc::new(std::sync::Mutex::new(Vec::new()));
        let statuses2 = statuses.clone();
        ctrl.add_frame_transmit_handler(move |ev| {
            statuses2.lock().unwrap().push(ev.status);
        });

        ctrl.send_frame(&[0u8; 60], 1);
        ctrl.activate();
        ctrl.send_frame(&[0u8; 60], 2);
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![ETHERNET_TRANSMIT_CONTROLLER_INACTIVE, ETHERNET_TRANSMIT_OK]
        );
    }
}
