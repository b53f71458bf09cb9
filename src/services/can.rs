//! CAN controller
//!
//! Transports opaque CAN frames on a named link. Sending broadcasts a frame
//! event to every controller on the same network and acknowledges the
//! transmit locally, echoing the caller's user context. Baudrate and
//! controller-mode changes travel as their own message kinds so a simulated
//! network could interpret them; plain controllers ignore them.

use crate::descriptor::ServiceDescriptor;
use crate::net::Connection;
use crate::services::handlers::{HandlerId, Handlers};
use crate::services::orchestration::TimeProvider;
use crate::wire::message::{
    CanConfigureBaudrate, CanControllerStatus, CanFrame, CanFrameEvent, CanFrameTransmitEvent,
    CanSetControllerMode, CanTransmitStatus, MessageKind, RoutedMessage, TransmitDirection,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CanControllerState {
    Uninit = 0,
    Stopped = 1,
    Started = 2,
    Sleep = 3,
}

impl CanControllerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CanControllerState::Stopped,
            2 => CanControllerState::Started,
            3 => CanControllerState::Sleep,
            _ => CanControllerState::Uninit,
        }
    }
}

pub struct CanController {
    descriptor: ServiceDescriptor,
    connection: Arc<Connection>,
    time_provider: Arc<TimeProvider>,
    link: String,
    state: AtomicU8,
    frame_handlers: Handlers<CanFrameEvent>,
    frame_transmit_handlers: Handlers<CanFrameTransmitEvent>,
    state_change_handlers: Handlers<CanControllerState>,
}

impl CanController {
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
            state: AtomicU8::new(CanControllerState::Uninit as u8),
            frame_handlers: Handlers::new(),
            frame_transmit_handlers: Handlers::new(),
            state_change_handlers: Handlers::new(),
        });

        {
            let ctrl = controller.clone();
            connection.register_receiver(
                MessageKind::CanFrameEvent,
                &link,
                descriptor.endpoint_address(),
                Arc::new(move |_, msg| {
                    if let RoutedMessage::CanFrameEvent(ev) = msg {
                        let mut rx = ev.clone();
                        rx.direction = TransmitDirection::Rx;
                        ctrl.frame_handlers.invoke_all(&rx);
                    }
                }),
            );
        }
        {
            let ctrl = controller.clone();
            connection.register_receiver(
                MessageKind::CanControllerStatus,
                &link,
                descriptor.endpoint_address(),
                Arc::new(move |_, msg| {
                    if let RoutedMessage::CanControllerStatus(status) = msg {
                        trace!(
                            controller = %ctrl.descriptor.service_name,
                            state = status.controller_state,
                            "controller status"
                        );
                    }
                }),
            );
        }

        controller
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> CanControllerState {
        CanControllerState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn set_baud_rate(&self, rate: u32, fd_rate: u32, xl_rate: u32) {
        self.connection.send_msg(
            self.descriptor.endpoint_address(),
            &self.link,
            RoutedMessage::CanConfigureBaudrate(CanConfigureBaudrate { rate, fd_rate, xl_rate }),
        );
    }

    pub fn start(&self) {
        self.set_mode(CanControllerState::Started);
    }

    pub fn stop(&self) {
        self.set_mode(CanControllerState::Stopped);
    }

    pub fn sleep(&self) {
        self.set_mode(CanControllerState::Sleep);
    }

    fn set_mode(&self, mode: CanControllerState) {
        let previous = self.state.swap(mode as u8, Ordering::Relaxed);
        self.connection.send_msg(
            self.descriptor.endpoint_address(),
            &self.link,
            RoutedMessage::CanSetControllerMode(CanSetControllerMode { mode: mode as u8 }),
        );
        self.connection.send_msg(
            self.descriptor.endpoint_address(),
            &self.link,
            RoutedMessage::CanControllerStatus(CanControllerStatus {
                timestamp_ns: self.time_provider.now_ns(),
                controller_state: mode as u8,
                error_state: 0,
            }),
        );
        if previous != mode as u8 {
            debug!(controller = %self.descriptor.service_name, state = ?mode, "controller mode");
            self.state_change_handlers.invoke_all(&mode);
        }
    }

    /// Send a frame; the transmit acknowledgment echoes `user_context`.
    pub fn send_frame(&self, frame: CanFrame, user_context: u64) {
        let timestamp_ns = self.time_provider.now_ns();
        trace!(
            controller = %self.descriptor.service_name,
            can_id = frame.can_id,
            "sending can frame"
        );
        let can_id = frame.can_id;
        self.connection.send_msg(
            self.descriptor.endpoint_address(),
            &self.link,
            RoutedMessage::CanFrameEvent(CanFrameEvent {
                timestamp_ns,
                frame,
                direction: TransmitDirection::Tx,
                user_context,
            }),
        );
        // Trivial simulation: the transmit succeeds as soon as it is queued.
        let ack = CanFrameTransmitEvent {
            timestamp_ns,
            can_id,
            status: CanTransmitStatus::Transmitted,
            user_context,
        };
        self.frame_transmit_handlers.invoke_all(&ack);
    }

    pub fn add_frame_handler(&self, f: impl FnMut(&CanFrameEvent) + Send + 'static) -> HandlerId {
        self.frame_handlers.add(f)
    }

    pub fn remove_frame_handler(&self, id: HandlerId) {
        self.frame_handlers.remove(id);
    }

    pub fn add_frame_transmit_handler(
        &self,
        f: impl FnMut(&CanFrameTransmitEvent) + Send + 'static,
    ) -> HandlerId {
        self.frame_transmit_handlers.add(f)
    }

    pub fn remove_frame_transmit_handler(&self, id: HandlerId) {
        self.frame_transmit_handlers.remove(id);
    }

    pub fn add_state_change_handler(
        &self,
        f: impl FnMut(&CanControllerState) + Send + 'static,
    ) -> HandlerId {
        self.state_change_handlers.add(f)
    }

    pub fn remove_state_change_handler(&self, id: HandlerId) {
        self.state_change_handlers.remove(id);
    }
}
