//! RPC services
//!
//! Symmetric to pub/sub with the roles flipped: each client allocates a UUID
//! link and advertises the function name, media type, and labels; servers
//! discover matching clients and spawn one internal server per client link.
//! Calls flow client → servers on the link; every result comes back on the
//! same link and is matched to the pending call by id.

use crate::descriptor::{keys, NetworkType, ServiceDescriptor, ServiceType};
use crate::net::{Connection, ReceiverHandle};
use crate::services::discovery::ServiceDiscovery;
use crate::services::matching::{labels_from_json, labels_to_json, pubsub_match, PubSubSpec};
use crate::services::orchestration::TimeProvider;
use crate::wire::message::{FunctionCall, FunctionCallResponse, MessageKind, RoutedMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Spec for RPC matching: the function name takes the topic's place.
pub type RpcSpec = PubSubSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcCallHandle(pub u64);

pub type CallResultHandler = Box<dyn FnMut(RpcCallHandle, &[u8]) + Send>;
pub type CallHandler = Box<dyn FnMut(RpcCallHandle, &[u8]) + Send>;

pub struct RpcClient {
    descriptor: ServiceDescriptor,
    connection: Arc<Connection>,
    time_provider: Arc<TimeProvider>,
    link: String,
    next_call_id: AtomicU64,
    result_handler: Arc<Mutex<Option<CallResultHandler>>>,
}

impl RpcClient {
    pub(crate) fn new(
        descriptor: ServiceDescriptor,
        connection: Arc<Connection>,
        time_provider: Arc<TimeProvider>,
        link: String,
        result_handler: Option<CallResultHandler>,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            descriptor: descriptor.clone(),
            connection: connection.clone(),
            time_provider,
            link: link.clone(),
            next_call_id: AtomicU64::new(1),
            result_handler: Arc::new(Mutex::new(result_handler)),
        });

        let handler = client.result_handler.clone();
        connection.register_receiver(
            MessageKind::FunctionCallResponse,
            &link,
            descriptor.endpoint_address(),
            Arc::new(move |_, msg| {
                if let RoutedMessage::FunctionCallResponse(resp) = msg {
                    let mut handler = handler.lock().expect("handler lock");
                    if let Some(f) = handler.as_mut() {
                        f(RpcCallHandle(resp.call_id), &resp.data);
                    }
                }
            }),
        );

        client
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn set_call_result_handler(&self, f: impl FnMut(RpcCallHandle, &[u8]) + Send + 'static) {
        *self.result_handler.lock().expect("handler lock") = Some(Box::new(f));
    }

    /// Issue a call towards every matched server.
    pub fn call(&self, data: &[u8]) -> RpcCallHandle {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        trace!(link = %self.link, call_id, "rpc call");
        self.connection.send_msg(
            self.descriptor.endpoint_address(),
            &self.link,
            RoutedMessage::FunctionCall(FunctionCall {
                timestamp_ns: self.time_provider.now_ns(),
                call_id,
                data: data.to_vec(),
            }),
        );
        RpcCallHandle(call_id)
    }
}

struct InternalServer {
    descriptor: ServiceDescriptor,
    receiver: ReceiverHandle,
}

pub struct RpcServer {
    descriptor: ServiceDescriptor,
    connection: Arc<Connection>,
    discovery: Arc<ServiceDiscovery>,
    service_ids: Arc<AtomicU64>,
    time_provider: Arc<TimeProvider>,
    spec: RpcSpec,
    call_handler: Arc<Mutex<Option<CallHandler>>>,
    internal: Mutex<HashMap<String, InternalServer>>,
    /// Pending call id → the client link the result must go back on.
    pending: Arc<Mutex<HashMap<u64, String>>>,
}

impl RpcServer {
    pub(crate) fn new(
        descriptor: ServiceDescriptor,
        connection: Arc<Connection>,
        discovery: Arc<ServiceDiscovery>,
        service_ids: Arc<AtomicU64>,
        time_provider: Arc<TimeProvider>,
        spec: RpcSpec,
        call_handler: Option<CallHandler>,
    ) -> Arc<Self> {
        let server = Arc::new(Self {
            descriptor,
            connection,
            discovery: discovery.clone(),
            service_ids,
            time_provider,
            spec,
            call_handler: Arc::new(Mutex::new(call_handler)),
            internal: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
        });

        {
            let srv = server.clone();
            discovery.register_handler(move |event_kind, sd| {
                use crate::wire::message::ServiceDiscoveryEventKind as Kind;
                let Some(client_spec) = client_spec_of(sd) else {
                    return;
                };
                let Some(link) = sd.supplemental(keys::RPC_CLIENT_UUID) else {
                    return;
                };
                if !pubsub_match(&client_spec, &srv.spec) {
                    return;
                }
                match event_kind {
                    Kind::ServiceCreated => srv.attach_to_client(link),
                    Kind::ServiceRemoved => srv.detach_from_client(link),
                }
            });
        }

        server
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn set_call_handler(&self, f: impl FnMut(RpcCallHandle, &[u8]) + Send + 'static) {
        *self.call_handler.lock().expect("handler lock") = Some(Box::new(f));
    }

    /// Answer a received call. Unknown handles are logged and dropped.
    pub fn submit_result(&self, call: RpcCallHandle, data: &[u8]) {
        let link = self.pending.lock().expect("pending lock").remove(&call.0);
        let Some(link) = link else {
            warn!(call_id = call.0, "submit_result for unknown call");
            return;
        };
        self.connection.send_msg(
            self.descriptor.endpoint_address(),
            &link,
            RoutedMessage::FunctionCallResponse(FunctionCallResponse {
                timestamp_ns: self.time_provider.now_ns(),
                call_id: call.0,
                data: data.to_vec(),
            }),
        );
    }

    fn attach_to_client(&self, link: &str) {
        let mut internal = self.internal.lock().expect("internal lock");
        if internal.contains_key(link) {
            return;
        }
        debug!(server = %self.descriptor.service_name, link = %link, "matched rpc client");

        let service_id = self.service_ids.fetch_add(1, Ordering::Relaxed);
        let mut isd = ServiceDescriptor::new(
            &self.descriptor.participant_name,
            link,
            &format!("{}-internal-{}", self.descriptor.service_name, service_id),
            service_id,
        );
        isd.service_type = ServiceType::InternalController;
        isd.network_type = NetworkType::Rpc;
        isd.set_supplemental(keys::CONTROLLER_TYPE, keys::CONTROLLER_TYPE_RPC_SERVER_INTERNAL);

        let handler = self.call_handler.clone();
        let pending = self.pending.clone();
        let link_owned = link.to_string();
        let receiver = self.connection.register_receiver(
            MessageKind::FunctionCall,
            link,
            isd.endpoint_address(),
            Arc::new(move |_, msg| {
                if let RoutedMessage::FunctionCall(call) = msg {
                    pending
                        .lock()
                        .expect("pending lock")
                        .insert(call.call_id, link_owned.clone());
                    let mut handler = handler.lock().expect("handler lock");
                    if let Some(f) = handler.as_mut() {
                        f(RpcCallHandle(call.call_id), &call.data);
                    }
                }
            }),
        );

        internal.insert(link.to_string(), InternalServer { descriptor: isd.clone(), receiver });
        drop(internal);
        self.discovery.notify_service_created(&isd);
    }

    fn detach_from_client(&self, link: &str) {
        let removed = self.internal.lock().expect("internal lock").remove(link);
        if let Some(internal) = removed {
            debug!(server = %self.descriptor.service_name, link = %link, "rpc client removed");
            self.connection.remove_receiver(&internal.receiver);
            self.discovery.notify_service_removed(&internal.descriptor);
            self.pending.lock().expect("pending lock").retain(|_, l| l != link);
        }
    }
}

/// Extract the matching spec an RPC client advertised in its descriptor.
fn client_spec_of(sd: &ServiceDescriptor) -> Option<RpcSpec> {
    if sd.controller_type() != Some(keys::CONTROLLER_TYPE_RPC_CLIENT) {
        return None;
    }
    let function_name = sd.supplemental(keys::RPC_CLIENT_FUNCTION_NAME)?;
    let media_type = sd.supplemental(keys::RPC_CLIENT_MEDIA_TYPE).unwrap_or("");
    let labels = sd
        .supplemental(keys::RPC_CLIENT_LABELS)
        .map(labels_from_json)
        .unwrap_or_default();
    Some(RpcSpec {
        topic: function_name.to_string(),
        media_type: media_type.to_string(),
        labels,
    })
}

/// Supplemental entries an RPC client carries for the matching layer.
pub(crate) fn client_supplemental(spec: &RpcSpec, link: &str) -> Vec<(String, String)> {
    vec![
        (keys::CONTROLLER_TYPE.to_string(), keys::CONTROLLER_TYPE_RPC_CLIENT.to_string()),
        (keys::RPC_CLIENT_FUNCTION_NAME.to_string(), spec.topic.clone()),
        (keys::RPC_CLIENT_UUID.to_string(), link.to_string()),
        (keys::RPC_CLIENT_MEDIA_TYPE.to_string(), spec.media_type.clone()),
        (keys::RPC_CLIENT_LABELS.to_string(), labels_to_json(&spec.labels)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_spec_extraction() {
        let spec = RpcSpec::new("Add", "application/json");
        let mut sd = ServiceDescriptor::new("Client", "uuid-9", "AddClient", 4);
        for (k, v) in client_supplemental(&spec, "uuid-9") {
            sd.set_supplemental(&k, v);
        }
        let got = client_spec_of(&sd).unwrap();
        assert_eq!(got.topic, "Add");
        assert_eq!(got.media_type, "application/json");
        assert_eq!(sd.supplemental(keys::RPC_CLIENT_UUID), Some("uuid-9"));
    }
}
