//! Publish/subscribe data services
//!
//! Each publisher allocates a fresh UUID link and advertises topic, media
//! type, and labels through its service descriptor. Subscribers watch
//! discovery for matching publishers and attach one internal subscriber per
//! matched publisher link; removal events (including synthesized ones on
//! peer disconnect) detach them again. A publisher with history depth 1
//! retains its last payload for late-matched subscribers.

use crate::descriptor::{keys, NetworkType, ServiceDescriptor, ServiceType};
use crate::net::{Connection, ReceiverHandle};
use crate::services::discovery::ServiceDiscovery;
use crate::services::matching::{labels_from_json, labels_to_json, pubsub_match, PubSubSpec};
use crate::services::orchestration::TimeProvider;
use crate::wire::message::{DataMessageEvent, MessageKind, RoutedMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

pub type DataMessageHandler = Box<dyn FnMut(&DataMessageEvent) + Send>;

pub struct DataPublisher {
    descriptor: ServiceDescriptor,
    connection: Arc<Connection>,
    time_provider: Arc<TimeProvider>,
    link: String,
}

impl std::fmt::Debug for DataPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPublisher")
            .field("descriptor", &self.descriptor)
            .field("link", &self.link)
            .finish()
    }
}

impl DataPublisher {
    pub(crate) fn new(
        descriptor: ServiceDescriptor,
        connection: Arc<Connection>,
        time_provider: Arc<TimeProvider>,
        link: String,
        history: usize,
    ) -> Arc<Self> {
        if history == 1 {
            connection.enable_history(&link);
        }
        Arc::new(Self { descriptor, connection, time_provider, link })
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Broadcast a payload. Matched subscribers within this participant
    /// observe it before this call returns.
    pub fn publish(&self, data: &[u8]) {
        trace!(link = %self.link, bytes = data.len(), "publish");
        self.connection.send_msg(
            self.descriptor.endpoint_address(),
            &self.link,
            RoutedMessage::DataMessageEvent(DataMessageEvent {
                timestamp_ns: self.time_provider.now_ns(),
                data: data.to_vec(),
            }),
        );
    }
}

struct InternalSubscriber {
    descriptor: ServiceDescriptor,
    receiver: ReceiverHandle,
}

pub struct DataSubscriber {
    descriptor: ServiceDescriptor,
    connection: Arc<Connection>,
    discovery: Arc<ServiceDiscovery>,
    service_ids: Arc<AtomicU64>,
    spec: PubSubSpec,
    handler: Arc<Mutex<Option<DataMessageHandler>>>,
    internal: Mutex<HashMap<String, InternalSubscriber>>,
}

impl DataSubscriber {
    pub(crate) fn new(
        descriptor: ServiceDescriptor,
        connection: Arc<Connection>,
        discovery: Arc<ServiceDiscovery>,
        service_ids: Arc<AtomicU64>,
        spec: PubSubSpec,
        handler: Option<DataMessageHandler>,
    ) -> Arc<Self> {
        let subscriber = Arc::new(Self {
            descriptor,
            connection,
            discovery: discovery.clone(),
            service_ids,
            spec,
            handler: Arc::new(Mutex::new(handler)),
            internal: Mutex::new(HashMap::new()),
        });

        // Watch for matching publishers; replay of the known set covers
        // publishers that existed before this subscriber.
        {
            let sub = subscriber.clone();
            discovery.register_handler(move |event_kind, sd| {
                use crate::wire::message::ServiceDiscoveryEventKind as Kind;
                let Some(publisher_spec) = publisher_spec_of(sd) else {
                    return;
                };
                let Some(link) = sd.supplemental(keys::DATA_PUBLISHER_PUB_UUID) else {
                    return;
                };
                if !pubsub_match(&publisher_spec, &sub.spec) {
                    return;
                }
                match event_kind {
                    Kind::ServiceCreated => sub.attach_to_publisher(link),
                    Kind::ServiceRemoved => sub.detach_from_publisher(link),
                }
            });
        }

        subscriber
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn set_data_message_handler(&self, f: impl FnMut(&DataMessageEvent) + Send + 'static) {
        *self.handler.lock().expect("handler lock") = Some(Box::new(f));
    }

    fn attach_to_publisher(&self, link: &str) {
        let mut internal = self.internal.lock().expect("internal lock");
        if internal.contains_key(link) {
            return;
        }
        debug!(subscriber = %self.descriptor.service_name, link = %link, "matched publisher");

        let service_id = self.service_ids.fetch_add(1, Ordering::Relaxed);
        let mut isd = ServiceDescriptor::new(
            &self.descriptor.participant_name,
            link,
            &format!("{}-internal-{}", self.descriptor.service_name, service_id),
            service_id,
        );
        isd.service_type = ServiceType::InternalController;
        isd.network_type = NetworkType::Data;
        isd.set_supplemental(keys::CONTROLLER_TYPE, keys::CONTROLLER_TYPE_DATA_SUBSCRIBER_INTERNAL);

        let handler = self.handler.clone();
        let receiver = self.connection.register_receiver(
            MessageKind::DataMessageEvent,
            link,
            isd.endpoint_address(),
            Arc::new(move |_, msg| {
                if let RoutedMessage::DataMessageEvent(ev) = msg {
                    let mut handler = handler.lock().expect("handler lock");
                    if let Some(f) = handler.as_mut() {
                        f(ev);
                    }
                }
            }),
        );

        internal.insert(
            link.to_string(),
            InternalSubscriber { descriptor: isd.clone(), receiver },
        );
        drop(internal);
        self.discovery.notify_service_created(&isd);
    }

    fn detach_from_publisher(&self, link: &str) {
        let removed = self.internal.lock().expect("internal lock").remove(link);
        if let Some(internal) = removed {
            debug!(subscriber = %self.descriptor.service_name, link = %link, "publisher removed");
            self.connection.remove_receiver(&internal.receiver);
            self.discovery.notify_service_removed(&internal.descriptor);
        }
    }
}

/// Extract the matching spec a publisher advertised in its descriptor.
fn publisher_spec_of(sd: &ServiceDescriptor) -> Option<PubSubSpec> {
    if sd.controller_type() != Some(keys::CONTROLLER_TYPE_DATA_PUBLISHER) {
        return None;
    }
    let topic = sd.supplemental(keys::DATA_PUBLISHER_TOPIC)?;
    let media_type = sd.supplemental(keys::DATA_PUBLISHER_MEDIA_TYPE).unwrap_or("");
    let labels = sd
        .supplemental(keys::DATA_PUBLISHER_PUB_LABELS)
        .map(labels_from_json)
        .unwrap_or_default();
    Some(PubSubSpec {
        topic: topic.to_string(),
        media_type: media_type.to_string(),
        labels,
    })
}

/// Supplemental entries a publisher carries for the matching layer.
pub(crate) fn publisher_supplemental(spec: &PubSubSpec, link: &str) -> Vec<(String, String)> {
    vec![
        (keys::CONTROLLER_TYPE.to_string(), keys::CONTROLLER_TYPE_DATA_PUBLISHER.to_string()),
        (keys::DATA_PUBLISHER_TOPIC.to_string(), spec.topic.clone()),
        (keys::DATA_PUBLISHER_PUB_UUID.to_string(), link.to_string()),
        (keys::DATA_PUBLISHER_MEDIA_TYPE.to_string(), spec.media_type.clone()),
        (keys::DATA_PUBLISHER_PUB_LABELS.to_string(), labels_to_json(&spec.labels)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::matching::MatchingLabel;

    #[test]
    fn publisher_spec_extraction() {
        let spec = PubSubSpec::new("T", "m").add_label(MatchingLabel::mandatory("k", "v"));
        let mut sd = ServiceDescriptor::new("Pub", "uuid-1", "PubCtrl1", 3);
        for (k, v) in publisher_supplemental(&spec, "uuid-1") {
            sd.set_supplemental(&k, v);
        }
        let got = publisher_spec_of(&sd).unwrap();
        assert_eq!(got.topic, "T");
        assert_eq!(got.media_type, "m");
        assert_eq!(got.labels, spec.labels);
        assert_eq!(sd.supplemental(keys::DATA_PUBLISHER_PUB_UUID), Some("uuid-1"));
    }

    #[test]
    fn non_publisher_descriptors_are_ignored() {
        let mut sd = ServiceDescriptor::new("P", "CAN1", "CanCtrl", 1);
        sd.set_supplemental(keys::CONTROLLER_TYPE, keys::CONTROLLER_TYPE_CAN);
        assert!(publisher_spec_of(&sd).is_none());
    }
}
