//! Topic, media-type, and label matching between publishers and subscribers
//!
//! A publisher and a subscriber match iff topics are equal string-wise (no
//! wildcards), media types are equal or the subscriber's is empty, and the
//! label rule holds for every subscriber key. RPC reuses the same rule with
//! the function name in place of the topic.

pub use crate::config::LabelKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingLabel {
    pub key: String,
    pub value: String,
    pub kind: LabelKind,
}

impl MatchingLabel {
    pub fn mandatory(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into(), kind: LabelKind::Mandatory }
    }

    pub fn optional(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into(), kind: LabelKind::Optional }
    }
}

/// What a publisher or subscriber brings to the matching table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PubSubSpec {
    pub topic: String,
    pub media_type: String,
    pub labels: Vec<MatchingLabel>,
}

impl PubSubSpec {
    pub fn new(topic: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self { topic: topic.into(), media_type: media_type.into(), labels: Vec::new() }
    }

    pub fn add_label(mut self, label: MatchingLabel) -> Self {
        self.labels.push(label);
        self
    }
}

/// The per-key label rule, subscriber side driving:
/// - subscriber key present on the publisher: values must be equal;
/// - subscriber key absent: acceptable only for Optional labels;
/// - publisher-only keys are ignored.
pub fn labels_match(publisher: &[MatchingLabel], subscriber: &[MatchingLabel]) -> bool {
    subscriber.iter().all(|sub| {
        match publisher.iter().find(|p| p.key == sub.key) {
            Some(publisher_label) => publisher_label.value == sub.value,
            None => sub.kind == LabelKind::Optional,
        }
    })
}

/// Full pub/sub match: topic, media type (empty subscriber media type is a
/// wildcard), labels.
pub fn pubsub_match(publisher: &PubSubSpec, subscriber: &PubSubSpec) -> bool {
    if publisher.topic != subscriber.topic {
        return false;
    }
    if !subscriber.media_type.is_empty() && publisher.media_type != subscriber.media_type {
        return false;
    }
    labels_match(&publisher.labels, &subscriber.labels)
}

/// Labels travel inside supplemental data as a serialized document.
pub fn labels_to_json(labels: &[MatchingLabel]) -> String {
    serde_json::to_string(labels).unwrap_or_else(|_| "[]".to_string())
}

pub fn labels_from_json(json: &str) -> Vec<MatchingLabel> {
    serde_json::from_str(json).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(topic: &str, media: &str, labels: Vec<MatchingLabel>) -> PubSubSpec {
        PubSubSpec { topic: topic.into(), media_type: media.into(), labels }
    }

    #[test]
    fn topics_match_string_wise() {
        assert!(pubsub_match(&spec("T", "m", vec![]), &spec("T", "m", vec![])));
        assert!(!pubsub_match(&spec("T", "m", vec![]), &spec("T2", "m", vec![])));
        assert!(!pubsub_match(&spec("T*", "m", vec![]), &spec("T1", "m", vec![])));
    }

    #[test]
    fn empty_subscriber_media_type_is_wildcard() {
        assert!(pubsub_match(&spec("T", "application/json", vec![]), &spec("T", "", vec![])));
        assert!(!pubsub_match(&spec("T", "application/json", vec![]), &spec("T", "text/plain", vec![])));
    }

    #[test]
    fn mandatory_subscriber_label_requires_presence_and_equality() {
        let publisher = spec("T", "m", vec![MatchingLabel::optional("k", "v")]);
        let subscriber = spec("T", "m", vec![MatchingLabel::mandatory("k", "v")]);
        assert!(pubsub_match(&publisher, &subscriber));

        let publisher_wrong = spec("T", "m", vec![MatchingLabel::optional("k", "other")]);
        assert!(!pubsub_match(&publisher_wrong, &subscriber));

        let publisher_missing = spec("T", "m", vec![]);
        assert!(!pubsub_match(&publisher_missing, &subscriber));
    }

    #[test]
    fn optional_subscriber_label_tolerates_absence_but_not_mismatch() {
        let subscriber = spec("T", "m", vec![MatchingLabel::optional("k", "v")]);
        assert!(pubsub_match(&spec("T", "m", vec![]), &subscriber));
        assert!(pubsub_match(&spec("T", "m", vec![MatchingLabel::mandatory("k", "v")]), &subscriber));
        assert!(!pubsub_match(&spec("T", "m", vec![MatchingLabel::mandatory("k", "x")]), &subscriber));
    }

    #[test]
    fn publisher_only_keys_are_ignored() {
        let publisher = spec("T", "m", vec![MatchingLabel::mandatory("extra", "1")]);
        let subscriber = spec("T", "m", vec![]);
        assert!(pubsub_match(&publisher, &subscriber));
    }

    #[test]
    fn labels_survive_json_round_trip() {
        let labels = vec![MatchingLabel::mandatory("kA", "vA"), MatchingLabel::optional("kB", "vB")];
        let json = labels_to_json(&labels);
        assert_eq!(labels_from_json(&json), labels);
    }
}
