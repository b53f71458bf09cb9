//! Participant configuration document
//!
//! Declarative YAML or JSON. Unknown fields are rejected so typos surface at
//! load time instead of silently doing nothing. A value supplied both
//! programmatically and here resolves in favor of the document; the mismatch
//! is logged at Info by the merge helpers.

use crate::error::{SilKitError, SilKitResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LogLevel {
    Off,
    Critical,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            LogLevel::Off => 0,
            LogLevel::Critical => 1,
            LogLevel::Error => 2,
            LogLevel::Warn => 3,
            LogLevel::Info => 4,
            LogLevel::Debug => 5,
            LogLevel::Trace => 6,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Critical,
            2 => LogLevel::Error,
            3 => LogLevel::Warn,
            5 => LogLevel::Debug,
            6 => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.to_ascii_lowercase().as_str() {
            "off" => LogLevel::Off,
            "critical" => LogLevel::Critical,
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SinkType {
    Stdout,
    File,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Sink {
    #[serde(rename = "type")]
    pub sink_type: SinkType,
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Logging {
    #[serde(default)]
    pub sinks: Vec<Sink>,
    #[serde(default)]
    pub log_from_remotes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Middleware {
    #[serde(default = "default_registry_uri")]
    pub registry_uri: String,
    #[serde(default = "default_true")]
    pub enable_domain_sockets: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: f64,
    #[serde(default)]
    pub acceptor_uris: Vec<String>,
    #[serde(default = "default_simulation_name")]
    pub simulation_name: String,
}

fn default_registry_uri() -> String {
    "silkit://localhost:8500".to_string()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> f64 {
    5.0
}

fn default_simulation_name() -> String {
    "default".to_string()
}

impl Default for Middleware {
    fn default() -> Self {
        Self {
            registry_uri: default_registry_uri(),
            enable_domain_sockets: true,
            connect_timeout_seconds: default_connect_timeout(),
            acceptor_uris: Vec::new(),
            simulation_name: default_simulation_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct HealthCheck {
    /// Soft step timeout in milliseconds; expiry logs a warning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_response_timeout: Option<u64>,
    /// Hard step timeout in milliseconds; expiry escalates to Error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_response_timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AggregationMode {
    Off,
    On,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TimeSynchronization {
    /// Wall-clock coupling factor; 0.0 disables the coupling thread.
    #[serde(default)]
    pub animation_factor: f64,
    #[serde(default)]
    pub enable_message_aggregation: AggregationMode,
}

impl Default for TimeSynchronization {
    fn default() -> Self {
        Self { animation_factor: 0.0, enable_message_aggregation: AggregationMode::Auto }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricsSinkType {
    JsonFile,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MetricsSink {
    #[serde(rename = "type")]
    pub sink_type: MetricsSinkType,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Metrics {
    /// Snapshot interval in seconds.
    #[serde(default = "default_metrics_interval")]
    pub update_interval: f64,
    #[serde(default)]
    pub collect_from_remote: bool,
    #[serde(default)]
    pub sinks: Vec<MetricsSink>,
}

fn default_metrics_interval() -> f64 {
    1.0
}

impl Default for Metrics {
    fn default() -> Self {
        Self { update_interval: default_metrics_interval(), collect_from_remote: false, sinks: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Experimental {
    #[serde(default)]
    pub time_synchronization: TimeSynchronization,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelKind {
    Mandatory,
    Optional,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigLabel {
    pub key: String,
    pub value: String,
    pub kind: LabelKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CanControllerConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default)]
    pub use_trace_sinks: Vec<String>,
}

pub type EthernetControllerConfig = CanControllerConfig;
pub type LinControllerConfig = CanControllerConfig;
pub type FlexrayControllerConfig = CanControllerConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DataPublisherConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<usize>,
    #[serde(default)]
    pub labels: Vec<ConfigLabel>,
    #[serde(default)]
    pub use_trace_sinks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DataSubscriberConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub labels: Vec<ConfigLabel>,
    #[serde(default)]
    pub use_trace_sinks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RpcClientConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default)]
    pub labels: Vec<ConfigLabel>,
}

pub type RpcServerConfig = RpcClientConfig;

/// The root document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ParticipantConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub middleware: Middleware,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub health_check: HealthCheck,
    #[serde(default)]
    pub experimental: Experimental,
    #[serde(default)]
    pub can_controllers: Vec<CanControllerConfig>,
    #[serde(default)]
    pub ethernet_controllers: Vec<EthernetControllerConfig>,
    #[serde(default)]
    pub lin_controllers: Vec<LinControllerConfig>,
    #[serde(default)]
    pub flexray_controllers: Vec<FlexrayControllerConfig>,
    #[serde(default)]
    pub data_publishers: Vec<DataPublisherConfig>,
    #[serde(default)]
    pub data_subscribers: Vec<DataSubscriberConfig>,
    #[serde(default)]
    pub rpc_clients: Vec<RpcClientConfig>,
    #[serde(default)]
    pub rpc_servers: Vec<RpcServerConfig>,
}

impl ParticipantConfiguration {
    /// Parse a YAML or JSON document. YAML is a superset here, so one parser
    /// handles both; errors carry the underlying diagnostic.
    pub fn from_str(text: &str) -> SilKitResult<Self> {
        let cfg: ParticipantConfiguration = serde_yaml::from_str(text)
            .map_err(|e| SilKitError::configuration(format!("invalid configuration: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> SilKitResult<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SilKitError::configuration(format!(
                "cannot read configuration file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_str(&text)
    }

    pub fn validate(&self) -> SilKitResult<()> {
        for publisher in &self.data_publishers {
            if let Some(history) = publisher.history {
                if history > 1 {
                    return Err(SilKitError::configuration(format!(
                        "data publisher '{}': history {} not supported (must be 0 or 1)",
                        publisher.name, history
                    )));
                }
            }
        }
        if self.middleware.connect_timeout_seconds <= 0.0 {
            return Err(SilKitError::configuration("connectTimeoutSeconds must be positive"));
        }
        if self.experimental.time_synchronization.animation_factor < 0.0 {
            return Err(SilKitError::configuration("animationFactor must not be negative"));
        }
        if self.experimental.metrics.update_interval <= 0.0 {
            return Err(SilKitError::configuration("metrics updateInterval must be positive"));
        }
        if let (Some(soft), Some(hard)) =
            (self.health_check.soft_response_timeout, self.health_check.hard_response_timeout)
        {
            if hard < soft {
                return Err(SilKitError::configuration(
                    "healthCheck hardResponseTimeout must not be below softResponseTimeout",
                ));
            }
        }
        Ok(())
    }

    pub fn find_can_controller(&self, name: &str) -> Option<&CanControllerConfig> {
        self.can_controllers.iter().find(|c| c.name == name)
    }

    pub fn find_data_publisher(&self, name: &str) -> Option<&DataPublisherConfig> {
        self.data_publishers.iter().find(|c| c.name == name)
    }

    pub fn find_data_subscriber(&self, name: &str) -> Option<&DataSubscriberConfig> {
        self.data_subscribers.iter().find(|c| c.name == name)
    }
}

/// Resolve a value supplied both programmatically and in the configuration.
/// The configured value wins; a mismatch is logged at Info.
pub fn resolve_configured<T: PartialEq + Clone + std::fmt::Debug>(
    what: &str,
    controller_name: &str,
    configured: Option<&T>,
    programmatic: T,
) -> T {
    match configured {
        Some(cfg) if *cfg != programmatic => {
            info!(
                controller = controller_name,
                "configuration overrides {}: {:?} (API supplied {:?})", what, cfg, programmatic
            );
            cfg.clone()
        }
        Some(cfg) => cfg.clone(),
        None => programmatic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gets_defaults() {
        let cfg = ParticipantConfiguration::from_str("{}").unwrap();
        assert_eq!(cfg.middleware.registry_uri, "silkit://localhost:8500");
        assert!(cfg.middleware.enable_domain_sockets);
        assert_eq!(cfg.middleware.simulation_name, "default");
        assert!(cfg.logging.sinks.is_empty());
    }

    #[test]
    fn yaml_document_parses() {
        let cfg = ParticipantConfiguration::from_str(
            r#"
participantName: CanWriter
middleware:
  registryUri: silkit://127.0.0.1:8501
  enableDomainSockets: false
logging:
  sinks:
    - type: Stdout
      level: Debug
canControllers:
  - name: CanController1
    network: CAN1
dataPublishers:
  - name: PubCtrl1
    topic: Topic1
    history: 1
    labels:
      - key: kA
        value: vA
        kind: Mandatory
"#,
        )
        .unwrap();
        assert_eq!(cfg.participant_name.as_deref(), Some("CanWriter"));
        assert_eq!(cfg.middleware.registry_uri, "silkit://127.0.0.1:8501");
        assert!(!cfg.middleware.enable_domain_sockets);
        assert_eq!(cfg.can_controllers[0].network.as_deref(), Some("CAN1"));
        assert_eq!(cfg.data_publishers[0].history, Some(1));
        assert_eq!(cfg.data_publishers[0].labels[0].kind, LabelKind::Mandatory);
    }

    #[test]
    fn json_document_parses() {
        let cfg = ParticipantConfiguration::from_str(
            r#"{"participantName": "P1", "middleware": {"registryUri": "silkit://localhost:8500"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.participant_name.as_deref(), Some("P1"));
    }

    #[test]
    fn unknown_field_rejected() {
        let err = ParticipantConfiguration::from_str("particpantName: oops\n").unwrap_err();
        assert!(matches!(err, SilKitError::Configuration(_)));
    }

    #[test]
    fn history_above_one_rejected() {
        let err = ParticipantConfiguration::from_str(
            "dataPublishers:\n  - name: P\n    topic: T\n    history: 2\n",
        )
        .unwrap_err();
        assert!(matches!(err, SilKitError::Configuration(_)));
    }

    #[test]
    fn configured_value_wins() {
        let configured = Some("CAN_CFG".to_string());
        let got = resolve_configured("network", "CanController1", configured.as_ref(), "CAN_API".to_string());
        assert_eq!(got, "CAN_CFG");
        let got = resolve_configured("network", "CanController1", None, "CAN_API".to_string());
        assert_eq!(got, "CAN_API");
    }
}
