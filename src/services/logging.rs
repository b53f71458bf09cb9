//! Logging: subscriber setup and remote log distribution
//!
//! The configured sinks map onto a `tracing` subscriber (stdout and/or file
//! writers at per-sink levels). A `Remote` sink forwards records above its
//! level as `LogMsg` frames; with `logFromRemotes` enabled, received remote
//! records are re-emitted through the local `tracing` macros tagged with the
//! originating participant.

use crate::config::{LogLevel, Logging as LoggingConfig, SinkType};
use crate::descriptor::EndpointAddress;
use crate::net::Connection;
use crate::services::orchestration::time_provider::wall_clock_ns;
use crate::wire::message::{LogMsg, MessageKind, RoutedMessage};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn level_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Off => "off",
        LogLevel::Critical | LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

fn filter_for(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("simbus={}", level_directive(level))))
}

/// Initialize the process-wide subscriber from the logging configuration:
/// a stdout layer plus an optional plain-text file layer. Only the first
/// call takes effect; later participants in the same process share the
/// subscriber. The filter is the most verbose configured sink level.
pub fn init(config: &LoggingConfig) {
    let max_level = config
        .sinks
        .iter()
        .filter(|s| s.sink_type != SinkType::Remote)
        .map(|s| s.level)
        .max_by_key(|l| l.as_u8())
        .unwrap_or(LogLevel::Info);

    let file_writer = config
        .sinks
        .iter()
        .find(|s| s.sink_type == SinkType::File)
        .and_then(|sink| {
            let name = sink.log_name.clone().unwrap_or_else(|| "simbus.log".to_string());
            match std::fs::File::create(&name) {
                Ok(file) => Some(Arc::new(file)),
                Err(e) => {
                    eprintln!("cannot open log file {}: {}", name, e);
                    None
                }
            }
        });

    let base = tracing_subscriber::registry()
        .with(filter_for(max_level))
        .with(tracing_subscriber::fmt::layer());
    match file_writer {
        Some(file) => {
            let _ = base
                .with(tracing_subscriber::fmt::layer().with_writer(file).with_ansi(false))
                .try_init();
        }
        None => {
            let _ = base.try_init();
        }
    }
}

/// Initialize with an explicit stdout level (used by the registry CLI).
pub fn init_with_level(level: LogLevel) {
    let _ = tracing_subscriber::fmt().with_env_filter(filter_for(level)).try_init();
}

/// Sends local log records to peers as `LogMsg` frames. Explicitly invoked
/// at the few sites that matter remotely (state changes, step diagnostics).
pub struct RemoteLogSender {
    connection: Arc<Connection>,
    endpoint: EndpointAddress,
    level: LogLevel,
    logger_name: String,
}

impl RemoteLogSender {
    pub fn new(
        connection: Arc<Connection>,
        endpoint: EndpointAddress,
        level: LogLevel,
        logger_name: &str,
    ) -> Arc<Self> {
        Arc::new(Self { connection, endpoint, level, logger_name: logger_name.to_string() })
    }

    pub fn log(&self, level: LogLevel, body: &str, key_values: BTreeMap<String, String>) {
        if level.as_u8() < self.level.as_u8() || self.level == LogLevel::Off {
            return;
        }
        self.connection.send_msg(
            self.endpoint,
            "default",
            RoutedMessage::LogMsg(LogMsg {
                logger_name: self.logger_name.clone(),
                level: level.as_u8(),
                time_ns: wall_clock_ns(),
                body: body.to_string(),
                key_values,
            }),
        );
    }
}

/// Re-emits `LogMsg` frames from peers through the local subscriber.
pub struct RemoteLogReceiver;

impl RemoteLogReceiver {
    pub fn install(connection: &Arc<Connection>, endpoint: EndpointAddress) {
        let conn = connection.clone();
        connection.register_receiver(
            MessageKind::LogMsg,
            "default",
            endpoint,
            Arc::new(move |from, msg| {
                if let RoutedMessage::LogMsg(log) = msg {
                    let origin = conn
                        .participant_name_of(from.participant_id)
                        .unwrap_or_else(|| log.logger_name.clone());
                    match LogLevel::from_u8(log.level) {
                        LogLevel::Off => {}
                        LogLevel::Critical | LogLevel::Error => {
                            error!(remote = %origin, "{}", log.body)
                        }
                        LogLevel::Warn => warn!(remote = %origin, "{}", log.body),
                        LogLevel::Info => info!(remote = %origin, "{}", log.body),
                        LogLevel::Debug => debug!(remote = %origin, "{}", log.body),
                        LogLevel::Trace => trace!(remote = %origin, "{}", log.body),
                    }
                }
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::participant_id_of;

    #[tokio::test]
    async fn remote_sender_respects_level_threshold() {
        let conn = Connection::new("A", participant_id_of("A"), "default");
        let endpoint = EndpointAddress { participant_id: participant_id_of("A"), service_id: 9 };
        let sender = RemoteLogSender::new(conn, endpoint, LogLevel::Warn, "A");
        // Below threshold: silently dropped (no peers to observe either way,
        // this exercises the early-out path).
        sender.log(LogLevel::Debug, "quiet", BTreeMap::new());
        sender.log(LogLevel::Error, "loud", BTreeMap::new());
    }

    #[test]
    fn level_directives() {
        assert_eq!(level_directive(LogLevel::Off), "off");
        assert_eq!(level_directive(LogLevel::Critical), "error");
        assert_eq!(level_directive(LogLevel::Trace), "trace");
    }
}
