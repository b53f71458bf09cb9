//! Metrics: counters, statistics, string lists
//!
//! Controllers grab metric handles from the manager and update them with
//! atomic increments or cheap locked samples. A periodic task snapshots
//! everything that changed since the last tick and hands the batch to the
//! configured sinks: a JSON-lines file, or a `MetricsUpdate` broadcast for
//! remote collection (the registry logs those when told to).

use crate::config::{Metrics as MetricsConfig, MetricsSinkType};
use crate::descriptor::EndpointAddress;
use crate::net::Connection;
use crate::services::orchestration::time_provider::wall_clock_ns;
use crate::wire::message::{MetricData, MetricValue, MetricsUpdate, RoutedMessage};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Monotonic counter.
pub struct CounterMetric {
    value: AtomicU64,
    dirty: AtomicBool,
}

impl CounterMetric {
    fn new() -> Self {
        Self { value: AtomicU64::new(0), dirty: AtomicBool::new(false) }
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct StatData {
    count: u64,
    min: f64,
    max: f64,
    sum: f64,
}

/// Running min/max/mean over taken samples.
pub struct StatisticMetric {
    data: Mutex<StatData>,
    dirty: AtomicBool,
}

impl StatisticMetric {
    fn new() -> Self {
        Self { data: Mutex::new(StatData::default()), dirty: AtomicBool::new(false) }
    }

    pub fn take(&self, sample: f64) {
        let mut data = self.data.lock().expect("stat lock");
        if data.count == 0 {
            data.min = sample;
            data.max = sample;
        } else {
            data.min = data.min.min(sample);
            data.max = data.max.max(sample);
        }
        data.count += 1;
        data.sum += sample;
        self.dirty.store(true, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MetricValue {
        let data = self.data.lock().expect("stat lock");
        let mean = if data.count > 0 { data.sum / data.count as f64 } else { 0.0 };
        MetricValue::Statistic { count: data.count, min: data.min, max: data.max, mean }
    }
}

/// Free-form list of strings (attribute metric).
pub struct StringListMetric {
    items: Mutex<Vec<String>>,
    dirty: AtomicBool,
}

impl StringListMetric {
    fn new() -> Self {
        Self { items: Mutex::new(Vec::new()), dirty: AtomicBool::new(false) }
    }

    pub fn add(&self, item: impl Into<String>) {
        self.items.lock().expect("list lock").push(item.into());
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.items.lock().expect("list lock").clear();
        self.dirty.store(true, Ordering::Relaxed);
    }
}

enum Metric {
    Counter(Arc<CounterMetric>),
    Statistic(Arc<StatisticMetric>),
    StringList(Arc<StringListMetric>),
}

enum MetricsSink {
    JsonFile { file: Mutex<std::fs::File>, participant_name: String },
    Remote { connection: Arc<Connection>, endpoint: EndpointAddress },
}

impl MetricsSink {
    fn process(&self, update: &MetricsUpdate) {
        match self {
            MetricsSink::JsonFile { file, participant_name } => {
                let mut file = file.lock().expect("sink lock");
                for data in &update.metrics {
                    let line = serde_json::json!({
                        "ts": data.timestamp_ns,
                        "participant": participant_name,
                        "name": data.name,
                        "value": match &data.value {
                            MetricValue::Counter(v) => serde_json::json!(v),
                            MetricValue::Statistic { count, min, max, mean } => serde_json::json!({
                                "count": count, "min": min, "max": max, "mean": mean,
                            }),
                            MetricValue::StringList(items) => serde_json::json!(items),
                        },
                    });
                    if writeln!(file, "{}", line).is_err() {
                        warn!("metrics json sink write failed");
                        return;
                    }
                }
            }
            MetricsSink::Remote { connection, endpoint } => {
                connection.send_msg(
                    *endpoint,
                    "default",
                    RoutedMessage::MetricsUpdate(update.clone()),
                );
            }
        }
    }
}

pub struct MetricsManager {
    participant_name: String,
    metrics: Mutex<HashMap<String, Metric>>,
    sinks: Mutex<Vec<MetricsSink>>,
}

impl MetricsManager {
    pub fn new(participant_name: &str) -> Arc<Self> {
        Arc::new(Self {
            participant_name: participant_name.to_string(),
            metrics: Mutex::new(HashMap::new()),
            sinks: Mutex::new(Vec::new()),
        })
    }

    /// Build sinks from configuration and start the snapshot timer.
    pub fn setup(
        self: &Arc<Self>,
        config: &MetricsConfig,
        connection: Option<(Arc<Connection>, EndpointAddress)>,
    ) {
        let mut sinks = Vec::new();
        for sink in &config.sinks {
            match sink.sink_type {
                MetricsSinkType::JsonFile => {
                    let name = if sink.name.is_empty() {
                        format!("{}_metrics.jsonl", self.participant_name)
                    } else {
                        sink.name.clone()
                    };
                    match std::fs::File::create(&name) {
                        Ok(file) => sinks.push(MetricsSink::JsonFile {
                            file: Mutex::new(file),
                            participant_name: self.participant_name.clone(),
                        }),
                        Err(e) => warn!(file = %name, error = %e, "cannot open metrics json sink"),
                    }
                }
                MetricsSinkType::Remote => match &connection {
                    Some((conn, endpoint)) => sinks.push(MetricsSink::Remote {
                        connection: conn.clone(),
                        endpoint: *endpoint,
                    }),
                    None => warn!("remote metrics sink requires a connection"),
                },
            }
        }
        let has_sinks = !sinks.is_empty();
        *self.sinks.lock().expect("sinks lock") = sinks;

        if has_sinks {
            let manager = self.clone();
            let interval = Duration::from_secs_f64(config.update_interval);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    manager.flush();
                }
            });
        }
    }

    pub fn counter(self: &Arc<Self>, name: &str) -> Arc<CounterMetric> {
        let mut metrics = self.metrics.lock().expect("metrics lock");
        match metrics.get(name) {
            Some(Metric::Counter(c)) => c.clone(),
            _ => {
                let c = Arc::new(CounterMetric::new());
                metrics.insert(name.to_string(), Metric::Counter(c.clone()));
                c
            }
        }
    }

    pub fn statistic(self: &Arc<Self>, name: &str) -> Arc<StatisticMetric> {
        let mut metrics = self.metrics.lock().expect("metrics lock");
        match metrics.get(name) {
            Some(Metric::Statistic(s)) => s.clone(),
            _ => {
                let s = Arc::new(StatisticMetric::new());
                metrics.insert(name.to_string(), Metric::Statistic(s.clone()));
                s
            }
        }
    }

    pub fn string_list(self: &Arc<Self>, name: &str) -> Arc<StringListMetric> {
        let mut metrics = self.metrics.lock().expect("metrics lock");
        match metrics.get(name) {
            Some(Metric::StringList(l)) => l.clone(),
            _ => {
                let l = Arc::new(StringListMetric::new());
                metrics.insert(name.to_string(), Metric::StringList(l.clone()));
                l
            }
        }
    }

    /// Snapshot every metric touched since the last flush and route the
    /// batch to all sinks.
    pub fn flush(&self) {
        let now = wall_clock_ns();
        let update = {
            let metrics = self.metrics.lock().expect("metrics lock");
            let mut batch = Vec::new();
            for (name, metric) in metrics.iter() {
                let (dirty, value) = match metric {
                    Metric::Counter(c) => {
                        (c.dirty.swap(false, Ordering::Relaxed), MetricValue::Counter(c.value()))
                    }
                    Metric::Statistic(s) => {
                        (s.dirty.swap(false, Ordering::Relaxed), s.snapshot())
                    }
                    Metric::StringList(l) => (
                        l.dirty.swap(false, Ordering::Relaxed),
                        MetricValue::StringList(l.items.lock().expect("list lock").clone()),
                    ),
                };
                if dirty {
                    batch.push(MetricData { timestamp_ns: now, name: name.clone(), value });
                }
            }
            MetricsUpdate { metrics: batch }
        };
        if update.metrics.is_empty() {
            return;
        }
        debug!(count = update.metrics.len(), "flushing metrics");
        let sinks = self.sinks.lock().expect("sinks lock");
        for sink in sinks.iter() {
            sink.process(&update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let manager = MetricsManager::new("P1");
        let counter = manager.counter("SimStepCount");
        counter.add(1);
        counter.add(2);
        assert_eq!(counter.value(), 3);
        // Same name returns the same metric.
        assert_eq!(manager.counter("SimStepCount").value(), 3);
    }

    #[test]
    fn statistic_tracks_min_max_mean() {
        let manager = MetricsManager::new("P1");
        let stat = manager.statistic("SimStep/execution_duration/[s]");
        stat.take(0.5);
        stat.take(1.5);
        stat.take(1.0);
        match stat.snapshot() {
            MetricValue::Statistic { count, min, max, mean } => {
                assert_eq!(count, 3);
                assert_eq!(min, 0.5);
                assert_eq!(max, 1.5);
                assert!((mean - 1.0).abs() < 1e-9);
            }
            other => panic!("unexpected snapshot {:?}", other),
        }
    }

    #[test]
    fn flush_skips_untouched_metrics() {
        let manager = MetricsManager::new("P1");
        let counter = manager.counter("a");
        let _untouched = manager.counter("b");
        counter.add(1);
        // No sinks: flush only clears the dirty bits.
        manager.flush();
        assert!(!counter.dirty.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn json_sink_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let manager = MetricsManager::new("P1");
        let config = MetricsConfig {
            update_interval: 60.0,
            collect_from_remote: false,
            sinks: vec![crate::config::MetricsSink {
                sink_type: MetricsSinkType::JsonFile,
                name: path.to_string_lossy().to_string(),
            }],
        };
        manager.setup(&config, None);
        manager.counter("SimStepCount").add(5);
        manager.flush();

        let content = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(line["participant"], "P1");
        assert_eq!(line["name"], "SimStepCount");
        assert_eq!(line["value"], 5);
    }
}
