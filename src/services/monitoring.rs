// Monitoring service
// In-process counters, timers, gauges and alert rules. Delivery to an
// external metrics system happens through the injected sink; nothing on the
// hot path performs network I/O.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::warn;

/// Push-only sink for metric delivery.
pub trait MetricsSink: Send + Sync {
    fn record_counter(&self, name: &str, value: u64);
    fn record_timer(&self, name: &str, duration: Duration);
    fn record_gauge(&self, name: &str, value: f64);
}

/// Sink that drops everything; the in-process counters still accumulate.
#[derive(Debug, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record_counter(&self, _name: &str, _value: u64) {}
    fn record_timer(&self, _name: &str, _duration: Duration) {}
    fn record_gauge(&self, _name: &str, _value: f64) {}
}

/// Alert rule: fires when a counter crosses its threshold, at most once per
/// cooldown window.
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub name: String,
    pub counter: String,
    pub threshold: u64,
    pub cooldown: Duration,
}

#[derive(Debug, Default)]
struct TimerStats {
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

/// Snapshot of the in-process metric state
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringSnapshot {
    pub counters: Vec<(String, u64)>,
    pub gauges: Vec<(String, f64)>,
}

pub struct MonitoringService {
    counters: DashMap<String, AtomicU64>,
    timers: DashMap<String, TimerStats>,
    gauges: DashMap<String, AtomicU64>, // f64 bits
    rules: RwLock<Vec<AlertRule>>,
    last_fired: Mutex<DashMap<String, Instant>>,
    sink: Arc<dyn MetricsSink>,
}

impl MonitoringService {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            counters: DashMap::new(),
            timers: DashMap::new(),
            gauges: DashMap::new(),
            rules: RwLock::new(Vec::new()),
            last_fired: Mutex::new(DashMap::new()),
            sink,
        }
    }

    pub fn with_noop_sink() -> Self {
        Self::new(Arc::new(NoopSink))
    }

    pub fn record_counter(&self, name: &str, value: u64) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
        self.sink.record_counter(name, value);
    }

    pub fn increment(&self, name: &str) {
        self.record_counter(name, 1);
    }

    pub fn record_timer(&self, name: &str, duration: Duration) {
        let millis = duration.as_millis() as u64;
        let stats = self.timers.entry(name.to_string()).or_default();
        stats.count.fetch_add(1, Ordering::Relaxed);
        stats.total_ms.fetch_add(millis, Ordering::Relaxed);
        stats.max_ms.fetch_max(millis, Ordering::Relaxed);
        self.sink.record_timer(name, duration);
    }

    pub fn record_gauge(&self, name: &str, value: f64) {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value.to_bits(), Ordering::Relaxed);
        self.sink.record_gauge(name, value);
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn add_alert_rule(&self, rule: AlertRule) {
        if let Ok(mut rules) = self.rules.write() {
            rules.push(rule);
        }
    }

    /// Evaluate all alert rules, returning the names of those that fired.
    /// Firing is rate-limited per rule by its cooldown.
    pub fn evaluate_alerts(&self) -> Vec<String> {
        let rules = match self.rules.read() {
            Ok(rules) => rules.clone(),
            Err(_) => return Vec::new(),
        };

        let mut fired = Vec::new();
        let now = Instant::now();
        let last_fired = match self.last_fired.lock() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };

        for rule in rules {
            if self.counter_value(&rule.counter) < rule.threshold {
                continue;
            }
            let in_cooldown = last_fired
                .get(&rule.name)
                .map(|at| now.duration_since(*at) < rule.cooldown)
                .unwrap_or(false);
            if in_cooldown {
                continue;
            }
            last_fired.insert(rule.name.clone(), now);
            warn!(
                alert = %rule.name,
                counter = %rule.counter,
                threshold = rule.threshold,
                "Alert rule fired"
            );
            fired.push(rule.name);
        }
        fired
    }

    pub fn snapshot(&self) -> MonitoringSnapshot {
        MonitoringSnapshot {
            counters: self
                .counters
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            gauges: self
                .gauges
                .iter()
                .map(|e| (e.key().clone(), f64::from_bits(e.value().load(Ordering::Relaxed))))
                .collect(),
        }
    }
}

impl MetricsSink for MonitoringService {
    fn record_counter(&self, name: &str, value: u64) {
        MonitoringService::record_counter(self, name, value);
    }

    fn record_timer(&self, name: &str, duration: Duration) {
        MonitoringService::record_timer(self, name, duration);
    }

    fn record_gauge(&self, name: &str, value: f64) {
        MonitoringService::record_gauge(self, name, value);
    }
}
