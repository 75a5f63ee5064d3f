//! Bounded per-type/source/subscriber statistics, rolling time windows, and
//! alert threshold evaluation, with an external Prometheus-style export
//! alongside the in-process rolling-stats struct.

use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use nervus_core::MetricsConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn ema(prev: f64, sample: f64, new_weight: f64) -> f64 {
    (1.0 - new_weight) * prev + new_weight * sample
}

#[derive(Debug, Clone, Default)]
pub struct OverallMetrics {
    pub total_events: u64,
    pub events_per_second: f64,
    pub average_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub error_rate: f64,
    pub active_subscribers: u64,
    pub successful_deliveries: u64,
    pub failed_deliveries: u64,
    pub dropped_events: u64,
    pub duplicate_events: u64,
    pub memory_usage: f64,
    pub cpu_usage: f64,
    pub queue_depth: u64,
    pub uptime_secs: u64,
    pub start_time: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DimensionStats {
    pub count: u64,
    pub average_size: f64,
    pub average_latency_ms: f64,
    pub average_processing_ms: f64,
    pub error_count: u64,
    pub last_seen: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriberStats {
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub last_activity: u64,
    pub health_score: f64,
}

#[derive(Debug, Clone)]
pub struct TimeWindowStats {
    pub size_secs: u64,
    pub start: u64,
    pub event_count: u64,
    pub per_type: HashMap<String, u64>,
    pub peak_rate: f64,
    pub average_rate: f64,
}

impl TimeWindowStats {
    fn new(size_secs: u64, now: u64) -> Self {
        Self {
            size_secs,
            start: now,
            event_count: 0,
            per_type: HashMap::new(),
            peak_rate: 0.0,
            average_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub id: String,
    pub alert_type: String,
    pub severity: String,
    pub message: String,
    pub threshold: f64,
    pub actual: f64,
    pub timestamp: u64,
    pub resolved: bool,
}

struct Inner {
    overall: RwLock<OverallMetrics>,
    by_type: DashMap<String, DimensionStats>,
    by_source: DashMap<String, DimensionStats>,
    by_subscriber: DashMap<String, SubscriberStats>,
    windows: RwLock<Vec<TimeWindowStats>>,
    last_snapshot_count: AtomicU64,
    last_snapshot_time: AtomicU64,
}

/// Collector of overall, per-dimension and rolling-window statistics. Owns
/// its own `collection_interval`/cleanup background tasks when started via
/// the host binary; the struct itself is plain data plus recording methods,
/// matching the teacher's `Metrics` (counters behind an `RwLock`, mirrored
/// out to the `metrics` crate for external scraping).
pub struct MetricsCollector {
    config: MetricsConfig,
    inner: Arc<Inner>,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        let now = now_secs();
        let windows = config
            .time_window_sizes
            .iter()
            .map(|&size| TimeWindowStats::new(size, now))
            .collect();
        Self {
            config,
            inner: Arc::new(Inner {
                overall: RwLock::new(OverallMetrics {
                    start_time: now,
                    ..Default::default()
                }),
                by_type: DashMap::new(),
                by_source: DashMap::new(),
                by_subscriber: DashMap::new(),
                windows: RwLock::new(windows),
                last_snapshot_count: AtomicU64::new(0),
                last_snapshot_time: AtomicU64::new(now),
            }),
        }
    }

    pub fn record_event(&self, event_type: &str, source: &str, latency_ms: f64, success: bool) {
        {
            let mut overall = self.inner.overall.write();
            overall.total_events += 1;
            overall.average_latency_ms = ema(overall.average_latency_ms, latency_ms, 0.1);
            if success {
                overall.successful_deliveries += 1;
            } else {
                overall.failed_deliveries += 1;
            }
        }
        counter!("nervus_events_total").increment(1);
        histogram!("nervus_event_latency_ms").record(latency_ms);

        if self.inner.by_type.len_hint() < self.config.max_event_types {
            self.record_dimension(&self.inner.by_type, event_type, latency_ms, success);
        }
        if self.inner.by_source.len_hint() < self.config.max_sources {
            self.record_dimension(&self.inner.by_source, source, latency_ms, success);
        }

        let now = now_secs();
        let mut windows = self.inner.windows.write();
        for window in windows.iter_mut() {
            if now.saturating_sub(window.start) >= window.size_secs {
                *window = TimeWindowStats::new(window.size_secs, now);
            }
            window.event_count += 1;
            *window.per_type.entry(event_type.to_string()).or_insert(0) += 1;
            let elapsed = (now.saturating_sub(window.start)).max(1) as f64;
            window.average_rate = window.event_count as f64 / elapsed;
            window.peak_rate = window.peak_rate.max(window.average_rate);
        }
    }

    fn record_dimension(
        &self,
        table: &DashMap<String, DimensionStats>,
        key: &str,
        latency_ms: f64,
        success: bool,
    ) {
        let mut entry = table.entry(key.to_string()).or_default();
        entry.count += 1;
        entry.average_latency_ms = ema(entry.average_latency_ms, latency_ms, 0.1);
        if !success {
            entry.error_count += 1;
        }
        entry.last_seen = now_secs();
        entry.success_rate = 1.0 - (entry.error_count as f64 / entry.count as f64);
    }

    /// Updates subscriber stats and recomputes `health_score =
    /// processed/received * 100` (§4.E).
    pub fn record_subscriber_activity(
        &self,
        subscriber_id: &str,
        received: u64,
        processed: u64,
        failed: u64,
    ) {
        if self.inner.by_subscriber.len_hint() >= self.config.max_subscribers
            && !self.inner.by_subscriber.contains_key(subscriber_id)
        {
            return;
        }
        let mut entry = self.inner.by_subscriber.entry(subscriber_id.to_string()).or_default();
        entry.received += received;
        entry.processed += processed;
        entry.failed += failed;
        entry.last_activity = now_secs();
        entry.health_score = if entry.received == 0 {
            100.0
        } else {
            entry.processed as f64 / entry.received as f64 * 100.0
        };
    }

    fn by_type(&self) -> &DashMap<String, DimensionStats> {
        &self.inner.by_type
    }
    fn by_source(&self) -> &DashMap<String, DimensionStats> {
        &self.inner.by_source
    }
    fn by_subscriber(&self) -> &DashMap<String, SubscriberStats> {
        &self.inner.by_subscriber
    }

    /// Derives `events_per_second`/`error_rate`, refreshes
    /// `active_subscribers`, and evaluates alert thresholds when enabled.
    pub fn collect(&self) -> Vec<Alert> {
        let now = now_secs();
        let mut alerts = Vec::new();
        let (eps, error_rate, active_subscribers, avg_latency, queue_depth) = {
            let mut overall = self.inner.overall.write();
            let last_count = self.inner.last_snapshot_count.swap(overall.total_events, Ordering::SeqCst);
            let last_time = self.inner.last_snapshot_time.swap(now, Ordering::SeqCst);
            let elapsed = now.saturating_sub(last_time).max(1) as f64;
            overall.events_per_second = (overall.total_events.saturating_sub(last_count)) as f64 / elapsed;
            let total = overall.successful_deliveries + overall.failed_deliveries;
            overall.error_rate = if total == 0 {
                0.0
            } else {
                overall.failed_deliveries as f64 / total as f64 * 100.0
            };
            overall.active_subscribers = self.inner.by_subscriber.len() as u64;
            overall.uptime_secs = now.saturating_sub(overall.start_time);
            gauge!("nervus_active_subscribers").set(overall.active_subscribers as f64);
            (
                overall.events_per_second,
                overall.error_rate,
                overall.active_subscribers,
                overall.average_latency_ms,
                overall.queue_depth,
            )
        };

        if self.config.enable_alerting {
            let t = &self.config.alert_thresholds;
            if error_rate > t.max_error_rate {
                alerts.push(self.make_alert("error_rate", t.max_error_rate, error_rate));
            }
            if avg_latency > t.max_latency {
                alerts.push(self.make_alert("latency", t.max_latency, avg_latency));
            }
            if eps < t.min_throughput {
                alerts.push(self.make_alert("throughput", t.min_throughput, eps));
            }
            if queue_depth as f64 > t.max_queue_depth as f64 {
                alerts.push(self.make_alert("queue_depth", t.max_queue_depth as f64, queue_depth as f64));
            }
            let _ = active_subscribers;
        }
        alerts
    }

    fn make_alert(&self, alert_type: &str, threshold: f64, actual: f64) -> Alert {
        let severity = if actual > threshold * 2.0 { "critical" } else { "warning" };
        Alert {
            id: format!("{}-{}", alert_type, now_secs()),
            alert_type: alert_type.to_string(),
            severity: severity.to_string(),
            message: format!("{} threshold breached: {:.2} > {:.2}", alert_type, actual, threshold),
            threshold,
            actual,
            timestamp: now_secs(),
            resolved: false,
        }
    }

    /// Drops per-dimension entries whose last activity predates
    /// `now - retention_period` (§4.E cleanup task).
    pub fn cleanup(&self) {
        let horizon = now_secs().saturating_sub(self.config.retention_period.as_secs());
        self.inner.by_type.retain(|_, v| v.last_seen >= horizon);
        self.inner.by_source.retain(|_, v| v.last_seen >= horizon);
        self.inner.by_subscriber.retain(|_, v| v.last_activity >= horizon);
        info!("metrics cleanup complete");
    }

    pub fn overall(&self) -> OverallMetrics {
        self.inner.overall.read().clone()
    }

    /// Deep-copied snapshot across all dimensions for export (§4.E).
    pub fn get_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            overall: self.overall(),
            by_type: self.by_type().iter().map(|e| (e.key().clone(), e.value().clone())).collect(),
            by_source: self.by_source().iter().map(|e| (e.key().clone(), e.value().clone())).collect(),
            by_subscriber: self
                .by_subscriber()
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            windows: self.inner.windows.read().clone(),
        }
    }

    pub fn prometheus_text(&self) -> String {
        let overall = self.overall();
        format!(
            "# HELP nervus_events_total Total events recorded\n\
             # TYPE nervus_events_total counter\n\
             nervus_events_total {}\n\
             # HELP nervus_active_subscribers Active subscriber count\n\
             # TYPE nervus_active_subscribers gauge\n\
             nervus_active_subscribers {}\n",
            overall.total_events, overall.active_subscribers
        )
    }
}

trait LenHint {
    fn len_hint(&self) -> usize;
}

impl<K: std::hash::Hash + Eq, V> LenHint for DashMap<K, V> {
    fn len_hint(&self) -> usize {
        self.len()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub overall: OverallMetrics,
    pub by_type: HashMap<String, DimensionStats>,
    pub by_source: HashMap<String, DimensionStats>,
    pub by_subscriber: HashMap<String, SubscriberStats>,
    pub windows: Vec<TimeWindowStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_collects_overall_stats() {
        let collector = MetricsCollector::new(MetricsConfig::default());
        collector.record_event("memory.update", "producer-1", 12.0, true);
        collector.record_event("memory.update", "producer-1", 8.0, false);
        let alerts = collector.collect();
        assert!(alerts.is_empty());
        let overall = collector.overall();
        assert_eq!(overall.total_events, 2);
        assert_eq!(overall.successful_deliveries, 1);
        assert_eq!(overall.failed_deliveries, 1);
    }

    #[test]
    fn subscriber_health_score() {
        let collector = MetricsCollector::new(MetricsConfig::default());
        collector.record_subscriber_activity("sub1", 10, 8, 2);
        let snapshot = collector.get_snapshot();
        let stats = snapshot.by_subscriber.get("sub1").unwrap();
        assert_eq!(stats.health_score, 80.0);
    }

    #[test]
    fn alert_threshold_breach_emits_alert() {
        let mut config = MetricsConfig::default();
        config.enable_alerting = true;
        config.alert_thresholds.max_error_rate = 1.0;
        let collector = MetricsCollector::new(config);
        collector.record_event("t", "s", 1.0, false);
        let alerts = collector.collect();
        assert!(alerts.iter().any(|a| a.alert_type == "error_rate"));
    }

    #[test]
    fn queue_depth_breach_emits_alert() {
        let mut config = MetricsConfig::default();
        config.enable_alerting = true;
        config.alert_thresholds.max_queue_depth = 10;
        let collector = MetricsCollector::new(config);
        collector.inner.overall.write().queue_depth = 11;
        let alerts = collector.collect();
        assert!(alerts.iter().any(|a| a.alert_type == "queue_depth"));
    }

    #[test]
    fn per_dimension_cap_is_silent_noop() {
        let mut config = MetricsConfig::default();
        config.max_event_types = 1;
        let collector = MetricsCollector::new(config);
        collector.record_event("a", "s", 1.0, true);
        collector.record_event("b", "s", 1.0, true);
        assert_eq!(collector.by_type().len(), 1);
    }

    #[test]
    fn cleanup_drops_stale_entries() {
        let mut config = MetricsConfig::default();
        config.retention_period = std::time::Duration::from_secs(0);
        let collector = MetricsCollector::new(config);
        collector.record_event("a", "s", 1.0, true);
        collector
            .by_type()
            .get_mut("a")
            .unwrap()
            .last_seen = 0;
        collector.cleanup();
        assert!(collector.by_type().is_empty());
    }
}
