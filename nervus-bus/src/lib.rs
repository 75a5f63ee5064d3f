//! In-process pub/sub: bounded per-subscription channels, filter-aware
//! fan-out, TTL-based subscription cleanup, non-blocking publish.

use dashmap::DashMap;
use nervus_core::{BusConfig, Error, Event, Filter, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Channel,
}

#[derive(Debug, Default)]
pub struct Statistics {
    pub received: u64,
    pub delivered: u64,
    pub failed: u64,
    pub average_latency_ms: f64,
    pub last_event_time: Option<u64>,
}

impl Statistics {
    pub fn success_rate(&self) -> f64 {
        if self.received == 0 {
            return 1.0;
        }
        self.delivered as f64 / self.received as f64
    }
}

struct SubscriptionEntry {
    id: String,
    filter: Option<Filter>,
    sender: mpsc::Sender<Event>,
    stats: Arc<RwLock<Statistics>>,
    last_event_ms: Arc<AtomicU64>,
}

/// Handle returned from [`EventBus::subscribe`]. Owns the receiving end of
/// the subscription's channel.
pub struct Subscription {
    pub id: String,
    pub subscriber_id: String,
    pub delivery_mode: DeliveryMode,
    pub receiver: mpsc::Receiver<Event>,
    stats: Arc<RwLock<Statistics>>,
}

impl Subscription {
    pub fn stats(&self) -> Statistics {
        let s = self.stats.read();
        Statistics {
            received: s.received,
            delivered: s.delivered,
            failed: s.failed,
            average_latency_ms: s.average_latency_ms,
            last_event_time: s.last_event_time,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct BusMetrics {
    pub events_published: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
    pub average_latency_ms: f64,
    pub last_event_time: Option<u64>,
    pub throughput_per_second: f64,
}

/// In-memory event bus. `start`/`stop` own a background cleanup task and a
/// metrics task; both are joined on `stop`.
pub struct EventBus {
    config: BusConfig,
    running: AtomicBool,
    subscribers: RwLock<HashMap<String, Vec<String>>>,
    subscriptions: DashMap<String, SubscriptionEntry>,
    subscription_count: AtomicU64,
    metrics: RwLock<BusMetrics>,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Arc<Self> {
        let (tx, rx) = watch::channel(false);
        Arc::new(Self {
            config,
            running: AtomicBool::new(false),
            subscribers: RwLock::new(HashMap::new()),
            subscriptions: DashMap::new(),
            subscription_count: AtomicU64::new(0),
            metrics: RwLock::new(BusMetrics::default()),
            shutdown: tx,
            shutdown_rx: rx,
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        let _ = self.shutdown.send(false);

        let cleanup = self.clone();
        let mut rx = self.shutdown_rx.clone();
        let cleanup_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup.config.cleanup_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => cleanup.run_cleanup(),
                    _ = rx.changed() => {
                        if *rx.borrow() { break; }
                    }
                }
            }
        });

        let metrics = self.clone();
        let mut rx2 = self.shutdown_rx.clone();
        let metrics_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(metrics.config.metrics_interval);
            let mut last_count = 0u64;
            let mut last_tick = now_ms();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = now_ms();
                        let mut m = metrics.metrics.write();
                        let elapsed_secs = (now.saturating_sub(last_tick)) as f64 / 1000.0;
                        if elapsed_secs > 0.0 {
                            let delta = m.events_published.saturating_sub(last_count);
                            m.throughput_per_second = delta as f64 / elapsed_secs;
                        }
                        last_count = m.events_published;
                        last_tick = now;
                    }
                    _ = rx2.changed() => {
                        if *rx2.borrow() { break; }
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(cleanup_handle);
        tasks.push(metrics_handle);
        info!("event bus started");
        Ok(())
    }

    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(Error::NotRunning);
        }
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        self.subscriptions.clear();
        self.subscribers.write().clear();
        info!("event bus stopped");
        Ok(())
    }

    pub fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
        filter: Option<Filter>,
        delivery_mode: DeliveryMode,
    ) -> Result<Subscription> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        let subscriber_id = subscriber_id.into();
        if self.subscription_count.load(Ordering::SeqCst) as usize >= self.config.max_subscribers {
            return Err(Error::CapReached("max_subscribers".to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.config.channel_buffer_size);
        let stats = Arc::new(RwLock::new(Statistics::default()));
        let last_event_ms = Arc::new(AtomicU64::new(now_ms()));

        self.subscriptions.insert(
            id.clone(),
            SubscriptionEntry {
                id: id.clone(),
                filter,
                sender: tx,
                stats: stats.clone(),
                last_event_ms: last_event_ms.clone(),
            },
        );
        {
            let mut subs = self.subscribers.write();
            subs.entry(subscriber_id.clone()).or_default().push(id.clone());
        }
        self.subscription_count.fetch_add(1, Ordering::SeqCst);

        Ok(Subscription {
            id,
            subscriber_id,
            delivery_mode,
            receiver: rx,
            stats,
        })
    }

    pub fn unsubscribe(&self, subscriber_id: &str, subscription_id: &str) -> Result<()> {
        self.subscriptions
            .remove(subscription_id)
            .ok_or_else(|| Error::NotFound(subscription_id.to_string()))?;
        self.subscription_count.fetch_sub(1, Ordering::SeqCst);

        let mut subs = self.subscribers.write();
        if let Some(list) = subs.get_mut(subscriber_id) {
            list.retain(|id| id != subscription_id);
            if list.is_empty() {
                subs.remove(subscriber_id);
            }
        }
        Ok(())
    }

    /// Non-blocking fan-out: a full subscription channel is recorded as a
    /// drop but never blocks the publisher (§4.C step 4).
    pub fn publish(&self, event: Event) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        if event.estimated_size() > self.config.max_event_size {
            return Err(Error::Validation("event exceeds max_event_size".to_string()));
        }
        if event.is_expired() {
            self.metrics.write().events_dropped += 1;
            return Err(Error::Expired);
        }

        let mut delivered = 0u64;
        let mut dropped = 0u64;
        for entry in self.subscriptions.iter() {
            let matches = entry
                .filter
                .as_ref()
                .map(|f| f.matches(&event))
                .unwrap_or(true);
            if !matches {
                continue;
            }
            let mut stats = entry.stats.write();
            stats.received += 1;
            match entry.sender.try_send(event.clone()) {
                Ok(()) => {
                    stats.delivered += 1;
                    stats.last_event_time = Some(now_ms());
                    entry.last_event_ms.store(now_ms(), Ordering::SeqCst);
                    delivered += 1;
                }
                Err(_) => {
                    stats.failed += 1;
                    dropped += 1;
                    debug!(subscription = %entry.id, "subscription channel full, dropping event");
                }
            }
        }

        let mut m = self.metrics.write();
        m.events_published += 1;
        m.events_delivered += delivered;
        m.events_dropped += dropped;
        m.last_event_time = Some(now_ms());
        Ok(())
    }

    /// Serial `publish` with per-event failure accumulation (§4.C).
    pub fn publish_batch(&self, events: Vec<Event>) -> Vec<Result<()>> {
        events.into_iter().map(|e| self.publish(e)).collect()
    }

    pub fn metrics(&self) -> BusMetrics {
        self.metrics.read().clone()
    }

    fn run_cleanup(&self) {
        let horizon = now_ms().saturating_sub(self.config.event_ttl.as_millis() as u64);
        let stale: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|e| e.last_event_ms.load(Ordering::SeqCst) < horizon)
            .map(|e| e.id.clone())
            .collect();
        for id in stale {
            self.subscriptions.remove(&id);
            self.subscription_count.fetch_sub(1, Ordering::SeqCst);
            let mut subs = self.subscribers.write();
            subs.retain(|_, list| {
                list.retain(|sid| sid != &id);
                !list.is_empty()
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nervus_core::Event;
    use serde_json::Value;

    fn mk(id: &str, t: &str) -> Event {
        Event::new(id, t, "create", "test", Value::Null).unwrap()
    }

    #[tokio::test]
    async fn publish_fifo_within_subscription() {
        let bus = EventBus::new(BusConfig {
            channel_buffer_size: 10,
            ..Default::default()
        });
        bus.start().unwrap();
        let mut sub = bus.subscribe("sub1", None, DeliveryMode::Channel).unwrap();
        bus.publish(mk("e1", "t")).unwrap();
        bus.publish(mk("e2", "t")).unwrap();
        assert_eq!(sub.receiver.recv().await.unwrap().id, "e1");
        assert_eq!(sub.receiver.recv().await.unwrap().id, "e2");
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn filter_match_routes_only_matching_events() {
        let bus = EventBus::new(BusConfig::default());
        bus.start().unwrap();
        let filter = Filter {
            types: vec!["task.completed".to_string()],
            ..Default::default()
        };
        let mut sub = bus.subscribe("sub1", Some(filter), DeliveryMode::Channel).unwrap();
        bus.publish(mk("e1", "memory.update")).unwrap();
        bus.publish(mk("e2", "task.completed")).unwrap();
        let received = sub.receiver.recv().await.unwrap();
        assert_eq!(received.id, "e2");
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn overflow_drops_without_blocking() {
        let bus = EventBus::new(BusConfig {
            channel_buffer_size: 1,
            ..Default::default()
        });
        bus.start().unwrap();
        let sub = bus.subscribe("sub1", None, DeliveryMode::Channel).unwrap();
        bus.publish(mk("e1", "t")).unwrap();
        bus.publish(mk("e2", "t")).unwrap();
        assert_eq!(bus.metrics().events_dropped, 1);
        assert_eq!(sub.stats().failed, 1);
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn partial_drop_across_subscriptions_is_counted() {
        let bus = EventBus::new(BusConfig {
            channel_buffer_size: 1,
            ..Default::default()
        });
        bus.start().unwrap();
        let mut sub_a = bus.subscribe("a", None, DeliveryMode::Channel).unwrap();
        let mut sub_b = bus.subscribe("b", None, DeliveryMode::Channel).unwrap();

        // Fills both channels (buffer size 1).
        bus.publish(mk("e1", "t")).unwrap();
        // Drain sub_b only, leaving sub_a's channel full.
        sub_b.receiver.try_recv().unwrap();

        // sub_a's channel is still full so this delivery partially fails,
        // even though sub_b receives it.
        bus.publish(mk("e2", "t")).unwrap();

        assert_eq!(sub_a.stats().failed, 1);
        assert_eq!(sub_b.stats().failed, 0);
        assert_eq!(bus.metrics().events_dropped, 1);
        sub_a.receiver.try_recv().unwrap();
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn double_start_is_typed_error() {
        let bus = EventBus::new(BusConfig::default());
        bus.start().unwrap();
        assert!(bus.start().is_err());
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_when_stopped_is_typed_error() {
        let bus = EventBus::new(BusConfig::default());
        assert!(bus.stop().await.is_err());
    }
}
