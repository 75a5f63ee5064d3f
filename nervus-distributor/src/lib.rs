//! Event Distributor: public ingress that chains Filter Engine ->
//! match-subscriptions -> multi-transport delivery -> Store -> Metrics
//! across a worker pool (§4.F).

mod transport;

pub use transport::{PushNotification, PushTransport, WebSocketTransport};

use dashmap::DashMap;
use nervus_bus::EventBus;
use nervus_core::{DistributorConfig, Error, Event, Filter, Priority, Result};
use nervus_filter::FilterEngine;
use nervus_metrics::MetricsCollector;
use nervus_store::EventStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The subscriber-addressed delivery transport a `DistributionSubscription`
/// wants its events routed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Bus,
    WebSocket,
    Push,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberType {
    WebSocket,
    Push,
    Cli,
    Webhook,
}

/// Higher-level binding: subscriber id/type, filter, delivery modes,
/// priority and per-subscription retry/dedup/batching/compression toggles.
#[derive(Debug, Clone)]
pub struct DistributionSubscription {
    pub id: String,
    pub subscriber_id: String,
    pub subscriber_type: SubscriberType,
    pub filter: Option<Filter>,
    pub delivery_modes: Vec<DeliveryMode>,
    pub priority: i64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub dedup_enabled: bool,
    pub batching_enabled: bool,
    pub compression_enabled: bool,
}

impl DistributionSubscription {
    pub fn new(subscriber_id: impl Into<String>, subscriber_type: SubscriberType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            subscriber_id: subscriber_id.into(),
            subscriber_type,
            filter: None,
            delivery_modes: Vec::new(),
            priority: 0,
            max_retries: 0,
            retry_delay_ms: 0,
            dedup_enabled: false,
            batching_enabled: false,
            compression_enabled: false,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_delivery_modes(mut self, modes: Vec<DeliveryMode>) -> Self {
        self.delivery_modes = modes;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionStats {
    pub received: u64,
    pub delivered: u64,
    pub failed: u64,
    pub average_latency_ms: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub duration_ms: f64,
    pub timestamp: u64,
    pub attempt: u32,
}

/// One unit of distributor work: the (possibly filter-transformed) event,
/// its matched subscriptions sorted priority descending, and the delivery
/// results keyed `subscription_id + "_" + mode` as they're produced.
#[derive(Debug, Clone)]
pub struct DistributionEvent {
    pub event: Event,
    pub matched_subscriptions: Vec<String>,
    pub priority: Priority,
    pub attempts: u32,
    pub last_attempt: Option<u64>,
    pub delivery_results: HashMap<String, DeliveryResult>,
}

struct SubscriptionRecord {
    subscription: DistributionSubscription,
    stats: std::sync::RwLock<SubscriptionStats>,
}

fn ema(prev: f64, sample: f64, new_weight: f64) -> f64 {
    (1.0 - new_weight) * prev + new_weight * sample
}

fn push_priority(priority: Priority) -> &'static str {
    match priority {
        Priority::Critical => "critical",
        Priority::High => "high",
        Priority::Normal => "normal",
        Priority::Low => "low",
    }
}

/// Orchestrates ingress, filtering, subscription matching, worker-pool
/// fan-out over Bus/WebSocket/Push, persistence and metrics recording.
pub struct EventDistributor {
    config: DistributorConfig,
    bus: Option<Arc<EventBus>>,
    store: Option<Arc<EventStore>>,
    metrics: Option<Arc<MetricsCollector>>,
    filter_engine: Option<Arc<std::sync::RwLock<FilterEngine>>>,
    websocket: Option<Arc<dyn WebSocketTransport>>,
    push: Option<Arc<dyn PushTransport>>,
    subscriptions: DashMap<String, SubscriptionRecord>,
    queue_tx: std::sync::Mutex<Option<mpsc::Sender<DistributionEvent>>>,
    running: AtomicBool,
    events_distributed: AtomicU64,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl EventDistributor {
    pub fn new(config: DistributorConfig) -> Arc<Self> {
        let (tx, rx) = watch::channel(false);
        Arc::new(Self {
            config,
            bus: None,
            store: None,
            metrics: None,
            filter_engine: None,
            websocket: None,
            push: None,
            subscriptions: DashMap::new(),
            queue_tx: std::sync::Mutex::new(None),
            running: AtomicBool::new(false),
            events_distributed: AtomicU64::new(0),
            tasks: std::sync::Mutex::new(Vec::new()),
            shutdown: tx,
            shutdown_rx: rx,
        })
    }

    pub fn with_bus(self: Arc<Self>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self { bus: Some(bus), ..unwrap_arc(self) })
    }

    pub fn with_store(self: Arc<Self>, store: Arc<EventStore>) -> Arc<Self> {
        Arc::new(Self { store: Some(store), ..unwrap_arc(self) })
    }

    pub fn with_metrics(self: Arc<Self>, metrics: Arc<MetricsCollector>) -> Arc<Self> {
        Arc::new(Self { metrics: Some(metrics), ..unwrap_arc(self) })
    }

    pub fn with_filter_engine(self: Arc<Self>, engine: FilterEngine) -> Arc<Self> {
        Arc::new(Self {
            filter_engine: Some(Arc::new(std::sync::RwLock::new(engine))),
            ..unwrap_arc(self)
        })
    }

    pub fn with_websocket_transport(self: Arc<Self>, transport: Arc<dyn WebSocketTransport>) -> Arc<Self> {
        Arc::new(Self { websocket: Some(transport), ..unwrap_arc(self) })
    }

    pub fn with_push_transport(self: Arc<Self>, transport: Arc<dyn PushTransport>) -> Arc<Self> {
        Arc::new(Self { push: Some(transport), ..unwrap_arc(self) })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, subscription: DistributionSubscription) -> Result<String> {
        let id = subscription.id.clone();
        self.subscriptions.insert(
            id.clone(),
            SubscriptionRecord {
                subscription,
                stats: std::sync::RwLock::new(SubscriptionStats::default()),
            },
        );
        Ok(id)
    }

    pub fn unsubscribe(&self, id: &str) -> Result<()> {
        self.subscriptions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn subscription_stats(&self, id: &str) -> Option<SubscriptionStats> {
        self.subscriptions.get(id).map(|r| r.stats.read().unwrap().clone())
    }

    /// Launches the worker pool. Double-start is a typed error.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        let _ = self.shutdown.send(false);

        let (tx, rx) = mpsc::channel::<DistributionEvent>(self.config.queue_size);
        *self.queue_tx.lock().unwrap() = Some(tx);
        let rx = Arc::new(AsyncMutex::new(rx));

        let mut tasks = self.tasks.lock().unwrap();
        for worker_id in 0..self.config.worker_count {
            let distributor = self.clone();
            let rx = rx.clone();
            let mut shutdown_rx = self.shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = rx.lock().await;
                        tokio::select! {
                            job = guard.recv() => job,
                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() { None } else { continue }
                            }
                        }
                    };
                    match job {
                        Some(job) => distributor.process(job).await,
                        None => break,
                    }
                }
                debug!(worker_id, "distributor worker exiting");
            }));
        }
        drop(tasks);
        info!(workers = self.config.worker_count, "event distributor started");
        Ok(())
    }

    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(Error::NotRunning);
        }
        *self.queue_tx.lock().unwrap() = None;
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        info!("event distributor stopped");
        Ok(())
    }

    /// Public ingress (§4.F step 1-6).
    pub async fn distribute_event(&self, event: Event) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        let start = Instant::now();

        let mut working = event;
        if self.config.enable_filtering {
            if let Some(engine) = &self.filter_engine {
                let result = engine.read().unwrap().apply_filters(&working);
                if !result.allowed {
                    debug!(event_id = %working.id, "event denied by filter engine, suppressing");
                    return Ok(());
                }
                working = result.transformed;
            }
        }

        let mut matched: Vec<(String, i64)> = self
            .subscriptions
            .iter()
            .filter(|entry| {
                entry
                    .subscription
                    .filter
                    .as_ref()
                    .map(|f| f.matches(&working))
                    .unwrap_or(true)
            })
            .map(|entry| (entry.subscription.id.clone(), entry.subscription.priority))
            .collect();
        matched.sort_by(|a, b| b.1.cmp(&a.1));

        if matched.is_empty() {
            return Ok(());
        }

        let job = DistributionEvent {
            event: working.clone(),
            matched_subscriptions: matched.into_iter().map(|(id, _)| id).collect(),
            priority: working.priority(),
            attempts: 0,
            last_attempt: None,
            delivery_results: HashMap::new(),
        };

        let tx = self.queue_tx.lock().unwrap().clone();
        match tx {
            Some(tx) => tx
                .try_send(job)
                .map_err(|_| Error::BackpressureDrop("distributor work queue".to_string()))?,
            None => return Err(Error::NotRunning),
        }

        if self.config.enable_metrics {
            if let Some(metrics) = &self.metrics {
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                metrics.record_event(&working.event_type, &working.source, elapsed_ms, true);
            }
        }
        self.events_distributed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn process(&self, mut job: DistributionEvent) {
        job.attempts += 1;
        job.last_attempt = Some(now_ms());

        for sub_id in job.matched_subscriptions.clone() {
            let Some(record) = self.subscriptions.get(&sub_id) else {
                continue;
            };
            let modes = record.subscription.delivery_modes.clone();
            let subscriber_type = record.subscription.subscriber_type;
            let subscriber_id = record.subscription.subscriber_id.clone();
            drop(record);

            let mut any_delivered = false;
            let mut any_attempted = false;
            for mode in &modes {
                any_attempted = true;
                let started = Instant::now();
                let outcome = self
                    .deliver(mode, &subscriber_id, subscriber_type, &job.event)
                    .await;
                let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                let success = outcome.is_ok();
                if success {
                    any_delivered = true;
                } else if let Err(e) = &outcome {
                    warn!(subscription = %sub_id, mode = ?mode, error = %e, "delivery failed");
                }
                let result = DeliveryResult {
                    success,
                    status_code: if success { Some(200) } else { None },
                    error: outcome.err().map(|e| e.to_string()),
                    duration_ms,
                    timestamp: now_ms(),
                    attempt: job.attempts,
                };
                job.delivery_results
                    .insert(format!("{}_{}", sub_id, mode_key(mode)), result);
            }

            if let Some(record) = self.subscriptions.get(&sub_id) {
                let mut stats = record.stats.write().unwrap();
                if any_attempted {
                    stats.received += 1;
                    if any_delivered {
                        stats.delivered += 1;
                    } else {
                        stats.failed += 1;
                    }
                    let latency = job
                        .delivery_results
                        .values()
                        .map(|r| r.duration_ms)
                        .sum::<f64>()
                        / modes.len().max(1) as f64;
                    stats.average_latency_ms = ema(stats.average_latency_ms, latency, 0.2);
                    stats.success_rate = stats.delivered as f64 / stats.received as f64;
                }
            }
        }

        if self.config.enable_persistence {
            if let Some(store) = &self.store {
                if let Err(e) = store.store(job.event.clone()) {
                    error!(event_id = %job.event.id, error = %e, "failed to persist distributed event");
                }
            }
        }
    }

    async fn deliver(
        &self,
        mode: &DeliveryMode,
        subscriber_id: &str,
        subscriber_type: SubscriberType,
        event: &Event,
    ) -> Result<()> {
        match mode {
            DeliveryMode::Bus => {
                let bus = self.bus.as_ref().ok_or(Error::NotRunning)?;
                bus.publish(event.clone())
            }
            DeliveryMode::WebSocket => {
                if !self.config.enable_websocket {
                    return Err(Error::TransportFailed("websocket transport disabled".to_string()));
                }
                let transport = self
                    .websocket
                    .as_ref()
                    .ok_or_else(|| Error::TransportFailed("no websocket transport configured".to_string()))?;
                let bytes = event.to_json()?.into_bytes();
                if subscriber_type == SubscriberType::WebSocket {
                    transport.send_to_connection(subscriber_id, bytes).await
                } else {
                    transport.send_to_session(subscriber_id, bytes).await
                }
            }
            DeliveryMode::Push => {
                if !self.config.enable_push {
                    return Err(Error::TransportFailed("push transport disabled".to_string()));
                }
                let transport = self
                    .push
                    .as_ref()
                    .ok_or_else(|| Error::TransportFailed("no push transport configured".to_string()))?;
                let notification = PushNotification {
                    id: event.id.clone(),
                    notification_type: event.event_type.clone(),
                    title: format!("Event: {}", event.event_type),
                    message: format!("Action: {} from {}", event.action, event.source),
                    data: event.metadata.clone(),
                    priority: push_priority(event.priority()).to_string(),
                };
                transport.send_notification(subscriber_id, notification).await
            }
        }
    }
}

fn mode_key(mode: &DeliveryMode) -> &'static str {
    match mode {
        DeliveryMode::Bus => "bus",
        DeliveryMode::WebSocket => "websocket",
        DeliveryMode::Push => "push",
    }
}

/// Pulls an owned `EventDistributor` out of an `Arc` for the `with_*`
/// builder chain, cloning shared handles when the `Arc` still has other
/// referents (construction time only; no concurrent access yet).
fn unwrap_arc(arc: Arc<EventDistributor>) -> EventDistributor {
    match Arc::try_unwrap(arc) {
        Ok(inner) => inner,
        Err(arc) => EventDistributor {
            config: arc.config.clone(),
            bus: arc.bus.clone(),
            store: arc.store.clone(),
            metrics: arc.metrics.clone(),
            filter_engine: arc.filter_engine.clone(),
            websocket: arc.websocket.clone(),
            push: arc.push.clone(),
            subscriptions: DashMap::new(),
            queue_tx: std::sync::Mutex::new(None),
            running: AtomicBool::new(false),
            events_distributed: AtomicU64::new(0),
            tasks: std::sync::Mutex::new(Vec::new()),
            shutdown: arc.shutdown.clone(),
            shutdown_rx: arc.shutdown_rx.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nervus_core::BusConfig;
    use serde_json::Value as JsonValue;
    use std::sync::Mutex as StdMutex;

    struct RecordingWebSocket {
        sent: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl WebSocketTransport for RecordingWebSocket {
        async fn send_to_connection(&self, connection_id: &str, bytes: Vec<u8>) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((connection_id.to_string(), String::from_utf8_lossy(&bytes).to_string()));
            Ok(())
        }
        async fn send_to_session(&self, session_id: &str, bytes: Vec<u8>) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((session_id.to_string(), String::from_utf8_lossy(&bytes).to_string()));
            Ok(())
        }
        async fn broadcast_to_all(&self, _bytes: Vec<u8>) -> Result<()> {
            Ok(())
        }
        async fn get_active_connections(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn mk_event(id: &str, t: &str) -> Event {
        Event::new(id, t, "create", "producer", JsonValue::Null).unwrap()
    }

    #[tokio::test]
    async fn distribute_rejects_when_not_running() {
        let distributor = EventDistributor::new(DistributorConfig::default());
        let err = distributor.distribute_event(mk_event("e1", "memory.update")).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn distribute_with_no_subscriptions_is_success() {
        let distributor = EventDistributor::new(DistributorConfig::default());
        distributor.start().unwrap();
        assert!(distributor.distribute_event(mk_event("e1", "memory.update")).await.is_ok());
        distributor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn websocket_delivery_reaches_transport() {
        let transport = Arc::new(RecordingWebSocket {
            sent: StdMutex::new(Vec::new()),
        });
        let distributor = EventDistributor::new(DistributorConfig::default()).with_websocket_transport(transport.clone());
        distributor.start().unwrap();
        distributor
            .subscribe(
                DistributionSubscription::new("conn-1", SubscriberType::WebSocket)
                    .with_delivery_modes(vec![DeliveryMode::WebSocket]),
            )
            .unwrap();
        distributor.distribute_event(mk_event("e1", "memory.update")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        assert_eq!(transport.sent.lock().unwrap()[0].0, "conn-1");
        distributor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn deny_via_filter_engine_suppresses_without_error() {
        let mut engine = FilterEngine::new();
        engine
            .add_rule(nervus_filter::FilterRule {
                id: "R1".to_string(),
                logic: nervus_filter::Logic::And,
                conditions: vec![nervus_filter::Condition {
                    field: "source".to_string(),
                    operator: nervus_filter::Operator::Equals,
                    value: serde_json::json!("producer"),
                    case_sensitive: true,
                }],
                priority: 1,
                enabled: true,
                actions: vec![nervus_filter::Action::Deny],
            })
            .unwrap();
        let distributor = EventDistributor::new(DistributorConfig::default()).with_filter_engine(engine);
        distributor.start().unwrap();
        distributor
            .subscribe(DistributionSubscription::new("s1", SubscriberType::Cli).with_delivery_modes(vec![DeliveryMode::Bus]))
            .unwrap();
        let result = distributor.distribute_event(mk_event("e1", "memory.update")).await;
        assert!(result.is_ok());
        distributor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn bus_delivery_fans_out_through_bus() {
        let bus = EventBus::new(BusConfig::default());
        bus.start().unwrap();
        let mut sub = bus.subscribe("cli-1", None, nervus_bus::DeliveryMode::Channel).unwrap();

        let distributor = EventDistributor::new(DistributorConfig::default()).with_bus(bus.clone());
        distributor.start().unwrap();
        distributor
            .subscribe(DistributionSubscription::new("cli-1", SubscriberType::Cli).with_delivery_modes(vec![DeliveryMode::Bus]))
            .unwrap();
        distributor.distribute_event(mk_event("e1", "memory.update")).await.unwrap();

        let received = sub.receiver.recv().await.unwrap();
        assert_eq!(received.id, "e1");
        distributor.stop().await.unwrap();
        bus.stop().await.unwrap();
    }
}
