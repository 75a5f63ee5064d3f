//! External transport contracts the distributor dispatches against (§6).
//! Real implementations live in the server binary; tests use recording
//! stand-ins.

use async_trait::async_trait;
use nervus_core::Result;
use serde_json::Value;
use std::collections::HashMap;

/// Push payload synthesized from an event for mobile/webhook subscribers.
#[derive(Debug, Clone)]
pub struct PushNotification {
    pub id: String,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub data: HashMap<String, Value>,
    pub priority: String,
}

#[async_trait]
pub trait WebSocketTransport: Send + Sync {
    async fn send_to_connection(&self, connection_id: &str, bytes: Vec<u8>) -> Result<()>;
    async fn send_to_session(&self, session_id: &str, bytes: Vec<u8>) -> Result<()>;
    async fn broadcast_to_all(&self, bytes: Vec<u8>) -> Result<()>;
    async fn get_active_connections(&self) -> Vec<String>;
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send_notification(&self, endpoint_id: &str, notification: PushNotification) -> Result<()>;
    async fn send_batch(&self, batch: Vec<(String, PushNotification)>) -> Result<()> {
        for (endpoint_id, notification) in batch {
            self.send_notification(&endpoint_id, notification).await?;
        }
        Ok(())
    }
    async fn get_active_endpoints(&self) -> Vec<String>;
}
