//! In-memory push transport. Real push delivery (APNs, FCM, webhooks) is an
//! external collaborator the distributor dispatches against but does not
//! own; this stub gives the binary something concrete to run and gives
//! integrators a drop-in extension point.

use async_trait::async_trait;
use nervus_core::Result;
use nervus_distributor::{PushNotification, PushTransport};
use parking_lot::RwLock;
use std::collections::HashSet;
use tracing::info;

pub struct LoggingPushTransport {
    endpoints: RwLock<HashSet<String>>,
}

impl LoggingPushTransport {
    pub fn new() -> Self {
        Self { endpoints: RwLock::new(HashSet::new()) }
    }
}

#[async_trait]
impl PushTransport for LoggingPushTransport {
    async fn send_notification(&self, endpoint_id: &str, notification: PushNotification) -> Result<()> {
        self.endpoints.write().insert(endpoint_id.to_string());
        info!(
            endpoint_id,
            notification_id = %notification.id,
            title = %notification.title,
            priority = %notification.priority,
            "push notification dispatched"
        );
        Ok(())
    }

    async fn get_active_endpoints(&self) -> Vec<String> {
        self.endpoints.read().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn records_endpoint_after_send() {
        let transport = LoggingPushTransport::new();
        let notification = PushNotification {
            id: "n1".into(),
            notification_type: "alert".into(),
            title: "title".into(),
            message: "message".into(),
            data: HashMap::new(),
            priority: "high".into(),
        };
        transport.send_notification("endpoint-1", notification).await.unwrap();
        assert_eq!(transport.get_active_endpoints().await, vec!["endpoint-1".to_string()]);
    }
}
