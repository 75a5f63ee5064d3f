//! Connection registry backing the `/ws` route and the distributor's
//! `WebSocketTransport`. One entry per live socket, keyed by a
//! server-generated connection id and (optionally) a client-supplied
//! session id for fan-out to every connection a session owns.

use async_trait::async_trait;
use nervus_core::{Error, Result};
use nervus_distributor::WebSocketTransport;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::debug;

pub struct WebSocketManager {
    connections: RwLock<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
    sessions: RwLock<HashMap<String, HashSet<String>>>,
}

impl WebSocketManager {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        connection_id: String,
        session_id: Option<String>,
        sender: mpsc::UnboundedSender<Vec<u8>>,
    ) {
        self.connections.write().insert(connection_id.clone(), sender);
        if let Some(session_id) = session_id {
            self.sessions
                .write()
                .entry(session_id)
                .or_default()
                .insert(connection_id);
        }
    }

    pub fn unregister(&self, connection_id: &str) {
        self.connections.write().remove(connection_id);
        let mut sessions = self.sessions.write();
        sessions.retain(|_, members| {
            members.remove(connection_id);
            !members.is_empty()
        });
        debug!(connection_id, "websocket connection unregistered");
    }
}

#[async_trait]
impl WebSocketTransport for WebSocketManager {
    async fn send_to_connection(&self, connection_id: &str, bytes: Vec<u8>) -> Result<()> {
        let sender = self.connections.read().get(connection_id).cloned();
        match sender {
            Some(tx) => tx
                .send(bytes)
                .map_err(|_| Error::TransportFailed(format!("connection {connection_id} closed"))),
            None => Err(Error::TransportFailed(format!("connection {connection_id} not found"))),
        }
    }

    async fn send_to_session(&self, session_id: &str, bytes: Vec<u8>) -> Result<()> {
        let members = self.sessions.read().get(session_id).cloned().unwrap_or_default();
        if members.is_empty() {
            return Err(Error::TransportFailed(format!("no connections for session {session_id}")));
        }
        let connections = self.connections.read();
        let mut delivered = false;
        for connection_id in members {
            if let Some(tx) = connections.get(&connection_id) {
                if tx.send(bytes.clone()).is_ok() {
                    delivered = true;
                }
            }
        }
        if delivered {
            Ok(())
        } else {
            Err(Error::TransportFailed(format!("session {session_id} has no live connections")))
        }
    }

    async fn broadcast_to_all(&self, bytes: Vec<u8>) -> Result<()> {
        for sender in self.connections.read().values() {
            let _ = sender.send(bytes.clone());
        }
        Ok(())
    }

    async fn get_active_connections(&self) -> Vec<String> {
        self.connections.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_to_connection_delivers_and_reports_active() {
        let manager = WebSocketManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.register("conn-1".into(), None, tx);

        manager.send_to_connection("conn-1", b"hello".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"hello");
        assert_eq!(manager.get_active_connections().await, vec!["conn-1".to_string()]);
    }

    #[tokio::test]
    async fn send_to_unknown_connection_is_transport_error() {
        let manager = WebSocketManager::new();
        let err = manager.send_to_connection("missing", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, Error::TransportFailed(_)));
    }

    #[tokio::test]
    async fn send_to_session_fans_out_to_every_member_connection() {
        let manager = WebSocketManager::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        manager.register("conn-1".into(), Some("session-a".into()), tx1);
        manager.register("conn-2".into(), Some("session-a".into()), tx2);

        manager.send_to_session("session-a", b"payload".to_vec()).await.unwrap();
        assert_eq!(rx1.recv().await.unwrap(), b"payload");
        assert_eq!(rx2.recv().await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn unregister_drops_connection_and_session_membership() {
        let manager = WebSocketManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.register("conn-1".into(), Some("session-a".into()), tx);

        manager.unregister("conn-1");

        assert!(manager.get_active_connections().await.is_empty());
        let err = manager.send_to_session("session-a", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, Error::TransportFailed(_)));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_registered_connection() {
        let manager = WebSocketManager::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        manager.register("conn-1".into(), None, tx1);
        manager.register("conn-2".into(), None, tx2);

        manager.broadcast_to_all(b"all".to_vec()).await.unwrap();
        assert_eq!(rx1.recv().await.unwrap(), b"all");
        assert_eq!(rx2.recv().await.unwrap(), b"all");
    }
}
