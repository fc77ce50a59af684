//! Fan-out broadcast to every session in a room.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Each
//! connection holds an independent receiver buffering up to `capacity`
//! messages; a connection that lags past that starts dropping and will
//! detect the gap through the protocol (epoch check → resync), so slow
//! consumers cannot stall the room.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

/// A broadcast group for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashSet<Uuid>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is the per-receiver buffer before lagging peers start
    /// dropping messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, client_id: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.peers.write().await.insert(client_id);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, client_id: &Uuid) -> bool {
        self.peers.write().await.remove(client_id)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, client_id: &Uuid) -> bool {
        self.peers.read().await.contains(client_id)
    }

    /// Encode once, send to all receivers. Returns the receiver count.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Send pre-encoded bytes. Lock-free hot path.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_remove_peer() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::from_u128(1);

        let _rx = group.add_peer(alice).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&alice).await);

        assert!(group.remove_peer(&alice).await);
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_receiver() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.add_peer(Uuid::from_u128(1)).await;
        let mut rx2 = group.add_peer(Uuid::from_u128(2)).await;
        let mut rx3 = group.add_peer(Uuid::from_u128(3)).await;

        let count = group.broadcast(&SyncMessage::Ping).unwrap();
        assert_eq!(count, 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let bytes = rx.recv().await.unwrap();
            assert_eq!(SyncMessage::decode(&bytes).unwrap(), SyncMessage::Ping);
        }
    }

    #[tokio::test]
    async fn test_broadcast_raw_zero_copy() {
        let group = BroadcastGroup::new(16);
        let mut rx = group.add_peer(Uuid::from_u128(1)).await;

        let payload = Arc::new(SyncMessage::Pong.encode().unwrap());
        let count = group.broadcast_raw(payload.clone());
        assert_eq!(count, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(*received, *payload);
    }

    #[tokio::test]
    async fn test_stats() {
        let group = BroadcastGroup::new(16);
        let _rx = group.add_peer(Uuid::from_u128(1)).await;
        group.broadcast(&SyncMessage::Ping).unwrap();
        group.broadcast(&SyncMessage::Ping).unwrap();

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.active_peers, 1);
    }
}
