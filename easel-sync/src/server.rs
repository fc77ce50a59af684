//! WebSocket sync server with room-based document routing.
//!
//! ```text
//! Client A ──┐
//!            ├── Room (doc_id) ── SyncRoom ── Store ── TransactionLog
//! Client B ──┘        │
//!                     ├── BroadcastGroup (fan-out)
//!                     └── DocumentStorage (snapshot + diff log)
//! ```
//!
//! The server owns transport only: sockets, fan-out, heartbeat ticks, and
//! persistence hooks. All protocol decisions live in [`SyncRoom`]. A
//! client disconnect never touches an in-progress room transaction — rooms
//! are document-scoped, not connection-scoped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use easel_store::StoreSchema;

use crate::broadcast::BroadcastGroup;
use crate::protocol::{NackReason, SyncMessage};
use crate::room::{Outbound, RoomConfig, SyncRoom};
use crate::storage::{DocumentStorage, StorageConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Broadcast channel capacity per room.
    pub broadcast_capacity: usize,
    /// Heartbeat sweep interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Presence eviction timeout in seconds.
    pub presence_timeout_secs: u64,
    /// Persistence root (None = in-memory only).
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9100".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval_secs: 15,
            presence_timeout_secs: 60,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_diffs: u64,
    pub persisted_snapshots: u64,
}

/// One live document: coordinator plus fan-out.
struct Room {
    doc: Mutex<SyncRoom>,
    broadcast: BroadcastGroup,
}

type Rooms = Arc<RwLock<HashMap<Uuid, Arc<Room>>>>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Rooms,
    stats: Arc<RwLock<ServerStats>>,
    storage: Option<Arc<DocumentStorage>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let storage = config.storage_path.as_ref().map(|path| {
            Arc::new(
                DocumentStorage::open(StorageConfig::new(path.clone()))
                    .expect("failed to open document storage"),
            )
        });
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            storage,
        }
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Server with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Load every persisted document into a live room.
    pub async fn recover(&self) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        let storage = match &self.storage {
            Some(storage) => storage,
            None => return Ok(0),
        };
        let mut recovered = 0;
        for doc_id in storage.list_documents()? {
            match Self::open_room(&self.config, Some(storage), doc_id) {
                Ok(room) => {
                    self.rooms.write().await.insert(doc_id, Arc::new(room));
                    recovered += 1;
                    log::info!("recovered document {doc_id} from storage");
                }
                Err(e) => log::error!("failed to recover document {doc_id}: {e}"),
            }
        }
        Ok(recovered)
    }

    /// Run the accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("recovered {recovered} documents from persistent storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            let storage = self.storage.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, rooms, stats, config, storage).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Build a room, restoring persisted state when available.
    fn open_room(
        config: &ServerConfig,
        storage: Option<&Arc<DocumentStorage>>,
        doc_id: Uuid,
    ) -> Result<Room, Box<dyn std::error::Error + Send + Sync>> {
        let room_config = RoomConfig {
            presence_timeout: Duration::from_secs(config.presence_timeout_secs),
        };
        let mut doc = SyncRoom::new(StoreSchema::canvas(), room_config);
        if let Some(storage) = storage {
            if let Some((snapshot, wire_diffs)) = storage.load_document(doc_id)? {
                let schema = StoreSchema::canvas();
                let mut records = Vec::with_capacity(snapshot.records.len());
                for record in snapshot.records {
                    records.push(record.ingest(&schema)?);
                }
                let mut diffs = Vec::with_capacity(wire_diffs.len());
                for diff in wire_diffs {
                    diffs.push(diff.ingest(&schema)?);
                }
                doc.restore(records, snapshot.epoch, diffs)?;
                log::info!(
                    "restored document {doc_id} at epoch {} (+{} logged diffs)",
                    doc.epoch(),
                    doc.store().log().tail_len()
                );
            }
        }
        Ok(Room {
            doc: Mutex::new(doc),
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
        })
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Rooms,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
        storage: Option<Arc<DocumentStorage>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("websocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut client_id: Option<Uuid> = None;
        let mut doc_id: Option<Uuid> = None;
        let mut room: Option<Arc<Room>> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;
        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        'connection: loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let bytes: Vec<u8> = match msg {
                        Some(Ok(Message::Binary(data))) => data.into(),
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => break 'connection,
                        Some(Err(e)) => {
                            log::warn!("websocket error from {addr}: {e}");
                            break 'connection;
                        }
                        _ => continue,
                    };
                    {
                        let mut s = stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += bytes.len() as u64;
                    }
                    let sync_msg = match SyncMessage::decode(&bytes) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("undecodable message from {addr}: {e}");
                            continue;
                        }
                    };

                    match sync_msg {
                        SyncMessage::Handshake { protocol_version, client_id: cid, document, schema } => {
                            // Join (or create) the document room.
                            let joined = {
                                let mut rooms_w = rooms.write().await;
                                match rooms_w.get(&document) {
                                    Some(room) => room.clone(),
                                    None => {
                                        let created = Self::open_room(&config, storage.as_ref(), document)?;
                                        let created = Arc::new(created);
                                        rooms_w.insert(document, created.clone());
                                        created
                                    }
                                }
                            };
                            {
                                let mut s = stats.write().await;
                                s.active_rooms = rooms.read().await.len();
                            }

                            let outbound = {
                                let mut doc = joined.doc.lock().await;
                                doc.handle_connect(cid, protocol_version, &schema, Instant::now())
                            };
                            match outbound {
                                Ok(outbound) => {
                                    broadcast_rx = Some(joined.broadcast.add_peer(cid).await);
                                    client_id = Some(cid);
                                    doc_id = Some(document);
                                    let closing = Self::dispatch(outbound, &mut ws_sender, &joined.broadcast).await?;
                                    room = Some(joined);
                                    if closing {
                                        break 'connection;
                                    }
                                }
                                Err(e) => {
                                    log::warn!("handshake from {addr} failed: {e}");
                                    break 'connection;
                                }
                            }
                        }

                        SyncMessage::Push { push_id, base_epoch, diff, .. } => {
                            let (cid, joined) = match (client_id, &room) {
                                (Some(cid), Some(room)) => (cid, room.clone()),
                                _ => continue,
                            };
                            let outbound = {
                                let mut doc = joined.doc.lock().await;
                                doc.handle_push(cid, push_id, base_epoch, diff, Instant::now())
                            };
                            match outbound {
                                Ok(outbound) => {
                                    Self::persist_diffs(&storage, &stats, doc_id, &outbound).await;
                                    Self::dispatch(outbound, &mut ws_sender, &joined.broadcast).await?;
                                }
                                Err(e) => {
                                    log::warn!("push from {cid} failed: {e}");
                                    let nack = SyncMessage::Nack {
                                        reason: NackReason::Rejected { reason: e.to_string() },
                                    };
                                    ws_sender.send(Message::Binary(nack.encode()?.into())).await?;
                                }
                            }
                        }

                        SyncMessage::Ack { epoch } => {
                            if let (Some(cid), Some(room)) = (client_id, &room) {
                                let mut doc = room.doc.lock().await;
                                if let Err(e) = doc.handle_ack(cid, epoch, Instant::now()) {
                                    log::debug!("ack from {cid} ignored: {e}");
                                }
                            }
                        }

                        SyncMessage::Nack { reason: NackReason::SyncGap { .. } } => {
                            // The client lost the diff stream: fresh snapshot.
                            if let (Some(cid), Some(joined)) = (client_id, room.clone()) {
                                let outbound = {
                                    let mut doc = joined.doc.lock().await;
                                    doc.handle_resync(cid, Instant::now())
                                };
                                if let Ok(outbound) = outbound {
                                    Self::dispatch(outbound, &mut ws_sender, &joined.broadcast).await?;
                                }
                            }
                        }

                        SyncMessage::Presence { record } => {
                            if let (Some(cid), Some(joined)) = (client_id, room.clone()) {
                                let outbound = {
                                    let mut doc = joined.doc.lock().await;
                                    doc.handle_presence(cid, record, Instant::now())
                                };
                                match outbound {
                                    Ok(outbound) => {
                                        Self::dispatch(outbound, &mut ws_sender, &joined.broadcast).await?;
                                    }
                                    Err(e) => log::warn!("presence from {cid} rejected: {e}"),
                                }
                            }
                        }

                        SyncMessage::Ping => {
                            if let (Some(cid), Some(joined)) = (client_id, &room) {
                                let mut doc = joined.doc.lock().await;
                                let _ = doc.heartbeat(cid, Instant::now());
                            }
                            ws_sender.send(Message::Binary(SyncMessage::Pong.encode()?.into())).await?;
                        }

                        SyncMessage::Close { .. } => break 'connection,

                        other => {
                            log::debug!("unhandled {} from {addr}", other.kind_name());
                        }
                    }
                }

                // Fan-out from the room (includes our own resolved pushes).
                broadcast = async {
                    match &mut broadcast_rx {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match broadcast {
                        Ok(data) => {
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            // The client will detect the epoch gap and resync.
                            log::warn!("connection {addr} lagged by {n} broadcasts");
                        }
                        Err(_) => break 'connection,
                    }
                }

                _ = heartbeat.tick() => {
                    if let (Some(cid), Some(joined)) = (client_id, room.clone()) {
                        let (evicted, outbound) = {
                            let mut doc = joined.doc.lock().await;
                            doc.evict_stale(Instant::now())
                        };
                        Self::dispatch(outbound, &mut ws_sender, &joined.broadcast).await?;
                        if evicted.contains(&cid) {
                            log::info!("closing timed-out connection {addr}");
                            let close = SyncMessage::Close {
                                reason: crate::protocol::CloseReason::ServerShutdown,
                            };
                            let _ = ws_sender.send(Message::Binary(close.encode()?.into())).await;
                            break 'connection;
                        }
                    }
                }
            }
        }

        // Cleanup. Disconnect evicts only this client's presence; durable
        // records and any in-flight room transaction are untouched.
        if let (Some(cid), Some(did), Some(joined)) = (client_id, doc_id, room) {
            let outbound = {
                let mut doc = joined.doc.lock().await;
                doc.disconnect(cid)
            };
            for action in outbound {
                if let Outbound::Broadcast(msg) = action {
                    let _ = joined.broadcast.broadcast(&msg);
                }
            }
            joined.broadcast.remove_peer(&cid).await;

            if joined.broadcast.peer_count().await == 0 {
                if let Some(storage) = &storage {
                    let doc = joined.doc.lock().await;
                    match doc.snapshot_message() {
                        Ok(SyncMessage::Snapshot { epoch, schema, records }) => {
                            match storage.save_snapshot(did, epoch, schema, records) {
                                Ok(()) => {
                                    stats.write().await.persisted_snapshots += 1;
                                    log::info!("persisted snapshot for {did} (room closing)");
                                }
                                Err(e) => log::error!("failed to persist snapshot for {did}: {e}"),
                            }
                        }
                        Ok(_) => {}
                        Err(e) => log::error!("failed to build snapshot for {did}: {e}"),
                    }
                }
                rooms.write().await.remove(&did);
                log::info!("room {did} removed (empty)");
            }
        }

        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = rooms.read().await.len();
        Ok(())
    }

    /// Send replies on this connection, broadcasts through the room.
    /// Returns true when a Close reply was sent.
    async fn dispatch(
        outbound: Vec<Outbound>,
        ws_sender: &mut WsSink,
        broadcast: &BroadcastGroup,
    ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        let mut closing = false;
        for action in outbound {
            match action {
                Outbound::Reply(msg) => {
                    if matches!(msg, SyncMessage::Close { .. }) {
                        closing = true;
                    }
                    ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                }
                Outbound::Broadcast(msg) => {
                    let _ = broadcast.broadcast(&msg);
                }
            }
        }
        Ok(closing)
    }

    /// Persist committed diffs carried by broadcast messages.
    async fn persist_diffs(
        storage: &Option<Arc<DocumentStorage>>,
        stats: &Arc<RwLock<ServerStats>>,
        doc_id: Option<Uuid>,
        outbound: &[Outbound],
    ) {
        let (storage, doc_id) = match (storage, doc_id) {
            (Some(storage), Some(doc_id)) => (storage, doc_id),
            _ => return,
        };
        for action in outbound {
            if let Outbound::Broadcast(SyncMessage::Diff { diff, .. }) = action {
                if diff.to_epoch == diff.from_epoch {
                    continue;
                }
                match storage.append_diff(doc_id, diff) {
                    Ok(()) => stats.write().await.persisted_diffs += 1,
                    Err(e) => log::error!("failed to persist diff for {doc_id}: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9100");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 15);
        assert_eq!(config.presence_timeout_secs, 60);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9100");
        assert!(server.storage.is_none());
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::with_storage("127.0.0.1:0", dir.path().join("docs"));
        assert!(server.storage.is_some());
    }

    #[tokio::test]
    async fn test_initial_stats() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_recover_empty() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_open_room_fresh() {
        let config = ServerConfig::default();
        let room = SyncServer::open_room(&config, None, Uuid::from_u128(1)).unwrap();
        let doc = room.doc.lock().await;
        assert_eq!(doc.epoch(), 0);
        assert_eq!(doc.session_count(), 0);
    }
}
