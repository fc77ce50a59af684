//! Sync client: a pure session state machine plus a WebSocket transport.
//!
//! [`ClientSession`] is the protocol brain — `Connecting → Bootstrapping →
//! Live → (Resyncing | Closed)` — with no I/O of its own: the transport
//! feeds decoded messages in and sends whatever comes back out. That keeps
//! every reconnect/conflict/resync path testable without a socket.
//!
//! Local mutations apply optimistically to the local store and queue a
//! `Push`. While disconnected the queue simply buffers (the offline queue);
//! on the next snapshot the pending pushes are rebased and replayed if they
//! still apply, else dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use futures_util::{SinkExt, StreamExt};

use easel_store::{Record, RecordDiff, RecordId, RecordProps, Store, StoreSchema};

use crate::protocol::{
    NackReason, ProtocolError, SyncError, SyncMessage, WireDiff, WireRecord, PROTOCOL_VERSION,
};

/// Client session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Bootstrapping,
    Live,
    Resyncing,
    Closed,
}

/// Events surfaced to the application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Bootstrapping or resync finished; the local store is authoritative.
    Live,
    Disconnected,
    /// A server diff was applied to the local store.
    RemoteDiff(RecordDiff),
    PresenceChanged(Record),
    PresenceRemoved(RecordId),
    /// The server refused us; the session is closed and the user must
    /// reload or upgrade.
    Rejected(NackReason),
    /// Gap detected; a fresh snapshot is on its way.
    Resyncing,
    /// A pending optimistic push no longer applied after resync.
    PushDropped(u64),
}

/// Result of feeding the session one message or one local mutation.
#[derive(Debug, Default)]
pub struct ClientOutput {
    pub outgoing: Vec<SyncMessage>,
    pub events: Vec<ClientEvent>,
}

/// An optimistic local mutation awaiting server resolution.
#[derive(Debug, Clone)]
pub struct PendingPush {
    pub push_id: u64,
    pub base_epoch: u64,
    pub diff: RecordDiff,
}

/// The transport-free client state machine.
pub struct ClientSession {
    client_id: Uuid,
    document: Uuid,
    store: Store,
    state: SessionState,
    /// Epoch of the last server diff or snapshot we hold.
    server_epoch: u64,
    pending: VecDeque<PendingPush>,
    next_push_id: u64,
}

impl ClientSession {
    pub fn new(client_id: Uuid, document: Uuid, schema: StoreSchema) -> Self {
        Self {
            client_id,
            document,
            store: Store::new(schema),
            state: SessionState::Connecting,
            server_epoch: 0,
            pending: VecDeque::new(),
            next_push_id: 0,
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn document(&self) -> Uuid {
        self.document
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn server_epoch(&self) -> u64 {
        self.server_epoch
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Read access to the local store for the UI layer.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The handshake to send once the transport is up.
    pub fn handshake(&mut self) -> SyncMessage {
        self.state = SessionState::Bootstrapping;
        SyncMessage::Handshake {
            protocol_version: PROTOCOL_VERSION,
            client_id: self.client_id,
            document: self.document,
            schema: self.store.schema().fingerprint(),
        }
    }

    /// The transport dropped; pending pushes keep buffering.
    pub fn transport_lost(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Connecting;
        }
    }

    /// Apply a local mutation optimistically and queue it for the server.
    pub fn mutate<R>(
        &mut self,
        f: impl FnOnce(&mut easel_store::Transaction<'_>) -> Result<R, easel_store::StoreError>,
    ) -> Result<(R, ClientOutput), SyncError> {
        if self.state == SessionState::Closed {
            return Err(SyncError::InvalidMessage("session is closed"));
        }
        let (out, diff) = self.store.transact(f)?;
        let mut output = ClientOutput::default();

        // Own presence changes go out immediately on the light channel.
        for record in diff.added.iter().chain(diff.updated.iter().map(|(_, n)| n)) {
            if let RecordProps::Presence(p) = &record.props {
                if p.client == self.client_id && self.state == SessionState::Live {
                    output
                        .outgoing
                        .push(SyncMessage::Presence {
                            record: WireRecord::from_record(record)?,
                        });
                }
            }
        }

        let durable = diff.durable();
        if !durable.is_empty() {
            let push = PendingPush {
                push_id: self.next_push_id,
                base_epoch: self.server_epoch,
                diff: durable,
            };
            self.next_push_id += 1;
            if self.state == SessionState::Live {
                output.outgoing.push(self.push_message(&push)?);
            }
            self.pending.push_back(push);
        }
        Ok((out, output))
    }

    /// Feed one decoded server message through the state machine.
    pub fn handle_message(&mut self, msg: SyncMessage) -> Result<ClientOutput, SyncError> {
        if self.state == SessionState::Closed {
            return Ok(ClientOutput::default());
        }
        match msg {
            SyncMessage::Snapshot { epoch, records, .. } => self.on_snapshot(epoch, records),
            SyncMessage::Diff { diff, source, .. } => self.on_diff(diff, source),
            SyncMessage::Presence { record } => self.on_presence(record),
            SyncMessage::PresenceGone { id } => self.on_presence_gone(id),
            SyncMessage::Nack { reason } => self.on_nack(reason),
            SyncMessage::Ping => Ok(ClientOutput {
                outgoing: vec![SyncMessage::Pong],
                events: Vec::new(),
            }),
            SyncMessage::Pong => Ok(ClientOutput::default()),
            SyncMessage::Close { .. } => {
                self.state = SessionState::Closed;
                Ok(ClientOutput {
                    outgoing: Vec::new(),
                    events: vec![ClientEvent::Disconnected],
                })
            }
            other => {
                log::debug!("ignoring unexpected {} from server", other.kind_name());
                Ok(ClientOutput::default())
            }
        }
    }

    fn on_snapshot(
        &mut self,
        epoch: u64,
        records: Vec<WireRecord>,
    ) -> Result<ClientOutput, SyncError> {
        let mut ingested = Vec::with_capacity(records.len());
        for record in records {
            ingested.push(record.ingest(self.store.schema())?);
        }
        self.store.load_snapshot(ingested, epoch)?;
        self.server_epoch = epoch;

        // Rebase and replay optimistic pushes on top of the fresh snapshot;
        // pushes that no longer apply are dropped.
        let mut output = ClientOutput::default();
        let pending = std::mem::take(&mut self.pending);
        for mut push in pending {
            match self.store.apply_diff(&push.diff) {
                Ok(_) => {
                    push.base_epoch = epoch;
                    output.outgoing.push(self.push_message(&push)?);
                    self.pending.push_back(push);
                }
                Err(e) => {
                    log::info!("dropping stale push {}: {e}", push.push_id);
                    output.events.push(ClientEvent::PushDropped(push.push_id));
                }
            }
        }

        self.state = SessionState::Live;
        output.events.push(ClientEvent::Live);
        Ok(output)
    }

    fn on_diff(
        &mut self,
        diff: WireDiff,
        source: Option<crate::protocol::PushOrigin>,
    ) -> Result<ClientOutput, SyncError> {
        if self.state != SessionState::Live {
            log::debug!("ignoring diff while {:?}", self.state);
            return Ok(ClientOutput::default());
        }
        let diff = diff.ingest(self.store.schema())?;
        if diff.from_epoch != self.server_epoch {
            return Ok(self.start_resync(diff.from_epoch));
        }
        if let Some(origin) = source {
            if origin.client == self.client_id {
                self.pending.retain(|p| p.push_id != origin.push_id);
            }
        }
        if let Err(e) = self.store.apply_diff(&diff) {
            log::warn!("server diff failed to apply locally: {e}");
            return Ok(self.start_resync(diff.from_epoch));
        }
        self.server_epoch = diff.to_epoch;

        let mut output = ClientOutput::default();
        if diff.to_epoch > diff.from_epoch {
            output.outgoing.push(SyncMessage::Ack {
                epoch: diff.to_epoch,
            });
        }
        output.events.push(ClientEvent::RemoteDiff(diff));
        Ok(output)
    }

    fn start_resync(&mut self, got: u64) -> ClientOutput {
        self.state = SessionState::Resyncing;
        ClientOutput {
            outgoing: vec![SyncMessage::Nack {
                reason: NackReason::SyncGap {
                    expected: self.server_epoch,
                    got,
                },
            }],
            events: vec![ClientEvent::Resyncing],
        }
    }

    fn on_presence(&mut self, record: WireRecord) -> Result<ClientOutput, SyncError> {
        let record = record.ingest(self.store.schema())?;
        if let RecordProps::Presence(p) = &record.props {
            // Our own update echoed back.
            if p.client == self.client_id {
                return Ok(ClientOutput::default());
            }
        }
        self.store.transact(|txn| {
            txn.put(record.clone());
            Ok(())
        })?;
        Ok(ClientOutput {
            outgoing: Vec::new(),
            events: vec![ClientEvent::PresenceChanged(record)],
        })
    }

    fn on_presence_gone(&mut self, id: RecordId) -> Result<ClientOutput, SyncError> {
        self.store.transact(|txn| {
            txn.delete(&id);
            Ok(())
        })?;
        Ok(ClientOutput {
            outgoing: Vec::new(),
            events: vec![ClientEvent::PresenceRemoved(id)],
        })
    }

    fn on_nack(&mut self, reason: NackReason) -> Result<ClientOutput, SyncError> {
        match reason {
            NackReason::IncompatibleVersion { .. } | NackReason::IncompatibleSchema { .. } => {
                // Irrecoverable: surface "please reload/upgrade".
                self.state = SessionState::Closed;
                Ok(ClientOutput {
                    outgoing: Vec::new(),
                    events: vec![ClientEvent::Rejected(reason)],
                })
            }
            NackReason::Rejected { .. } => {
                // One of our pushes was refused server-side. Resync: the
                // snapshot replay revalidates every pending push and drops
                // the bad one.
                let mut output = self.start_resync(self.server_epoch);
                output.events.push(ClientEvent::Rejected(reason));
                Ok(output)
            }
            NackReason::SyncGap { .. } => Ok(ClientOutput::default()),
        }
    }

    fn push_message(&self, push: &PendingPush) -> Result<SyncMessage, SyncError> {
        Ok(SyncMessage::Push {
            push_id: push.push_id,
            base_epoch: push.base_epoch,
            diff: WireDiff::from_diff(&push.diff)?,
            schema: self.store.schema().fingerprint(),
        })
    }
}

/// WebSocket transport around a [`ClientSession`].
///
/// Spawns a writer task (mpsc → socket) and a reader task (socket →
/// session → events); the application consumes events from
/// [`take_event_rx`](Self::take_event_rx) and mutates through
/// [`mutate`](Self::mutate).
pub struct SyncClient {
    session: Arc<Mutex<ClientSession>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    server_url: String,
}

impl SyncClient {
    pub fn new(
        client_id: Uuid,
        document: Uuid,
        schema: StoreSchema,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            session: Arc::new(Mutex::new(ClientSession::new(client_id, document, schema))),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Shared handle to the session, e.g. for store reads.
    pub fn session(&self) -> Arc<Mutex<ClientSession>> {
        self.session.clone()
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Connect, send the handshake, and spawn the pump tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.server_url)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx.clone());

        // Writer task: forward the outgoing channel to the socket.
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        // Handshake first.
        let handshake = {
            let mut session = self.session.lock().await;
            session.handshake()
        };
        let encoded = handshake.encode()?;
        out_tx
            .send(encoded)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        // Reader task: socket → session → events.
        let session = self.session.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let decoded = match SyncMessage::decode(&bytes) {
                            Ok(decoded) => decoded,
                            Err(e) => {
                                log::warn!("undecodable message from server: {e}");
                                continue;
                            }
                        };
                        let output = {
                            let mut session = session.lock().await;
                            session.handle_message(decoded)
                        };
                        match output {
                            Ok(output) => {
                                for msg in output.outgoing {
                                    if let Ok(encoded) = msg.encode() {
                                        let _ = out_tx.send(encoded).await;
                                    }
                                }
                                for event in output.events {
                                    let _ = event_tx.send(event).await;
                                }
                            }
                            Err(e) => log::warn!("session error: {e}"),
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            {
                let mut session = session.lock().await;
                session.transport_lost();
            }
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Run a local mutation and ship the resulting messages.
    pub async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut easel_store::Transaction<'_>) -> Result<R, easel_store::StoreError>,
    ) -> Result<R, SyncError> {
        let (out, output) = {
            let mut session = self.session.lock().await;
            session.mutate(f)?
        };
        self.send_all(output.outgoing).await;
        Ok(out)
    }

    /// Heartbeat ping.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let encoded = SyncMessage::Ping.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn send_all(&self, messages: Vec<SyncMessage>) {
        let tx = match &self.outgoing_tx {
            Some(tx) => tx,
            None => return,
        };
        for msg in messages {
            match msg.encode() {
                Ok(encoded) => {
                    let _ = tx.send(encoded).await;
                }
                Err(e) => log::warn!("failed to encode {}: {e}", msg.kind_name()),
            }
        }
    }
}
