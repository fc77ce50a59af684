//! Server-side sync room: the authority for one document.
//!
//! A room owns the authoritative record store, the per-client sessions, and
//! the conflict-resolution state. It is transport-free — the WebSocket
//! server feeds messages in and dispatches the returned [`Outbound`]
//! actions — so the whole protocol state machine is testable without a
//! socket in sight.
//!
//! ```text
//! Client A ──┐
//!            ├── SyncRoom ── Store ── TransactionLog
//! Client B ──┘      │
//!                   ├── sessions {client → last acked epoch, presence}
//!                   └── field stamps {record.field → (epoch, client)}
//! ```
//!
//! ## Conflict resolution
//!
//! Pushes carry the client's observed base epoch. Every changed field is
//! stamped `(base_epoch, client_id)`; an incoming write is applied iff its
//! stamp is `>=` the stored one, compared lexicographically with the client
//! id (as u128) breaking ties. Resolution is a pure function of the stamp
//! table and the push — the outcome is identical regardless of network
//! arrival order. The resolved diff is re-broadcast to every session,
//! including the originator, whose optimistic state is corrected if it was
//! overridden. Concurrent deletion beats concurrent field writes.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use uuid::Uuid;

use easel_store::{Record, RecordDiff, RecordId, RecordProps, Store, StoreSchema};

use crate::protocol::{
    CloseReason, NackReason, ProtocolError, PushOrigin, SyncError, SyncMessage, WireDiff,
    WireRecord, PROTOCOL_VERSION,
};

/// Room configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Presence entries of a silent client are evicted after this long,
    /// independent of explicit disconnect.
    pub presence_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            presence_timeout: Duration::from_secs(60),
        }
    }
}

impl RoomConfig {
    /// Short timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            presence_timeout: Duration::from_millis(50),
        }
    }
}

/// Room counters, snapshot via [`SyncRoom::stats`].
#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub pushes_applied: u64,
    pub fields_overridden: u64,
    pub snapshots_served: u64,
    pub presence_evictions: u64,
}

/// One connected client.
struct Session {
    last_acked_epoch: u64,
    presence: Vec<RecordId>,
    last_seen: Instant,
}

/// What the transport should do with a message the room produced.
#[derive(Debug)]
pub enum Outbound {
    /// Send to the client whose message triggered this.
    Reply(SyncMessage),
    /// Fan out to every session in the room, the originator included.
    Broadcast(SyncMessage),
}

/// The per-document coordinator.
pub struct SyncRoom {
    store: Store,
    sessions: HashMap<Uuid, Session>,
    /// Last winning write per record field: `(base_epoch, client key)`.
    field_stamps: HashMap<RecordId, HashMap<String, (u64, u128)>>,
    config: RoomConfig,
    stats: RoomStats,
}

impl SyncRoom {
    pub fn new(schema: StoreSchema, config: RoomConfig) -> Self {
        Self {
            store: Store::new(schema),
            sessions: HashMap::new(),
            field_stamps: HashMap::new(),
            config,
            stats: RoomStats::default(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn stats(&self) -> RoomStats {
        self.stats.clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn epoch(&self) -> u64 {
        self.store.epoch()
    }

    /// Restore the room from persisted state: a snapshot plus the logged
    /// diff tail.
    pub fn restore(
        &mut self,
        records: Vec<Record>,
        epoch: u64,
        diffs: Vec<RecordDiff>,
    ) -> Result<(), SyncError> {
        self.store.load_snapshot(records, epoch)?;
        for diff in diffs {
            self.store.apply_diff(&diff)?;
        }
        Ok(())
    }

    /// Mutate the document server-side (no originating client). The
    /// committed diff must still be broadcast by the caller.
    pub fn local_transact<R>(
        &mut self,
        f: impl FnOnce(&mut easel_store::Transaction<'_>) -> Result<R, easel_store::StoreError>,
    ) -> Result<(R, RecordDiff), SyncError> {
        Ok(self.store.transact(f)?)
    }

    /// Handshake: version gate, session creation, bootstrap snapshot.
    pub fn handle_connect(
        &mut self,
        client_id: Uuid,
        protocol_version: u16,
        client_schema: &easel_store::SchemaFingerprint,
        now: Instant,
    ) -> Result<Vec<Outbound>, SyncError> {
        if protocol_version != PROTOCOL_VERSION {
            log::info!(
                "rejecting client {client_id}: protocol v{protocol_version} (server v{PROTOCOL_VERSION})"
            );
            return Ok(vec![
                Outbound::Reply(SyncMessage::Nack {
                    reason: NackReason::IncompatibleVersion {
                        expected: PROTOCOL_VERSION,
                        got: protocol_version,
                    },
                }),
                Outbound::Reply(SyncMessage::Close {
                    reason: CloseReason::IncompatibleVersion,
                }),
            ]);
        }
        let server_schema = self.store.schema().fingerprint();
        if !client_schema.at_or_below(&server_schema) {
            // The client is ahead of us on some collection; we cannot
            // migrate its pushes and it must not load our document.
            log::info!("rejecting client {client_id}: schema {client_schema} ahead of {server_schema}");
            return Ok(vec![
                Outbound::Reply(SyncMessage::Nack {
                    reason: NackReason::IncompatibleSchema {
                        server: server_schema,
                        client: client_schema.clone(),
                    },
                }),
                Outbound::Reply(SyncMessage::Close {
                    reason: CloseReason::IncompatibleVersion,
                }),
            ]);
        }

        self.sessions.insert(
            client_id,
            Session {
                last_acked_epoch: self.store.epoch(),
                presence: Vec::new(),
                last_seen: now,
            },
        );

        let mut out = vec![Outbound::Reply(self.snapshot_message()?)];
        // Let the new client see everyone's cursors right away.
        for record in self.store.presence_records() {
            out.push(Outbound::Reply(SyncMessage::Presence {
                record: WireRecord::from_record(&record)?,
            }));
        }
        self.stats.snapshots_served += 1;
        log::info!("client {client_id} bootstrapped at epoch {}", self.store.epoch());
        Ok(out)
    }

    /// A client push: resolve against concurrent history, commit, and
    /// re-broadcast the resolved diff to everyone.
    pub fn handle_push(
        &mut self,
        client_id: Uuid,
        push_id: u64,
        base_epoch: u64,
        diff: WireDiff,
        now: Instant,
    ) -> Result<Vec<Outbound>, SyncError> {
        self.touch(client_id, now)?;
        let diff = diff.ingest(self.store.schema())?;
        let client_key = client_id.as_u128();

        let mut staged_puts: Vec<Record> = Vec::new();
        let mut staged_deletes: Vec<RecordId> = Vec::new();
        let mut broadcast_added: Vec<Record> = Vec::new();
        let mut broadcast_updated: Vec<(Record, Record)> = Vec::new();
        let mut broadcast_removed: Vec<Record> = Vec::new();

        for record in diff.added {
            match self.store.get(&record.id) {
                None => {
                    self.stamp_all_fields(&record, base_epoch, client_key)?;
                    staged_puts.push(record.clone());
                    broadcast_added.push(record);
                }
                Some(current) => {
                    // Concurrent creation of the same id: resolve it like an
                    // update where the client changed every field.
                    let fields = record_fields(&record)?;
                    let merged =
                        self.resolve_fields(&record.id, &current, fields, base_epoch, client_key)?;
                    broadcast_updated.push(((*current).clone(), merged.clone()));
                    if merged != *current {
                        staged_puts.push(merged);
                    }
                }
            }
        }
        for (old, new) in diff.updated {
            match self.store.get(&new.id) {
                None => {
                    // Concurrently deleted: deletion wins. Tell the
                    // originator so its optimistic update is rolled back.
                    broadcast_removed.push(old);
                }
                Some(current) => {
                    let changed = changed_fields(&old, &new)?;
                    let merged =
                        self.resolve_fields(&new.id, &current, changed, base_epoch, client_key)?;
                    broadcast_updated.push(((*current).clone(), merged.clone()));
                    if merged != *current {
                        staged_puts.push(merged);
                    }
                }
            }
        }
        for record in diff.removed {
            if self.store.get(&record.id).is_some() {
                staged_deletes.push(record.id.clone());
                broadcast_removed.push(record.clone());
            }
            self.field_stamps.remove(&record.id);
        }

        let from_epoch = self.store.epoch();
        let commit = self.store.transact(|txn| {
            for record in staged_puts {
                txn.put(record);
            }
            for id in &staged_deletes {
                txn.delete(id);
            }
            Ok(())
        });
        if let Err(e) = commit {
            // Validation failed server-side; the push is rejected whole and
            // nothing was applied.
            log::warn!("push {push_id} from {client_id} rejected: {e}");
            return Ok(vec![Outbound::Reply(SyncMessage::Nack {
                reason: NackReason::Rejected {
                    reason: e.to_string(),
                },
            })]);
        }

        self.stats.pushes_applied += 1;
        let resolved = RecordDiff {
            from_epoch,
            to_epoch: self.store.epoch(),
            added: broadcast_added,
            updated: broadcast_updated,
            removed: broadcast_removed,
        };
        let msg = SyncMessage::Diff {
            diff: WireDiff::from_diff(&resolved)?,
            schema: self.store.schema().fingerprint(),
            source: Some(PushOrigin {
                client: client_id,
                push_id,
            }),
        };
        self.maybe_compact();
        Ok(vec![Outbound::Broadcast(msg)])
    }

    /// A transport-level ping; keeps the session's presence alive.
    pub fn heartbeat(&mut self, client_id: Uuid, now: Instant) -> Result<(), SyncError> {
        self.touch(client_id, now)
    }

    pub fn handle_ack(
        &mut self,
        client_id: Uuid,
        epoch: u64,
        now: Instant,
    ) -> Result<(), SyncError> {
        self.touch(client_id, now)?;
        if let Some(session) = self.sessions.get_mut(&client_id) {
            session.last_acked_epoch = session.last_acked_epoch.max(epoch);
        }
        self.maybe_compact();
        Ok(())
    }

    /// A client detected a gap (or otherwise lost the plot): serve a fresh
    /// snapshot at the current epoch.
    pub fn handle_resync(
        &mut self,
        client_id: Uuid,
        now: Instant,
    ) -> Result<Vec<Outbound>, SyncError> {
        self.touch(client_id, now)?;
        self.stats.snapshots_served += 1;
        log::info!("resyncing client {client_id} at epoch {}", self.store.epoch());
        Ok(vec![Outbound::Reply(self.snapshot_message()?)])
    }

    /// Presence update: validated, stored ephemerally, broadcast
    /// immediately on its own channel — never enters the diff log.
    pub fn handle_presence(
        &mut self,
        client_id: Uuid,
        record: WireRecord,
        now: Instant,
    ) -> Result<Vec<Outbound>, SyncError> {
        self.touch(client_id, now)?;
        let record = record.ingest(self.store.schema())?;
        let owner = match &record.props {
            RecordProps::Presence(p) => p.client,
            _ => return Err(SyncError::InvalidMessage("presence update with non-presence record")),
        };
        if owner != client_id {
            return Err(SyncError::InvalidMessage(
                "presence record owned by another client",
            ));
        }
        self.store.transact(|txn| {
            txn.put(record.clone());
            Ok(())
        })?;
        if let Some(session) = self.sessions.get_mut(&client_id) {
            if !session.presence.contains(&record.id) {
                session.presence.push(record.id.clone());
            }
        }
        Ok(vec![Outbound::Broadcast(SyncMessage::Presence {
            record: WireRecord::from_record(&record)?,
        })])
    }

    /// Explicit disconnect: evict the session and its presence records.
    /// Durable records are untouched.
    pub fn disconnect(&mut self, client_id: Uuid) -> Vec<Outbound> {
        let session = match self.sessions.remove(&client_id) {
            Some(session) => session,
            None => return Vec::new(),
        };
        log::info!("client {client_id} disconnected");
        self.evict_presence(session.presence)
    }

    /// Heartbeat sweep: evict sessions silent past the presence timeout.
    /// Returns the evicted client ids and the broadcasts to send.
    pub fn evict_stale(&mut self, now: Instant) -> (Vec<Uuid>, Vec<Outbound>) {
        let timeout = self.config.presence_timeout;
        let stale: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        let mut out = Vec::new();
        for client_id in &stale {
            if let Some(session) = self.sessions.remove(client_id) {
                log::info!("evicting client {client_id} after heartbeat timeout");
                out.extend(self.evict_presence(session.presence));
            }
        }
        (stale, out)
    }

    /// The bootstrap message: all durable records at the current epoch.
    pub fn snapshot_message(&self) -> Result<SyncMessage, SyncError> {
        let records = self
            .store
            .durable_records()
            .iter()
            .map(WireRecord::from_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SyncMessage::Snapshot {
            epoch: self.store.epoch(),
            schema: self.store.schema().fingerprint(),
            records,
        })
    }

    // ── internals ──────────────────────────────────────────────────

    fn touch(&mut self, client_id: Uuid, now: Instant) -> Result<(), SyncError> {
        match self.sessions.get_mut(&client_id) {
            Some(session) => {
                session.last_seen = now;
                Ok(())
            }
            None => Err(SyncError::UnknownClient(client_id)),
        }
    }

    fn evict_presence(&mut self, presence: Vec<RecordId>) -> Vec<Outbound> {
        let mut out = Vec::new();
        for id in presence {
            let removed = self.store.transact(|txn| {
                let existed = txn.contains(&id);
                txn.delete(&id);
                Ok(existed)
            });
            match removed {
                Ok((true, _)) => {
                    self.stats.presence_evictions += 1;
                    out.push(Outbound::Broadcast(SyncMessage::PresenceGone { id }));
                }
                Ok((false, _)) => {}
                Err(e) => log::error!("presence eviction failed: {e}"),
            }
        }
        out
    }

    /// Per-field last-writer-wins. Returns the post-resolution record.
    fn resolve_fields(
        &mut self,
        id: &RecordId,
        current: &Record,
        changed: BTreeMap<String, serde_json::Value>,
        base_epoch: u64,
        client_key: u128,
    ) -> Result<Record, SyncError> {
        let mut fields = record_fields(current)?;
        let stamps = self.field_stamps.entry(id.clone()).or_default();
        let incoming = (base_epoch, client_key);
        for (field, value) in changed {
            let existing = stamps.get(&field).copied().unwrap_or((0, 0));
            // `>=` so a client's own pipelined writes at one base epoch
            // apply in send order; distinct clients can never tie.
            if incoming >= existing {
                fields.insert(field.clone(), value);
                stamps.insert(field, incoming);
            } else {
                self.stats.fields_overridden += 1;
                log::debug!(
                    "field `{field}` of {id} kept stamp {existing:?} over {incoming:?}"
                );
            }
        }
        let props = RecordProps::from_json(
            id.kind(),
            serde_json::Value::Object(fields.into_iter().collect()),
        )
        .map_err(|e| SyncError::Protocol(ProtocolError::Props(e.to_string())))?;
        Ok(Record::new(id.clone(), current.version, props))
    }

    fn stamp_all_fields(
        &mut self,
        record: &Record,
        base_epoch: u64,
        client_key: u128,
    ) -> Result<(), SyncError> {
        let fields = record_fields(record)?;
        let stamps = self.field_stamps.entry(record.id.clone()).or_default();
        for field in fields.keys() {
            stamps.insert(field.clone(), (base_epoch, client_key));
        }
        Ok(())
    }

    fn maybe_compact(&mut self) {
        if !self.store.log().needs_compaction() {
            return;
        }
        let min_acked = self
            .sessions
            .values()
            .map(|s| s.last_acked_epoch)
            .min()
            .unwrap_or(self.store.epoch());
        self.store.log_mut().compact(min_acked);
    }
}

/// Props of a record as a field map.
fn record_fields(record: &Record) -> Result<BTreeMap<String, serde_json::Value>, SyncError> {
    let value = record
        .props
        .to_json()
        .map_err(|e| SyncError::Protocol(ProtocolError::Props(e.to_string())))?;
    match value {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(SyncError::InvalidMessage("record props are not an object")),
    }
}

/// Fields whose value differs between the client's base and its proposed
/// record — i.e. what the client actually changed.
fn changed_fields(
    old: &Record,
    new: &Record,
) -> Result<BTreeMap<String, serde_json::Value>, SyncError> {
    let old_fields = record_fields(old)?;
    let new_fields = record_fields(new)?;
    Ok(new_fields
        .into_iter()
        .filter(|(field, value)| old_fields.get(field) != Some(value))
        .collect())
}
