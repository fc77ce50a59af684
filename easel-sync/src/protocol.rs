//! Binary wire protocol for record synchronization.
//!
//! The message envelope is bincode-encoded. Record payloads cross the wire
//! with their props as JSON text: bincode is not self-describing, and
//! props must stay migratable — a receiver on a different schema version
//! migrates the JSON form on ingest before it ever parses into typed
//! records.
//!
//! ```text
//! client                                server
//!   │ Handshake{proto, client, schema}    │
//!   │ ───────────────────────────────────►│  version check
//!   │◄─────────────────────────────────── │  Snapshot{epoch, records}
//!   │             ... Live ...            │
//!   │ Push{push_id, base_epoch, diff}     │
//!   │ ───────────────────────────────────►│  resolve + commit
//!   │◄─────────────────────────────────── │  Diff{diff, source}  (all clients)
//!   │ Ack{epoch}                          │
//!   │ ───────────────────────────────────►│
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use easel_store::{
    MigrationFailure, RawRecord, Record, RecordDiff, RecordId, SchemaFingerprint, StoreSchema,
};

/// Wire protocol version, checked in the handshake before anything else.
pub const PROTOCOL_VERSION: u16 = 1;

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    /// Record props failed to encode/decode as JSON.
    Props(String),
    Migration(MigrationFailure),
    ConnectionClosed,
    Timeout,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Serialization(e) => write!(f, "serialization error: {e}"),
            ProtocolError::Deserialization(e) => write!(f, "deserialization error: {e}"),
            ProtocolError::Props(e) => write!(f, "record props error: {e}"),
            ProtocolError::Migration(e) => write!(f, "{e}"),
            ProtocolError::ConnectionClosed => write!(f, "connection closed"),
            ProtocolError::Timeout => write!(f, "connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<MigrationFailure> for ProtocolError {
    fn from(e: MigrationFailure) -> Self {
        ProtocolError::Migration(e)
    }
}

/// Errors of the sync layer proper (room and client session logic).
#[derive(Debug)]
pub enum SyncError {
    Protocol(ProtocolError),
    Store(easel_store::StoreError),
    /// Message from a client without a live session.
    UnknownClient(Uuid),
    /// Message invalid in the current state.
    InvalidMessage(&'static str),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Protocol(e) => write!(f, "{e}"),
            SyncError::Store(e) => write!(f, "{e}"),
            SyncError::UnknownClient(id) => write!(f, "no session for client {id}"),
            SyncError::InvalidMessage(what) => write!(f, "invalid message: {what}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Protocol(e)
    }
}

impl From<easel_store::StoreError> for SyncError {
    fn from(e: easel_store::StoreError) -> Self {
        SyncError::Store(e)
    }
}

impl From<MigrationFailure> for SyncError {
    fn from(e: MigrationFailure) -> Self {
        SyncError::Protocol(ProtocolError::Migration(e))
    }
}

/// A record in transit: id and collection version in the envelope, props as
/// self-describing JSON so any peer can migrate on ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRecord {
    pub id: RecordId,
    pub version: u16,
    pub props: String,
}

impl WireRecord {
    pub fn from_record(record: &Record) -> Result<WireRecord, ProtocolError> {
        let props = record
            .props
            .to_json()
            .map_err(|e| ProtocolError::Props(e.to_string()))?;
        let props =
            serde_json::to_string(&props).map_err(|e| ProtocolError::Props(e.to_string()))?;
        Ok(WireRecord {
            id: record.id.clone(),
            version: record.version,
            props,
        })
    }

    pub fn into_raw(self) -> Result<RawRecord, ProtocolError> {
        let props = serde_json::from_str(&self.props)
            .map_err(|e| ProtocolError::Props(e.to_string()))?;
        Ok(RawRecord {
            id: self.id,
            version: self.version,
            props,
        })
    }

    /// Migrate to the receiver's schema and parse into a typed record.
    pub fn ingest(self, schema: &StoreSchema) -> Result<Record, ProtocolError> {
        Ok(schema.ingest(self.into_raw()?)?)
    }
}

/// A diff in transit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WireDiff {
    pub from_epoch: u64,
    pub to_epoch: u64,
    pub added: Vec<WireRecord>,
    pub updated: Vec<(WireRecord, WireRecord)>,
    pub removed: Vec<WireRecord>,
}

impl WireDiff {
    pub fn from_diff(diff: &RecordDiff) -> Result<WireDiff, ProtocolError> {
        Ok(WireDiff {
            from_epoch: diff.from_epoch,
            to_epoch: diff.to_epoch,
            added: diff
                .added
                .iter()
                .map(WireRecord::from_record)
                .collect::<Result<_, _>>()?,
            updated: diff
                .updated
                .iter()
                .map(|(old, new)| {
                    Ok((WireRecord::from_record(old)?, WireRecord::from_record(new)?))
                })
                .collect::<Result<_, ProtocolError>>()?,
            removed: diff
                .removed
                .iter()
                .map(WireRecord::from_record)
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn ingest(self, schema: &StoreSchema) -> Result<RecordDiff, ProtocolError> {
        Ok(RecordDiff {
            from_epoch: self.from_epoch,
            to_epoch: self.to_epoch,
            added: self
                .added
                .into_iter()
                .map(|r| r.ingest(schema))
                .collect::<Result<_, _>>()?,
            updated: self
                .updated
                .into_iter()
                .map(|(old, new)| Ok((old.ingest(schema)?, new.ingest(schema)?)))
                .collect::<Result<_, ProtocolError>>()?,
            removed: self
                .removed
                .into_iter()
                .map(|r| r.ingest(schema))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Why a request or connection was refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NackReason {
    /// Protocol version mismatch; refused before bootstrapping.
    IncompatibleVersion { expected: u16, got: u16 },
    /// Schema fingerprint outside the migratable range.
    IncompatibleSchema {
        server: SchemaFingerprint,
        client: SchemaFingerprint,
    },
    /// Receiver observed a missing epoch and needs a fresh snapshot.
    SyncGap { expected: u64, got: u64 },
    /// A push failed validation or migration on the server.
    Rejected { reason: String },
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NackReason::IncompatibleVersion { expected, got } => {
                write!(f, "incompatible protocol version: server {expected}, client {got}")
            }
            NackReason::IncompatibleSchema { server, client } => {
                write!(f, "incompatible schema: server {server}, client {client}")
            }
            NackReason::SyncGap { expected, got } => {
                write!(f, "sync gap: expected epoch {expected}, got {got}")
            }
            NackReason::Rejected { reason } => write!(f, "rejected: {reason}"),
        }
    }
}

/// Why a connection is closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    ClientRequest,
    ServerShutdown,
    IncompatibleVersion,
    Protocol,
}

/// Tags a broadcast diff with the push it resolves, so the originator can
/// clear its pending entry and reconcile its optimistic state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushOrigin {
    pub client: Uuid,
    pub push_id: u64,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// First message on every connection.
    Handshake {
        protocol_version: u16,
        client_id: Uuid,
        document: Uuid,
        schema: SchemaFingerprint,
    },
    /// Full durable record set at an epoch. Replaces the client store
    /// wholesale.
    Snapshot {
        epoch: u64,
        schema: SchemaFingerprint,
        records: Vec<WireRecord>,
    },
    /// Server-to-client diff, streamed in epoch order.
    Diff {
        diff: WireDiff,
        schema: SchemaFingerprint,
        source: Option<PushOrigin>,
    },
    /// Client-originated mutation, tagged with the client's observed base
    /// epoch.
    Push {
        push_id: u64,
        base_epoch: u64,
        diff: WireDiff,
        schema: SchemaFingerprint,
    },
    Ack { epoch: u64 },
    Nack { reason: NackReason },
    /// Ephemeral presence update; never part of snapshots or the diff log.
    Presence { record: WireRecord },
    PresenceGone { id: RecordId },
    Ping,
    Pong,
    Close { reason: CloseReason },
}

impl SyncMessage {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Short tag for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            SyncMessage::Handshake { .. } => "handshake",
            SyncMessage::Snapshot { .. } => "snapshot",
            SyncMessage::Diff { .. } => "diff",
            SyncMessage::Push { .. } => "push",
            SyncMessage::Ack { .. } => "ack",
            SyncMessage::Nack { .. } => "nack",
            SyncMessage::Presence { .. } => "presence",
            SyncMessage::PresenceGone { .. } => "presence-gone",
            SyncMessage::Ping => "ping",
            SyncMessage::Pong => "pong",
            SyncMessage::Close { .. } => "close",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_store::{PageProps, RecordProps, RecordType};

    fn sample_record() -> Record {
        Record::new(
            RecordId::new(RecordType::Page, "p1"),
            2,
            RecordProps::Page(PageProps {
                name: "Page 1".into(),
                index: 0,
            }),
        )
    }

    #[test]
    fn test_handshake_roundtrip() {
        let schema = StoreSchema::canvas();
        let msg = SyncMessage::Handshake {
            protocol_version: PROTOCOL_VERSION,
            client_id: Uuid::new_v4(),
            document: Uuid::new_v4(),
            schema: schema.fingerprint(),
        };
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let schema = StoreSchema::canvas();
        let record = sample_record();
        let msg = SyncMessage::Snapshot {
            epoch: 42,
            schema: schema.fingerprint(),
            records: vec![WireRecord::from_record(&record).unwrap()],
        };
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            SyncMessage::Snapshot { epoch, records, .. } => {
                assert_eq!(epoch, 42);
                assert_eq!(records.len(), 1);
                let ingested = records[0].clone().ingest(&schema).unwrap();
                assert_eq!(ingested, record);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_diff_roundtrip() {
        let schema = StoreSchema::canvas();
        let record = sample_record();
        let diff = RecordDiff {
            from_epoch: 4,
            to_epoch: 5,
            added: vec![record.clone()],
            updated: Vec::new(),
            removed: Vec::new(),
        };
        let wire = WireDiff::from_diff(&diff).unwrap();
        let msg = SyncMessage::Diff {
            diff: wire,
            schema: schema.fingerprint(),
            source: Some(PushOrigin {
                client: Uuid::from_u128(9),
                push_id: 3,
            }),
        };
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            SyncMessage::Diff { diff, source, .. } => {
                assert_eq!(source.map(|s| s.push_id), Some(3));
                let ingested = diff.ingest(&schema).unwrap();
                assert_eq!(ingested, diff_expected(&record));
            }
            other => panic!("expected diff, got {other:?}"),
        }
    }

    fn diff_expected(record: &Record) -> RecordDiff {
        RecordDiff {
            from_epoch: 4,
            to_epoch: 5,
            added: vec![record.clone()],
            updated: Vec::new(),
            removed: Vec::new(),
        }
    }

    #[test]
    fn test_ingest_migrates_old_records() {
        let schema = StoreSchema::canvas();
        // A v1 shape straight off an old client's wire: no asset field.
        let wire = WireRecord {
            id: RecordId::new(RecordType::Shape, "s1"),
            version: 1,
            props: r#"{"page":{"kind":"page","key":"p1"},"x":1.0,"y":2.0,"rotation":0.0,"opacity":1.0,"geo":{"kind":"rect","w":5.0,"h":5.0}}"#.into(),
        };
        let record = wire.ingest(&schema).unwrap();
        assert_eq!(record.version, 2);
        match &record.props {
            RecordProps::Shape(p) => assert_eq!(p.asset, None),
            other => panic!("expected shape, got {other:?}"),
        }
    }

    #[test]
    fn test_ack_nack_roundtrip() {
        let ack = SyncMessage::Ack { epoch: 7 };
        assert_eq!(SyncMessage::decode(&ack.encode().unwrap()).unwrap(), ack);

        let nack = SyncMessage::Nack {
            reason: NackReason::SyncGap {
                expected: 5,
                got: 9,
            },
        };
        assert_eq!(SyncMessage::decode(&nack.encode().unwrap()).unwrap(), nack);
    }

    #[test]
    fn test_ping_pong_close_roundtrip() {
        for msg in [
            SyncMessage::Ping,
            SyncMessage::Pong,
            SyncMessage::Close {
                reason: CloseReason::ServerShutdown,
            },
        ] {
            assert_eq!(SyncMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0x02]).is_err());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(SyncMessage::Ping.kind_name(), "ping");
        assert_eq!(SyncMessage::Ack { epoch: 0 }.kind_name(), "ack");
    }
}
