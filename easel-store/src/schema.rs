//! Versioned collection schemas and the migration engine.
//!
//! Each collection carries an ordered chain of migrations. A migration with
//! `to_version = n` transforms props from version `n - 1` to `n`; the chain
//! must be gapless — a gap means the running build does not understand the
//! document's history and continuing would corrupt it, so it is fatal.
//!
//! Migrations operate on the JSON form of props ([`RawRecord`]): payloads
//! from older builds cannot parse into the current typed sum type, so the
//! self-describing form is the unit of transformation. `down` migrations may
//! be retired once no living document depends on reversing them; a retired
//! down always fails, which is how old clients learn they must upgrade
//! rather than load a newer document.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::record::{
    validate_binding, validate_document, validate_page, validate_presence, validate_shape, Record,
    RecordId, RecordProps, RecordType, SchemaViolation,
};

/// An up or down step over the JSON form of a record's props.
pub type MigrationFn = fn(&mut serde_json::Value) -> Result<(), String>;

/// Reverse step of a migration, if still supported.
#[derive(Clone, Copy)]
pub enum DownMigration {
    Fn(MigrationFn),
    /// No living document depends on reversing this step; attempting to is
    /// always an error.
    Retired,
}

impl fmt::Debug for DownMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownMigration::Fn(_) => f.write_str("Fn"),
            DownMigration::Retired => f.write_str("Retired"),
        }
    }
}

/// One step in a collection's version chain.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Version this step migrates *to* (from `to_version - 1`).
    pub to_version: u16,
    pub up: MigrationFn,
    pub down: DownMigration,
}

/// Version chain for a single collection.
#[derive(Debug, Clone)]
pub struct CollectionSchema {
    pub version: u16,
    pub migrations: Vec<Migration>,
}

impl CollectionSchema {
    fn verify(&self, kind: RecordType) -> Result<(), MigrationFailure> {
        if self.version == 0 {
            return Err(MigrationFailure::NonContiguous {
                kind,
                expected: 1,
                found: 0,
            });
        }
        let mut expected = 2;
        for migration in &self.migrations {
            if migration.to_version != expected {
                return Err(MigrationFailure::NonContiguous {
                    kind,
                    expected,
                    found: migration.to_version,
                });
            }
            expected += 1;
        }
        if expected != self.version + 1 {
            return Err(MigrationFailure::NonContiguous {
                kind,
                expected,
                found: self.version,
            });
        }
        Ok(())
    }
}

type ValidatorFn = fn(&Record) -> Result<(), SchemaViolation>;

/// Migration errors. All of these are fatal for the unit that triggered
/// them: a record load, a document load, or a sync session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationFailure {
    /// A migration step failed on a record's props.
    Step {
        record: RecordId,
        to_version: u16,
        reason: String,
    },
    /// The version chain has a gap — client and server builds disagree.
    NonContiguous {
        kind: RecordType,
        expected: u16,
        found: u16,
    },
    /// A downgrade crossed a retired `down` step.
    Retired { kind: RecordType, at_version: u16 },
    /// No migration path between the two versions.
    NoPath { kind: RecordType, from: u16, to: u16 },
    /// Migrated props failed to parse into the typed record shape.
    Parse { record: RecordId, reason: String },
    /// Post-migration integrity: a record references a missing record.
    DanglingReference {
        record: RecordId,
        field: &'static str,
        target: RecordId,
    },
    /// Post-migration validation failure.
    Invalid(SchemaViolation),
}

impl fmt::Display for MigrationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationFailure::Step {
                record,
                to_version,
                reason,
            } => write!(f, "migration of {record} to v{to_version} failed: {reason}"),
            MigrationFailure::NonContiguous {
                kind,
                expected,
                found,
            } => write!(
                f,
                "non-contiguous migration chain for {kind}: expected v{expected}, found v{found}"
            ),
            MigrationFailure::Retired { kind, at_version } => write!(
                f,
                "downgrade of {kind} past v{at_version} is retired; upgrade required"
            ),
            MigrationFailure::NoPath { kind, from, to } => {
                write!(f, "no migration path for {kind} from v{from} to v{to}")
            }
            MigrationFailure::Parse { record, reason } => {
                write!(f, "migrated record {record} failed to parse: {reason}")
            }
            MigrationFailure::DanglingReference {
                record,
                field,
                target,
            } => write!(
                f,
                "record {record} field `{field}` references missing record {target}"
            ),
            MigrationFailure::Invalid(v) => write!(f, "migrated record invalid: {v}"),
        }
    }
}

impl std::error::Error for MigrationFailure {}

/// The migratable, self-describing form of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub id: RecordId,
    pub version: u16,
    pub props: serde_json::Value,
}

impl RawRecord {
    pub fn from_record(record: &Record) -> Result<RawRecord, MigrationFailure> {
        let props = record
            .props
            .to_json()
            .map_err(|e| MigrationFailure::Parse {
                record: record.id.clone(),
                reason: e.to_string(),
            })?;
        Ok(RawRecord {
            id: record.id.clone(),
            version: record.version,
            props,
        })
    }
}

/// Collection versions, exchanged in the sync handshake and stamped on
/// snapshots so a receiver can migrate on ingest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaFingerprint(pub Vec<(RecordType, u16)>);

impl SchemaFingerprint {
    pub fn version_of(&self, kind: RecordType) -> u16 {
        self.0
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }

    /// True when every collection version here is at or below `other`'s —
    /// i.e. `other` can up-migrate everything this peer produces.
    pub fn at_or_below(&self, other: &SchemaFingerprint) -> bool {
        self.0
            .iter()
            .all(|(kind, version)| *version <= other.version_of(*kind))
    }
}

impl fmt::Display for SchemaFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (kind, version) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{kind}@{version}")?;
            first = false;
        }
        Ok(())
    }
}

/// Store-wide schema: per-collection version chains plus the validator
/// table, built once at startup.
pub struct StoreSchema {
    collections: HashMap<RecordType, CollectionSchema>,
    validators: HashMap<RecordType, ValidatorFn>,
}

impl fmt::Debug for StoreSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreSchema({})", self.fingerprint())
    }
}

fn shape_asset_up(props: &mut serde_json::Value) -> Result<(), String> {
    let obj = props
        .as_object_mut()
        .ok_or_else(|| "shape props must be an object".to_string())?;
    // v1 shapes may omit the asset entirely; v2 makes it required-nullable.
    obj.entry("asset").or_insert(serde_json::Value::Null);
    Ok(())
}

fn shape_asset_down(props: &mut serde_json::Value) -> Result<(), String> {
    let obj = props
        .as_object_mut()
        .ok_or_else(|| "shape props must be an object".to_string())?;
    obj.remove("asset");
    Ok(())
}

fn page_index_up(props: &mut serde_json::Value) -> Result<(), String> {
    let obj = props
        .as_object_mut()
        .ok_or_else(|| "page props must be an object".to_string())?;
    obj.entry("index").or_insert(serde_json::json!(0));
    Ok(())
}

impl StoreSchema {
    /// The canvas document schema shipped with this build.
    pub fn canvas() -> StoreSchema {
        let mut collections = HashMap::new();
        collections.insert(
            RecordType::Shape,
            CollectionSchema {
                version: 2,
                migrations: vec![Migration {
                    to_version: 2,
                    up: shape_asset_up,
                    down: DownMigration::Fn(shape_asset_down),
                }],
            },
        );
        collections.insert(
            RecordType::Page,
            CollectionSchema {
                version: 2,
                migrations: vec![Migration {
                    to_version: 2,
                    up: page_index_up,
                    down: DownMigration::Retired,
                }],
            },
        );
        collections.insert(
            RecordType::Binding,
            CollectionSchema {
                version: 1,
                migrations: Vec::new(),
            },
        );
        collections.insert(
            RecordType::Document,
            CollectionSchema {
                version: 1,
                migrations: Vec::new(),
            },
        );
        collections.insert(
            RecordType::Presence,
            CollectionSchema {
                version: 1,
                migrations: Vec::new(),
            },
        );
        StoreSchema {
            collections,
            validators: Self::validator_table(),
        }
    }

    /// Build a schema from explicit collection chains, verifying that every
    /// chain is gapless.
    pub fn build(
        collections: HashMap<RecordType, CollectionSchema>,
    ) -> Result<StoreSchema, MigrationFailure> {
        for (kind, collection) in &collections {
            collection.verify(*kind)?;
        }
        Ok(StoreSchema {
            collections,
            validators: Self::validator_table(),
        })
    }

    fn validator_table() -> HashMap<RecordType, ValidatorFn> {
        let mut validators: HashMap<RecordType, ValidatorFn> = HashMap::new();
        validators.insert(RecordType::Shape, validate_shape);
        validators.insert(RecordType::Binding, validate_binding);
        validators.insert(RecordType::Page, validate_page);
        validators.insert(RecordType::Document, validate_document);
        validators.insert(RecordType::Presence, validate_presence);
        validators
    }

    pub fn version_of(&self, kind: RecordType) -> u16 {
        self.collections
            .get(&kind)
            .map(|c| c.version)
            .unwrap_or(1)
    }

    pub fn fingerprint(&self) -> SchemaFingerprint {
        let mut versions: Vec<(RecordType, u16)> = RecordType::ALL
            .iter()
            .map(|kind| (*kind, self.version_of(*kind)))
            .collect();
        versions.sort();
        SchemaFingerprint(versions)
    }

    /// Validate a record against its collection's validator.
    pub fn validate(&self, record: &Record) -> Result<(), SchemaViolation> {
        match self.validators.get(&record.kind()) {
            Some(validator) => validator(record),
            None => Err(SchemaViolation {
                record: record.id.clone(),
                field: "id",
                message: format!("unknown collection {}", record.kind()),
            }),
        }
    }

    /// Apply the migration chain between `raw.version` and `target`.
    pub fn migrate_record(
        &self,
        mut raw: RawRecord,
        target: u16,
    ) -> Result<RawRecord, MigrationFailure> {
        let kind = raw.id.kind();
        let collection = match self.collections.get(&kind) {
            Some(c) => c,
            None => {
                return Err(MigrationFailure::NoPath {
                    kind,
                    from: raw.version,
                    to: target,
                })
            }
        };
        if target == 0 || target > collection.version {
            return Err(MigrationFailure::NoPath {
                kind,
                from: raw.version,
                to: target,
            });
        }
        if raw.version == target {
            return Ok(raw);
        }

        if raw.version < target {
            for version in (raw.version + 1)..=target {
                let step = collection
                    .migrations
                    .iter()
                    .find(|m| m.to_version == version)
                    .ok_or(MigrationFailure::NonContiguous {
                        kind,
                        expected: version,
                        found: raw.version,
                    })?;
                (step.up)(&mut raw.props).map_err(|reason| MigrationFailure::Step {
                    record: raw.id.clone(),
                    to_version: version,
                    reason,
                })?;
                raw.version = version;
            }
        } else {
            for version in ((target + 1)..=raw.version).rev() {
                let step = collection
                    .migrations
                    .iter()
                    .find(|m| m.to_version == version)
                    .ok_or(MigrationFailure::NonContiguous {
                        kind,
                        expected: version,
                        found: raw.version,
                    })?;
                match step.down {
                    DownMigration::Fn(down) => {
                        down(&mut raw.props).map_err(|reason| MigrationFailure::Step {
                            record: raw.id.clone(),
                            to_version: version - 1,
                            reason,
                        })?;
                        raw.version = version - 1;
                    }
                    DownMigration::Retired => {
                        return Err(MigrationFailure::Retired {
                            kind,
                            at_version: version,
                        })
                    }
                }
            }
        }
        Ok(raw)
    }

    /// Migrate a raw record to the current version and parse it into the
    /// typed shape. The entry point for everything arriving off the wire or
    /// off disk.
    pub fn ingest(&self, raw: RawRecord) -> Result<Record, MigrationFailure> {
        let kind = raw.id.kind();
        let current = self.version_of(kind);
        let migrated = self.migrate_record(raw, current)?;
        let props = RecordProps::from_json(kind, migrated.props).map_err(|e| {
            MigrationFailure::Parse {
                record: migrated.id.clone(),
                reason: e.to_string(),
            }
        })?;
        let record = Record::new(migrated.id, current, props);
        self.validate(&record).map_err(MigrationFailure::Invalid)?;
        Ok(record)
    }

    /// Migrate a whole document, then check the structural invariants that
    /// span records.
    pub fn migrate_document(
        &self,
        raws: Vec<RawRecord>,
    ) -> Result<Vec<Record>, MigrationFailure> {
        let mut records = Vec::with_capacity(raws.len());
        for raw in raws {
            records.push(self.ingest(raw)?);
        }
        self.check_integrity(&records)?;
        Ok(records)
    }

    /// Cross-record invariants: no dangling references among durable
    /// records.
    pub fn check_integrity(&self, records: &[Record]) -> Result<(), MigrationFailure> {
        let ids: BTreeSet<&RecordId> = records.iter().map(|r| &r.id).collect();
        for record in records {
            match &record.props {
                RecordProps::Shape(shape) => {
                    if !ids.contains(&shape.page) {
                        return Err(MigrationFailure::DanglingReference {
                            record: record.id.clone(),
                            field: "page",
                            target: shape.page.clone(),
                        });
                    }
                    if let Some(parent) = &shape.parent {
                        if !ids.contains(parent) {
                            return Err(MigrationFailure::DanglingReference {
                                record: record.id.clone(),
                                field: "parent",
                                target: parent.clone(),
                            });
                        }
                    }
                }
                RecordProps::Binding(binding) => {
                    for (field, target) in [("from", &binding.from), ("to", &binding.to)] {
                        if !ids.contains(target) {
                            return Err(MigrationFailure::DanglingReference {
                                record: record.id.clone(),
                                field,
                                target: target.clone(),
                            });
                        }
                    }
                }
                // Presence is ephemeral; its references may lag.
                _ => {}
            }
        }
        Ok(())
    }
}
