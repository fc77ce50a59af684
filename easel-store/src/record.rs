//! Canvas record model: typed ids, props as a tagged sum type, validators.
//!
//! Records are immutable snapshots. A "mutation" replaces the record stored
//! under its id; no in-place change is ever visible across transaction
//! boundaries. Each record carries the schema version of its collection so
//! documents written by older builds can be migrated on load.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The typed collections of a canvas document.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Shape,
    Binding,
    Page,
    Document,
    Presence,
}

impl RecordType {
    pub const ALL: [RecordType; 5] = [
        RecordType::Shape,
        RecordType::Binding,
        RecordType::Page,
        RecordType::Document,
        RecordType::Presence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Shape => "shape",
            RecordType::Binding => "binding",
            RecordType::Page => "page",
            RecordType::Document => "document",
            RecordType::Presence => "presence",
        }
    }

    /// Ephemeral collections are replicated live but never persisted and
    /// never enter the transaction log.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, RecordType::Presence)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record id, unique within its collection. Rendered `"shape:<key>"`.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RecordId {
    kind: RecordType,
    key: String,
}

impl RecordId {
    pub fn new(kind: RecordType, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }

    /// Fresh id with a random key.
    pub fn random(kind: RecordType) -> Self {
        Self {
            kind,
            key: Uuid::new_v4().to_string(),
        }
    }

    pub fn kind(&self) -> RecordType {
        self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

/// Geometry payload of a shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShapeKind {
    Rect { w: f64, h: f64 },
    Ellipse { rx: f64, ry: f64 },
    Line { points: Vec<[f64; 2]> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeProps {
    /// Page this shape lives on.
    pub page: RecordId,
    /// Optional parent shape (grouping). World transform composes down the
    /// parent chain.
    #[serde(default)]
    pub parent: Option<RecordId>,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub rotation: f64,
    pub opacity: f64,
    pub geo: ShapeKind,
    /// Referenced asset. Required-nullable since shape schema v2.
    pub asset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingProps {
    pub from: RecordId,
    pub to: RecordId,
    /// Normalized anchor point on the target shape.
    pub anchor: [f64; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageProps {
    pub name: String,
    /// Sort position among sibling pages. Added in page schema v2.
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentProps {
    pub name: String,
    pub grid_size: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceProps {
    /// Owning client. Presence is evicted when this client disconnects or
    /// times out.
    pub client: Uuid,
    pub user_name: String,
    /// RGBA cursor color.
    pub color: [f32; 4],
    #[serde(default)]
    pub cursor: Option<[f64; 2]>,
    #[serde(default)]
    pub selection: Vec<RecordId>,
}

/// Tagged props union keyed by collection.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordProps {
    Shape(ShapeProps),
    Binding(BindingProps),
    Page(PageProps),
    Document(DocumentProps),
    Presence(PresenceProps),
}

impl RecordProps {
    pub fn kind(&self) -> RecordType {
        match self {
            RecordProps::Shape(_) => RecordType::Shape,
            RecordProps::Binding(_) => RecordType::Binding,
            RecordProps::Page(_) => RecordType::Page,
            RecordProps::Document(_) => RecordType::Document,
            RecordProps::Presence(_) => RecordType::Presence,
        }
    }

    /// Serialize props to their migratable JSON form.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            RecordProps::Shape(p) => serde_json::to_value(p),
            RecordProps::Binding(p) => serde_json::to_value(p),
            RecordProps::Page(p) => serde_json::to_value(p),
            RecordProps::Document(p) => serde_json::to_value(p),
            RecordProps::Presence(p) => serde_json::to_value(p),
        }
    }

    /// Parse props of the given collection from JSON at the current schema
    /// shape.
    pub fn from_json(
        kind: RecordType,
        value: serde_json::Value,
    ) -> Result<RecordProps, serde_json::Error> {
        Ok(match kind {
            RecordType::Shape => RecordProps::Shape(serde_json::from_value(value)?),
            RecordType::Binding => RecordProps::Binding(serde_json::from_value(value)?),
            RecordType::Page => RecordProps::Page(serde_json::from_value(value)?),
            RecordType::Document => RecordProps::Document(serde_json::from_value(value)?),
            RecordType::Presence => RecordProps::Presence(serde_json::from_value(value)?),
        })
    }
}

/// An immutable record snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: RecordId,
    /// Schema version of this record's collection at write time.
    pub version: u16,
    pub props: RecordProps,
}

impl Record {
    pub fn new(id: RecordId, version: u16, props: RecordProps) -> Self {
        Self { id, version, props }
    }

    pub fn kind(&self) -> RecordType {
        self.id.kind()
    }
}

/// A record failed schema validation. Aborts the enclosing transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub record: RecordId,
    pub field: &'static str,
    pub message: String,
}

impl SchemaViolation {
    fn new(record: &RecordId, field: &'static str, message: impl Into<String>) -> Self {
        Self {
            record: record.clone(),
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "schema violation on {} (field `{}`): {}",
            self.record, self.field, self.message
        )
    }
}

impl std::error::Error for SchemaViolation {}

fn check_finite(
    id: &RecordId,
    field: &'static str,
    value: f64,
) -> Result<(), SchemaViolation> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(SchemaViolation::new(id, field, "must be a finite number"))
    }
}

pub(crate) fn validate_shape(record: &Record) -> Result<(), SchemaViolation> {
    let props = match &record.props {
        RecordProps::Shape(p) => p,
        _ => {
            return Err(SchemaViolation::new(
                &record.id,
                "id",
                "id collection does not match props",
            ))
        }
    };
    if props.page.kind() != RecordType::Page {
        return Err(SchemaViolation::new(
            &record.id,
            "page",
            "must reference a page record",
        ));
    }
    if let Some(parent) = &props.parent {
        if parent.kind() != RecordType::Shape {
            return Err(SchemaViolation::new(
                &record.id,
                "parent",
                "must reference a shape record",
            ));
        }
        if *parent == record.id {
            return Err(SchemaViolation::new(
                &record.id,
                "parent",
                "shape cannot be its own parent",
            ));
        }
    }
    check_finite(&record.id, "x", props.x)?;
    check_finite(&record.id, "y", props.y)?;
    check_finite(&record.id, "rotation", props.rotation)?;
    if !(0.0..=1.0).contains(&props.opacity) {
        return Err(SchemaViolation::new(
            &record.id,
            "opacity",
            "must be within [0, 1]",
        ));
    }
    match &props.geo {
        ShapeKind::Rect { w, h } => {
            check_finite(&record.id, "geo.w", *w)?;
            check_finite(&record.id, "geo.h", *h)?;
            if *w < 0.0 || *h < 0.0 {
                return Err(SchemaViolation::new(
                    &record.id,
                    "geo",
                    "rect extent must be non-negative",
                ));
            }
        }
        ShapeKind::Ellipse { rx, ry } => {
            check_finite(&record.id, "geo.rx", *rx)?;
            check_finite(&record.id, "geo.ry", *ry)?;
            if *rx < 0.0 || *ry < 0.0 {
                return Err(SchemaViolation::new(
                    &record.id,
                    "geo",
                    "ellipse radii must be non-negative",
                ));
            }
        }
        ShapeKind::Line { points } => {
            if points.len() < 2 {
                return Err(SchemaViolation::new(
                    &record.id,
                    "geo.points",
                    "line needs at least two points",
                ));
            }
            for p in points {
                check_finite(&record.id, "geo.points", p[0])?;
                check_finite(&record.id, "geo.points", p[1])?;
            }
        }
    }
    Ok(())
}

pub(crate) fn validate_binding(record: &Record) -> Result<(), SchemaViolation> {
    let props = match &record.props {
        RecordProps::Binding(p) => p,
        _ => {
            return Err(SchemaViolation::new(
                &record.id,
                "id",
                "id collection does not match props",
            ))
        }
    };
    if props.from.kind() != RecordType::Shape {
        return Err(SchemaViolation::new(
            &record.id,
            "from",
            "must reference a shape record",
        ));
    }
    if props.to.kind() != RecordType::Shape {
        return Err(SchemaViolation::new(
            &record.id,
            "to",
            "must reference a shape record",
        ));
    }
    check_finite(&record.id, "anchor", props.anchor[0])?;
    check_finite(&record.id, "anchor", props.anchor[1])?;
    Ok(())
}

pub(crate) fn validate_page(record: &Record) -> Result<(), SchemaViolation> {
    let props = match &record.props {
        RecordProps::Page(p) => p,
        _ => {
            return Err(SchemaViolation::new(
                &record.id,
                "id",
                "id collection does not match props",
            ))
        }
    };
    if props.name.is_empty() {
        return Err(SchemaViolation::new(&record.id, "name", "must not be empty"));
    }
    Ok(())
}

pub(crate) fn validate_document(record: &Record) -> Result<(), SchemaViolation> {
    let props = match &record.props {
        RecordProps::Document(p) => p,
        _ => {
            return Err(SchemaViolation::new(
                &record.id,
                "id",
                "id collection does not match props",
            ))
        }
    };
    check_finite(&record.id, "grid_size", props.grid_size)?;
    if props.grid_size <= 0.0 {
        return Err(SchemaViolation::new(
            &record.id,
            "grid_size",
            "must be positive",
        ));
    }
    Ok(())
}

pub(crate) fn validate_presence(record: &Record) -> Result<(), SchemaViolation> {
    let props = match &record.props {
        RecordProps::Presence(p) => p,
        _ => {
            return Err(SchemaViolation::new(
                &record.id,
                "id",
                "id collection does not match props",
            ))
        }
    };
    if props.client.is_nil() {
        return Err(SchemaViolation::new(
            &record.id,
            "client",
            "must carry the owning client id",
        ));
    }
    if let Some(cursor) = props.cursor {
        check_finite(&record.id, "cursor", cursor[0])?;
        check_finite(&record.id, "cursor", cursor[1])?;
    }
    for selected in &props.selection {
        if selected.kind() != RecordType::Shape {
            return Err(SchemaViolation::new(
                &record.id,
                "selection",
                "selection entries must be shape ids",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_page() -> Record {
        Record::new(
            RecordId::new(RecordType::Page, "p1"),
            2,
            RecordProps::Page(PageProps {
                name: "Page 1".into(),
                index: 0,
            }),
        )
    }

    pub(crate) fn sample_shape(key: &str) -> Record {
        Record::new(
            RecordId::new(RecordType::Shape, key),
            2,
            RecordProps::Shape(ShapeProps {
                page: RecordId::new(RecordType::Page, "p1"),
                parent: None,
                x: 10.0,
                y: 20.0,
                rotation: 0.0,
                opacity: 1.0,
                geo: ShapeKind::Rect { w: 100.0, h: 50.0 },
                asset: None,
            }),
        )
    }

    #[test]
    fn test_record_id_display() {
        let id = RecordId::new(RecordType::Shape, "abc");
        assert_eq!(id.to_string(), "shape:abc");
        assert_eq!(id.kind(), RecordType::Shape);
        assert_eq!(id.key(), "abc");
    }

    #[test]
    fn test_record_id_ordering_groups_by_collection() {
        let a = RecordId::new(RecordType::Shape, "z");
        let b = RecordId::new(RecordType::Binding, "a");
        // Shape sorts before Binding because of the enum declaration order,
        // which is what the store's range scans rely on.
        assert!(a < b);
    }

    #[test]
    fn test_random_ids_unique() {
        let a = RecordId::random(RecordType::Shape);
        let b = RecordId::random(RecordType::Shape);
        assert_ne!(a, b);
    }

    #[test]
    fn test_valid_shape_passes() {
        assert!(validate_shape(&sample_shape("s1")).is_ok());
    }

    #[test]
    fn test_shape_opacity_out_of_range() {
        let mut shape = sample_shape("s1");
        if let RecordProps::Shape(p) = &mut shape.props {
            p.opacity = 1.5;
        }
        let err = validate_shape(&shape).unwrap_err();
        assert_eq!(err.field, "opacity");
    }

    #[test]
    fn test_shape_non_finite_coordinate() {
        let mut shape = sample_shape("s1");
        if let RecordProps::Shape(p) = &mut shape.props {
            p.x = f64::NAN;
        }
        let err = validate_shape(&shape).unwrap_err();
        assert_eq!(err.field, "x");
    }

    #[test]
    fn test_shape_parent_must_be_shape() {
        let mut shape = sample_shape("s1");
        if let RecordProps::Shape(p) = &mut shape.props {
            p.parent = Some(RecordId::new(RecordType::Page, "p1"));
        }
        let err = validate_shape(&shape).unwrap_err();
        assert_eq!(err.field, "parent");
    }

    #[test]
    fn test_shape_own_parent_rejected() {
        let mut shape = sample_shape("s1");
        if let RecordProps::Shape(p) = &mut shape.props {
            p.parent = Some(shape.id.clone());
        }
        let err = validate_shape(&shape).unwrap_err();
        assert_eq!(err.field, "parent");
    }

    #[test]
    fn test_line_needs_two_points() {
        let mut shape = sample_shape("s1");
        if let RecordProps::Shape(p) = &mut shape.props {
            p.geo = ShapeKind::Line {
                points: vec![[0.0, 0.0]],
            };
        }
        let err = validate_shape(&shape).unwrap_err();
        assert_eq!(err.field, "geo.points");
    }

    #[test]
    fn test_page_name_required() {
        let page = Record::new(
            RecordId::new(RecordType::Page, "p1"),
            2,
            RecordProps::Page(PageProps {
                name: String::new(),
                index: 0,
            }),
        );
        let err = validate_page(&page).unwrap_err();
        assert_eq!(err.field, "name");
    }

    #[test]
    fn test_presence_requires_client() {
        let presence = Record::new(
            RecordId::new(RecordType::Presence, "c1"),
            1,
            RecordProps::Presence(PresenceProps {
                client: Uuid::nil(),
                user_name: "Ada".into(),
                color: [1.0, 0.0, 0.0, 1.0],
                cursor: None,
                selection: Vec::new(),
            }),
        );
        let err = validate_presence(&presence).unwrap_err();
        assert_eq!(err.field, "client");
    }

    #[test]
    fn test_props_json_roundtrip() {
        let shape = sample_shape("s1");
        let json = shape.props.to_json().unwrap();
        let parsed = RecordProps::from_json(RecordType::Shape, json).unwrap();
        assert_eq!(parsed, shape.props);
    }

    #[test]
    fn test_mismatched_props_rejected() {
        let wrong = Record::new(
            RecordId::new(RecordType::Shape, "s1"),
            2,
            RecordProps::Page(PageProps {
                name: "nope".into(),
                index: 0,
            }),
        );
        let err = validate_shape(&wrong).unwrap_err();
        assert_eq!(err.field, "id");
    }

    #[test]
    fn test_ephemeral_collections() {
        assert!(RecordType::Presence.is_ephemeral());
        assert!(!RecordType::Shape.is_ephemeral());
    }
}
