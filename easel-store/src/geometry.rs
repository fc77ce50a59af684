//! World-space geometry derived from shape records.
//!
//! The canonical computed cache of the editor: axis-aligned world bounds
//! for a shape, composing the transforms of its parent chain. Rendering
//! and hit-testing subscribe to this; they never recompute geometry
//! themselves.

use std::sync::Arc;

use crate::cache::{ComputedCache, RecordCtx};
use crate::record::{Record, RecordProps, ShapeKind, ShapeProps};
use crate::store::Store;

/// Parent chains deeper than this are treated as data corruption and cut
/// off rather than walked forever.
const MAX_PARENT_DEPTH: usize = 64;

/// Axis-aligned bounding box in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    fn from_points(points: &[[f64; 2]]) -> Option<Bounds> {
        let first = points.first()?;
        let mut bounds = Bounds {
            min_x: first[0],
            min_y: first[1],
            max_x: first[0],
            max_y: first[1],
        };
        for p in &points[1..] {
            bounds.min_x = bounds.min_x.min(p[0]);
            bounds.min_y = bounds.min_y.min(p[1]);
            bounds.max_x = bounds.max_x.max(p[0]);
            bounds.max_y = bounds.max_y.max(p[1]);
        }
        Some(bounds)
    }
}

/// Points outlining the shape in its own coordinate space.
fn local_points(geo: &ShapeKind) -> Vec<[f64; 2]> {
    match geo {
        ShapeKind::Rect { w, h } => vec![[0.0, 0.0], [*w, 0.0], [*w, *h], [0.0, *h]],
        ShapeKind::Ellipse { rx, ry } => {
            vec![[-rx, -ry], [*rx, -ry], [*rx, *ry], [-rx, *ry]]
        }
        ShapeKind::Line { points } => points.clone(),
    }
}

/// Apply one shape's transform (rotate, then translate) to a point set.
fn apply_transform(points: &mut [[f64; 2]], shape: &ShapeProps) {
    let (sin, cos) = shape.rotation.sin_cos();
    for p in points.iter_mut() {
        let (x, y) = (p[0], p[1]);
        p[0] = x * cos - y * sin + shape.x;
        p[1] = x * sin + y * cos + shape.y;
    }
}

/// Outline of a shape in world coordinates, composing the parent chain.
/// Parents are read through the ctx, so the computed entry recomputes when
/// any ancestor moves.
fn world_points(ctx: &mut RecordCtx<'_, '_>, record: &Record) -> Option<Vec<[f64; 2]>> {
    let shape = match &record.props {
        RecordProps::Shape(shape) => shape,
        _ => return None,
    };
    let mut points = local_points(&shape.geo);
    apply_transform(&mut points, shape);

    let mut parent_ref = shape.parent.clone();
    let mut depth = 0;
    while let Some(parent_id) = parent_ref {
        depth += 1;
        if depth > MAX_PARENT_DEPTH {
            log::warn!("parent chain of {} exceeds {MAX_PARENT_DEPTH}; truncating", record.id);
            break;
        }
        let parent = match ctx.record(&parent_id) {
            Some(parent) => parent,
            // Dangling parents act as roots.
            None => break,
        };
        match &parent.props {
            RecordProps::Shape(parent_shape) => {
                apply_transform(&mut points, parent_shape);
                parent_ref = parent_shape.parent.clone();
            }
            _ => break,
        }
    }
    Some(points)
}

/// World bounds for a record: `Some` for shapes, `None` otherwise.
pub fn record_bounds(ctx: &mut RecordCtx<'_, '_>, record: &Record) -> Option<Bounds> {
    let points = world_points(ctx, record)?;
    Bounds::from_points(&points)
}

/// The shared bounds cache for a store.
pub fn bounds_cache(store: &mut Store) -> ComputedCache<Option<Bounds>> {
    ComputedCache::new(store, "bounds", record_bounds)
}

/// Union of the world bounds of several records. Convenience for selection
/// outlines.
pub fn union_bounds(
    cache: &mut ComputedCache<Option<Bounds>>,
    store: &mut Store,
    ids: &[crate::record::RecordId],
) -> Option<Bounds> {
    let mut out: Option<Bounds> = None;
    for id in ids {
        let bounds = match cache.get(store, id) {
            Some(Ok(Some(bounds))) => bounds,
            _ => continue,
        };
        out = Some(match out {
            Some(acc) => acc.union(&bounds),
            None => bounds,
        });
    }
    out
}

/// Shapes on a page whose world bounds intersect the viewport. A plain
/// helper over the cache — callers hold both.
pub fn shapes_in_viewport(
    cache: &mut ComputedCache<Option<Bounds>>,
    store: &mut Store,
    page: &crate::record::RecordId,
    viewport: &Bounds,
) -> Vec<Arc<Record>> {
    let candidates: Vec<Arc<Record>> = store
        .query(
            crate::record::RecordType::Shape,
            crate::store::Predicate::OnPage(page.clone()),
        )
        .collect();
    candidates
        .into_iter()
        .filter(|record| match cache.get(store, &record.id) {
            Some(Ok(Some(bounds))) => {
                bounds.min_x <= viewport.max_x
                    && bounds.max_x >= viewport.min_x
                    && bounds.min_y <= viewport.max_y
                    && bounds.max_y >= viewport.min_y
            }
            _ => false,
        })
        .collect()
}
