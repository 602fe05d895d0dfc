//! Uniform spatial hash grid for broadphase neighbor queries

use std::collections::{BTreeSet, HashMap};

use glam::Vec3;

use super::EntityId;

/// Integer cell coordinate
pub type CellKey = (i32, i32, i32);

/// Buckets entity ids by the grid cell containing their position.
///
/// Derived data only: the simulator clears and refills it every step from the
/// world table. Single writer; not meant to be shared across threads.
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    cell_size: f32,
    cells: HashMap<CellKey, BTreeSet<EntityId>>,
    locations: HashMap<EntityId, CellKey>,
}

impl SpatialIndex {
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size: cell_size.max(1e-3),
            cells: HashMap::new(),
            locations: HashMap::new(),
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Cell containing `position`
    pub fn cell_of(&self, position: Vec3) -> CellKey {
        let cs = self.cell_size;
        (
            (position.x / cs).floor() as i32,
            (position.y / cs).floor() as i32,
            (position.z / cs).floor() as i32,
        )
    }

    /// Insert `id` at `position`, moving it if it was already indexed
    pub fn insert(&mut self, id: EntityId, position: Vec3) {
        self.remove(id);
        let cell = self.cell_of(position);
        self.cells.entry(cell).or_default().insert(id);
        self.locations.insert(id, cell);
    }

    /// Remove `id`, returns whether it was present
    pub fn remove(&mut self, id: EntityId) -> bool {
        let Some(cell) = self.locations.remove(&id) else {
            return false;
        };
        if let Some(bucket) = self.cells.get_mut(&cell) {
            bucket.remove(&id);
            if bucket.is_empty() {
                self.cells.remove(&cell);
            }
        }
        true
    }

    pub fn update_position(&mut self, id: EntityId, position: Vec3) {
        if self.locations.get(&id) == Some(&self.cell_of(position)) {
            return;
        }
        self.insert(id, position);
    }

    /// Every entity whose cell lies within `ceil(radius / cell_size)` cells of the
    /// query cell. Candidates only: callers still filter by real distance.
    pub fn query_neighbors(&self, position: Vec3, radius: f32) -> BTreeSet<EntityId> {
        let mut found = BTreeSet::new();
        if self.cells.is_empty() {
            return found;
        }

        let reach = if radius.is_finite() && radius > 0.0 {
            (radius / self.cell_size).ceil().min(i32::MAX as f32) as i32
        } else {
            0
        };
        let (cx, cy, cz) = self.cell_of(position);

        // Huge queries: walking occupied cells beats walking the empty cube
        let span = 2 * reach as i64 + 1;
        if span.saturating_mul(span).saturating_mul(span) > self.cells.len() as i64 {
            for (&(x, y, z), bucket) in &self.cells {
                let within = (x as i64 - cx as i64).abs() <= reach as i64
                    && (y as i64 - cy as i64).abs() <= reach as i64
                    && (z as i64 - cz as i64).abs() <= reach as i64;
                if within {
                    found.extend(bucket.iter().copied());
                }
            }
            return found;
        }

        for dx in -reach..=reach {
            for dy in -reach..=reach {
                for dz in -reach..=reach {
                    let key = (
                        cx.saturating_add(dx),
                        cy.saturating_add(dy),
                        cz.saturating_add(dz),
                    );
                    if let Some(bucket) = self.cells.get(&key) {
                        found.extend(bucket.iter().copied());
                    }
                }
            }
        }
        found
    }

    /// Drop every entry but keep allocations for the next step
    pub fn clear(&mut self) {
        self.cells.clear();
        self.locations.clear();
    }

    /// Number of indexed entities
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Number of occupied cells
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }
}
