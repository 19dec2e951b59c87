//! Sparse uniform grid keyed by `(cx << 32) | cy`, with a cached cell-key stamp per entity so a
//! sub-cell movement update is an O(1) no-op. Grounded on the sparse-hash-grid design used for
//! broad-phase neighbor queries; mutated only from the owning room's strand, so it carries no
//! internal locking (§4.9, §5).
use hashbrown::HashMap;

pub type CellKey = u64;

#[inline]
fn cell_key(cx: i32, cy: i32) -> CellKey {
    ((cx as u32 as u64) << 32) | (cy as u32 as u64)
}

#[inline]
fn cell_of(x: f32, y: f32, cell_size: f32) -> (i32, i32) {
    ((x / cell_size).floor() as i32, (y / cell_size).floor() as i32)
}

/// A sparse uniform grid over `(f32, f32)` positions, indexed by 64-bit entity id. Generic over
/// neither position nor payload: callers look positions up by id through their own `ObjectManager`
/// and pass them in on every `add`/`update` call, keeping the grid itself free of any gameplay
/// type.
pub struct SpatialGrid {
    cell_size: f32,
    buckets: HashMap<CellKey, Vec<u64>>,
    stamps: HashMap<u64, CellKey>,
}

impl SpatialGrid {
    /// `cell_size` is typically 2-4 world units (§4.9); must be positive.
    pub fn new(cell_size: f32) -> SpatialGrid {
        assert!(cell_size > 0.0, "cell_size must be positive");
        SpatialGrid {
            cell_size,
            buckets: HashMap::new(),
            stamps: HashMap::new(),
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    pub fn contains(&self, entity: u64) -> bool {
        self.stamps.contains_key(&entity)
    }

    /// Inserts `entity` at `(x, y)`, stamping it with its cell key. A second `add` for an id
    /// already in the grid first removes the stale entry (defensive; callers should `update`
    /// instead).
    pub fn add(&mut self, entity: u64, x: f32, y: f32) {
        if self.stamps.contains_key(&entity) {
            self.remove(entity);
        }
        let (cx, cy) = cell_of(x, y, self.cell_size);
        let key = cell_key(cx, cy);
        self.buckets.entry(key).or_insert_with(Vec::new).push(entity);
        self.stamps.insert(entity, key);
    }

    /// Re-homes `entity` to `(x, y)`. Returns immediately (the hot path) when the cell hasn't
    /// changed since the last stamp; otherwise swap-removes from the old bucket and pushes into
    /// the new one, erasing the old bucket if it becomes empty.
    pub fn update(&mut self, entity: u64, x: f32, y: f32) {
        let (cx, cy) = cell_of(x, y, self.cell_size);
        let new_key = cell_key(cx, cy);

        let old_key = match self.stamps.get(&entity) {
            Some(key) => *key,
            None => {
                self.add(entity, x, y);
                return;
            }
        };

        if old_key == new_key {
            return;
        }

        if let Some(bucket) = self.buckets.get_mut(&old_key) {
            if let Some(pos) = bucket.iter().position(|&id| id == entity) {
                bucket.swap_remove(pos);
            }
            if bucket.is_empty() {
                self.buckets.remove(&old_key);
            }
        }

        self.buckets.entry(new_key).or_insert_with(Vec::new).push(entity);
        self.stamps.insert(entity, new_key);
    }

    /// Removes `entity` using its stamped cell key directly, O(bucket size). A no-op if `entity`
    /// isn't present.
    pub fn remove(&mut self, entity: u64) {
        let key = match self.stamps.remove(&entity) {
            Some(key) => key,
            None => return,
        };
        if let Some(bucket) = self.buckets.get_mut(&key) {
            if let Some(pos) = bucket.iter().position(|&id| id == entity) {
                bucket.swap_remove(pos);
            }
            if bucket.is_empty() {
                self.buckets.remove(&key);
            }
        }
    }

    /// Appends every entity whose position (as tracked by `positions`) lies within `r` of
    /// `(x, y)` to `out`. `positions` maps an entity id back to its current `(x, y)` — the grid
    /// itself only stores cell membership, not coordinates, so a narrow-phase distance filter
    /// needs the caller's own position lookup.
    pub fn query_range(
        &self,
        x: f32,
        y: f32,
        r: f32,
        positions: impl Fn(u64) -> Option<(f32, f32)>,
        out: &mut Vec<u64>,
    ) {
        let (min_cx, min_cy) = cell_of(x - r, y - r, self.cell_size);
        let (max_cx, max_cy) = cell_of(x + r, y + r, self.cell_size);
        let r_sq = r * r;

        for cy in min_cy..=max_cy {
            for cx in min_cx..=max_cx {
                let key = cell_key(cx, cy);
                if let Some(bucket) = self.buckets.get(&key) {
                    for &entity in bucket {
                        if let Some((ex, ey)) = positions(entity) {
                            let dx = ex - x;
                            let dy = ey - y;
                            if dx * dx + dy * dy <= r_sq {
                                out.push(entity);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Number of non-empty buckets; exposed for metrics/tests, not used on the hot path.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    #[test]
    fn update_within_the_same_cell_is_a_no_op_on_bucket_membership() {
        let mut grid = SpatialGrid::new(4.0);
        grid.add(1, 0.5, 0.5);
        let key_before = grid.stamps[&1];
        grid.update(1, 0.9, 0.9);
        assert_eq!(grid.stamps[&1], key_before);
        assert_eq!(grid.bucket_count(), 1);
    }

    #[test]
    fn update_across_cells_moves_the_entity_and_drops_the_empty_bucket() {
        let mut grid = SpatialGrid::new(4.0);
        grid.add(1, 0.5, 0.5);
        assert_eq!(grid.bucket_count(), 1);
        grid.update(1, 100.0, 100.0);
        assert_eq!(grid.bucket_count(), 1);
        assert!(grid.contains(1));
    }

    #[test]
    fn remove_erases_the_entity_and_empty_buckets() {
        let mut grid = SpatialGrid::new(4.0);
        grid.add(1, 0.0, 0.0);
        grid.remove(1);
        assert!(!grid.contains(1));
        assert_eq!(grid.bucket_count(), 0);
    }

    #[test]
    fn query_range_returns_exactly_entities_within_the_radius() {
        let mut grid = SpatialGrid::new(2.0);
        let mut positions: StdHashMap<u64, (f32, f32)> = StdHashMap::new();

        let points = [
            (1u64, 0.0f32, 0.0f32),
            (2, 1.0, 0.0),
            (3, 5.0, 0.0),
            (4, 0.0, 4.9),
            (5, 3.5, 3.5),
        ];
        for &(id, x, y) in &points {
            grid.add(id, x, y);
            positions.insert(id, (x, y));
        }

        let mut out = Vec::new();
        grid.query_range(0.0, 0.0, 5.0, |id| positions.get(&id).copied(), &mut out);
        out.sort_unstable();

        let expected: Vec<u64> = points
            .iter()
            .filter(|&&(_, x, y)| x * x + y * y <= 25.0)
            .map(|&(id, _, _)| id)
            .collect();
        let mut expected_sorted = expected.clone();
        expected_sorted.sort_unstable();

        assert_eq!(out, expected_sorted);
    }

    #[test]
    fn re_adding_an_entity_already_present_relocates_rather_than_duplicates() {
        let mut grid = SpatialGrid::new(4.0);
        grid.add(1, 0.0, 0.0);
        grid.add(1, 100.0, 100.0);
        assert_eq!(grid.len(), 1);

        let mut out = Vec::new();
        let positions: StdHashMap<u64, (f32, f32)> = [(1, (100.0, 100.0))].into_iter().collect();
        grid.query_range(100.0, 100.0, 1.0, |id| positions.get(&id).copied(), &mut out);
        assert_eq!(out, vec![1]);
    }
}
