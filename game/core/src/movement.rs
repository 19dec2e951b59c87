//! Pluggable AI steering: a monster is handed a movement-strategy trait object at spawn time
//! instead of inheriting from a Chaser/Wander/Swarm/Boss class hierarchy (§9 design notes). Each
//! strategy only sees a read-only `RoomView` over the grid and entity map — "the core exposes the
//! grid queries they need", nothing more.
use crate::entity::{Entity, EntityKind};
use crate::object::ObjectManager;
use aetherium::prelude::SpatialGrid;

/// Below this squared magnitude a velocity is zeroed rather than normalized, avoiding a divide
/// blow-up on an exactly-stationary target (§4.10 numeric policy).
pub const ZERO_VELOCITY_EPS_SQ: f32 = 1e-4;

pub struct RoomView<'a> {
    pub grid: &'a SpatialGrid,
    pub objects: &'a ObjectManager,
}

impl<'a> RoomView<'a> {
    pub fn neighbors_within(&self, x: f32, y: f32, r: f32) -> Vec<u64> {
        let mut out = Vec::new();
        self.grid
            .query_range(x, y, r, |id| self.objects.get(id).map(|e| (e.x, e.y)), &mut out);
        out
    }
}

pub trait MovementStrategy: Send + Sync {
    fn compute_desired_velocity(&self, entity: &Entity, room: &RoomView<'_>, dt: f32, tx: f32, ty: f32) -> (f32, f32);
}

fn normalized_toward(from_x: f32, from_y: f32, to_x: f32, to_y: f32, speed: f32) -> (f32, f32) {
    let dx = to_x - from_x;
    let dy = to_y - from_y;
    let mag_sq = dx * dx + dy * dy;
    if mag_sq < ZERO_VELOCITY_EPS_SQ {
        return (0.0, 0.0);
    }
    let inv_len = speed / mag_sq.sqrt();
    (dx * inv_len, dy * inv_len)
}

/// Beelines straight at the target.
pub struct ChaserStrategy {
    pub speed: f32,
}

impl MovementStrategy for ChaserStrategy {
    fn compute_desired_velocity(&self, entity: &Entity, _room: &RoomView<'_>, _dt: f32, tx: f32, ty: f32) -> (f32, f32) {
        normalized_toward(entity.x, entity.y, tx, ty, self.speed)
    }
}

/// Approaches at half speed with a deterministic sideways wobble, so a wandering monster doesn't
/// walk in a dead-straight line without needing its own per-entity RNG state (which would break
/// the seeded-replay guarantee the wave spawner alone is responsible for upholding).
pub struct WanderStrategy {
    pub speed: f32,
}

impl MovementStrategy for WanderStrategy {
    fn compute_desired_velocity(&self, entity: &Entity, _room: &RoomView<'_>, _dt: f32, tx: f32, ty: f32) -> (f32, f32) {
        let (vx, vy) = normalized_toward(entity.x, entity.y, tx, ty, self.speed * 0.5);
        let wobble = (entity.id as f64 * 0.37 + entity.facing as f64).sin() as f32 * 0.15 * self.speed;
        (vx - vy.signum() * wobble, vy + vx.signum() * wobble)
    }
}

/// Chases the target while adding a separation term from nearby monsters, so a pack doesn't
/// collapse onto a single point.
pub struct SwarmStrategy {
    pub speed: f32,
    pub separation_radius: f32,
}

impl MovementStrategy for SwarmStrategy {
    fn compute_desired_velocity(&self, entity: &Entity, room: &RoomView<'_>, _dt: f32, tx: f32, ty: f32) -> (f32, f32) {
        let (mut vx, mut vy) = normalized_toward(entity.x, entity.y, tx, ty, self.speed);

        let mut push_x = 0.0f32;
        let mut push_y = 0.0f32;
        for id in room.neighbors_within(entity.x, entity.y, self.separation_radius) {
            if id == entity.id {
                continue;
            }
            let other = match room.objects.get(id) {
                Some(e) if e.kind == EntityKind::Monster => e,
                _ => continue,
            };
            let dx = entity.x - other.x;
            let dy = entity.y - other.y;
            let mag_sq = dx * dx + dy * dy;
            if mag_sq < ZERO_VELOCITY_EPS_SQ {
                continue;
            }
            let falloff = 1.0 - (mag_sq.sqrt() / self.separation_radius).min(1.0);
            push_x += dx * falloff;
            push_y += dy * falloff;
        }

        vx += push_x * self.speed * 0.5;
        vy += push_y * self.speed * 0.5;
        (vx, vy)
    }
}

/// A boss: chases at whatever speed it's configured with, no separation behavior.
pub struct BossStrategy {
    pub speed: f32,
}

impl MovementStrategy for BossStrategy {
    fn compute_desired_velocity(&self, entity: &Entity, _room: &RoomView<'_>, _dt: f32, tx: f32, ty: f32) -> (f32, f32) {
        normalized_toward(entity.x, entity.y, tx, ty, self.speed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityState;
    use crate::object::ObjectManager;

    fn at(id: u64, x: f32, y: f32) -> Entity {
        Entity {
            id,
            kind: EntityKind::Monster,
            x,
            y,
            vx: 0.0,
            vy: 0.0,
            radius: 1.0,
            hp: 10,
            max_hp: 10,
            xp: 0,
            state: EntityState::Alive,
            facing: 0.0,
            owner: None,
            projectile: None,
            orbit_angle: 0.0,
            invincible_until: 0.0,
            movement: None,
        }
    }

    #[test]
    fn chaser_heads_straight_for_the_target() {
        let objects = ObjectManager::new();
        let grid = SpatialGrid::new(4.0);
        let view = RoomView { grid: &grid, objects: &objects };
        let strategy = ChaserStrategy { speed: 2.0 };
        let entity = at(1, 0.0, 0.0);
        let (vx, vy) = strategy.compute_desired_velocity(&entity, &view, 0.04, 10.0, 0.0);
        assert!((vx - 2.0).abs() < 1e-4);
        assert!(vy.abs() < 1e-4);
    }

    #[test]
    fn zero_distance_target_yields_zero_velocity() {
        let objects = ObjectManager::new();
        let grid = SpatialGrid::new(4.0);
        let view = RoomView { grid: &grid, objects: &objects };
        let strategy = ChaserStrategy { speed: 2.0 };
        let entity = at(1, 5.0, 5.0);
        let (vx, vy) = strategy.compute_desired_velocity(&entity, &view, 0.04, 5.0, 5.0);
        assert_eq!((vx, vy), (0.0, 0.0));
    }
}
