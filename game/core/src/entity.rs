//! Game entities tracked by a room: monsters, players and projectiles share one map so the
//! spatial grid, AI and combat passes can treat them uniformly (§3 "Room" data model).
use crate::movement::MovementStrategy;
use std::sync::Arc;

pub type EntityId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Alive,
    Dead,
    Expired,
}

#[derive(Debug, Clone, Copy)]
pub enum ProjectileKind {
    Straight,
    Orbit {
        center: EntityId,
        radius: f32,
        angular_velocity: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Player,
    Monster,
    Projectile,
}

/// One simulated object. Position and velocity are 32-bit float, damage/hp are integer, matching
/// the numeric policy in §4.10. A player's `id` is its owning session's ID directly, so a
/// packet handler can route combat notices to a session without a separate lookup table.
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub radius: f32,
    pub hp: i32,
    pub max_hp: i32,
    pub xp: i32,
    pub state: EntityState,
    pub facing: f32,
    /// Owning entity for a projectile (who fired it); `None` for monsters/players.
    pub owner: Option<EntityId>,
    pub projectile: Option<ProjectileKind>,
    /// Double-precision angle accumulator for orbit projectiles, to resist drift (§4.10).
    pub orbit_angle: f64,
    /// `totalRunTime` timestamp below which this entity ignores further body-contact damage.
    pub invincible_until: f64,
    pub movement: Option<Arc<dyn MovementStrategy>>,
}
