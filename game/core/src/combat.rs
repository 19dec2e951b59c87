//! Collision and damage resolution: projectile-vs-monster broad+narrow phase, monster-vs-player
//! body contact with knockback and an invincibility window, and the end-of-tick despawn sweep
//! (§4.10 step 8). Broad phase always goes through the grid; narrow phase is a squared-distance
//! check, never an exact shape test.
use crate::entity::{EntityId, EntityKind, EntityState};
use crate::object::ObjectManager;
use aetherium::prelude::SpatialGrid;

pub const PLAYER_CONTACT_RADIUS: f32 = 1.5;
pub const PLAYER_INVINCIBILITY_SECS: f64 = 0.5;
pub const KNOCKBACK_SPEED: f32 = 8.0;
const PROJECTILE_DAMAGE: i32 = 10;
const MONSTER_CONTACT_DAMAGE: i32 = 5;
const MONSTER_XP_REWARD: i32 = 10;
const ZERO_VELOCITY_EPS_SQ: f32 = 1e-4;

#[derive(Debug, Clone, Copy)]
pub struct HpChange {
    pub entity: EntityId,
    pub hp: i32,
}

#[derive(Default)]
pub struct CombatOutcome {
    pub hp_changes: Vec<HpChange>,
    pub despawned: Vec<EntityId>,
    pub game_over: bool,
}

#[derive(Default)]
pub struct CombatManager;

impl CombatManager {
    pub fn new() -> Self {
        CombatManager
    }

    pub fn update(&mut self, total_run_time: f64, objects: &mut ObjectManager, grid: &mut SpatialGrid) -> CombatOutcome {
        let mut outcome = CombatOutcome::default();

        resolve_projectiles(objects, grid, &mut outcome);
        resolve_body_contact(total_run_time, objects, grid, &mut outcome);
        sweep_dead(objects, grid, &mut outcome);

        outcome.game_over = objects.all_players_dead();
        outcome
    }
}

fn resolve_projectiles(objects: &mut ObjectManager, grid: &SpatialGrid, outcome: &mut CombatOutcome) {
    let projectile_ids: Vec<EntityId> = objects
        .iter()
        .filter(|e| e.kind == EntityKind::Projectile && e.state == EntityState::Alive)
        .map(|e| e.id)
        .collect();

    for projectile_id in projectile_ids {
        let (px, py, pr, owner) = match objects.get(projectile_id) {
            Some(p) if p.state == EntityState::Alive => (p.x, p.y, p.radius, p.owner),
            _ => continue,
        };

        let mut candidates = Vec::new();
        grid.query_range(px, py, pr + 2.0, |id| objects.get(id).map(|e| (e.x, e.y)), &mut candidates);

        let mut hit_target = None;
        for target_id in candidates {
            if target_id == projectile_id {
                continue;
            }
            let hit = match objects.get(target_id) {
                Some(target) if target.kind == EntityKind::Monster && target.state == EntityState::Alive => {
                    let dx = target.x - px;
                    let dy = target.y - py;
                    let reach = target.radius + pr;
                    dx * dx + dy * dy <= reach * reach
                }
                _ => false,
            };
            if hit {
                hit_target = Some(target_id);
                break;
            }
        }

        let target_id = match hit_target {
            Some(id) => id,
            None => continue,
        };

        let died = if let Some(target) = objects.get_mut(target_id) {
            target.hp -= PROJECTILE_DAMAGE;
            target.hp <= 0
        } else {
            false
        };

        if died {
            objects.set_state(target_id, EntityState::Dead);
            outcome.hp_changes.push(HpChange { entity: target_id, hp: 0 });
            if let Some(owner_id) = owner {
                if let Some(owner_entity) = objects.get_mut(owner_id) {
                    if owner_entity.kind == EntityKind::Player {
                        owner_entity.xp += MONSTER_XP_REWARD;
                    }
                }
            }
        } else if let Some(target) = objects.get(target_id) {
            outcome.hp_changes.push(HpChange { entity: target_id, hp: target.hp });
        }

        objects.set_state(projectile_id, EntityState::Dead);
    }
}

fn resolve_body_contact(total_run_time: f64, objects: &mut ObjectManager, grid: &SpatialGrid, outcome: &mut CombatOutcome) {
    let player_ids: Vec<EntityId> = objects
        .players()
        .filter(|p| p.state == EntityState::Alive)
        .map(|p| p.id)
        .collect();

    for player_id in player_ids {
        let (px, py, invincible_until) = match objects.get(player_id) {
            Some(p) => (p.x, p.y, p.invincible_until),
            None => continue,
        };
        if total_run_time < invincible_until {
            continue;
        }

        let mut candidates = Vec::new();
        grid.query_range(px, py, PLAYER_CONTACT_RADIUS, |id| objects.get(id).map(|e| (e.x, e.y)), &mut candidates);

        let mut contact = None;
        for id in candidates {
            if let Some(monster) = objects.get(id) {
                if monster.kind != EntityKind::Monster || monster.state != EntityState::Alive {
                    continue;
                }
                let dx = px - monster.x;
                let dy = py - monster.y;
                let reach = PLAYER_CONTACT_RADIUS + monster.radius;
                if dx * dx + dy * dy <= reach * reach {
                    contact = Some((monster.x, monster.y));
                    break;
                }
            }
        }

        let (mx, my) = match contact {
            Some(pos) => pos,
            None => continue,
        };

        if let Some(player) = objects.get_mut(player_id) {
            player.hp -= MONSTER_CONTACT_DAMAGE;
            player.invincible_until = total_run_time + PLAYER_INVINCIBILITY_SECS;

            let dx = px - mx;
            let dy = py - my;
            let mag_sq = dx * dx + dy * dy;
            if mag_sq >= ZERO_VELOCITY_EPS_SQ {
                let inv_len = KNOCKBACK_SPEED / mag_sq.sqrt();
                player.vx = dx * inv_len;
                player.vy = dy * inv_len;
            }

            let hp = player.hp.max(0);
            outcome.hp_changes.push(HpChange { entity: player_id, hp });
            if player.hp <= 0 {
                objects.set_state(player_id, EntityState::Dead);
            }
        }
    }
}

/// Removes dead monsters and projectiles from the grid and entity map. Dead players are left in
/// place (kind filter below) so `all_players_dead` keeps seeing them for the game-over check.
fn sweep_dead(objects: &mut ObjectManager, grid: &mut SpatialGrid, outcome: &mut CombatOutcome) {
    let dead_ids: Vec<EntityId> = objects
        .iter()
        .filter(|e| e.state != EntityState::Alive && e.kind != EntityKind::Player)
        .map(|e| e.id)
        .collect();

    for id in dead_ids {
        grid.remove(id);
        objects.remove(id);
        outcome.despawned.push(id);
    }
}
