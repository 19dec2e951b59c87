//! Wave spawner: fires monsters into the room on a fixed per-tick schedule, using a seeded RNG so
//! a replay at the same seed reproduces a bitwise-identical spawn/position trace (§8 scenario 4).
use crate::config::WaveScheduleConfig;
use crate::entity::{Entity, EntityKind, EntityState};
use crate::movement::{ChaserStrategy, MovementStrategy, SwarmStrategy, WanderStrategy};
use crate::object::ObjectManager;
use aetherium::prelude::SpatialGrid;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

const SPAWN_RING_RADIUS: f32 = 40.0;
const MONSTER_RADIUS: f32 = 1.0;
const MONSTER_HP: i32 = 30;
const MONSTER_SPEED: f32 = 3.0;

pub struct SpawnedMonster {
    pub id: u64,
    pub x: f32,
    pub y: f32,
}

pub struct WaveManager {
    entries: Vec<(u64, usize)>,
    next_wave: usize,
    rng: StdRng,
}

impl WaveManager {
    pub fn new(config: &WaveScheduleConfig) -> Self {
        let mut entries: Vec<(u64, usize)> = config.entries.iter().map(|e| (e.at_tick, e.count)).collect();
        entries.sort_by_key(|&(at_tick, _)| at_tick);
        WaveManager {
            entries,
            next_wave: 0,
            rng: StdRng::seed_from_u64(config.seed),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.next_wave >= self.entries.len()
    }

    /// Spawns every wave whose `at_tick` has arrived, adding each monster to `objects` and `grid`.
    /// Returns the spawned monsters so the room can broadcast SPAWN notices (§4.10 step 3).
    pub fn update(&mut self, tick: u64, objects: &mut ObjectManager, grid: &mut SpatialGrid) -> Vec<SpawnedMonster> {
        let mut spawned = Vec::new();

        while self.next_wave < self.entries.len() && self.entries[self.next_wave].0 <= tick {
            let (_, count) = self.entries[self.next_wave];
            for i in 0..count {
                let angle: f32 = self.rng.gen_range(0.0f32..std::f32::consts::TAU);
                let x = angle.cos() * SPAWN_RING_RADIUS;
                let y = angle.sin() * SPAWN_RING_RADIUS;
                let id = objects.alloc_id();

                let strategy: Arc<dyn MovementStrategy> = match i % 3 {
                    0 => Arc::new(ChaserStrategy { speed: MONSTER_SPEED }),
                    1 => Arc::new(SwarmStrategy {
                        speed: MONSTER_SPEED,
                        separation_radius: 3.0,
                    }),
                    _ => Arc::new(WanderStrategy { speed: MONSTER_SPEED }),
                };

                let entity = Entity {
                    id,
                    kind: EntityKind::Monster,
                    x,
                    y,
                    vx: 0.0,
                    vy: 0.0,
                    radius: MONSTER_RADIUS,
                    hp: MONSTER_HP,
                    max_hp: MONSTER_HP,
                    xp: 0,
                    state: EntityState::Alive,
                    facing: angle,
                    owner: None,
                    projectile: None,
                    orbit_angle: 0.0,
                    invincible_until: 0.0,
                    movement: Some(strategy),
                };

                grid.add(id, x, y);
                objects.insert(entity);
                spawned.push(SpawnedMonster { id, x, y });
            }
            self.next_wave += 1;
        }

        spawned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WaveEntry;

    fn config() -> WaveScheduleConfig {
        WaveScheduleConfig {
            seed: 0xDEAD_BEEF,
            entries: vec![WaveEntry { at_tick: 5, count: 3 }, WaveEntry { at_tick: 10, count: 2 }],
        }
    }

    #[test]
    fn spawns_nothing_before_the_scheduled_tick() {
        let mut wave = WaveManager::new(&config());
        let mut objects = ObjectManager::new();
        let mut grid = SpatialGrid::new(4.0);
        let spawned = wave.update(1, &mut objects, &mut grid);
        assert!(spawned.is_empty());
    }

    #[test]
    fn spawns_the_configured_count_once_the_tick_arrives() {
        let mut wave = WaveManager::new(&config());
        let mut objects = ObjectManager::new();
        let mut grid = SpatialGrid::new(4.0);
        let spawned = wave.update(5, &mut objects, &mut grid);
        assert_eq!(spawned.len(), 3);
        assert_eq!(objects.alive_monster_count(), 3);
    }

    #[test]
    fn same_seed_produces_the_same_spawn_positions() {
        let mut a_wave = WaveManager::new(&config());
        let mut a_objects = ObjectManager::new();
        let mut a_grid = SpatialGrid::new(4.0);
        let a = a_wave.update(5, &mut a_objects, &mut a_grid);

        let mut b_wave = WaveManager::new(&config());
        let mut b_objects = ObjectManager::new();
        let mut b_grid = SpatialGrid::new(4.0);
        let b = b_wave.update(5, &mut b_objects, &mut b_grid);

        let a_positions: Vec<(f32, f32)> = a.iter().map(|m| (m.x, m.y)).collect();
        let b_positions: Vec<(f32, f32)> = b.iter().map(|m| (m.x, m.y)).collect();
        assert_eq!(a_positions, b_positions);
    }

    #[test]
    fn is_exhausted_once_every_wave_has_fired() {
        let mut wave = WaveManager::new(&config());
        let mut objects = ObjectManager::new();
        let mut grid = SpatialGrid::new(4.0);
        wave.update(20, &mut objects, &mut grid);
        assert!(wave.is_exhausted());
    }
}
