//! Status-effect ticking against the room's shared `totalRunTime` clock. Iterates a snapshot of
//! affected entity IDs rather than the live map, because applying one effect (a lethal
//! damage-over-time tick) can remove its own target from `objects` mid-pass (§4.10 step 4).
use crate::entity::{EntityId, EntityState};
use crate::object::ObjectManager;
use hashbrown::HashMap;

#[derive(Debug, Clone, Copy)]
pub enum EffectKind {
    DamageOverTime { per_tick: i32, interval: f64 },
    HealOverTime { per_tick: i32, interval: f64 },
}

#[derive(Debug, Clone, Copy)]
pub struct Effect {
    pub kind: EffectKind,
    pub expires_at: f64,
    pub last_applied_at: f64,
}

pub struct EffectManager {
    effects: HashMap<EntityId, Vec<Effect>>,
}

impl EffectManager {
    pub fn new() -> Self {
        EffectManager { effects: HashMap::new() }
    }

    pub fn apply(&mut self, target: EntityId, effect: Effect) {
        self.effects.entry(target).or_insert_with(Vec::new).push(effect);
    }

    pub fn clear_for(&mut self, target: EntityId) {
        self.effects.remove(&target);
    }

    pub fn update(&mut self, total_run_time: f64, objects: &mut ObjectManager) {
        let targets: Vec<EntityId> = self.effects.keys().copied().collect();

        for id in targets {
            if objects.get(id).is_none() {
                self.effects.remove(&id);
                continue;
            }

            let active = match self.effects.remove(&id) {
                Some(effects) => effects,
                None => continue,
            };

            let mut remaining = Vec::with_capacity(active.len());
            for mut effect in active {
                if total_run_time >= effect.expires_at {
                    continue;
                }
                if objects.get(id).is_none() {
                    continue;
                }

                let interval = match effect.kind {
                    EffectKind::DamageOverTime { interval, .. } => interval,
                    EffectKind::HealOverTime { interval, .. } => interval,
                };

                if total_run_time - effect.last_applied_at >= interval {
                    effect.last_applied_at = total_run_time;
                    match effect.kind {
                        EffectKind::DamageOverTime { per_tick, .. } => {
                            if let Some(entity) = objects.get_mut(id) {
                                entity.hp -= per_tick;
                                if entity.hp <= 0 {
                                    objects.set_state(id, EntityState::Dead);
                                }
                            }
                        }
                        EffectKind::HealOverTime { per_tick, .. } => {
                            if let Some(entity) = objects.get_mut(id) {
                                entity.hp = (entity.hp + per_tick).min(entity.max_hp);
                            }
                        }
                    }
                }

                let still_alive = objects.get(id).map(|e| e.state == EntityState::Alive).unwrap_or(false);
                if still_alive {
                    remaining.push(effect);
                }
            }

            if !remaining.is_empty() {
                self.effects.insert(id, remaining);
            }
        }
    }
}

impl Default for EffectManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntityKind};

    fn target(id: EntityId, hp: i32) -> Entity {
        Entity {
            id,
            kind: EntityKind::Monster,
            x: 0.0,
            y: 0.0,
            vx: 0.0,
            vy: 0.0,
            radius: 1.0,
            hp,
            max_hp: hp,
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
    fn damage_over_time_applies_once_per_interval() {
        let mut objects = ObjectManager::new();
        objects.insert(target(1, 100));
        let mut effects = EffectManager::new();
        effects.apply(
            1,
            Effect {
                kind: EffectKind::DamageOverTime { per_tick: 10, interval: 1.0 },
                expires_at: 5.0,
                last_applied_at: 0.0,
            },
        );

        effects.update(0.5, &mut objects);
        assert_eq!(objects.get(1).unwrap().hp, 100);

        effects.update(1.1, &mut objects);
        assert_eq!(objects.get(1).unwrap().hp, 90);
    }

    #[test]
    fn a_lethal_tick_does_not_panic_on_the_next_entry_in_the_same_pass() {
        let mut objects = ObjectManager::new();
        objects.insert(target(1, 5));
        objects.insert(target(2, 100));
        let mut effects = EffectManager::new();
        effects.apply(
            1,
            Effect {
                kind: EffectKind::DamageOverTime { per_tick: 10, interval: 0.0 },
                expires_at: 5.0,
                last_applied_at: -1.0,
            },
        );
        effects.apply(
            2,
            Effect {
                kind: EffectKind::DamageOverTime { per_tick: 10, interval: 0.0 },
                expires_at: 5.0,
                last_applied_at: -1.0,
            },
        );

        effects.update(0.0, &mut objects);
        assert_eq!(objects.get(1).unwrap().state, EntityState::Dead);
        assert_eq!(objects.get(2).unwrap().hp, 90);
    }
}
