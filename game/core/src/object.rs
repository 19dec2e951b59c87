//! ID→entity registry for a room, with an alive-monster counter kept in sync through a single
//! `set_state` choke point rather than scattered increments (§3 "Room" data model: ObjectManager).
use crate::entity::{Entity, EntityId, EntityKind, EntityState};
use hashbrown::HashMap;

pub struct ObjectManager {
    entities: HashMap<EntityId, Entity>,
    next_id: EntityId,
    alive_monsters: usize,
}

impl ObjectManager {
    pub fn new() -> Self {
        ObjectManager {
            entities: HashMap::new(),
            next_id: 1,
            alive_monsters: 0,
        }
    }

    /// Reserves a fresh id without inserting an entity yet.
    pub fn alloc_id(&mut self) -> EntityId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, entity: Entity) {
        if entity.kind == EntityKind::Monster && entity.state == EntityState::Alive {
            self.alive_monsters += 1;
        }
        self.entities.insert(entity.id, entity);
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    /// Transitions `id`'s state, keeping `alive_monster_count` accurate across the
    /// Alive/Dead/Expired boundary. A no-op if `id` isn't present.
    pub fn set_state(&mut self, id: EntityId, new_state: EntityState) {
        if let Some(entity) = self.entities.get_mut(&id) {
            if entity.kind == EntityKind::Monster {
                if entity.state == EntityState::Alive && new_state != EntityState::Alive {
                    self.alive_monsters = self.alive_monsters.saturating_sub(1);
                } else if entity.state != EntityState::Alive && new_state == EntityState::Alive {
                    self.alive_monsters += 1;
                }
            }
            entity.state = new_state;
        }
    }

    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        let removed = self.entities.remove(&id);
        if let Some(entity) = &removed {
            if entity.kind == EntityKind::Monster && entity.state == EntityState::Alive {
                self.alive_monsters = self.alive_monsters.saturating_sub(1);
            }
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    pub fn alive_monster_count(&self) -> usize {
        self.alive_monsters
    }

    pub fn players(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values().filter(|e| e.kind == EntityKind::Player)
    }

    pub fn player_count(&self) -> usize {
        self.players().count()
    }

    /// `true` only once at least one player has joined and every one of them is dead; an empty
    /// room never reports a loss.
    pub fn all_players_dead(&self) -> bool {
        let mut any = false;
        for player in self.players() {
            any = true;
            if player.state == EntityState::Alive {
                return false;
            }
        }
        any
    }
}

impl Default for ObjectManager {
    fn default() -> Self {
        Self::new()
    }
}
