//! Reference gameplay loop built on top of `aetherium`'s networking/concurrency substrate: a
//! fixed-tick room that spawns monster waves, runs simple AI, resolves combat, and replicates
//! state to its joined players.
pub mod combat;
pub mod config;
pub mod effect;
pub mod entity;
pub mod movement;
pub mod object;
pub mod protocol;
pub mod room;
pub mod wave;

pub use config::GameConfig;
pub use entity::{Entity, EntityId, EntityKind, EntityState};
pub use object::ObjectManager;
pub use room::{Room, RoomId, RoomPhase};
