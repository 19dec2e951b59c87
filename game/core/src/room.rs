//! Per-room fixed-timestep tick loop: the substrate's `Strand`/`Dispatcher::set_interval`/
//! `SpatialGrid` driving a minimal wave/effect/combat simulation end to end (§4.10). A `Room`
//! advances exactly one tick per timer fire while it is `Running` and has at least one player.
use crate::combat::CombatManager;
use crate::config::GameConfig;
use crate::effect::EffectManager;
use crate::entity::{Entity, EntityId, EntityKind, EntityState, ProjectileKind};
use crate::movement::{RoomView, ZERO_VELOCITY_EPS_SQ};
use crate::object::ObjectManager;
use crate::protocol::{
    DespawnNotice, GameOverNotice, HpChangeNotice, PositionAck, PositionEntry, PositionSyncBatch, SpawnNotice,
    StateChangeNotice,
};
use crate::wave::WaveManager;
use aetherium::net::Session;
use aetherium::prelude::{Packet, PacketPool, SpatialGrid, Strand, ThreadPool, TimerListener};
use flux::logging;
use flux::SessionId;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

pub type RoomId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoomPhase {
    Lobby = 0,
    Ready = 1,
    Running = 2,
    Ended = 3,
}

struct Sim {
    phase: RoomPhase,
    total_run_time: f64,
    server_tick: u64,
    objects: ObjectManager,
    grid: SpatialGrid,
    wave: WaveManager,
    effects: EffectManager,
    combat: CombatManager,
    ready: hashbrown::HashSet<SessionId>,
    last_input_tick: HashMap<SessionId, u64>,
}

struct PerfCounters {
    last_log_tick: u64,
}

/// A room owns an `ObjectManager`, a `SpatialGrid`, the wave/effect/combat managers, its own
/// `Strand`, a server tick counter, and the set of player sessions currently joined (§3 "Room").
/// Constructed via `Arc::new_cyclic` so `on_timer` — which only receives `&self` — can still post
/// tick work onto the room's own strand as an owned `Arc<Room>`.
pub struct Room {
    id: RoomId,
    tick_interval_ms: u64,
    tick_interval_secs: f32,
    max_monsters: usize,
    strand: Strand,
    pool: Arc<PacketPool>,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    sim: Mutex<Sim>,
    perf: Mutex<PerfCounters>,
    log: logging::Logger,
    self_weak: Weak<Room>,
}

fn nearest_player_target(objects: &ObjectManager) -> Option<(f32, f32)> {
    objects.players().find(|p| p.state == EntityState::Alive).map(|p| (p.x, p.y))
}

impl Room {
    pub fn new(id: RoomId, config: &GameConfig, pool: Arc<PacketPool>, pool_threads: &Arc<ThreadPool>, log: logging::Logger) -> Arc<Room> {
        let room_cfg = config.core.room.clone();
        Arc::new_cyclic(|weak: &Weak<Room>| Room {
            id,
            tick_interval_ms: room_cfg.tick_interval_ms,
            tick_interval_secs: room_cfg.tick_interval_ms as f32 / 1000.0,
            max_monsters: room_cfg.max_monsters,
            strand: Strand::new(pool_threads),
            pool,
            sessions: Mutex::new(HashMap::new()),
            sim: Mutex::new(Sim {
                phase: RoomPhase::Lobby,
                total_run_time: 0.0,
                server_tick: 0,
                objects: ObjectManager::new(),
                grid: SpatialGrid::new(room_cfg.cell_size),
                wave: WaveManager::new(&config.waves),
                effects: EffectManager::new(),
                combat: CombatManager::new(),
                ready: hashbrown::HashSet::new(),
                last_input_tick: HashMap::new(),
            }),
            perf: Mutex::new(PerfCounters { last_log_tick: 0 }),
            log,
            self_weak: weak.clone(),
        })
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn phase(&self) -> RoomPhase {
        self.sim.lock().phase
    }

    pub fn player_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Registers this room's tick interval on `dispatcher`'s timer service. Must be called once,
    /// after the room has been constructed, from whatever owns the `Arc<Dispatcher>` (§4.6 —
    /// timers are owned by the dispatcher thread).
    pub fn start(self: &Arc<Self>, dispatcher: &aetherium::prelude::Dispatcher) {
        let listener: Weak<dyn TimerListener> = self.self_weak.clone() as Weak<dyn TimerListener>;
        dispatcher.set_interval(self.tick_interval_ms, listener, self.id);
    }

    /// Adds a joined player to the room, using the player's session ID directly as its entity ID
    /// (a pragmatic 1:1 simplification for this reference gameplay loop — a production mapping
    /// would track session-to-entity separately to allow reconnection under a new session).
    pub fn join_player(self: &Arc<Self>, session_id: SessionId, session: Arc<Session>, spawn_x: f32, spawn_y: f32) {
        {
            let mut sim = self.sim.lock();
            let entity = Entity {
                id: session_id,
                kind: EntityKind::Player,
                x: spawn_x,
                y: spawn_y,
                vx: 0.0,
                vy: 0.0,
                radius: 1.0,
                hp: 100,
                max_hp: 100,
                xp: 0,
                state: EntityState::Alive,
                facing: 0.0,
                owner: None,
                projectile: None,
                orbit_angle: 0.0,
                invincible_until: 0.0,
                movement: None,
            };
            sim.grid.add(session_id, spawn_x, spawn_y);
            sim.objects.insert(entity);
            sim.last_input_tick.insert(session_id, 0);
            if sim.phase == RoomPhase::Lobby {
                sim.phase = RoomPhase::Ready;
            }
        }
        self.sessions.lock().insert(session_id, session);
        logging::info!(self.log, "player joined room"; "room_id" => self.id, "session_id" => session_id);
    }

    pub fn leave_player(&self, session_id: SessionId) {
        self.sessions.lock().remove(&session_id);
        let mut sim = self.sim.lock();
        sim.ready.remove(&session_id);
        sim.last_input_tick.remove(&session_id);
        sim.grid.remove(session_id);
        sim.objects.remove(session_id);
        logging::info!(self.log, "player left room"; "room_id" => self.id, "session_id" => session_id);
    }

    /// Applies a client's per-tick movement input directly to its player entity (players have no
    /// AI movement strategy of their own) and records the input tick, echoed back by the next
    /// position-ack broadcast (§4.10 step 9).
    pub fn apply_input(&self, session_id: SessionId, vx: f32, vy: f32, input_tick: u64) {
        let mut sim = self.sim.lock();
        sim.last_input_tick.insert(session_id, input_tick);
        if let Some(player) = sim.objects.get_mut(session_id) {
            if player.kind == EntityKind::Player && player.state == EntityState::Alive {
                player.vx = vx;
                player.vy = vy;
            }
        }
    }

    /// The application-level analog of "all joined players sent GAME_READY" (§4.10 state
    /// machine): a packet handler calls this once per ready signal; the room transitions to
    /// Running once every currently-joined session has checked in.
    pub fn player_ready(&self, session_id: SessionId) {
        let mut sim = self.sim.lock();
        if sim.phase != RoomPhase::Ready {
            return;
        }
        sim.ready.insert(session_id);
        let joined = self.sessions.lock().len();
        if joined > 0 && sim.ready.len() >= joined {
            sim.phase = RoomPhase::Running;
            drop(sim);
            self.broadcast(&StateChangeNotice { state: RoomPhase::Running as u8 });
        }
    }

    fn on_timer_fired(self: &Arc<Self>) {
        let dt = self.tick_interval_secs;
        let strand = self.strand.clone();
        let room = Arc::clone(self);
        strand.post(move || room.execute_update(dt));
    }

    fn execute_update(&self, dt: f32) {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.run_tick(dt)));
        if outcome.is_err() {
            let sim = self.sim.lock();
            logging::error!(self.log, "tick failed, skipping";
                "room_id" => self.id, "tick" => sim.server_tick,
                "entities" => sim.objects.iter().count());
        }
    }

    fn run_tick(&self, dt: f32) {
        struct TickOutputs {
            spawned: Vec<crate::wave::SpawnedMonster>,
            hp_changes: Vec<crate::combat::HpChange>,
            despawned: Vec<EntityId>,
            entries: Vec<PositionEntry>,
            acks: Vec<(SessionId, u64)>,
            ended: Option<bool>, // Some(victory) once the match concludes this tick
            tick: u64,
        }

        let outputs = {
            let mut sim = self.sim.lock();

            // Step 1: early-out unless the room is live.
            if sim.phase != RoomPhase::Running || sim.objects.player_count() == 0 {
                return;
            }

            // Step 2: advance the clock.
            sim.total_run_time += dt as f64;
            sim.server_tick += 1;
            let tick = sim.server_tick;
            let total_run_time = sim.total_run_time;

            // Step 3: waves.
            let max_monsters = self.max_monsters;
            let spawned = if sim.objects.alive_monster_count() < max_monsters {
                sim.wave.update(tick, &mut sim.objects, &mut sim.grid)
            } else {
                Vec::new()
            };

            // Step 4: effects (snapshot-then-revalidate internally).
            sim.effects.update(total_run_time, &mut sim.objects);

            // Step 5: grid rebuild — cheap no-op for any entity whose cell hasn't changed.
            for id in sim.objects.ids() {
                if let Some(e) = sim.objects.get(id) {
                    if e.state == EntityState::Alive {
                        let (x, y) = (e.x, e.y);
                        sim.grid.update(id, x, y);
                    }
                }
            }

            // Step 6: AI movement strategy.
            let target = nearest_player_target(&sim.objects);
            if let Some((tx, ty)) = target {
                let ai_ids: Vec<EntityId> = sim
                    .objects
                    .iter()
                    .filter(|e| e.kind == EntityKind::Monster && e.state == EntityState::Alive && e.movement.is_some())
                    .map(|e| e.id)
                    .collect();

                for id in ai_ids {
                    let strategy = match sim.objects.get(id) {
                        Some(e) => e.movement.clone(),
                        None => continue,
                    };
                    let strategy = match strategy {
                        Some(s) => s,
                        None => continue,
                    };
                    let (vx, vy) = {
                        let view = RoomView { grid: &sim.grid, objects: &sim.objects };
                        let entity = match sim.objects.get(id) {
                            Some(e) => e,
                            None => continue,
                        };
                        strategy.compute_desired_velocity(entity, &view, dt, tx, ty)
                    };
                    if let Some(e) = sim.objects.get_mut(id) {
                        e.vx = vx;
                        e.vy = vy;
                    }
                }
            }

            // Step 7: physics integration. Orbit projectiles are resolved against a position
            // snapshot so a mutable borrow of the moving entity never aliases the lookup of its
            // orbit center.
            let positions: HashMap<EntityId, (f32, f32)> = sim.objects.iter().map(|e| (e.id, (e.x, e.y))).collect();
            for id in sim.objects.ids() {
                let kind = match sim.objects.get(id) {
                    Some(e) if e.state == EntityState::Alive => e.projectile,
                    _ => continue,
                };
                if let Some(e) = sim.objects.get_mut(id) {
                    match kind {
                        Some(ProjectileKind::Orbit { center, radius, angular_velocity }) => {
                            e.orbit_angle += angular_velocity * dt as f64;
                            if let Some(&(cx, cy)) = positions.get(&center) {
                                e.x = cx + radius * (e.orbit_angle.cos() as f32);
                                e.y = cy + radius * (e.orbit_angle.sin() as f32);
                            }
                        }
                        _ => {
                            let mag_sq = e.vx * e.vx + e.vy * e.vy;
                            if mag_sq >= ZERO_VELOCITY_EPS_SQ {
                                e.x += e.vx * dt;
                                e.y += e.vy * dt;
                            }
                        }
                    }
                }
            }

            // Step 8: combat resolution (projectile damage, body contact, cleanup sweep).
            let combat_outcome = sim.combat.update(total_run_time, &mut sim.objects, &mut sim.grid);

            let mut ended = None;
            if combat_outcome.game_over {
                ended = Some(false);
            } else if sim.wave.is_exhausted() && sim.objects.alive_monster_count() == 0 {
                ended = Some(true);
            }
            if let Some(_victory) = ended {
                sim.phase = RoomPhase::Ended;
            }

            // Step 9: network sync — batched position update, filtered for non-finite values.
            let mut entries = Vec::new();
            for e in sim.objects.iter() {
                if e.state != EntityState::Alive {
                    continue;
                }
                if !e.x.is_finite() || !e.y.is_finite() || !e.vx.is_finite() || !e.vy.is_finite() {
                    continue;
                }
                entries.push(PositionEntry {
                    id: e.id,
                    x: e.x,
                    y: e.y,
                    vx: e.vx,
                    vy: e.vy,
                    state: e.state,
                    facing: e.facing,
                });
            }
            let acks: Vec<(SessionId, u64)> = sim.last_input_tick.iter().map(|(&sid, &t)| (sid, t)).collect();

            TickOutputs {
                spawned,
                hp_changes: combat_outcome.hp_changes,
                despawned: combat_outcome.despawned,
                entries,
                acks,
                ended,
                tick,
            }
        };

        // I/O below runs with the tick lock released.
        for monster in &outputs.spawned {
            self.broadcast(&SpawnNotice { id: monster.id, x: monster.x, y: monster.y });
        }
        for hp in &outputs.hp_changes {
            self.broadcast(&HpChangeNotice { id: hp.entity, hp: hp.hp });
        }
        if !outputs.despawned.is_empty() {
            self.broadcast(&DespawnNotice { ids: outputs.despawned.clone() });
        }
        self.broadcast(&PositionSyncBatch { entries: outputs.entries });
        for (session_id, last_tick) in &outputs.acks {
            self.send_to(*session_id, &PositionAck { player_id: *session_id, last_input_tick: *last_tick });
        }
        if let Some(victory) = outputs.ended {
            self.broadcast(&GameOverNotice { victory });
            self.broadcast(&StateChangeNotice { state: RoomPhase::Ended as u8 });
        }

        // Step 10: perf counters, logged once per second.
        let ticks_per_second = (1000 / self.tick_interval_ms.max(1)).max(1);
        let mut perf = self.perf.lock();
        if outputs.tick >= perf.last_log_tick + ticks_per_second {
            perf.last_log_tick = outputs.tick;
            let sim = self.sim.lock();
            logging::info!(self.log, "room tick";
                "room_id" => self.id, "tick" => outputs.tick,
                "entities" => sim.objects.iter().count(),
                "alive_monsters" => sim.objects.alive_monster_count());
        }
    }

    fn broadcast(&self, packet: &dyn Packet) {
        let bytes = aetherium::net::frame::encode(packet);
        let message = match self.pool.allocate(aetherium::prelude::MessageTag::NetworkData, &bytes) {
            Some(m) => m,
            None => {
                logging::warn!(self.log, "packet pool exhausted on room broadcast"; "room_id" => self.id);
                return;
            }
        };
        let sessions = self.sessions.lock();
        for session in sessions.values() {
            session.send_pre_serialized(&message);
        }
    }

    fn send_to(&self, session_id: SessionId, packet: &dyn Packet) {
        let sessions = self.sessions.lock();
        if let Some(session) = sessions.get(&session_id) {
            session.send_packet(packet);
        }
    }
}

impl TimerListener for Room {
    fn on_timer(&self, _timer_id: u64, _param: u64) {
        if let Some(room) = self.self_weak.upgrade() {
            room.on_timer_fired();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GameConfig {
        let mut config = GameConfig::default();
        config.waves.entries = vec![crate::config::WaveEntry { at_tick: 1, count: 2 }];
        config
    }

    fn room() -> Arc<Room> {
        let pool = PacketPool::new(Default::default());
        let threads = ThreadPool::new(2, logging::discard());
        Room::new(1, &config(), pool, &threads, logging::discard())
    }

    #[test]
    fn applying_input_moves_the_player_and_records_the_tick() {
        let room = room();
        {
            let mut sim = room.sim.lock();
            sim.objects.insert(Entity {
                id: 7,
                kind: EntityKind::Player,
                x: 0.0,
                y: 0.0,
                vx: 0.0,
                vy: 0.0,
                radius: 1.0,
                hp: 100,
                max_hp: 100,
                xp: 0,
                state: EntityState::Alive,
                facing: 0.0,
                owner: None,
                projectile: None,
                orbit_angle: 0.0,
                invincible_until: 0.0,
                movement: None,
            });
        }
        room.apply_input(7, 1.0, -1.0, 42);
        let sim = room.sim.lock();
        let player = sim.objects.get(7).unwrap();
        assert_eq!((player.vx, player.vy), (1.0, -1.0));
        assert_eq!(sim.last_input_tick.get(&7), Some(&42));
    }

    #[test]
    fn a_room_with_no_players_never_ticks() {
        let room = room();
        {
            let mut sim = room.sim.lock();
            sim.phase = RoomPhase::Running;
        }
        room.execute_update(0.04);
        assert_eq!(room.sim.lock().server_tick, 0);
    }

    #[test]
    fn the_room_starts_in_lobby_and_transitions_to_ready_once_a_session_is_marked() {
        let room = room();
        assert_eq!(room.phase(), RoomPhase::Lobby);

        {
            let mut sim = room.sim.lock();
            sim.phase = RoomPhase::Ready;
        }
        assert_eq!(room.phase(), RoomPhase::Ready);
    }

    #[test]
    fn a_running_tick_spawns_a_wave_and_advances_the_counter() {
        let room = room();
        {
            let mut sim = room.sim.lock();
            sim.phase = RoomPhase::Running;
            sim.objects.insert(Entity {
                id: 1,
                kind: EntityKind::Player,
                x: 0.0,
                y: 0.0,
                vx: 0.0,
                vy: 0.0,
                radius: 1.0,
                hp: 100,
                max_hp: 100,
                xp: 0,
                state: EntityState::Alive,
                facing: 0.0,
                owner: None,
                projectile: None,
                orbit_angle: 0.0,
                invincible_until: 0.0,
                movement: None,
            });
        }
        room.execute_update(0.04);
        let sim = room.sim.lock();
        assert_eq!(sim.server_tick, 1);
        assert_eq!(sim.objects.alive_monster_count(), 2);
    }

    #[test]
    fn repeated_runs_from_the_same_seed_produce_identical_monster_positions() {
        let run = || {
            let room = room();
            {
                let mut sim = room.sim.lock();
                sim.phase = RoomPhase::Running;
                sim.objects.insert(Entity {
                    id: 1,
                    kind: EntityKind::Player,
                    x: 0.0,
                    y: 0.0,
                    vx: 0.0,
                    vy: 0.0,
                    radius: 1.0,
                    hp: 100,
                    max_hp: 100,
                    xp: 0,
                    state: EntityState::Alive,
                    facing: 0.0,
                    owner: None,
                    projectile: None,
                    orbit_angle: 0.0,
                    invincible_until: 0.0,
                    movement: None,
                });
            }
            for _ in 0..20 {
                room.execute_update(0.04);
            }
            let sim = room.sim.lock();
            let mut positions: Vec<(EntityId, (i32, i32))> = sim
                .objects
                .iter()
                .filter(|e| e.kind == EntityKind::Monster)
                .map(|e| (e.id, ((e.x * 1000.0) as i32, (e.y * 1000.0) as i32)))
                .collect();
            positions.sort_by_key(|&(id, _)| id);
            positions
        };

        assert_eq!(run(), run());
    }
}
