//! Reference server binary: wires the `aetherium` substrate (dispatcher, acceptor, thread pool,
//! packet/session pools, database, metrics, console) to a single `gamecore::Room` so the
//! reference gameplay loop can be exercised end to end over a real socket.
use aetherium::concurrency::ThreadPool;
use aetherium::console::{self, ConsoleState};
use aetherium::db::{Database, DatabaseConfig as DbConfig};
use aetherium::dispatcher::{Dispatcher, DispatcherConfig, NetworkHandler, PacketView};
use aetherium::memory::{PacketPool, PacketPoolConfig, SessionPool, SessionPoolConfig};
use aetherium::metrics::{self, Metrics};
use aetherium::net::acceptor::{Acceptor, CipherFactory};
use aetherium::net::session::{HeartbeatConfig, SessionSlot};
use aetherium::net::udp::UdpReceiver;
use clap::Parser;
use flux::logging::{self, o};
use flux::SessionId;
use gamecore::protocol::{ClientInput, PACKET_CLIENT_INPUT, PACKET_GAME_READY};
use gamecore::{GameConfig, Room, RoomId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TIMER_DRIVER_INTERVAL_MS: u64 = 10;
const UDP_DRIVER_INTERVAL_MS: u64 = 10;
const WORLD_ROOM_ID: RoomId = 1;

#[derive(Parser)]
#[command(name = "gamerunner", about = "Reference game server built on the aetherium substrate")]
struct CliOptions {
    /// Path to the server's TOML configuration file. Missing or partial files still produce a
    /// runnable server, since every field has a default.
    #[arg(long, default_value = "game_config.toml")]
    config: String,
}

/// Routes dispatcher events into the single world room. `acceptor` is filled in after the
/// acceptor is bound, since binding it requires the dispatcher to already have a handler set.
struct GameHandler {
    room: Arc<Room>,
    acceptor: Mutex<Option<Arc<Acceptor>>>,
    udp_receiver: Arc<UdpReceiver>,
    log: logging::Logger,
}

impl GameHandler {
    fn new(room: Arc<Room>, udp_receiver: Arc<UdpReceiver>, log: logging::Logger) -> Arc<GameHandler> {
        Arc::new(GameHandler {
            room,
            acceptor: Mutex::new(None),
            udp_receiver,
            log,
        })
    }

    fn set_acceptor(&self, acceptor: Arc<Acceptor>) {
        *self.acceptor.lock() = Some(acceptor);
    }
}

impl NetworkHandler for GameHandler {
    fn on_connect(&self, session_id: SessionId) {
        let session = match self.acceptor.lock().as_ref().and_then(|a| a.session(session_id)) {
            Some(session) => session,
            None => return,
        };
        // Opens the companion UDP side channel bound to the TCP peer's address with its UDP
        // port zeroed out — the client's real UDP endpoint is unknown until its first token-
        // bearing datagram arrives, at which point `UdpReceiver::handle_datagram`'s token-match
        // rebind (§4.4) moves the mapping to the real source address. The application never
        // learns its session id/token pair over this reference wiring; that bootstrap handshake
        // is left to callers (see DESIGN.md).
        let mut udp_peer = session.peer();
        udp_peer.set_port(0);
        let _ = self.udp_receiver.open_session(udp_peer);
        self.room.join_player(session_id, session, 0.0, 0.0);
    }

    fn on_disconnect(&self, session_id: SessionId) {
        self.room.leave_player(session_id);
    }

    fn on_data(&self, session_id: SessionId, view: PacketView<'_>) {
        match view.id {
            PACKET_GAME_READY => self.room.player_ready(session_id),
            PACKET_CLIENT_INPUT => match ClientInput::decode(view.payload) {
                Some(input) => self.room.apply_input(session_id, input.vx, input.vy, input.input_tick),
                None => {
                    logging::warn!(self.log, "truncated client input"; "session_id" => session_id);
                }
            },
            other => {
                logging::warn!(self.log, "unrecognized packet id"; "session_id" => session_id, "packet_id" => other);
            }
        }
    }
}

struct RunnerConsoleState {
    acceptor: Arc<Acceptor>,
    stop: Arc<AtomicBool>,
}

impl ConsoleState for RunnerConsoleState {
    fn live_session_count(&self) -> usize {
        self.acceptor.live_session_count()
    }

    fn live_room_count(&self) -> usize {
        1
    }

    fn request_shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn main() {
    let cli = CliOptions::parse();
    let config = GameConfig::load(&cli.config).unwrap_or_else(|err| {
        eprintln!("failed to load {}: {} — starting from defaults", cli.config, err);
        GameConfig::default()
    });

    let log = logging::init("gamerunner", &config.core.logging);
    logging::install_crash_hook(log.clone());

    let dispatcher_config = DispatcherConfig {
        worker_count: config.core.server.task_worker_count.max(1),
        ..Default::default()
    };
    let dispatcher = Dispatcher::new(dispatcher_config, log.new(o!("subsystem" => "dispatcher")));

    let room_threads = ThreadPool::new(
        config.core.server.worker_thread_count.max(1),
        log.new(o!("subsystem" => "threadpool")),
    );
    let packet_pool = PacketPool::new(PacketPoolConfig::default());

    let next_session_id = Arc::new(AtomicU64::new(1));
    let session_pool = Arc::new(SessionPool::new(SessionPoolConfig::default(), {
        let next_session_id = Arc::clone(&next_session_id);
        move || SessionSlot {
            id: next_session_id.fetch_add(1, Ordering::SeqCst),
        }
    }));

    let cipher_config = config.core.encryption.clone();
    let cipher_factory: CipherFactory = Box::new(move || cipher_config.build_adapter());

    let db_config = DbConfig {
        address: config.core.database.address.clone(),
        pool_size: config.core.database.pool_size,
    };
    let db_log = log.new(o!("subsystem" => "database"));
    let database = Database::open(&db_config, config.core.server.db_worker_count, db_log.clone()).unwrap_or_else(|err| {
        logging::warn!(log, "failed to open configured database, falling back to in-memory"; "error" => %err);
        Database::open_in_memory(db_config.pool_size, config.core.server.db_worker_count, db_log)
            .expect("failed to open in-memory database")
    });
    // The reference gameplay loop in `gamecore` has no persistence needs of its own; `database`
    // demonstrates the substrate's contract and is where an application would store player state.
    let _ = database;

    let metrics = Metrics::new();
    let monitor = metrics::spawn_monitor(metrics.clone(), log.new(o!("subsystem" => "monitor")));

    let room = Room::new(
        WORLD_ROOM_ID,
        &config,
        Arc::clone(&packet_pool),
        &room_threads,
        log.new(o!("room_id" => WORLD_ROOM_ID)),
    );

    let udp_receiver = UdpReceiver::bind(
        config.core.server.udp_port,
        Arc::clone(&packet_pool),
        Arc::clone(&dispatcher),
        log.new(o!("subsystem" => "udp")),
    )
    .expect("failed to bind udp receiver");

    let handler = GameHandler::new(
        Arc::clone(&room),
        Arc::clone(&udp_receiver),
        log.new(o!("subsystem" => "handler")),
    );
    dispatcher.set_handler(Arc::clone(&handler) as Arc<dyn NetworkHandler>);

    let worker_handles = dispatcher.start();

    let acceptor = Acceptor::bind(
        config.core.server.port,
        Arc::clone(&dispatcher),
        Arc::clone(&packet_pool),
        Arc::clone(&session_pool),
        cipher_factory,
        HeartbeatConfig::default(),
        log.new(o!("subsystem" => "acceptor")),
    )
    .expect("failed to bind acceptor");
    handler.set_acceptor(Arc::clone(&acceptor));

    room.start(&dispatcher);

    let stop = Arc::new(AtomicBool::new(false));

    let acceptor_loop = Arc::clone(&acceptor);
    let acceptor_stop = Arc::clone(&stop);
    let acceptor_thread = std::thread::Builder::new()
        .name("acceptor".to_string())
        .spawn(move || acceptor_loop.run(&acceptor_stop))
        .expect("failed to spawn acceptor thread");

    let timer_stop = Arc::clone(&stop);
    let timer_dispatcher = Arc::clone(&dispatcher);
    let timer_thread = std::thread::Builder::new()
        .name("timer-driver".to_string())
        .spawn(move || {
            while !timer_stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(TIMER_DRIVER_INTERVAL_MS));
                timer_dispatcher.post_timer_tick();
            }
        })
        .expect("failed to spawn timer driver thread");

    let udp_loop = Arc::clone(&udp_receiver);
    let udp_stop = Arc::clone(&stop);
    let udp_thread = std::thread::Builder::new()
        .name("udp-receiver".to_string())
        .spawn(move || udp_loop.run(&udp_stop))
        .expect("failed to spawn udp receiver thread");

    let udp_update_receiver = Arc::clone(&udp_receiver);
    let udp_update_stop = Arc::clone(&stop);
    let udp_update_thread = std::thread::Builder::new()
        .name("udp-update-driver".to_string())
        .spawn(move || {
            while !udp_update_stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(UDP_DRIVER_INTERVAL_MS));
                let now = (flux::time::timestamp_millis() & u32::MAX as u64) as u32;
                udp_update_receiver.update_all(now);
            }
        })
        .expect("failed to spawn udp update driver thread");

    logging::info!(log, "gamerunner started"; "port" => config.core.server.port, "udp_port" => config.core.server.udp_port);

    let console_state: Arc<dyn ConsoleState> = Arc::new(RunnerConsoleState {
        acceptor: Arc::clone(&acceptor),
        stop: Arc::clone(&stop),
    });
    console::run(
        std::io::stdin().lock(),
        Arc::clone(&dispatcher),
        metrics.clone(),
        console_state,
        log.new(o!("subsystem" => "console")),
    );

    stop.store(true, Ordering::SeqCst);
    dispatcher.stop();
    acceptor_thread.join().ok();
    timer_thread.join().ok();
    udp_thread.join().ok();
    udp_update_thread.join().ok();
    for handle in worker_handles {
        handle.join().ok();
    }
    monitor.stop();

    logging::info!(log, "gamerunner stopped");
}
