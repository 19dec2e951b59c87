//! TCP accept loop: a `mio::Poll` reactor that accepts connections, hands each to the
//! `SessionPool`, and drives readable/writable events into the matching `Session` (§4.3).
//! Grounded on the teacher's mio-based reactor shape, rebuilt against the current
//! `Dispatcher`/`SessionPool` pair instead of the retired handshake `Endpoint`.
use crate::dispatcher::{Dispatcher, Quiescent};
use crate::memory::{PacketPool, SessionPool};
use crate::net::session::{HeartbeatConfig, RecvOutcome, Session, SessionSlot};
use flux::crypto::EncryptionAdapter;
use flux::logging;
use flux::SessionId;
use hashbrown::HashMap;
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LISTENER_TOKEN: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Produces the per-session encryption adapter; a function rather than a stored instance since
/// most adapters (e.g. `AesCipher`) embed per-session key material.
pub type CipherFactory = Box<dyn Fn() -> Box<dyn EncryptionAdapter> + Send + Sync>;

pub struct Acceptor {
    listener: Mutex<TcpListener>,
    poll: Mutex<Poll>,
    sessions: Mutex<HashMap<Token, Arc<Session>>>,
    next_token: AtomicU64,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<PacketPool>,
    session_pool: Arc<SessionPool<SessionSlot>>,
    cipher_factory: CipherFactory,
    heartbeat: HeartbeatConfig,
    log: logging::Logger,
}

impl Acceptor {
    pub fn bind(
        port: u16,
        dispatcher: Arc<Dispatcher>,
        pool: Arc<PacketPool>,
        session_pool: Arc<SessionPool<SessionSlot>>,
        cipher_factory: CipherFactory,
        heartbeat: HeartbeatConfig,
        log: logging::Logger,
    ) -> std::io::Result<Arc<Acceptor>> {
        let addr = format!("0.0.0.0:{}", port).parse().unwrap();
        let mut listener = TcpListener::bind(addr)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Arc::new(Acceptor {
            listener: Mutex::new(listener),
            poll: Mutex::new(poll),
            sessions: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            dispatcher,
            pool,
            session_pool,
            cipher_factory,
            heartbeat,
            log,
        }))
    }

    /// Runs the reactor loop on the calling thread until `stop` is observed. Intended to run on
    /// its own dedicated I/O thread (§5 "a small dedicated I/O thread pool runs the network
    /// reactor").
    pub fn run(self: &Arc<Self>, stop: &std::sync::atomic::AtomicBool) {
        let mut events = Events::with_capacity(1024);
        while !stop.load(Ordering::SeqCst) {
            {
                let mut poll = self.poll.lock();
                if let Err(err) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                    if err.kind() != std::io::ErrorKind::Interrupted {
                        logging::error!(self.log, "poll error"; "error" => %err);
                    }
                    continue;
                }
            }

            for event in events.iter() {
                self.handle_event(event);
            }
        }
    }

    fn handle_event(self: &Arc<Self>, event: &Event) {
        if event.token() == LISTENER_TOKEN {
            self.accept_all();
            return;
        }

        let session = self.sessions.lock().get(&event.token()).cloned();
        let session = match session {
            Some(session) => session,
            None => return,
        };

        if event.is_readable() {
            match session.on_readable(&self.dispatcher) {
                RecvOutcome::Closed => self.close(event.token(), &session),
                RecvOutcome::Progressed | RecvOutcome::WouldBlock => {}
            }
        }

        if event.is_error() || event.is_read_closed() {
            self.close(event.token(), &session);
        }
    }

    fn accept_all(self: &Arc<Self>) {
        loop {
            let accepted = self.listener.lock().accept();
            let (mut stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    logging::warn!(self.log, "accept failed"; "error" => %err);
                    return;
                }
            };

            let token = Token(self.next_token.fetch_add(1, Ordering::SeqCst) as usize);
            if let Err(err) =
                self.poll
                    .lock()
                    .registry()
                    .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
            {
                logging::warn!(self.log, "failed to register connection"; "error" => %err);
                continue;
            }

            let slot = match self.session_pool.acquire() {
                Some(slot) => slot,
                None => {
                    // PoolExhaustion (§7): the hard session cap is reached. Drop the nascent
                    // connection; the rejection counter was already bumped inside `acquire`.
                    logging::warn!(self.log, "session pool exhausted, rejecting connection"; "peer" => %peer);
                    continue;
                }
            };
            let session_id = slot.id;
            let session = Session::new(
                slot,
                Arc::clone(&self.session_pool),
                stream,
                peer,
                (self.cipher_factory)(),
                Arc::clone(&self.pool),
                self.heartbeat,
                self.log.clone(),
            );

            session.register_heartbeat(&self.dispatcher);
            self.sessions.lock().insert(token, Arc::clone(&session));
            self.dispatcher
                .post_connect(session.clone() as Arc<dyn Quiescent>);

            logging::info!(self.log, "session accepted"; "session_id" => session_id, "peer" => %peer);
        }
    }

    fn close(self: &Arc<Self>, token: Token, session: &Arc<Session>) {
        session.disconnect(&self.dispatcher);
        self.sessions.lock().remove(&token);
    }

    /// Looks up a live session by its application-level id, for handlers that only received the
    /// id through `NetworkHandler::on_connect` and need a handle to send packets back.
    pub fn session(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().values().find(|s| s.id() == session_id).cloned()
    }

    pub fn live_session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}
