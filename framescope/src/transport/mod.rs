//! # Transport
//!
//! Session state machine and frame delivery to a viewer.
//!
//! ```text
//!  Disconnected ──connect──▶ Connecting ──handshake ok──▶ Connected ◀──resume── Paused
//!       ▲                        │                          │   │                 ▲
//!       └────handshake failed────┘          disconnect /    │   └──────pause──────┘
//!       └────────────────────────────────── socket failure ─┘
//! ```
//!
//! The session mutex guards the state and the current [`Link`]. It is never
//! held while connecting, handshaking or joining link threads; while it is held
//! the only I/O is a non-blocking queue send.
//!
//! Transport failures never reach instrumented code: a dead link is noticed on
//! the next `state()`/`send_frame()` and the session drops back to
//! `Disconnected`.
//!
//! Every data frame is preceded on the queue by definition frames for every
//! collector and thread registered since the last send, so the viewer can
//! always name an index before it sees one in a data frame.

mod link;

use crossbeam_channel::TrySendError;
use framescope_common::{ClientMessage, DataFrame, Hello};
use log::{debug, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::ClientConfig;
use crate::domain::ConnectError;
use crate::registry::{CollectorRegistry, ThreadRegistry};
use link::Link;

/// Connection state of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Paused,
}

/// Delivery counters, readable without taking the session lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportStats {
    /// Data frames handed to the writer
    pub frames_queued: u64,
    /// Data frames discarded because the send queue was full
    pub frames_dropped: u64,
    /// Collector and thread definitions handed to the writer
    pub definitions_queued: u64,
    /// Links lost to socket failures
    pub connections_lost: u64,
}

#[derive(Default)]
struct Counters {
    frames_queued: AtomicU64,
    frames_dropped: AtomicU64,
    definitions_queued: AtomicU64,
    connections_lost: AtomicU64,
}

struct Session {
    state: SessionState,
    link: Option<Link>,
    sent_collectors: usize,
    sent_threads: usize,
}

impl Session {
    /// Detach a link whose threads have observed a socket failure.
    fn take_dead_link(&mut self) -> Option<Link> {
        if self.link.as_ref().is_some_and(|l| !l.is_alive()) {
            self.state = SessionState::Disconnected;
            return self.link.take();
        }
        None
    }
}

/// Owns the session with the viewer. Created lazily by the client.
pub struct Transport {
    config: ClientConfig,
    session: Mutex<Session>,
    counters: Counters,
}

impl Transport {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            session: Mutex::new(Session {
                state: SessionState::Disconnected,
                link: None,
                sent_collectors: 0,
                sent_threads: 0,
            }),
            counters: Counters::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, after reaping a link that has failed.
    pub fn state(&self) -> SessionState {
        let (state, dead) = {
            let mut session = self.lock();
            let dead = session.take_dead_link();
            (session.state, dead)
        };
        self.reap(dead);
        state
    }

    /// Address of the connected viewer.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.lock().link.as_ref().filter(|l| l.is_alive()).map(Link::peer)
    }

    /// Name the connected viewer announced in its handshake.
    pub fn server_name(&self) -> Option<String> {
        self.lock().link.as_ref().filter(|l| l.is_alive()).map(|l| l.server().server.clone())
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            frames_queued: self.counters.frames_queued.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
            definitions_queued: self.counters.definitions_queued.load(Ordering::Relaxed),
            connections_lost: self.counters.connections_lost.load(Ordering::Relaxed),
        }
    }

    /// Replace any existing session with a new connection to `host:port`.
    ///
    /// # Errors
    /// Resolution, socket and handshake failures. The session is left
    /// `Disconnected` on error.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        hello: Hello,
        collectors: &Arc<CollectorRegistry>,
        threads: &ThreadRegistry,
    ) -> Result<(), ConnectError> {
        let previous = {
            let mut session = self.lock();
            if session.state == SessionState::Connecting {
                return Err(ConnectError::InProgress);
            }
            session.state = SessionState::Connecting;
            session.link.take()
        };
        if let Some(previous) = previous {
            previous.close(true);
        }

        let result = Link::establish(host, port, hello, &self.config, Arc::clone(collectors));

        let mut session = self.lock();
        match result {
            Ok(link) if session.state == SessionState::Connecting => {
                session.link = Some(link);
                session.state = SessionState::Connected;
                session.sent_collectors = 0;
                session.sent_threads = 0;
                self.queue_definitions(&mut session, collectors, threads);
                Ok(())
            }
            Ok(link) => {
                // disconnect() ran while we were handshaking
                drop(session);
                link.close(false);
                Err(ConnectError::Io(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "disconnected during connect",
                )))
            }
            Err(e) => {
                session.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Close the session if there is one. Idempotent.
    pub fn disconnect(&self) {
        let link = {
            let mut session = self.lock();
            session.state = SessionState::Disconnected;
            session.link.take()
        };
        if let Some(link) = link {
            link.close(true);
        }
    }

    /// `Connected → Paused`. Other states are unchanged.
    pub fn pause(&self) {
        let mut session = self.lock();
        if session.state == SessionState::Connected {
            session.state = SessionState::Paused;
        }
    }

    /// `Paused → Connected`. Other states are unchanged.
    pub fn resume(&self) {
        let mut session = self.lock();
        if session.state == SessionState::Paused {
            session.state = SessionState::Connected;
        }
    }

    /// Queue `frame` for delivery, or drop it if there is no live session.
    ///
    /// A paused session still delivers frames.
    pub fn send_frame(&self, frame: DataFrame, collectors: &CollectorRegistry, threads: &ThreadRegistry) {
        let dead = {
            let mut session = self.lock();
            if let Some(dead) = session.take_dead_link() {
                Some(dead)
            } else if !matches!(session.state, SessionState::Connected | SessionState::Paused) {
                None
            } else if !self.queue_definitions(&mut session, collectors, threads) {
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                session.take_dead_link()
            } else {
                match session.link.as_ref().map(|l| l.try_send(ClientMessage::Data(frame))) {
                    Some(Ok(())) => {
                        self.counters.frames_queued.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                    Some(Err(TrySendError::Full(_))) => {
                        self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        debug!("send queue full, dropping frame");
                        None
                    }
                    Some(Err(TrySendError::Disconnected(_))) => {
                        session.state = SessionState::Disconnected;
                        session.link.take()
                    }
                    None => None,
                }
            }
        };
        self.reap(dead);
    }

    /// Queue definitions the viewer has not seen yet. Returns `false` if the
    /// queue filled up before all of them were queued.
    fn queue_definitions(
        &self,
        session: &mut Session,
        collectors: &CollectorRegistry,
        threads: &ThreadRegistry,
    ) -> bool {
        let Some(link) = session.link.as_ref() else {
            return false;
        };

        for collector in collectors.snapshot_from(session.sent_collectors) {
            if link.try_send(ClientMessage::CollectorDef(collector.to_wire())).is_err() {
                return false;
            }
            session.sent_collectors += 1;
            self.counters.definitions_queued.fetch_add(1, Ordering::Relaxed);
        }
        for thread in threads.snapshot_from(session.sent_threads) {
            if link.try_send(ClientMessage::ThreadDef(thread.to_wire())).is_err() {
                return false;
            }
            session.sent_threads += 1;
            self.counters.definitions_queued.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    fn reap(&self, dead: Option<Link>) {
        if let Some(link) = dead {
            self.counters.connections_lost.fetch_add(1, Ordering::Relaxed);
            warn!("lost connection to viewer at {}; instrumentation continues offline", link.peer());
            link.close(false);
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
