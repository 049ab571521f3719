//! # Client Runtime
//!
//! [`Client`] is what instrumented code talks to. It ties together:
//!
//! - the collector and thread registries (lock-free lookups)
//! - one [`Recorder`](crate::recorder::Recorder) per observed thread
//! - the shared [`SessionClock`]
//! - a lazily created [`Transport`]
//!
//! ## Hot path
//!
//! `start`/`stop`/`add_level` resolve the calling thread's index from a
//! thread-local cache, look up the collector without locking, and touch only
//! the calling thread's recorder. They never perform I/O.
//!
//! ## Failure policy
//!
//! Transport trouble is absorbed here: nothing but [`Client::try_connect`]
//! reports it. Registry misuse (bad index, unbalanced stop) is logged at error
//! level and returned as [`RegistryError`].

pub mod clock;
mod global;

use framescope_common::{DataFrame, Hello};
use log::{error, info, warn};
use std::cell::RefCell;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};

use crate::config::{machine_name, ClientConfig};
use crate::domain::{CollectorIndex, ConnectError, Duration, RegistryError, ThreadIndex, Timestamp};
use crate::pipeline;
use crate::registry::{CollectorOptions, CollectorRegistry, ThreadEntry, ThreadRegistry};
use crate::transport::{SessionState, Transport, TransportStats};

pub use clock::SessionClock;
pub use global::{global, shutdown_global};

thread_local! {
    /// (client identity, thread index) pairs for the calling thread. Entries of
    /// dropped clients are pruned whenever a new entry is added.
    static THREAD_INDICES: RefCell<Vec<(Weak<()>, ThreadIndex)>> = const { RefCell::new(Vec::new()) };
}

/// Telemetry client for one process (or one test).
pub struct Client {
    /// Identity for the thread-local index cache; only weak references escape
    identity: Arc<()>,
    config: ClientConfig,
    collectors: Arc<CollectorRegistry>,
    threads: ThreadRegistry,
    clock: SessionClock,
    transport: OnceLock<Transport>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            identity: Arc::new(()),
            collectors: Arc::new(CollectorRegistry::new(config.default_active)),
            threads: ThreadRegistry::new(),
            clock: SessionClock::new(),
            transport: OnceLock::new(),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn collectors(&self) -> &CollectorRegistry {
        &self.collectors
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    pub fn clock(&self) -> &SessionClock {
        &self.clock
    }

    /// Current session time.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Index of the collector `name`, registering it (and its ancestors) if new.
    ///
    /// # Errors
    /// [`RegistryError::InvalidName`] for malformed names.
    pub fn collector(&self, name: &str) -> Result<CollectorIndex, RegistryError> {
        self.collectors.resolve(name).inspect_err(|e| error!("{e}"))
    }

    /// Like [`collector`](Self::collector) with presentation options.
    ///
    /// # Errors
    /// [`RegistryError::InvalidName`] for malformed names.
    pub fn collector_with(
        &self,
        name: &str,
        options: CollectorOptions,
    ) -> Result<CollectorIndex, RegistryError> {
        self.collectors.resolve_with(name, options).inspect_err(|e| error!("{e}"))
    }

    /// Index of the calling thread, registering it on first use.
    ///
    /// # Errors
    /// [`RegistryError::Exhausted`] if no more threads can be registered.
    pub fn current_thread_index(&self) -> Result<ThreadIndex, RegistryError> {
        let me = Arc::as_ptr(&self.identity);
        let cached = THREAD_INDICES.with(|slots| {
            slots.borrow().iter().find(|(client, _)| client.as_ptr() == me).map(|(_, index)| *index)
        });
        if let Some(index) = cached {
            return Ok(index);
        }

        let thread = pipeline::current_thread();
        let index = self.threads.resolve(&thread, self.clock.now())?;
        THREAD_INDICES.with(|slots| {
            let mut slots = slots.borrow_mut();
            slots.retain(|(client, _)| client.strong_count() > 0);
            slots.push((Arc::downgrade(&self.identity), index));
        });
        Ok(index)
    }

    fn current_entry(&self) -> Result<Arc<ThreadEntry>, RegistryError> {
        let index = self.current_thread_index()?;
        self.threads.get(index)
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    /// Begin timing `collector` on the calling thread.
    ///
    /// # Errors
    /// [`RegistryError::UnknownCollector`] for an unassigned index.
    pub fn start(&self, collector: CollectorIndex) -> Result<(), RegistryError> {
        let active = self
            .collectors
            .get(collector)
            .map(|c| c.definition(self.collectors.default_active()).is_active())
            .inspect_err(|e| error!("{e}"))?;

        let entry = self.current_entry()?;
        if active {
            let now = self.clock.stamp();
            entry.recorder().start(collector, now);
        } else {
            entry.recorder().start_skipped(collector, self.clock.now());
        }
        Ok(())
    }

    /// End timing `collector` on the calling thread.
    ///
    /// Stops are matched LIFO against starts on the same thread, whether or
    /// not the collector was active when it started.
    ///
    /// # Errors
    /// [`RegistryError::NotStarted`] or [`RegistryError::OutOfOrderStop`] for
    /// an unbalanced stop; [`RegistryError::UnknownCollector`] for an unassigned
    /// index. Other threads' accounting is unaffected.
    pub fn stop(&self, collector: CollectorIndex) -> Result<(), RegistryError> {
        self.collectors.get(collector).inspect_err(|e| error!("{e}"))?;

        let entry = self.current_entry()?;
        let now = self.clock.stamp();
        let result = entry.recorder().stop(collector, now).inspect_err(|e| error!("{e}"));
        result
    }

    /// Time a region with a guard that stops `collector` when dropped.
    ///
    /// # Errors
    /// As for [`start`](Self::start).
    pub fn scope(&self, collector: CollectorIndex) -> Result<ScopeGuard<'_>, RegistryError> {
        self.start(collector)?;
        Ok(ScopeGuard { client: self, collector })
    }

    /// Add `value` to `collector`'s level for the current epoch.
    ///
    /// # Errors
    /// [`RegistryError::UnknownCollector`] for an unassigned index.
    pub fn add_level(&self, collector: CollectorIndex, value: f64) -> Result<(), RegistryError> {
        if self.level_active(collector)? {
            self.current_entry()?.recorder().add_level(collector, value);
        }
        Ok(())
    }

    /// Overwrite `collector`'s level for the current epoch.
    ///
    /// # Errors
    /// [`RegistryError::UnknownCollector`] for an unassigned index.
    pub fn set_level(&self, collector: CollectorIndex, value: f64) -> Result<(), RegistryError> {
        if self.level_active(collector)? {
            self.current_entry()?.recorder().set_level(collector, value);
        }
        Ok(())
    }

    fn level_active(&self, collector: CollectorIndex) -> Result<bool, RegistryError> {
        self.collectors
            .get(collector)
            .map(|c| c.definition(self.collectors.default_active()).is_active())
            .inspect_err(|e| error!("{e}"))
    }

    // ------------------------------------------------------------------
    // Ticks
    // ------------------------------------------------------------------

    /// Close the current epoch of `thread` and hand its frame to the transport.
    ///
    /// Returns the frame's number. Without a live session the frame is
    /// dropped; recording continues either way.
    ///
    /// # Errors
    /// [`RegistryError::UnknownThread`] for an unassigned index.
    pub fn tick(&self, thread: ThreadIndex) -> Result<u64, RegistryError> {
        let entry = self.threads.get(thread).inspect_err(|e| error!("{e}"))?;
        let frame = self.take_frame(&entry);
        let number = frame.frame_number;
        self.emit(frame);
        Ok(number)
    }

    /// [`tick`](Self::tick) the calling thread.
    ///
    /// # Errors
    /// [`RegistryError::Exhausted`] if the thread cannot be registered.
    pub fn tick_current(&self) -> Result<u64, RegistryError> {
        let index = self.current_thread_index()?;
        self.tick(index)
    }

    /// Tick every live thread in `sync_name`. Returns how many were ticked.
    pub fn tick_sync_group(&self, sync_name: &str) -> usize {
        let members = self.threads.in_sync_group(sync_name);
        for entry in &members {
            let frame = self.take_frame(entry);
            self.emit(frame);
        }
        members.len()
    }

    /// Number of frames `thread` has produced so far.
    ///
    /// # Errors
    /// [`RegistryError::UnknownThread`] for an unassigned index.
    pub fn frame_number(&self, thread: ThreadIndex) -> Result<u64, RegistryError> {
        Ok(self.threads.get(thread)?.recorder().frame_number())
    }

    fn take_frame(&self, entry: &ThreadEntry) -> DataFrame {
        let stage = entry.stage();
        let now = self.clock.stamp();
        entry.recorder().take_frame(stage, now)
    }

    fn emit(&self, frame: DataFrame) {
        if let Some(transport) = self.transport.get() {
            transport.send_frame(frame, &self.collectors, &self.threads);
        }
    }

    // ------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------

    fn transport(&self) -> &Transport {
        self.transport.get_or_init(|| Transport::new(self.config.clone()))
    }

    /// Connect to a viewer at `host:port`. Returns whether it succeeded.
    pub fn connect(&self, host: &str, port: u16) -> bool {
        match self.try_connect(host, port) {
            Ok(()) => true,
            Err(e) => {
                warn!("could not connect to viewer at {host}:{port}: {e}");
                false
            }
        }
    }

    /// Connect to the viewer named in the configuration.
    pub fn connect_default(&self) -> bool {
        let host = self.config.host.clone();
        self.connect(&host, self.config.port)
    }

    /// Connect to a viewer at `host:port`.
    ///
    /// # Errors
    /// Resolution, socket and handshake failures, including a protocol
    /// version mismatch.
    pub fn try_connect(&self, host: &str, port: u16) -> Result<(), ConnectError> {
        let hello = Hello::new(self.config.program.clone(), machine_name(), std::process::id());
        self.transport().connect(host, port, hello, &self.collectors, &self.threads)
    }

    /// Close the session, if any. Idempotent.
    pub fn disconnect(&self) {
        if let Some(transport) = self.transport.get() {
            transport.disconnect();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn state(&self) -> SessionState {
        self.transport.get().map_or(SessionState::Disconnected, Transport::state)
    }

    /// Address of the connected viewer.
    pub fn viewer_addr(&self) -> Option<SocketAddr> {
        self.transport.get().and_then(Transport::peer)
    }

    /// Name the connected viewer announced in its handshake.
    pub fn viewer_name(&self) -> Option<String> {
        self.transport.get().and_then(Transport::server_name)
    }

    /// Mark the start of an application pause.
    ///
    /// Frames ticked while paused are still delivered; only the clock is
    /// affected, at [`resume_after_pause`](Self::resume_after_pause).
    pub fn pause(&self) {
        self.clock.pause();
        if let Some(transport) = self.transport.get() {
            transport.pause();
        }
    }

    /// Continue after a pause, excising the gap from the timeline.
    ///
    /// Works with or without a preceding [`pause`](Self::pause): without one,
    /// the gap is measured from the last recorded sample. Returns the length
    /// of the excised gap.
    pub fn resume_after_pause(&self) -> Duration {
        let gap = self.clock.resume();
        if let Some(transport) = self.transport.get() {
            transport.resume();
        }
        info!("resumed after {gap} pause");
        gap
    }

    pub fn stats(&self) -> TransportStats {
        self.transport.get().map(Transport::stats).unwrap_or_default()
    }
}

#[cfg(test)]
fn cached_thread_indices() -> usize {
    THREAD_INDICES.with(|slots| slots.borrow().len())
}

impl Default for Client {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

/// Stops its collector when dropped. See [`Client::scope`].
#[must_use = "the region ends when the guard is dropped"]
pub struct ScopeGuard<'a> {
    client: &'a Client,
    collector: CollectorIndex,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        let _ = self.client.stop(self.collector);
    }
}
