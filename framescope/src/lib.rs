//! # framescope - Frame-Based Instrumentation Client
//!
//! framescope lets a program time named regions of code ("collectors"), record
//! numeric levels, and group both into per-thread frames. Each completed frame
//! is streamed over TCP to a viewer, which can switch individual collectors on
//! and off while the program runs.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Instrumented Application                     │
//! │        start / stop / add_level / tick on any thread            │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ no locks shared between threads, no I/O
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     framescope (This Crate)                     │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │   Registry   │──▶│   Recorder   │──▶│  Transport   │         │
//! │  │ (collectors, │   │ (per thread) │   │ (session +   │         │
//! │  │   threads)   │   └──────────────┘   │   link)      │         │
//! │  └──────────────┘          ▲           └──────┬───────┘         │
//! │         ▲                  │                  │ bounded queue   │
//! │         │           ┌──────────────┐          ▼                 │
//! │         │           │ SessionClock │   writer / reader threads  │
//! │         │           └──────────────┘                            │
//! │         └─────────── set_active ◀─────────────┘                 │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ length-prefixed JSON frames
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │            Viewer (ViewerSession / framescope binary)           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`client`]: the [`Client`] facade, the session clock and the process-wide
//!   instance
//! - [`registry`]: copy-on-growth collector and thread tables with lock-free
//!   reads
//! - [`recorder`]: per-thread region stack, accumulated times and levels,
//!   frame assembly
//! - [`pipeline`]: pipeline thread identities and stages
//! - [`transport`]: session state machine, definition ordering, frame delivery
//! - [`viewer`]: the receiving half of the protocol
//! - [`config`]: client settings from code or the environment
//! - [`domain`]: index, time and error types
//! - [`cli`], [`display`]: the headless listener binary
//!
//! ## Typical Usage
//!
//! ```no_run
//! let client = framescope::global();
//! client.connect_default();
//!
//! let render = client.collector("render").unwrap();
//! {
//!     let _scope = client.scope(render).unwrap();
//!     // ... draw ...
//! }
//! client.tick_current().ok();
//! framescope::shutdown_global();
//! ```
//!
//! ```bash
//! # Print every frame a program sends
//! framescope --port 5185
//! ```

pub mod cli;
pub mod client;
pub mod config;
pub mod display;
pub mod domain;
pub mod pipeline;
pub mod recorder;
pub mod registry;
pub mod transport;
pub mod viewer;

pub use client::{global, shutdown_global, Client, ScopeGuard, SessionClock};
pub use config::ClientConfig;
pub use domain::{CollectorIndex, ConnectError, RegistryError, ThreadIndex};
pub use pipeline::PipelineThread;
pub use registry::CollectorOptions;
pub use transport::{SessionState, TransportStats};
pub use framescope_common::{CollectorKind, DEFAULT_PORT, PROTOCOL_MAJOR, PROTOCOL_MINOR};
