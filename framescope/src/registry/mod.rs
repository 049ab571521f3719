//! Concurrent registries
//!
//! - `table`: the copy-on-growth array both registries are built on
//! - `collectors`: hierarchical, named instrumentation points
//! - `threads`: observed application threads and their recording state
//!
//! Reads (`get`, `count`) never lock. Creation and growth are serialized per
//! registry.

pub mod collectors;
pub mod table;
pub mod threads;

pub use collectors::{Collector, CollectorDef, CollectorOptions, CollectorRegistry};
pub use table::GrowableTable;
pub use threads::{ThreadEntry, ThreadRegistry};
