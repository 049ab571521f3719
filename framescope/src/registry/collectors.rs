//! Collector registry
//!
//! Collectors are named with `:`-separated paths. `"render:cull"` is a child of
//! `"render"`; resolving a path registers every missing ancestor first, so a
//! parent always has a smaller index than its children.
//!
//! A collector's [`CollectorDef`] is built lazily the first time the collector
//! is observed (started, stopped, given a level, or toggled by the viewer).
//! Until then [`Collector::is_active`] is `false`.

use framescope_common::{CollectorDefinition, CollectorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use super::table::GrowableTable;
use crate::domain::{CollectorIndex, RegistryError};

/// Path separator in collector names.
pub const SEPARATOR: char = ':';

/// Presentation hints supplied by the call site that registers a collector.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CollectorOptions {
    pub kind: CollectorKind,
    pub color: Option<[f32; 3]>,
    pub sort: i32,
}

impl CollectorOptions {
    /// Options for a level (counter) collector.
    pub fn level() -> Self {
        Self { kind: CollectorKind::Level, ..Self::default() }
    }

    #[must_use]
    pub fn with_color(mut self, rgb: [f32; 3]) -> Self {
        self.color = Some(rgb);
        self
    }

    #[must_use]
    pub fn with_sort(mut self, sort: i32) -> Self {
        self.sort = sort;
        self
    }
}

/// Lazily-built definition of a collector.
#[derive(Debug)]
pub struct CollectorDef {
    pub kind: CollectorKind,
    pub color: Option<[f32; 3]>,
    pub sort: i32,
    active: AtomicBool,
}

impl CollectorDef {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }
}

/// One registered collector.
#[derive(Debug)]
pub struct Collector {
    index: CollectorIndex,
    name: String,
    parent: Option<CollectorIndex>,
    options: CollectorOptions,
    def: OnceLock<CollectorDef>,
}

impl Collector {
    pub fn index(&self) -> CollectorIndex {
        self.index
    }

    /// Fully qualified name, e.g. `"render:cull"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last path segment, e.g. `"cull"`.
    pub fn display_name(&self) -> &str {
        self.name.rsplit(SEPARATOR).next().unwrap_or(&self.name)
    }

    pub fn parent(&self) -> Option<CollectorIndex> {
        self.parent
    }

    pub fn options(&self) -> CollectorOptions {
        self.options
    }

    /// The definition, building it with `default_active` if this is the first
    /// observation. Concurrent first calls converge on one object.
    pub fn definition(&self, default_active: bool) -> &CollectorDef {
        self.def.get_or_init(|| CollectorDef {
            kind: self.options.kind,
            color: self.options.color,
            sort: self.options.sort,
            active: AtomicBool::new(default_active),
        })
    }

    /// The definition if it has been built.
    pub fn existing_definition(&self) -> Option<&CollectorDef> {
        self.def.get()
    }

    /// True once the definition exists and is marked active.
    pub fn is_active(&self) -> bool {
        self.def.get().is_some_and(CollectorDef::is_active)
    }

    /// Registry-definition frame for this collector.
    pub fn to_wire(&self) -> CollectorDefinition {
        CollectorDefinition {
            index: self.index.0,
            name: self.name.clone(),
            parent: self.parent.map(|p| p.0),
            kind: self.options.kind,
            color: self.options.color,
            sort: self.options.sort,
        }
    }
}

/// Concurrent name → collector registry.
pub struct CollectorRegistry {
    table: GrowableTable<String, Collector>,
    default_active: bool,
}

impl CollectorRegistry {
    /// Create a registry whose collectors start active when `default_active`.
    pub fn new(default_active: bool) -> Self {
        Self { table: GrowableTable::new(), default_active }
    }

    pub fn default_active(&self) -> bool {
        self.default_active
    }

    /// Index of `name`, registering it and any missing ancestors.
    ///
    /// # Errors
    /// Returns [`RegistryError::InvalidName`] for empty names or empty segments.
    pub fn resolve(&self, name: &str) -> Result<CollectorIndex, RegistryError> {
        self.resolve_with(name, CollectorOptions::default())
    }

    /// Like [`resolve`](Self::resolve), applying `options` to the leaf if this
    /// call creates it. Ancestors created on the way get default options.
    ///
    /// # Errors
    /// Returns [`RegistryError::InvalidName`] for empty names or empty segments.
    pub fn resolve_with(
        &self,
        name: &str,
        options: CollectorOptions,
    ) -> Result<CollectorIndex, RegistryError> {
        validate_name(name)?;

        if let Some(index) = self.table.find(&name.to_string()) {
            return Ok(CollectorIndex(index));
        }

        let mut parent = None;
        let mut end = 0;
        for segment in name.split(SEPARATOR) {
            end += segment.len();
            let path = &name[..end];
            let is_leaf = end == name.len();
            let opts = if is_leaf { options } else { CollectorOptions::default() };

            let resolved = self
                .table
                .get_or_insert_with(path.to_string(), |index| Collector {
                    index: CollectorIndex(index),
                    name: path.to_string(),
                    parent,
                    options: opts,
                    def: OnceLock::new(),
                })
                .ok_or(RegistryError::Exhausted)?;

            if resolved.created {
                log::debug!("registered collector {path:?} as {}", CollectorIndex(resolved.index));
            }
            parent = Some(CollectorIndex(resolved.index));
            end += SEPARATOR.len_utf8();
        }

        parent.ok_or_else(|| RegistryError::InvalidName(name.to_string()))
    }

    /// Number of registered collectors.
    pub fn count(&self) -> usize {
        self.table.len()
    }

    /// Collector at `index`.
    ///
    /// # Errors
    /// Returns [`RegistryError::UnknownCollector`] if `index` was never assigned.
    pub fn get(&self, index: CollectorIndex) -> Result<Arc<Collector>, RegistryError> {
        self.table
            .get(index.as_usize())
            .ok_or(RegistryError::UnknownCollector { index, count: self.count() })
    }

    /// Index of an already registered name, without registering anything.
    pub fn lookup(&self, name: &str) -> Option<CollectorIndex> {
        self.table.find(&name.to_string()).map(CollectorIndex)
    }

    /// Mark a collector active or inactive, building its definition if needed.
    ///
    /// # Errors
    /// Returns [`RegistryError::UnknownCollector`] if `index` was never assigned.
    pub fn set_active(&self, index: CollectorIndex, active: bool) -> Result<(), RegistryError> {
        self.get(index)?.definition(self.default_active).set_active(active);
        Ok(())
    }

    /// All collectors with index `>= start`.
    pub fn snapshot_from(&self, start: usize) -> Vec<Arc<Collector>> {
        self.table.snapshot_from(start)
    }
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() || name.split(SEPARATOR).any(|segment| segment.trim().is_empty()) {
        return Err(RegistryError::InvalidName(name.to_string()));
    }
    Ok(())
}
