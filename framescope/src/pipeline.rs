//! Pipeline stage model
//!
//! Every application thread that touches framescope gets a [`PipelineThread`]
//! object carrying its name, sync group and pipeline stage. Stage 0 is the
//! stage that originates new work; a thread consuming work deferred from an
//! earlier generation raises its stage so its samples are attributed to that
//! generation.
//!
//! The calling thread's object lives in a thread-local and is dropped when the
//! thread exits. Registries only ever hold a `Weak` to it.

use framescope_common::DEFAULT_SYNC_GROUP;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Arc<PipelineThread>>> = const { RefCell::new(None) };
}

/// Identity and pipeline stage of one application thread.
#[derive(Debug)]
pub struct PipelineThread {
    serial: u64,
    name: String,
    sync_name: String,
    stage: AtomicU32,
}

impl PipelineThread {
    /// Create a thread object that is not bound to any OS thread.
    ///
    /// Mostly useful for tests and for threads managed by a foreign scheduler.
    pub fn new(name: impl Into<String>, sync_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            sync_name: sync_name.into(),
            stage: AtomicU32::new(0),
        })
    }

    /// Process-unique identity, never reused.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sync_name(&self) -> &str {
        &self.sync_name
    }

    pub fn stage(&self) -> u32 {
        self.stage.load(Ordering::Relaxed)
    }

    /// Raise the stage to `max(current, stage)`. Lowering is a no-op.
    pub fn set_min_stage(&self, stage: u32) {
        self.stage.fetch_max(stage, Ordering::Relaxed);
    }
}

/// Stage of `thread`.
pub fn get_stage(thread: &PipelineThread) -> u32 {
    thread.stage()
}

/// Raise the stage of `thread` to at least `stage`.
pub fn set_min_stage(thread: &PipelineThread, stage: u32) {
    thread.set_min_stage(stage);
}

/// Stage of the calling thread.
///
/// One thread-local access and one relaxed load; safe to call per timed region.
pub fn get_current_stage() -> u32 {
    CURRENT.with(|slot| slot.borrow().as_ref().map_or(0, |t| t.stage()))
}

/// The calling thread's object, created on first use.
///
/// An unbound thread is named after its OS thread name (or `thread-<serial>`)
/// and joins the default sync group.
pub fn current_thread() -> Arc<PipelineThread> {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(thread) = slot.as_ref() {
            return Arc::clone(thread);
        }
        let os_name = std::thread::current().name().map(str::to_owned);
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        let thread = Arc::new(PipelineThread {
            serial,
            name: os_name.unwrap_or_else(|| format!("thread-{serial}")),
            sync_name: DEFAULT_SYNC_GROUP.to_string(),
            stage: AtomicU32::new(0),
        });
        *slot = Some(Arc::clone(&thread));
        thread
    })
}

/// Name the calling thread and choose its sync group.
///
/// Must run before the thread first interacts with a client to affect how it
/// is registered; later calls return the existing object unchanged.
pub fn bind_current(name: &str, sync_name: &str) -> Arc<PipelineThread> {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(thread) = slot.as_ref() {
            if thread.name() != name || thread.sync_name() != sync_name {
                log::warn!(
                    "thread {:?} already bound; ignoring rebind as {name:?}/{sync_name:?}",
                    thread.name()
                );
            }
            return Arc::clone(thread);
        }
        let thread = PipelineThread::new(name, sync_name);
        *slot = Some(Arc::clone(&thread));
        thread
    })
}

/// Raise the calling thread's stage to at least `stage`.
pub fn set_current_min_stage(stage: u32) {
    current_thread().set_min_stage(stage);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;
    use std::thread;

    #[test]
    fn test_min_stage_is_a_monotonic_floor() {
        let t = PipelineThread::new("render", "Default");
        set_min_stage(&t, 2);
        set_min_stage(&t, 1);
        assert_eq!(get_stage(&t), 2);
        set_min_stage(&t, 2);
        assert_eq!(get_stage(&t), 2);
        set_min_stage(&t, 5);
        assert_eq!(get_stage(&t), 5);
    }

    #[test]
    fn test_current_stage_follows_calling_thread() {
        thread::spawn(|| {
            assert_eq!(get_current_stage(), 0);
            set_current_min_stage(1);
            assert_eq!(get_current_stage(), 1);
            thread::spawn(|| assert_eq!(get_current_stage(), 0)).join().unwrap();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_bind_current_names_the_thread() {
        thread::spawn(|| {
            let bound = bind_current("cull", "render");
            let current = current_thread();
            assert!(Arc::ptr_eq(&bound, &current));
            assert_eq!(current.name(), "cull");
            assert_eq!(current.sync_name(), "render");
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_unbound_thread_uses_os_name() {
        thread::Builder::new()
            .name("loader".into())
            .spawn(|| assert_eq!(current_thread().name(), "loader"))
            .unwrap()
            .join()
            .unwrap();
    }

    #[test]
    fn test_thread_object_dies_with_its_thread() {
        let weak: Weak<PipelineThread> =
            thread::spawn(|| Arc::downgrade(&current_thread())).join().unwrap();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_serials_are_unique() {
        let a = PipelineThread::new("a", "Default");
        let b = PipelineThread::new("a", "Default");
        assert_ne!(a.serial(), b.serial());
    }
}
