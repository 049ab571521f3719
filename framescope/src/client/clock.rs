//! Session clock with pause excision
//!
//! All threads of a client take timestamps from one [`SessionClock`]. The clock
//! is `Instant`-based and therefore monotonic; on top of that it keeps a running
//! total of "excised" time that is subtracted from every reading.
//!
//! Resuming after a pause excises everything between the resume point and now.
//! The resume point is the later of the explicit [`pause`](SessionClock::pause)
//! mark (if any) and the last timestamp handed out by
//! [`stamp`](SessionClock::stamp). Taking the later of the two keeps the clock
//! non-decreasing with respect to every recorded sample.
//!
//! Readings and resumes are ordered by a generation counter that is odd while
//! a resume is in progress. A reading that overlaps a resume is retried, so no
//! timestamp pairs a raw time from before a resume with the excision total
//! from after it (or the reverse).

use std::hint;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crate::domain::{Duration, Timestamp};

#[derive(Debug)]
pub struct SessionClock {
    origin: Instant,
    generation: AtomicU64,
    excised_ns: AtomicU64,
    last_stamp_ns: AtomicU64,
    paused_at: Mutex<Option<Timestamp>>,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            generation: AtomicU64::new(0),
            excised_ns: AtomicU64::new(0),
            last_stamp_ns: AtomicU64::new(0),
            paused_at: Mutex::new(None),
        }
    }

    fn raw_ns(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn read(&self, record: bool) -> Timestamp {
        loop {
            let generation = self.generation.load(Ordering::SeqCst);
            if generation % 2 == 1 {
                hint::spin_loop();
                continue;
            }
            let now = self.raw_ns().saturating_sub(self.excised_ns.load(Ordering::SeqCst));
            if record {
                self.last_stamp_ns.fetch_max(now, Ordering::SeqCst);
            }
            if self.generation.load(Ordering::SeqCst) == generation {
                return Timestamp(now);
            }
        }
    }

    /// Current session time.
    pub fn now(&self) -> Timestamp {
        self.read(false)
    }

    /// Current session time, remembered as the latest recorded activity.
    pub fn stamp(&self) -> Timestamp {
        self.read(true)
    }

    /// Total time excised by resumes so far.
    pub fn excised(&self) -> Duration {
        Duration(self.excised_ns.load(Ordering::Acquire))
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Mark the start of a pause. A second pause keeps the first mark.
    pub fn pause(&self) {
        let mut paused_at = self.paused_at.lock().unwrap_or_else(PoisonError::into_inner);
        if paused_at.is_none() {
            *paused_at = Some(self.stamp());
        }
    }

    /// Excise the gap since the resume point and return its length.
    pub fn resume(&self) -> Duration {
        let mut paused_at = self.paused_at.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.now();

        self.generation.fetch_add(1, Ordering::SeqCst);
        let last = Timestamp(self.last_stamp_ns.load(Ordering::SeqCst));
        let resume_point = paused_at.take().map_or(last, |p| p.max(last));
        let gap = now.since(resume_point);
        self.excised_ns.fetch_add(gap.0, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        gap
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}
