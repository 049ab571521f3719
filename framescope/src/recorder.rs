//! Per-thread sample recording
//!
//! A [`Recorder`] holds one thread's open regions and the samples accumulated
//! since its last tick. `start`/`stop` keep a LIFO stack; elapsed time is
//! credited to a collector when its outermost open instance stops, so a
//! collector that recurses into itself is not double counted.
//!
//! At tick time, regions that are still open are credited up to the tick and
//! their start is moved to the tick boundary, so a long-running region shows
//! up in every frame it spans.
//!
//! A start made while the collector is inactive pushes an uncredited marker.
//! Its stop pops the marker whatever the collector's state is by then, so a
//! viewer toggling collectors never unbalances the stack.
//!
//! Levels must be finite. Non-finite values, including sums that overflow,
//! are dropped with a warning since they cannot be encoded.

use framescope_common::{CollectorLevel, CollectorTime, DataFrame, EventKind, TimeEvent};
use log::warn;
use std::collections::BTreeMap;

use crate::domain::{CollectorIndex, RegistryError, ThreadIndex, Timestamp};

/// Start/stop markers kept per frame before further markers are dropped.
pub const MAX_EVENTS_PER_FRAME: usize = 8192;

#[derive(Debug, Clone, Copy)]
struct OpenRegion {
    collector: CollectorIndex,
    started: Timestamp,
    /// False for starts skipped while the collector was inactive
    credited: bool,
}

/// Recording state of one thread.
#[derive(Debug)]
pub struct Recorder {
    thread: ThreadIndex,
    stack: Vec<OpenRegion>,
    elapsed: BTreeMap<CollectorIndex, u64>,
    levels: BTreeMap<CollectorIndex, f64>,
    events: Vec<TimeEvent>,
    dropped_events: u64,
    frame_number: u64,
    frame_start: Timestamp,
}

impl Recorder {
    pub fn new(thread: ThreadIndex, now: Timestamp) -> Self {
        Self {
            thread,
            stack: Vec::new(),
            elapsed: BTreeMap::new(),
            levels: BTreeMap::new(),
            events: Vec::new(),
            dropped_events: 0,
            frame_number: 0,
            frame_start: now,
        }
    }

    /// Number of frames taken so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Depth of the open region stack.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// True if `collector` is on the stack, credited or not.
    pub fn is_open(&self, collector: CollectorIndex) -> bool {
        self.stack.iter().any(|r| r.collector == collector)
    }

    fn is_credited(&self, collector: CollectorIndex) -> bool {
        self.stack.iter().any(|r| r.collector == collector && r.credited)
    }

    /// Markers dropped because a frame exceeded [`MAX_EVENTS_PER_FRAME`].
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    pub fn start(&mut self, collector: CollectorIndex, now: Timestamp) {
        self.stack.push(OpenRegion { collector, started: now, credited: true });
        self.push_event(collector, EventKind::Start, now);
    }

    /// Open a region for an inactive collector: balanced by `stop`, never
    /// credited, no markers.
    pub fn start_skipped(&mut self, collector: CollectorIndex, now: Timestamp) {
        self.stack.push(OpenRegion { collector, started: now, credited: false });
    }

    /// Close the innermost open region, which must belong to `collector`.
    ///
    /// # Errors
    /// [`RegistryError::NotStarted`] if `collector` is not open on this thread,
    /// [`RegistryError::OutOfOrderStop`] if another region is open inside it.
    /// State is left untouched in both cases.
    pub fn stop(&mut self, collector: CollectorIndex, now: Timestamp) -> Result<(), RegistryError> {
        let Some(top) = self.stack.last().copied() else {
            return Err(RegistryError::NotStarted { collector, thread: self.thread });
        };

        if top.collector != collector {
            return Err(if self.is_open(collector) {
                RegistryError::OutOfOrderStop { collector, top: top.collector, thread: self.thread }
            } else {
                RegistryError::NotStarted { collector, thread: self.thread }
            });
        }

        self.stack.pop();
        if !top.credited {
            return Ok(());
        }
        if !self.is_credited(collector) {
            *self.elapsed.entry(collector).or_insert(0) += now.since(top.started).0;
        }
        self.push_event(collector, EventKind::Stop, now);
        Ok(())
    }

    pub fn add_level(&mut self, collector: CollectorIndex, value: f64) {
        let current = self.levels.get(&collector).copied().unwrap_or(0.0);
        let sum = current + value;
        if sum.is_finite() {
            self.levels.insert(collector, sum);
        } else {
            warn!("dropping non-finite level for {collector}: {current} + {value}");
        }
    }

    pub fn set_level(&mut self, collector: CollectorIndex, value: f64) {
        if value.is_finite() {
            self.levels.insert(collector, value);
        } else {
            warn!("dropping non-finite level for {collector}: {value}");
        }
    }

    /// Package everything recorded since the last tick and reset for the next.
    pub fn take_frame(&mut self, stage: u32, now: Timestamp) -> DataFrame {
        let mut seen = Vec::with_capacity(self.stack.len());
        for region in self.stack.iter_mut().filter(|r| r.credited) {
            if !seen.contains(&region.collector) {
                seen.push(region.collector);
                *self.elapsed.entry(region.collector).or_insert(0) += now.since(region.started).0;
            }
            region.started = now;
        }

        let frame = DataFrame {
            thread: self.thread.0,
            stage,
            frame_number: self.frame_number,
            start_ns: self.frame_start.0,
            end_ns: now.0,
            times: std::mem::take(&mut self.elapsed)
                .into_iter()
                .map(|(collector, elapsed_ns)| CollectorTime { collector: collector.0, elapsed_ns })
                .collect(),
            levels: std::mem::take(&mut self.levels)
                .into_iter()
                .map(|(collector, value)| CollectorLevel { collector: collector.0, value })
                .collect(),
            events: std::mem::take(&mut self.events),
        };

        self.frame_number += 1;
        self.frame_start = now;
        frame
    }

    fn push_event(&mut self, collector: CollectorIndex, kind: EventKind, now: Timestamp) {
        if self.events.len() < MAX_EVENTS_PER_FRAME {
            self.events.push(TimeEvent { collector: collector.0, kind, timestamp_ns: now.0 });
        } else {
            self.dropped_events += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: ThreadIndex = ThreadIndex(0);
    const A: CollectorIndex = CollectorIndex(0);
    const B: CollectorIndex = CollectorIndex(1);

    #[test]
    fn test_nested_regions_accumulate_separately() {
        let mut rec = Recorder::new(T, Timestamp(0));
        rec.start(A, Timestamp(10));
        rec.start(B, Timestamp(20));
        rec.stop(B, Timestamp(50)).unwrap();
        rec.stop(A, Timestamp(100)).unwrap();

        let frame = rec.take_frame(0, Timestamp(120));
        assert_eq!(frame.elapsed_ns(A.0), Some(90));
        assert_eq!(frame.elapsed_ns(B.0), Some(30));
        assert_eq!(frame.events.len(), 4);
        assert_eq!((frame.start_ns, frame.end_ns), (0, 120));
    }

    #[test]
    fn test_stop_without_start_is_reported() {
        let mut rec = Recorder::new(T, Timestamp(0));
        assert_eq!(
            rec.stop(A, Timestamp(5)),
            Err(RegistryError::NotStarted { collector: A, thread: T })
        );
        rec.start(B, Timestamp(6));
        assert_eq!(
            rec.stop(A, Timestamp(7)),
            Err(RegistryError::NotStarted { collector: A, thread: T })
        );
        assert_eq!(rec.depth(), 1);
    }

    #[test]
    fn test_out_of_order_stop_leaves_stack_intact() {
        let mut rec = Recorder::new(T, Timestamp(0));
        rec.start(A, Timestamp(1));
        rec.start(B, Timestamp(2));
        assert_eq!(
            rec.stop(A, Timestamp(3)),
            Err(RegistryError::OutOfOrderStop { collector: A, top: B, thread: T })
        );
        assert_eq!(rec.depth(), 2);
        rec.stop(B, Timestamp(4)).unwrap();
        rec.stop(A, Timestamp(5)).unwrap();
        assert_eq!(rec.depth(), 0);
    }

    #[test]
    fn test_recursion_is_not_double_counted() {
        let mut rec = Recorder::new(T, Timestamp(0));
        rec.start(A, Timestamp(0));
        rec.start(A, Timestamp(10));
        rec.stop(A, Timestamp(20)).unwrap();
        rec.stop(A, Timestamp(40)).unwrap();
        assert_eq!(rec.take_frame(0, Timestamp(50)).elapsed_ns(A.0), Some(40));
    }

    #[test]
    fn test_open_region_spans_ticks() {
        let mut rec = Recorder::new(T, Timestamp(0));
        rec.start(A, Timestamp(10));
        let first = rec.take_frame(0, Timestamp(30));
        assert_eq!(first.elapsed_ns(A.0), Some(20));

        rec.stop(A, Timestamp(45)).unwrap();
        let second = rec.take_frame(0, Timestamp(50));
        assert_eq!(second.elapsed_ns(A.0), Some(15));
        assert_eq!(second.frame_number, 1);
        assert_eq!(second.start_ns, 30);
    }

    #[test]
    fn test_levels_reset_every_frame() {
        let mut rec = Recorder::new(T, Timestamp(0));
        rec.add_level(B, 2.0);
        rec.add_level(B, 3.0);
        let frame = rec.take_frame(1, Timestamp(1));
        assert_eq!(frame.level(B.0), Some(5.0));
        assert_eq!(frame.stage, 1);

        rec.set_level(B, 7.0);
        rec.set_level(B, 4.0);
        let frame = rec.take_frame(1, Timestamp(2));
        assert_eq!(frame.level(B.0), Some(4.0));
        assert!(rec.take_frame(1, Timestamp(3)).levels.is_empty());
    }

    #[test]
    fn test_skipped_start_is_balanced_but_never_credited() {
        let mut rec = Recorder::new(T, Timestamp(0));
        rec.start(A, Timestamp(0));
        rec.start_skipped(B, Timestamp(10));
        rec.stop(B, Timestamp(20)).unwrap();
        rec.stop(A, Timestamp(30)).unwrap();

        let frame = rec.take_frame(0, Timestamp(40));
        assert_eq!(frame.elapsed_ns(A.0), Some(30));
        assert_eq!(frame.elapsed_ns(B.0), None);
        assert_eq!(frame.events.len(), 2);
        assert_eq!(rec.depth(), 0);
    }

    #[test]
    fn test_skipped_outer_instance_does_not_hide_inner_credit() {
        let mut rec = Recorder::new(T, Timestamp(0));
        rec.start_skipped(A, Timestamp(0));
        rec.start(A, Timestamp(10));
        rec.stop(A, Timestamp(25)).unwrap();
        rec.stop(A, Timestamp(40)).unwrap();
        assert_eq!(rec.take_frame(0, Timestamp(50)).elapsed_ns(A.0), Some(15));
    }

    #[test]
    fn test_open_skipped_region_is_not_credited_at_tick() {
        let mut rec = Recorder::new(T, Timestamp(0));
        rec.start_skipped(A, Timestamp(0));
        assert!(rec.take_frame(0, Timestamp(10)).times.is_empty());
        rec.stop(A, Timestamp(20)).unwrap();
    }

    #[test]
    fn test_non_finite_levels_are_dropped() {
        let mut rec = Recorder::new(T, Timestamp(0));
        rec.set_level(A, f64::NAN);
        rec.add_level(B, f64::INFINITY);
        assert!(rec.take_frame(0, Timestamp(1)).levels.is_empty());

        rec.add_level(B, f64::MAX);
        rec.add_level(B, f64::MAX);
        rec.set_level(A, 2.0);
        rec.set_level(A, f64::NEG_INFINITY);
        let frame = rec.take_frame(0, Timestamp(2));
        assert_eq!(frame.level(B.0), Some(f64::MAX));
        assert_eq!(frame.level(A.0), Some(2.0));
    }

    #[test]
    fn test_event_markers_are_capped() {
        let mut rec = Recorder::new(T, Timestamp(0));
        for i in 0..MAX_EVENTS_PER_FRAME as u64 {
            rec.start(A, Timestamp(i));
            rec.stop(A, Timestamp(i)).unwrap();
        }
        assert_eq!(rec.dropped_events(), MAX_EVENTS_PER_FRAME as u64);
        assert_eq!(rec.take_frame(0, Timestamp(0)).events.len(), MAX_EVENTS_PER_FRAME);
    }
}
