//! Gapless playback scheduling
//!
//! Response audio arrives as decoded 24 kHz PCM chunks faster than it plays.
//! Each chunk's start time is pinned to the end of the previous chunk (or to
//! "now" when the output has been idle), so continuous audio has no silence
//! gaps. The scheduler owns the output clock and the set of in-flight chunks;
//! chunk completion is reported back by id, and a flush-on-interrupt empties
//! everything at once.

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::controller::CallEvent;
use crate::error::CallError;

/// Samples per second of decoded response audio.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Identity of a scheduled chunk, assigned monotonically at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(pub u64);

/// Output device seam. The scheduler never blocks on the device; it only
/// pins start times against the device clock and hands chunks over.
pub trait PlaybackSink: Send {
    /// Current position of the output device clock, in seconds.
    fn device_time(&self) -> f64;
    /// Schedule a decoded chunk to begin at `start` on the device timeline.
    fn play_at(&mut self, id: ChunkId, pcm: Vec<i16>, start: f64);
    /// Stop every chunk scheduled so far.
    fn cancel_all(&mut self);
    /// Tear down the output device. Idempotent.
    fn close(&mut self);
}

/// Opens a playback device. Completion and level events for scheduled chunks
/// are delivered through the given call-event channel.
pub trait OutputDevice: Send {
    fn open(
        self: Box<Self>,
        events: mpsc::Sender<CallEvent>,
    ) -> Result<Box<dyn PlaybackSink>, CallError>;
}

/// Sink that swallows everything. Stands in when the real device failed to
/// open so teardown paths still have something to drive.
pub struct NullSink;

impl PlaybackSink for NullSink {
    fn device_time(&self) -> f64 {
        0.0
    }
    fn play_at(&mut self, _id: ChunkId, _pcm: Vec<i16>, _start: f64) {}
    fn cancel_all(&mut self) {}
    fn close(&mut self) {}
}

pub struct PlaybackScheduler {
    sink: Box<dyn PlaybackSink>,
    next_id: u64,
    /// Next available start time on the device timeline, advanced by chunk
    /// duration as each chunk is scheduled.
    output_clock: f64,
    /// Scheduled-but-unfinished chunks, keyed by id, holding each duration.
    active: BTreeMap<ChunkId, f64>,
    closed: bool,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn PlaybackSink>) -> Self {
        Self {
            sink,
            next_id: 0,
            output_clock: 0.0,
            active: BTreeMap::new(),
            closed: false,
        }
    }

    /// Schedule a decoded chunk for gapless output. Returns the chunk id, or
    /// `None` when the chunk is empty or the device is already torn down.
    pub fn enqueue(&mut self, pcm: Vec<i16>) -> Option<ChunkId> {
        if self.closed {
            debug!("ignoring enqueue after teardown");
            return None;
        }
        if pcm.is_empty() {
            warn!("dropping empty playback chunk");
            return None;
        }
        let id = ChunkId(self.next_id);
        self.next_id += 1;
        let duration = pcm.len() as f64 / PLAYBACK_SAMPLE_RATE as f64;
        let start = self.output_clock.max(self.sink.device_time());
        debug!(id = id.0, start, duration, "scheduling playback chunk");
        self.sink.play_at(id, pcm, start);
        self.output_clock = start + duration;
        self.active.insert(id, duration);
        Some(id)
    }

    /// Record completion of a chunk's output. Returns true when this emptied
    /// the active set, i.e. playback drained. A completion for a chunk that
    /// was already flushed by `interrupt` is a no-op.
    pub fn complete(&mut self, id: ChunkId) -> bool {
        if self.active.remove(&id).is_none() {
            debug!(id = id.0, "completion for unknown chunk, ignoring");
            return false;
        }
        self.active.is_empty()
    }

    /// Barge-in flush: stop every in-flight chunk and reset the clock so the
    /// next chunk schedules relative to the device's current time, not the
    /// stale pre-interrupt value. The caller treats this as an unconditional
    /// drain.
    pub fn interrupt(&mut self) {
        if self.closed {
            return;
        }
        debug!(flushed = self.active.len(), "interrupting playback");
        self.sink.cancel_all();
        self.active.clear();
        self.output_clock = 0.0;
    }

    /// Terminal teardown. Pending chunks are discarded without completion
    /// semantics; no drain signal is derived. Idempotent.
    pub fn stop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.active.clear();
        self.sink.close();
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    pub fn active_sources(&self) -> usize {
        self.active.len()
    }

    pub fn output_clock(&self) -> f64 {
        self.output_clock
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockSink;
    use super::*;

    fn chunk(seconds: f64) -> Vec<i16> {
        vec![0; (seconds * PLAYBACK_SAMPLE_RATE as f64) as usize]
    }

    fn scheduler_with_sink() -> (PlaybackScheduler, MockSink) {
        let sink = MockSink::default();
        (PlaybackScheduler::new(Box::new(sink.clone())), sink)
    }

    #[test]
    fn back_to_back_chunks_are_gapless() {
        let (mut scheduler, sink) = scheduler_with_sink();
        sink.set_device_time(10.0);

        scheduler.enqueue(chunk(0.5)).unwrap();
        scheduler.enqueue(chunk(0.25)).unwrap();
        scheduler.enqueue(chunk(1.0)).unwrap();

        let log = sink.log();
        let starts: Vec<f64> = log.scheduled.iter().map(|(_, _, s)| *s).collect();
        assert_eq!(starts, vec![10.0, 10.5, 10.75]);
        drop(log);
        assert_eq!(scheduler.output_clock(), 11.75);
        assert_eq!(scheduler.active_sources(), 3);
    }

    #[test]
    fn idle_output_pins_to_device_time() {
        let (mut scheduler, sink) = scheduler_with_sink();
        sink.set_device_time(3.0);
        scheduler.enqueue(chunk(0.5)).unwrap();
        // The device clock passed the end of the first chunk while the output
        // sat idle; the next chunk must not schedule in the past.
        sink.set_device_time(7.0);
        scheduler.enqueue(chunk(0.5)).unwrap();

        let log = sink.log();
        assert_eq!(log.scheduled[0].2, 3.0);
        assert_eq!(log.scheduled[1].2, 7.0);
    }

    #[test]
    fn drain_detected_when_last_chunk_completes() {
        let (mut scheduler, _sink) = scheduler_with_sink();
        let a = scheduler.enqueue(chunk(0.5)).unwrap();
        let b = scheduler.enqueue(chunk(0.5)).unwrap();
        assert!(!scheduler.complete(a));
        assert!(scheduler.complete(b));
        assert!(scheduler.is_idle());
    }

    #[test]
    fn interrupt_flushes_and_resets_clock() {
        let (mut scheduler, sink) = scheduler_with_sink();
        sink.set_device_time(5.0);
        let a = scheduler.enqueue(chunk(2.0)).unwrap();
        scheduler.enqueue(chunk(2.0)).unwrap();

        scheduler.interrupt();
        assert!(scheduler.is_idle());
        assert_eq!(scheduler.output_clock(), 0.0);
        assert_eq!(sink.log().cancels, 1);

        // A late completion for a flushed chunk is ignored and never counts
        // as a drain.
        assert!(!scheduler.complete(a));

        // The next chunk schedules at the current device time, not at the
        // stale pre-interrupt clock.
        sink.set_device_time(9.0);
        scheduler.enqueue(chunk(0.5)).unwrap();
        assert_eq!(sink.log().scheduled.last().unwrap().2, 9.0);
        assert_eq!(scheduler.output_clock(), 9.5);
    }

    #[test]
    fn empty_chunks_are_dropped() {
        let (mut scheduler, sink) = scheduler_with_sink();
        assert_eq!(scheduler.enqueue(Vec::new()), None);
        assert!(sink.log().scheduled.is_empty());
    }

    #[test]
    fn stop_is_terminal_and_idempotent() {
        let (mut scheduler, sink) = scheduler_with_sink();
        scheduler.enqueue(chunk(0.5)).unwrap();
        scheduler.stop();
        scheduler.stop();
        assert_eq!(sink.log().closes, 1);
        assert!(scheduler.is_idle());
        assert_eq!(scheduler.enqueue(chunk(0.5)), None);
    }
}
