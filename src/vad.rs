//! Voice activity detection
//!
//! A debounced energy-hysteresis detector, not a statistical classifier: any
//! excursion above the threshold counts as speech, and speech ends only after
//! the silence timeout elapses without a louder frame cancelling it. Short
//! noise bursts below the timeout are accepted as false positives.

use std::time::{Duration, Instant};
use tracing::debug;

/// Emitted when the detector's speaking flag flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEvent {
    Start,
    End,
}

#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Normalized energy above which a frame counts as speech.
    pub threshold: f32,
    /// Silence that must elapse before a speech run is closed.
    pub silence_timeout: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.02,
            silence_timeout: Duration::from_millis(800),
        }
    }
}

/// Per-call detector state. `process` must be invoked in frame-arrival order;
/// the pending silence deadline is resolved at the next frame rather than by
/// a timer, so frame N+1 always observes frame N's side effects. Because an
/// elapsed deadline is resolved before the new frame is classified, a single
/// frame can yield two events: the `End` that closes the gapped run followed
/// by the `Start` that opens the new one.
pub struct VoiceActivityDetector {
    cfg: VadConfig,
    speaking: bool,
    silence_deadline: Option<Instant>,
}

impl VoiceActivityDetector {
    pub fn new(cfg: VadConfig) -> Self {
        Self {
            cfg,
            speaking: false,
            silence_deadline: None,
        }
    }

    /// Classify one frame against the wall clock.
    pub fn process(&mut self, frame: &[i16]) -> Vec<SpeechEvent> {
        self.process_at(frame, Instant::now())
    }

    /// Classify one frame at an explicit point in time. Events are returned
    /// in emission order.
    pub fn process_at(&mut self, frame: &[i16], now: Instant) -> Vec<SpeechEvent> {
        let mut events = Vec::new();
        // An elapsed deadline closes the run before the frame is classified,
        // whatever the frame's level. Speech resuming after a full timeout of
        // silence is a new run, not a continuation.
        if let Some(deadline) = self.silence_deadline {
            if now >= deadline {
                self.speaking = false;
                self.silence_deadline = None;
                debug!("speech closed after silence timeout");
                events.push(SpeechEvent::End);
            }
        }
        let level = frame_level(frame);
        if level > self.cfg.threshold {
            self.silence_deadline = None;
            if !self.speaking {
                self.speaking = true;
                debug!(level, "speech opened");
                events.push(SpeechEvent::Start);
            }
        } else if self.speaking && self.silence_deadline.is_none() {
            self.silence_deadline = Some(now + self.cfg.silence_timeout);
        }
        events
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Silent teardown: clears the pending deadline and the speaking flag
    /// without emitting `End`.
    pub fn stop(&mut self) {
        self.silence_deadline = None;
        self.speaking = false;
    }
}

/// Normalized mean absolute amplitude of a frame, in [0, 1].
pub fn frame_level(frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f64 = frame.iter().map(|&s| (s as f64).abs()).sum();
    (sum / frame.len() as f64 / 32768.0) as f32
}
