//! Conversation state machine
//!
//! The only component with cross-cutting state. VAD events, session events,
//! playback completions and user stop requests arrive from different tasks;
//! they are funneled into one event channel and applied here through a single
//! serialized entry point, mutating resources the controller uniquely owns.
//!
//! Turn-taking is deliberately asymmetric: VAD only toggles between
//! `Listening` and `UserSpeaking`, while arrival of agent audio forces
//! `Speaking` from any active state. The remote `interrupted` signal is the
//! authoritative way the user barges over the agent.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::capture::CapturePipeline;
use crate::pcm;
use crate::playback::{ChunkId, PlaybackScheduler};
use crate::session::SessionHandle;
use crate::transcript::{Speaker, TranscriptLog, TranscriptMessage};
use crate::vad::SpeechEvent;

/// Observable call state. Exactly one value is live at a time; only the
/// controller writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Connecting,
    Listening,
    UserSpeaking,
    Speaking,
    Error,
}

/// Everything the controller reacts to, from every producer.
#[derive(Debug)]
pub enum CallEvent {
    /// VAD speech start/end, in frame order.
    Speech(SpeechEvent),
    /// Microphone energy for the level meter, one per frame.
    InputLevel(f32),
    /// Output energy for the level meter, reported per played chunk.
    OutputLevel(f32),
    InputTranscript(String),
    OutputTranscript(String),
    /// Decoded response audio payload (24 kHz LE PCM bytes).
    AudioChunk(Vec<u8>),
    /// A scheduled chunk finished playing on the device.
    PlaybackFinished(ChunkId),
    /// Remote barge-in signal.
    Interrupted,
    SessionClosed,
    SessionError(String),
    StopRequested,
}

/// Watch senders the UI layer observes. The core pushes changes; any polling
/// or animation cadence is the observer's own business.
pub struct CallObservers {
    pub state: watch::Sender<CallState>,
    pub level: watch::Sender<f32>,
    pub transcript: watch::Sender<Vec<TranscriptMessage>>,
    pub error: watch::Sender<Option<String>>,
}

pub struct CallController {
    state: CallState,
    scheduler: PlaybackScheduler,
    transcript: TranscriptLog,
    capture: Option<CapturePipeline>,
    session: Option<Arc<dyn SessionHandle>>,
    observers: CallObservers,
}

impl CallController {
    pub fn new(scheduler: PlaybackScheduler, observers: CallObservers) -> Self {
        Self {
            state: CallState::Idle,
            scheduler,
            transcript: TranscriptLog::new(),
            capture: None,
            session: None,
            observers,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Start requested: clear the previous call's transcript and error and
    /// enter `Connecting` while the microphone and session are acquired.
    pub fn begin_connecting(&mut self) {
        self.transcript.reset();
        self.publish_transcript();
        self.observers.error.send_replace(None);
        self.set_state(CallState::Connecting);
    }

    /// Session open handshake completed: take ownership of the live
    /// resources and start listening.
    pub fn connected(&mut self, session: Arc<dyn SessionHandle>, capture: CapturePipeline) {
        self.session = Some(session);
        self.capture = Some(capture);
        self.set_state(CallState::Listening);
    }

    /// Microphone acquisition or the open handshake failed.
    pub fn connect_failed(&mut self, message: String) {
        self.fail(message);
    }

    /// The single serialized entry point for every in-call event.
    pub fn handle(&mut self, event: CallEvent) {
        match event {
            CallEvent::Speech(SpeechEvent::Start) => {
                if self.state == CallState::Listening {
                    self.set_state(CallState::UserSpeaking);
                }
            }
            CallEvent::Speech(SpeechEvent::End) => {
                if self.state == CallState::UserSpeaking {
                    self.set_state(CallState::Listening);
                }
            }
            CallEvent::InputLevel(level) => {
                if self.state == CallState::UserSpeaking {
                    self.observers.level.send_replace(level);
                }
            }
            CallEvent::OutputLevel(level) => {
                if self.state == CallState::Speaking {
                    self.observers.level.send_replace(level);
                }
            }
            CallEvent::InputTranscript(fragment) => {
                if self.is_active() {
                    self.transcript.append(Speaker::User, &fragment);
                    self.publish_transcript();
                }
            }
            CallEvent::OutputTranscript(fragment) => {
                if self.is_active() {
                    self.transcript.append(Speaker::Agent, &fragment);
                    self.publish_transcript();
                }
            }
            CallEvent::AudioChunk(bytes) => {
                if !self.is_active() {
                    debug!(state = ?self.state, "ignoring audio chunk");
                    return;
                }
                let Some(samples) = pcm::bytes_to_samples(&bytes) else {
                    warn!(len = bytes.len(), "dropping malformed audio chunk");
                    return;
                };
                if self.scheduler.enqueue(samples).is_some() {
                    self.set_state(CallState::Speaking);
                }
            }
            CallEvent::PlaybackFinished(id) => {
                if self.scheduler.complete(id) && self.state == CallState::Speaking {
                    self.set_state(CallState::Listening);
                }
            }
            CallEvent::Interrupted => {
                if self.is_active() {
                    info!("remote interruption, flushing playback");
                    self.scheduler.interrupt();
                    self.set_state(CallState::Listening);
                } else {
                    debug!(state = ?self.state, "ignoring late interruption");
                }
            }
            CallEvent::SessionClosed => {
                if self.state != CallState::Idle {
                    info!("session closed by remote");
                    self.teardown();
                    self.set_state(CallState::Idle);
                }
            }
            CallEvent::SessionError(message) => {
                if !matches!(self.state, CallState::Idle | CallState::Error) {
                    self.fail(message);
                }
            }
            CallEvent::StopRequested => {
                self.teardown();
                self.set_state(CallState::Idle);
            }
        }
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state,
            CallState::Listening | CallState::UserSpeaking | CallState::Speaking
        )
    }

    fn set_state(&mut self, next: CallState) {
        if self.state == next {
            return;
        }
        info!(from = ?self.state, to = ?next, "call state transition");
        self.state = next;
        self.observers.state.send_replace(next);
        if !matches!(next, CallState::UserSpeaking | CallState::Speaking) {
            self.observers.level.send_replace(0.0);
        }
    }

    fn publish_transcript(&self) {
        self.observers.transcript.send_replace(self.transcript.snapshot());
    }

    fn fail(&mut self, message: String) {
        error!("call failed: {message}");
        self.teardown();
        self.observers.error.send_replace(Some(message));
        self.set_state(CallState::Error);
    }

    /// Release every resource. Each sub-step is idempotent and runs even if
    /// an earlier one already ran; invoked from close, error and stop paths.
    fn teardown(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.scheduler.stop();
    }
}
