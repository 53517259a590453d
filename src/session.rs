//! Session interface boundary
//!
//! The remote agent is reached through an opaque bidirectional session:
//! outbound raw audio frames, inbound transcript fragments, decoded response
//! audio, interruption and lifecycle events. The core only sees these types;
//! the concrete transport lives behind `SessionConnector`.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::CallError;

/// Samples per second of outbound capture audio.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Opaque configuration handed through to the transport unmodified.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub system_instruction: String,
    pub voice: String,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

/// Inbound events from the remote agent.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Partial transcript of the user's own speech.
    InputTranscript(String),
    /// Partial transcript of the agent's speech.
    OutputTranscript(String),
    /// Decoded response audio: 16-bit LE PCM bytes at 24 kHz mono.
    AudioChunk(Vec<u8>),
    /// The user barged over the agent; queued playback must be flushed.
    Interrupted,
    /// Graceful remote close. Not an error.
    Closed,
    /// Mid-call transport fault, fatal to the current call.
    Error(String),
}

/// Outbound half of an open session.
pub trait SessionHandle: Send + Sync {
    /// Fire-and-forget outbound audio frame (16 kHz LE PCM bytes). Never
    /// blocks; a frame that cannot be queued is dropped without retry.
    fn send_audio(&self, frame: &[u8]);
    /// Idempotent close.
    fn close(&self);
}

pub struct OpenSession {
    pub handle: Arc<dyn SessionHandle>,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Opens a session against the remote agent.
pub trait SessionConnector: Send {
    fn open(
        self: Box<Self>,
        config: SessionConfig,
    ) -> BoxFuture<'static, Result<OpenSession, CallError>>;
}
