//! Voice call core: real-time microphone capture, turn-taking state and
//! gapless response playback against a live conversational agent.
//!
//! The crate is a library first; [`start_call`] wires a full call together
//! out of the device and transport seams in [`capture`], [`playback`] and
//! [`session`], and the binary in `main.rs` is a thin terminal front end.

#![forbid(unsafe_code)]

pub mod audio;
pub mod call;
pub mod capture;
pub mod config;
pub mod controller;
pub mod error;
pub mod gemini;
pub mod pcm;
pub mod playback;
pub mod session;
pub mod transcript;
pub mod vad;

pub use call::{start_call, CallHandle, CallIo};
pub use config::{AgentSettings, AVAILABLE_VOICES};
pub use controller::{CallEvent, CallState};
pub use error::CallError;
pub use transcript::{Speaker, TranscriptMessage};
pub use vad::{SpeechEvent, VadConfig, VoiceActivityDetector};
