//! Terminal front end for a single voice call.
//!
//! Connects the default microphone and speaker to the Live API agent, prints
//! the transcript as turns complete and ends the call on Ctrl-C.

#![forbid(unsafe_code)]

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use livecall::audio::{PulseMicrophone, PulseOutput};
use livecall::gemini::GeminiConnector;
use livecall::{start_call, AgentSettings, CallIo, CallState};

const APP_NAME: &str = "livecall";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let api_key = std::env::var("GEMINI_API_KEY").context("GEMINI_API_KEY is not set")?;
    let settings = AgentSettings::from_env();
    info!(agent = %settings.agent_name, voice = %settings.voice, "starting call");

    let io = CallIo {
        microphone: Box::new(PulseMicrophone::new(APP_NAME)),
        connector: Box::new(GeminiConnector::new(api_key)),
        output: Box::new(PulseOutput::new(APP_NAME)),
    };
    let handle = start_call(settings, io);

    let mut state_rx = handle.watch_state();
    let mut transcript_rx = handle.watch_transcript();
    // The live message mutates while a turn streams; print each message only
    // once the next turn starts.
    let mut printed = 0usize;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, ending call");
                handle.stop();
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                info!(?state, "call state");
                match state {
                    CallState::Idle => break,
                    CallState::Error => {
                        if let Some(message) = handle.last_error() {
                            eprintln!("call failed: {message}");
                        }
                        handle.stop();
                    }
                    _ => {}
                }
            }
            changed = transcript_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let transcript = transcript_rx.borrow_and_update().clone();
                while printed + 1 < transcript.len() {
                    let message = &transcript[printed];
                    println!("[{:?}] {}", message.speaker, message.text);
                    printed += 1;
                }
            }
        }
    }

    // Flush whatever was still streaming when the call ended.
    let transcript = transcript_rx.borrow().clone();
    for message in &transcript[printed.min(transcript.len())..] {
        println!("[{:?}] {}", message.speaker, message.text);
    }
    info!(duration = ?handle.duration(), "call ended");
    Ok(())
}
