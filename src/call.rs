//! Call lifecycle wiring
//!
//! Spawns the call task and hands the caller an observation handle. The task
//! owns the controller and is the only consumer of the event channel, so
//! every state mutation happens on one task in arrival order.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::capture::{CapturePipeline, Microphone};
use crate::config::AgentSettings;
use crate::controller::{CallController, CallEvent, CallObservers, CallState};
use crate::playback::{NullSink, OutputDevice, PlaybackScheduler};
use crate::session::{SessionConnector, SessionEvent};
use crate::transcript::TranscriptMessage;
use crate::vad::{VadConfig, VoiceActivityDetector};

/// The concrete devices and transport a call runs on. Seams for the real
/// PulseAudio and Live API endpoints, or for test doubles.
pub struct CallIo {
    pub microphone: Box<dyn Microphone>,
    pub connector: Box<dyn SessionConnector>,
    pub output: Box<dyn OutputDevice>,
}

/// Observation and control handle for a running call.
pub struct CallHandle {
    stop_tx: mpsc::Sender<()>,
    state_rx: watch::Receiver<CallState>,
    level_rx: watch::Receiver<f32>,
    transcript_rx: watch::Receiver<Vec<TranscriptMessage>>,
    error_rx: watch::Receiver<Option<String>>,
    started_at: Instant,
}

impl CallHandle {
    /// Request teardown. Idempotent; further calls are no-ops.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    pub fn state(&self) -> CallState {
        *self.state_rx.borrow()
    }

    pub fn duration(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn level(&self) -> f32 {
        *self.level_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state_rx.clone()
    }

    pub fn watch_transcript(&self) -> watch::Receiver<Vec<TranscriptMessage>> {
        self.transcript_rx.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.error_rx.borrow().clone()
    }
}

/// Start a call against the given endpoints. Returns immediately; progress
/// is observed through the handle.
pub fn start_call(settings: AgentSettings, io: CallIo) -> CallHandle {
    let (state_tx, state_rx) = watch::channel(CallState::Idle);
    let (level_tx, level_rx) = watch::channel(0.0f32);
    let (transcript_tx, transcript_rx) = watch::channel(Vec::new());
    let (error_tx, error_rx) = watch::channel(None);
    let (stop_tx, stop_rx) = mpsc::channel(1);

    let observers = CallObservers {
        state: state_tx,
        level: level_tx,
        transcript: transcript_tx,
        error: error_tx,
    };
    tokio::spawn(run_call(settings, io, observers, stop_rx));

    CallHandle {
        stop_tx,
        state_rx,
        level_rx,
        transcript_rx,
        error_rx,
        started_at: Instant::now(),
    }
}

async fn run_call(
    settings: AgentSettings,
    io: CallIo,
    observers: CallObservers,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let (event_tx, mut event_rx) = mpsc::channel::<CallEvent>(256);

    // The output device opens synchronously; a failure downgrades to a null
    // sink so the controller still has a scheduler to tear down.
    let (sink, sink_err) = match io.output.open(event_tx.clone()) {
        Ok(sink) => (sink, None),
        Err(e) => (
            Box::new(NullSink) as Box<dyn crate::playback::PlaybackSink>,
            Some(e.to_string()),
        ),
    };
    let mut controller = CallController::new(PlaybackScheduler::new(sink), observers);
    controller.begin_connecting();

    if let Some(message) = sink_err {
        controller.connect_failed(message);
        let _ = stop_rx.recv().await;
        controller.handle(CallEvent::StopRequested);
        return;
    }

    // Acquire the microphone and the session. Stop during either phase
    // abandons the call cleanly.
    let mic = tokio::select! {
        _ = stop_rx.recv() => {
            controller.handle(CallEvent::StopRequested);
            return;
        }
        result = io.microphone.open() => match result {
            Ok(mic) => mic,
            Err(e) => {
                controller.connect_failed(e.to_string());
                let _ = stop_rx.recv().await;
                controller.handle(CallEvent::StopRequested);
                return;
            }
        },
    };
    let session = tokio::select! {
        _ = stop_rx.recv() => {
            controller.handle(CallEvent::StopRequested);
            return;
        }
        result = io.connector.open(settings.session_config()) => match result {
            Ok(session) => session,
            Err(e) => {
                controller.connect_failed(e.to_string());
                let _ = stop_rx.recv().await;
                controller.handle(CallEvent::StopRequested);
                return;
            }
        },
    };

    let capture = CapturePipeline::spawn(
        mic,
        session.handle.clone(),
        event_tx.clone(),
        VoiceActivityDetector::new(VadConfig::default()),
    );
    controller.connected(session.handle, capture);
    info!("call connected");

    // Pump session events into the shared call-event channel.
    let mut session_events = session.events;
    let pump = tokio::spawn(async move {
        while let Some(event) = session_events.recv().await {
            let (mapped, last) = match event {
                SessionEvent::InputTranscript(text) => (CallEvent::InputTranscript(text), false),
                SessionEvent::OutputTranscript(text) => (CallEvent::OutputTranscript(text), false),
                SessionEvent::AudioChunk(bytes) => (CallEvent::AudioChunk(bytes), false),
                SessionEvent::Interrupted => (CallEvent::Interrupted, false),
                SessionEvent::Closed => (CallEvent::SessionClosed, true),
                SessionEvent::Error(message) => (CallEvent::SessionError(message), true),
            };
            if event_tx.send(mapped).await.is_err() || last {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                controller.handle(CallEvent::StopRequested);
                break;
            }
            event = event_rx.recv() => {
                let Some(event) = event else {
                    warn!("event channel drained unexpectedly");
                    controller.handle(CallEvent::StopRequested);
                    break;
                };
                let terminal = matches!(event, CallEvent::SessionClosed);
                controller.handle(event);
                if terminal {
                    break;
                }
                // A session error leaves the controller in its error state;
                // the call task lingers so observers can read it, and exits
                // on the eventual stop.
                if controller.state() == CallState::Error {
                    let _ = stop_rx.recv().await;
                    controller.handle(CallEvent::StopRequested);
                    break;
                }
            }
        }
    }
    pump.abort();
    info!("call task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MicStream;
    use crate::error::CallError;
    use crate::playback::testing::MockSink;
    use crate::playback::PlaybackSink;
    use crate::session::testing::MockSession;
    use crate::session::{OpenSession, SessionConfig};
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    struct FakeMic {
        frames: Mutex<Option<mpsc::Receiver<Vec<i16>>>>,
    }

    impl Microphone for FakeMic {
        fn open(self: Box<Self>) -> BoxFuture<'static, Result<MicStream, CallError>> {
            let frames = self.frames.lock().unwrap().take();
            async move {
                Ok(MicStream {
                    frames: frames.ok_or_else(|| {
                        CallError::PermissionDenied("mic already taken".to_string())
                    })?,
                    shutdown: Arc::new(AtomicBool::new(false)),
                })
            }
            .boxed()
        }
    }

    struct FailingMic;

    impl Microphone for FailingMic {
        fn open(self: Box<Self>) -> BoxFuture<'static, Result<MicStream, CallError>> {
            async { Err(CallError::PermissionDenied("denied by user".to_string())) }.boxed()
        }
    }

    struct FakeConnector {
        session: Arc<MockSession>,
        events: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    }

    impl SessionConnector for FakeConnector {
        fn open(
            self: Box<Self>,
            _config: SessionConfig,
        ) -> BoxFuture<'static, Result<OpenSession, CallError>> {
            async move {
                let events = self.events.lock().unwrap().take().ok_or_else(|| {
                    CallError::SessionOpenFailure("session already taken".to_string())
                })?;
                Ok(OpenSession {
                    handle: self.session.clone(),
                    events,
                })
            }
            .boxed()
        }
    }

    struct FakeOutput {
        sink: MockSink,
    }

    impl OutputDevice for FakeOutput {
        fn open(
            self: Box<Self>,
            _events: mpsc::Sender<CallEvent>,
        ) -> Result<Box<dyn PlaybackSink>, CallError> {
            Ok(Box::new(self.sink))
        }
    }

    struct Harness {
        handle: CallHandle,
        session: Arc<MockSession>,
        sink: MockSink,
        session_tx: mpsc::Sender<SessionEvent>,
        _frame_tx: mpsc::Sender<Vec<i16>>,
    }

    async fn started_call() -> Harness {
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (session_tx, session_rx) = mpsc::channel(8);
        let session = Arc::new(MockSession::default());
        let sink = MockSink::default();
        let io = CallIo {
            microphone: Box::new(FakeMic {
                frames: Mutex::new(Some(frame_rx)),
            }),
            connector: Box::new(FakeConnector {
                session: session.clone(),
                events: Mutex::new(Some(session_rx)),
            }),
            output: Box::new(FakeOutput { sink: sink.clone() }),
        };
        let handle = start_call(AgentSettings::default(), io);
        let mut state_rx = handle.watch_state();
        state_rx
            .wait_for(|s| *s == CallState::Listening)
            .await
            .unwrap();
        Harness {
            handle,
            session,
            sink,
            session_tx,
            _frame_tx: frame_tx,
        }
    }

    #[tokio::test]
    async fn call_connects_and_stops() {
        let harness = started_call().await;
        harness.handle.stop();
        let mut state_rx = harness.handle.watch_state();
        state_rx.wait_for(|s| *s == CallState::Idle).await.unwrap();
        assert_eq!(*harness.session.closes.lock().unwrap(), 1);
        assert_eq!(harness.sink.log().closes, 1);
        assert!(harness.handle.last_error().is_none());
    }

    #[tokio::test]
    async fn session_events_drive_transcript_and_playback() {
        let harness = started_call().await;
        harness
            .session_tx
            .send(SessionEvent::OutputTranscript("hi ".to_string()))
            .await
            .unwrap();
        harness
            .session_tx
            .send(SessionEvent::OutputTranscript("there".to_string()))
            .await
            .unwrap();
        harness
            .session_tx
            .send(SessionEvent::AudioChunk(vec![0u8; 4800]))
            .await
            .unwrap();

        let mut state_rx = harness.handle.watch_state();
        state_rx
            .wait_for(|s| *s == CallState::Speaking)
            .await
            .unwrap();
        let mut transcript_rx = harness.handle.watch_transcript();
        let transcript = transcript_rx
            .wait_for(|t| !t.is_empty())
            .await
            .unwrap()
            .clone();
        assert_eq!(transcript[0].text, "hi there");
        assert_eq!(harness.sink.log().scheduled.len(), 1);
        harness.handle.stop();
    }

    #[tokio::test]
    async fn remote_close_returns_handle_to_idle() {
        let harness = started_call().await;
        harness.session_tx.send(SessionEvent::Closed).await.unwrap();
        let mut state_rx = harness.handle.watch_state();
        state_rx.wait_for(|s| *s == CallState::Idle).await.unwrap();
        assert!(harness.handle.last_error().is_none());
    }

    #[tokio::test]
    async fn transport_error_is_observable_then_stoppable() {
        let harness = started_call().await;
        harness
            .session_tx
            .send(SessionEvent::Error("socket reset".to_string()))
            .await
            .unwrap();
        let mut state_rx = harness.handle.watch_state();
        state_rx.wait_for(|s| *s == CallState::Error).await.unwrap();
        assert_eq!(harness.handle.last_error().as_deref(), Some("socket reset"));
        harness.handle.stop();
        state_rx.wait_for(|s| *s == CallState::Idle).await.unwrap();
    }

    #[tokio::test]
    async fn microphone_failure_surfaces_as_error() {
        let (_session_tx, session_rx) = mpsc::channel(8);
        let io = CallIo {
            microphone: Box::new(FailingMic),
            connector: Box::new(FakeConnector {
                session: Arc::new(MockSession::default()),
                events: Mutex::new(Some(session_rx)),
            }),
            output: Box::new(FakeOutput {
                sink: MockSink::default(),
            }),
        };
        let handle = start_call(AgentSettings::default(), io);
        let mut state_rx = handle.watch_state();
        state_rx.wait_for(|s| *s == CallState::Error).await.unwrap();
        assert_eq!(handle.last_error().as_deref(), Some("denied by user"));
        handle.stop();
        state_rx.wait_for(|s| *s == CallState::Idle).await.unwrap();
    }
}
