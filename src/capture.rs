//! Capture pipeline
//!
//! Owns the microphone frame stream for the duration of a call. Each fixed
//! 4096-sample frame is converted to wire PCM and handed to the session,
//! then fed to the VAD exactly once. Send failures are not retried here; a
//! dropped frame is accepted silently in favor of latency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::controller::CallEvent;
use crate::error::CallError;
use crate::pcm;
use crate::session::SessionHandle;
use crate::vad::{frame_level, VoiceActivityDetector};

/// Samples per capture frame: 256 ms at 16 kHz. A tunable constant, not a
/// per-call parameter.
pub const FRAME_SAMPLES: usize = 4096;

/// A live microphone stream: fixed-size frames plus the shutdown flag the
/// producing device watches.
pub struct MicStream {
    pub frames: mpsc::Receiver<Vec<i16>>,
    pub shutdown: Arc<AtomicBool>,
}

/// Opens a microphone input stream. Failure maps to `PermissionDenied`.
pub trait Microphone: Send {
    fn open(self: Box<Self>) -> BoxFuture<'static, Result<MicStream, CallError>>;
}

pub struct CapturePipeline {
    shutdown: Arc<AtomicBool>,
    _task: JoinHandle<()>,
}

impl CapturePipeline {
    /// Spawn the frame-forwarding task. The VAD is owned by the task and
    /// evaluated once per frame, in arrival order.
    pub fn spawn(
        mut mic: MicStream,
        session: Arc<dyn SessionHandle>,
        events: mpsc::Sender<CallEvent>,
        mut vad: VoiceActivityDetector,
    ) -> Self {
        let shutdown = mic.shutdown.clone();
        let stop = shutdown.clone();
        let task = tokio::spawn(async move {
            'frames: while let Some(frame) = mic.frames.recv().await {
                // Checked before every send so no frame escapes after stop().
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                session.send_audio(&pcm::samples_to_bytes(&frame));
                for event in vad.process(&frame) {
                    if events.send(CallEvent::Speech(event)).await.is_err() {
                        break 'frames;
                    }
                }
                if events
                    .send(CallEvent::InputLevel(frame_level(&frame)))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            vad.stop();
            debug!("capture pipeline exited");
        });
        Self {
            shutdown,
            _task: task,
        }
    }

    /// Release the input stream. Idempotent; after this no further frames
    /// are forwarded or sent.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::MockSession;
    use crate::vad::{SpeechEvent, VadConfig};

    fn pipeline_parts() -> (
        mpsc::Sender<Vec<i16>>,
        MicStream,
        Arc<MockSession>,
        mpsc::Receiver<CallEvent>,
        mpsc::Sender<CallEvent>,
    ) {
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let mic = MicStream {
            frames: frame_rx,
            shutdown: Arc::new(AtomicBool::new(false)),
        };
        let session = Arc::new(MockSession::default());
        let (event_tx, event_rx) = mpsc::channel(32);
        (frame_tx, mic, session, event_rx, event_tx)
    }

    #[tokio::test]
    async fn frames_are_encoded_and_sent() {
        let (frame_tx, mic, session, mut events, event_tx) = pipeline_parts();
        let _pipeline = CapturePipeline::spawn(
            mic,
            session.clone(),
            event_tx,
            VoiceActivityDetector::new(VadConfig::default()),
        );

        let frame = vec![1000i16; FRAME_SAMPLES];
        frame_tx.send(frame.clone()).await.unwrap();

        // A loud frame yields a speech start followed by its level.
        match events.recv().await.unwrap() {
            CallEvent::Speech(SpeechEvent::Start) => {}
            other => panic!("unexpected event: {other:?}"),
        }
        match events.recv().await.unwrap() {
            CallEvent::InputLevel(level) => assert!(level > 0.02),
            other => panic!("unexpected event: {other:?}"),
        }

        let sent = session.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], pcm::samples_to_bytes(&frame));
    }

    #[tokio::test]
    async fn quiet_frames_report_level_only() {
        let (frame_tx, mic, session, mut events, event_tx) = pipeline_parts();
        let _pipeline = CapturePipeline::spawn(
            mic,
            session.clone(),
            event_tx,
            VoiceActivityDetector::new(VadConfig::default()),
        );

        frame_tx.send(vec![0i16; FRAME_SAMPLES]).await.unwrap();
        match events.recv().await.unwrap() {
            CallEvent::InputLevel(level) => assert_eq!(level, 0.0),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_halts_forwarding() {
        let (frame_tx, mic, session, mut events, event_tx) = pipeline_parts();
        let pipeline = CapturePipeline::spawn(
            mic,
            session.clone(),
            event_tx,
            VoiceActivityDetector::new(VadConfig::default()),
        );

        pipeline.stop();
        pipeline.stop(); // idempotent
        frame_tx.send(vec![1000i16; FRAME_SAMPLES]).await.unwrap();
        // The task drains the frame, sees the flag and exits without sending.
        assert!(events.recv().await.is_none());
        assert!(session.sent.lock().unwrap().is_empty());
    }
}
