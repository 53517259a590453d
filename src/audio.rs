//! PulseAudio device adapters
//!
//! Concrete microphone and playback endpoints over PulseAudio's simple API.
//! Each device runs on a dedicated OS thread, since the simple API blocks;
//! the threads talk to the async core through channels and report readiness
//! through a one-shot handshake so open failures surface at call start.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::capture::{MicStream, Microphone, FRAME_SAMPLES};
use crate::controller::CallEvent;
use crate::error::CallError;
use crate::pcm;
use crate::playback::{ChunkId, OutputDevice, PlaybackSink, PLAYBACK_SAMPLE_RATE};
use crate::session::CAPTURE_SAMPLE_RATE;
use crate::vad::frame_level;

/// Samples per playback write slice: 20 ms at 24 kHz. Cancellation is checked
/// between slices, bounding barge-in latency.
const PLAY_SLICE_SAMPLES: usize = 480;

fn capture_spec() -> Spec {
    Spec {
        format: Format::S16le,
        channels: 1,
        rate: CAPTURE_SAMPLE_RATE,
    }
}

fn playback_spec() -> Spec {
    Spec {
        format: Format::S16le,
        channels: 1,
        rate: PLAYBACK_SAMPLE_RATE,
    }
}

/// Default-source microphone at 16 kHz mono.
pub struct PulseMicrophone {
    app_name: String,
    device: Option<String>,
}

impl PulseMicrophone {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            device: None,
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }
}

impl Microphone for PulseMicrophone {
    fn open(self: Box<Self>) -> BoxFuture<'static, Result<MicStream, CallError>> {
        async move {
            let (frame_tx, frame_rx) = mpsc::channel::<Vec<i16>>(32);
            let shutdown = Arc::new(AtomicBool::new(false));
            let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();

            let flag = shutdown.clone();
            std::thread::spawn(move || {
                // The simple API blocks, so the stream lives on its own
                // thread for the whole call.
                let spec = capture_spec();
                let simple = Simple::new(
                    None,
                    &self.app_name,
                    Direction::Record,
                    self.device.as_deref(),
                    "capture",
                    &spec,
                    None,
                    None,
                );
                let simple = match simple {
                    Ok(simple) => {
                        let _ = ready_tx.send(Ok(()));
                        simple
                    }
                    Err(e) => {
                        // PAErr's inherent to_string() returns Option<String>
                        // and shadows Display; format through Display instead.
                        let _ = ready_tx.send(Err(format!("{e}")));
                        return;
                    }
                };
                info!("microphone stream open");

                let mut buf = vec![0u8; FRAME_SAMPLES * 2];
                loop {
                    if flag.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Err(e) = simple.read(&mut buf) {
                        error!("microphone read failed: {e}");
                        break;
                    }
                    if flag.load(Ordering::Relaxed) {
                        break;
                    }
                    let Some(frame) = pcm::bytes_to_samples(&buf) else {
                        continue;
                    };
                    if frame_tx.blocking_send(frame).is_err() {
                        break;
                    }
                }
                debug!("microphone thread exited");
            });

            ready_rx
                .await
                .map_err(|_| CallError::PermissionDenied("capture thread died".to_string()))?
                .map_err(CallError::PermissionDenied)?;
            Ok(MicStream {
                frames: frame_rx,
                shutdown,
            })
        }
        .boxed()
    }
}

/// Default-sink playback output at 24 kHz mono.
pub struct PulseOutput {
    app_name: String,
    device: Option<String>,
}

impl PulseOutput {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            device: None,
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }
}

enum SinkCmd {
    Play {
        id: ChunkId,
        pcm: Vec<i16>,
        start: f64,
        generation: u64,
    },
    Close,
}

impl OutputDevice for PulseOutput {
    fn open(
        self: Box<Self>,
        events: mpsc::Sender<CallEvent>,
    ) -> Result<Box<dyn PlaybackSink>, CallError> {
        let (cmd_tx, cmd_rx) = std_mpsc::channel::<SinkCmd>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();
        let cancel_gen = Arc::new(AtomicU64::new(0));
        let epoch = Instant::now();

        let generation = cancel_gen.clone();
        std::thread::spawn(move || {
            let spec = playback_spec();
            let simple = Simple::new(
                None,
                &self.app_name,
                Direction::Playback,
                self.device.as_deref(),
                "playback",
                &spec,
                None,
                None,
            );
            let simple = match simple {
                Ok(simple) => {
                    let _ = ready_tx.send(Ok(()));
                    simple
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("{e}")));
                    return;
                }
            };
            info!("playback stream open");
            run_playback(simple, cmd_rx, events, generation, epoch);
            debug!("playback thread exited");
        });

        ready_rx
            .recv()
            .map_err(|_| CallError::AudioDevice("playback thread died".to_string()))?
            .map_err(CallError::AudioDevice)?;
        Ok(Box::new(PulsePlayback {
            cmds: cmd_tx,
            epoch,
            cancel_gen,
        }))
    }
}

/// Sink half handed to the scheduler. Device time is wall time since the
/// stream opened; the write thread keys completions off the same epoch.
struct PulsePlayback {
    cmds: std_mpsc::Sender<SinkCmd>,
    epoch: Instant,
    cancel_gen: Arc<AtomicU64>,
}

impl PlaybackSink for PulsePlayback {
    fn device_time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn play_at(&mut self, id: ChunkId, pcm: Vec<i16>, start: f64) {
        let generation = self.cancel_gen.load(Ordering::Relaxed);
        let _ = self.cmds.send(SinkCmd::Play {
            id,
            pcm,
            start,
            generation,
        });
    }

    fn cancel_all(&mut self) {
        // Bumping the generation invalidates every queued and in-progress
        // chunk; the write thread sees it between slices.
        self.cancel_gen.fetch_add(1, Ordering::Relaxed);
    }

    fn close(&mut self) {
        let _ = self.cmds.send(SinkCmd::Close);
    }
}

/// Playback write loop. Chunks are written in small slices so a cancel takes
/// effect within one slice; completion events fire when the wall clock passes
/// each chunk's scheduled end.
fn run_playback(
    simple: Simple,
    cmds: std_mpsc::Receiver<SinkCmd>,
    events: mpsc::Sender<CallEvent>,
    generation: Arc<AtomicU64>,
    epoch: Instant,
) {
    // (id, scheduled end on the device timeline, generation at enqueue)
    let mut pending: Vec<(ChunkId, f64, u64)> = Vec::new();

    loop {
        let now = epoch.elapsed().as_secs_f64();
        let wait = pending
            .iter()
            .map(|(_, end, _)| *end)
            .fold(f64::INFINITY, f64::min)
            - now;

        let cmd = if wait.is_finite() {
            match cmds.recv_timeout(Duration::from_secs_f64(wait.max(0.0))) {
                Ok(cmd) => Some(cmd),
                Err(std_mpsc::RecvTimeoutError::Timeout) => None,
                Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match cmds.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            }
        };

        match cmd {
            Some(SinkCmd::Play {
                id,
                pcm,
                start,
                generation: chunk_gen,
            }) => {
                if generation.load(Ordering::Relaxed) != chunk_gen {
                    debug!(id = id.0, "skipping flushed chunk");
                } else {
                    let _ = events.blocking_send(CallEvent::OutputLevel(frame_level(&pcm)));
                    let mut cancelled = false;
                    for slice in pcm.chunks(PLAY_SLICE_SAMPLES) {
                        if generation.load(Ordering::Relaxed) != chunk_gen {
                            cancelled = true;
                            break;
                        }
                        if let Err(e) = simple.write(&pcm::samples_to_bytes(slice)) {
                            warn!(id = id.0, "playback write failed, dropping chunk: {e}");
                            cancelled = true;
                            break;
                        }
                    }
                    if cancelled {
                        let _ = simple.flush();
                    } else {
                        let duration = pcm.len() as f64 / PLAYBACK_SAMPLE_RATE as f64;
                        pending.push((id, start + duration, chunk_gen));
                    }
                }
            }
            Some(SinkCmd::Close) => break,
            None => {}
        }

        let now = epoch.elapsed().as_secs_f64();
        let current = generation.load(Ordering::Relaxed);
        pending.retain(|(id, end, chunk_gen)| {
            if *chunk_gen != current {
                // Flushed while queued; no completion for it.
                return false;
            }
            if *end <= now {
                let _ = events.blocking_send(CallEvent::PlaybackFinished(*id));
                return false;
            }
            true
        });
    }
    let _ = simple.flush();
}
