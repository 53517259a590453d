//! Gemini Live API transport
//!
//! Implements the session boundary over the Live API WebSocket. The socket is
//! split into sink and stream halves; a dedicated writer task is the single
//! point where outbound messages are serialized, and a reader task maps server
//! JSON onto session events. The rest of the crate never sees the wire format.

use std::time::Duration;

use base64::engine::general_purpose;
use base64::Engine;
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::CallError;
use crate::session::{OpenSession, SessionConfig, SessionConnector, SessionEvent, SessionHandle};
use std::sync::Arc;

const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";

const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connector for the Gemini Live API.
pub struct GeminiConnector {
    api_key: String,
    model: String,
}

impl GeminiConnector {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

impl SessionConnector for GeminiConnector {
    fn open(
        self: Box<Self>,
        config: SessionConfig,
    ) -> BoxFuture<'static, Result<OpenSession, CallError>> {
        async move {
            let url = format!("{LIVE_API_URL}?key={}", self.api_key);
            info!(model = %self.model, "connecting to Live API");
            let (ws, _resp) = connect_async(url.as_str())
                .await
                .map_err(|e| CallError::SessionOpenFailure(e.to_string()))?;
            let (mut sink, mut stream) = ws.split();

            let setup = setup_message(&self.model, &config);
            sink.send(Message::Text(setup.to_string().into()))
                .await
                .map_err(|e| CallError::SessionOpenFailure(e.to_string()))?;

            tokio::time::timeout(SETUP_TIMEOUT, wait_for_setup_complete(&mut stream))
                .await
                .map_err(|_| CallError::Timeout)??;
            info!("Live API session setup complete");

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::channel(64);
            tokio::spawn(run_writer(sink, outbound_rx));
            tokio::spawn(run_reader(stream, event_tx));

            Ok(OpenSession {
                handle: Arc::new(GeminiHandle {
                    outbound: outbound_tx,
                }),
                events: event_rx,
            })
        }
        .boxed()
    }
}

enum Outbound {
    Audio(Vec<u8>),
    Close,
}

struct GeminiHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl SessionHandle for GeminiHandle {
    fn send_audio(&self, frame: &[u8]) {
        // The writer task may already be gone after close; dropping the
        // frame is the intended behavior then.
        let _ = self.outbound.send(Outbound::Audio(frame.to_vec()));
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// Block until the server acknowledges the setup message. Anything else
/// arriving first is unexpected but skipped.
async fn wait_for_setup_complete(stream: &mut WsStream) -> Result<(), CallError> {
    while let Some(msg) = stream.next().await {
        let msg = msg.map_err(|e| CallError::SessionOpenFailure(e.to_string()))?;
        let text = match msg {
            Message::Text(text) => text.to_string(),
            Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Message::Close(frame) => {
                return Err(CallError::SessionOpenFailure(format!(
                    "socket closed during setup: {frame:?}"
                )));
            }
            _ => continue,
        };
        let value: Value = serde_json::from_str(&text)?;
        if value.get("setupComplete").is_some() {
            return Ok(());
        }
        debug!("skipping pre-setup message: {text}");
    }
    Err(CallError::SessionOpenFailure(
        "socket ended before setup completed".to_string(),
    ))
}

/// Writer task: the only place outbound messages touch the socket.
async fn run_writer(mut sink: WsSink, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(msg) = outbound.recv().await {
        match msg {
            Outbound::Audio(bytes) => {
                let payload = json!({
                    "realtimeInput": {
                        "audio": {
                            "data": general_purpose::STANDARD.encode(&bytes),
                            "mimeType": "audio/pcm;rate=16000"
                        }
                    }
                });
                if let Err(e) = sink.send(Message::Text(payload.to_string().into())).await {
                    // The reader side reports the transport fault; frames
                    // are not retried.
                    debug!("dropping outbound audio frame: {e}");
                }
            }
            Outbound::Close => {
                if let Err(e) = sink.send(Message::Close(None)).await {
                    debug!("close frame not sent: {e}");
                }
                break;
            }
        }
    }
    info!("Live API writer task exited");
}

/// Reader task: maps server messages onto session events until the socket
/// ends one way or another.
async fn run_reader(mut stream: WsStream, events: mpsc::Sender<SessionEvent>) {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.to_string(),
            // The Live API delivers JSON in binary frames as well.
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    warn!("ignoring non-UTF-8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                info!("Live API socket closed: {frame:?}");
                let _ = events.send(SessionEvent::Closed).await;
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                error!("Live API socket error: {e}");
                let _ = events.send(SessionEvent::Error(e.to_string())).await;
                return;
            }
        };
        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                warn!("unparseable server message: {e}");
                continue;
            }
        };
        for event in server_events(&value) {
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
    let _ = events.send(SessionEvent::Closed).await;
    info!("Live API reader task exited");
}

/// Build the one-time setup message sent before any audio.
fn setup_message(model: &str, config: &SessionConfig) -> Value {
    let mut setup = json!({
        "model": model,
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": config.voice }
                }
            }
        },
        "systemInstruction": {
            "parts": [{ "text": config.system_instruction }]
        }
    });
    if config.input_transcription {
        setup["inputAudioTranscription"] = json!({});
    }
    if config.output_transcription {
        setup["outputAudioTranscription"] = json!({});
    }
    json!({ "setup": setup })
}

/// Translate one server message into zero or more session events, preserving
/// arrival order within the message: transcripts first, then audio parts,
/// then the interruption flag.
fn server_events(value: &Value) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    if value.get("goAway").is_some() {
        out.push(SessionEvent::Closed);
        return out;
    }
    let Some(content) = value.get("serverContent") else {
        return out;
    };
    if let Some(text) = content
        .pointer("/inputTranscription/text")
        .and_then(Value::as_str)
    {
        if !text.is_empty() {
            out.push(SessionEvent::InputTranscript(text.to_string()));
        }
    }
    if let Some(text) = content
        .pointer("/outputTranscription/text")
        .and_then(Value::as_str)
    {
        if !text.is_empty() {
            out.push(SessionEvent::OutputTranscript(text.to_string()));
        }
    }
    if let Some(parts) = content.pointer("/modelTurn/parts").and_then(Value::as_array) {
        for part in parts {
            let Some(data) = part.pointer("/inlineData/data").and_then(Value::as_str) else {
                continue;
            };
            match general_purpose::STANDARD.decode(data) {
                Ok(bytes) if !bytes.is_empty() => out.push(SessionEvent::AudioChunk(bytes)),
                Ok(_) => {}
                Err(e) => warn!("undecodable inline audio part: {e}"),
            }
        }
    }
    if content
        .get("interrupted")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        out.push(SessionEvent::Interrupted);
    }
    out
}
