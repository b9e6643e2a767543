//! Media transports: telephony media streams and browser audio sockets.
//!
//! Both endpoints upgrade to a WebSocket, split it, and hand the write half
//! to a send task fed by the session's output channel. The read half is
//! driven by [`drive_session`], which also enforces the session's maximum
//! duration and honours replacement by a duplicate connection.

use crate::session::{SessionHost, SessionOutput, SessionSpec};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Extension, Query, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parlance_types::{AudioFormats, Role, TransportKind, DEFAULT_AGENT_ID};
use parlance_voice::{decode_base64_audio, encode_base64_audio};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

// ── telephony wire format ────────────────────────────────────────────

/// Inbound telephony media-stream frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyInbound {
    Connected,
    Start { start: StreamStart },
    Media { media: InboundMedia },
    Mark { mark: MarkPayload },
    Stop,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    pub stream_sid: String,
    pub call_sid: String,
    /// Parameters attached by the call flow, e.g. `agentId`, `conversationId`.
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct InboundMedia {
    /// Base64 mu-law audio.
    pub payload: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}

/// Outbound telephony frames.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyOutbound {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
    /// Drops audio the carrier has buffered but not yet played.
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkPayload,
    },
}

/// Frames one session output for a telephony stream.
///
/// Transcripts have no telephony representation.
pub fn telephony_frame(stream_sid: &str, output: SessionOutput) -> Option<Message> {
    let frame = match output {
        SessionOutput::Audio(chunk) => TelephonyOutbound::Media {
            stream_sid: stream_sid.to_string(),
            media: OutboundMedia {
                payload: encode_base64_audio(&chunk),
            },
        },
        SessionOutput::Interrupt { .. } => TelephonyOutbound::Clear {
            stream_sid: stream_sid.to_string(),
        },
        SessionOutput::SpeechDone { epoch } => TelephonyOutbound::Mark {
            stream_sid: stream_sid.to_string(),
            mark: MarkPayload {
                name: format!("speech-{epoch}"),
            },
        },
        SessionOutput::Transcript { .. } | SessionOutput::Close => return None,
    };
    serde_json::to_string(&frame)
        .ok()
        .map(|text| Message::Text(text.into()))
}

// ── browser wire format ──────────────────────────────────────────────

/// Query parameters for `GET /media/browser`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserParams {
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
}

/// Control messages a browser may send as text frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserInbound {
    Stop,
    /// Cut off the current reply without saying anything.
    Interrupt,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserOutbound {
    Interrupt { epoch: u64 },
    Transcript { role: Role, text: String },
    SpeechDone { epoch: u64 },
}

/// Frames one session output for a browser socket: audio as binary frames,
/// everything else as JSON text.
pub fn browser_frame(output: SessionOutput) -> Option<Message> {
    let event = match output {
        SessionOutput::Audio(chunk) => return Some(Message::Binary(chunk.into())),
        SessionOutput::Interrupt { epoch } => BrowserOutbound::Interrupt { epoch },
        SessionOutput::Transcript { role, text } => BrowserOutbound::Transcript { role, text },
        SessionOutput::SpeechDone { epoch } => BrowserOutbound::SpeechDone { epoch },
        SessionOutput::Close => return None,
    };
    serde_json::to_string(&event)
        .ok()
        .map(|text| Message::Text(text.into()))
}

// ── handlers ─────────────────────────────────────────────────────────

fn services_unavailable(error: impl std::fmt::Display) -> Response {
    tracing::error!(error = %error, "refusing media connection: voice services not configured");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": format!("voice services unavailable: {error}") })),
    )
        .into_response()
}

/// WebSocket handler: `GET /media/telephony`.
pub async fn telephony_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = state.services.validate() {
        return services_unavailable(e);
    }
    ws.on_upgrade(move |socket| telephony_session(socket, state, addr))
}

/// WebSocket handler: `GET /media/browser?agentId=&sessionId=&conversationId=`.
pub async fn browser_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<BrowserParams>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = state.services.validate() {
        return services_unavailable(e);
    }
    ws.on_upgrade(move |socket| browser_session(socket, state, addr, params))
}

/// Waits for the `start` frame that opens a telephony stream.
async fn await_stream_start(receiver: &mut SplitStream<WebSocket>) -> Option<StreamStart> {
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<TelephonyInbound>(text.as_str()) {
                Ok(TelephonyInbound::Start { start }) => return Some(start),
                Ok(TelephonyInbound::Connected) => tracing::debug!("telephony stream connected"),
                Ok(TelephonyInbound::Stop) => return None,
                Ok(_) => tracing::debug!("telephony frame before start ignored"),
                Err(e) => tracing::debug!(error = %e, "unrecognized telephony frame"),
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "telephony socket error before start");
                return None;
            }
        }
    }
    None
}

async fn telephony_session(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let (sender, mut receiver) = socket.split();

    let start = match tokio::time::timeout(
        state.session.max_duration(),
        await_stream_start(&mut receiver),
    )
    .await
    {
        Ok(Some(start)) => start,
        Ok(None) => {
            tracing::info!(remote_addr = %addr, "telephony stream ended before start");
            return;
        }
        Err(_) => {
            tracing::warn!(remote_addr = %addr, "telephony stream never started");
            return;
        }
    };

    let param = |name: &str| {
        start
            .custom_parameters
            .get(name)
            .filter(|value| !value.trim().is_empty())
            .cloned()
    };
    let spec = SessionSpec {
        key: format!("call:{}", start.call_sid),
        call_id: start.call_sid.clone(),
        conversation_id: param("conversationId").unwrap_or_else(|| start.call_sid.clone()),
        agent_id: param("agentId").unwrap_or_else(|| DEFAULT_AGENT_ID.to_string()),
        transport: TransportKind::Telephony,
        formats: AudioFormats::telephony(),
    };
    tracing::info!(
        remote_addr = %addr,
        call_id = %spec.call_id,
        stream_sid = %start.stream_sid,
        "telephony stream started"
    );

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let stream_sid = start.stream_sid;
    let send_task = tokio::spawn(forward_outputs(sender, out_rx, move |output| {
        telephony_frame(&stream_sid, output)
    }));

    drive_session(&state, spec, receiver, out_tx, send_task, handle_telephony_message).await;
}

fn handle_telephony_message(host: &SessionHost, message: Message) -> Flow {
    let Message::Text(text) = message else {
        return Flow::Continue;
    };
    match serde_json::from_str::<TelephonyInbound>(text.as_str()) {
        Ok(TelephonyInbound::Media { media }) => match decode_base64_audio(&media.payload) {
            Ok(audio) if !audio.is_empty() => host.handle_audio(audio),
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "dropping undecodable media payload"),
        },
        Ok(TelephonyInbound::Mark { mark }) => {
            tracing::debug!(mark = %mark.name, "playback mark reached");
        }
        Ok(TelephonyInbound::Stop) => return Flow::End("stop"),
        Ok(TelephonyInbound::Start { .. }) => tracing::debug!("duplicate start frame ignored"),
        Ok(TelephonyInbound::Connected) => {}
        Err(e) => tracing::debug!(error = %e, "unrecognized telephony frame"),
    }
    Flow::Continue
}

async fn browser_session(
    socket: WebSocket,
    state: Arc<AppState>,
    addr: SocketAddr,
    params: BrowserParams,
) {
    let (sender, receiver) = socket.split();

    let present = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
    let agent_id = present(params.agent_id).unwrap_or_else(|| DEFAULT_AGENT_ID.to_string());
    let session_id = present(params.session_id).unwrap_or_else(|| Uuid::new_v4().to_string());
    let conversation_id = present(params.conversation_id).unwrap_or_else(|| session_id.clone());

    let spec = SessionSpec {
        key: format!("browser:{agent_id}:{session_id}"),
        call_id: session_id,
        conversation_id,
        agent_id,
        transport: TransportKind::Browser,
        formats: AudioFormats::browser(
            state.session.browser_input_sample_rate,
            state.session.browser_output_sample_rate,
        ),
    };
    tracing::info!(remote_addr = %addr, session_key = %spec.key, "browser audio socket opened");

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let send_task = tokio::spawn(forward_outputs(sender, out_rx, browser_frame));

    drive_session(&state, spec, receiver, out_tx, send_task, handle_browser_message).await;
}

fn handle_browser_message(host: &SessionHost, message: Message) -> Flow {
    match message {
        Message::Binary(audio) => {
            if !audio.is_empty() {
                host.handle_audio(audio.to_vec());
            }
        }
        Message::Text(text) => match serde_json::from_str::<BrowserInbound>(text.as_str()) {
            Ok(BrowserInbound::Stop) => return Flow::End("stop"),
            Ok(BrowserInbound::Interrupt) => host.interrupt(),
            Err(e) => tracing::debug!(error = %e, "unrecognized browser control message"),
        },
        _ => {}
    }
    Flow::Continue
}

// ── shared session loop ──────────────────────────────────────────────

/// What the read loop should do after an inbound frame.
enum Flow {
    Continue,
    End(&'static str),
}

/// Writes framed session output until the session signals `Close`.
async fn forward_outputs<F>(
    mut sender: SplitSink<WebSocket, Message>,
    mut outputs: mpsc::UnboundedReceiver<SessionOutput>,
    frame: F,
) where
    F: Fn(SessionOutput) -> Option<Message> + Send + 'static,
{
    while let Some(output) = outputs.recv().await {
        if matches!(output, SessionOutput::Close) {
            break;
        }
        let Some(message) = frame(output) else {
            continue;
        };
        if let Err(e) = sender.send(message).await {
            tracing::debug!(error = %e, "media socket write failed");
            return;
        }
    }
    let _ = sender.close().await;
}

/// Registers the session, runs it until the connection ends, then tears it
/// down.
async fn drive_session<F>(
    state: &AppState,
    spec: SessionSpec,
    mut receiver: SplitStream<WebSocket>,
    outbound: mpsc::UnboundedSender<SessionOutput>,
    mut send_task: JoinHandle<()>,
    on_message: F,
) where
    F: Fn(&SessionHost, Message) -> Flow,
{
    let key = spec.key.clone();
    let (session_id, mut replaced) = state.sessions.register(&key);

    let host = match SessionHost::open(state, spec, outbound.clone()).await {
        Ok(host) => host,
        Err(e) => {
            tracing::error!(session_key = %key, error = %e, "failed to open session");
            state.sessions.remove(&key, session_id);
            let _ = outbound.send(SessionOutput::Close);
            let _ = send_task.await;
            return;
        }
    };

    let deadline = tokio::time::sleep(state.session.max_duration());
    tokio::pin!(deadline);

    let mut writer_done = false;
    let reason = loop {
        tokio::select! {
            message = receiver.next() => match message {
                Some(Ok(Message::Close(_))) | None => break "hangup",
                Some(Ok(message)) => {
                    if let Flow::End(reason) = on_message(&host, message) {
                        break reason;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(session_key = %key, error = %e, "media socket error");
                    break "transport_error";
                }
            },
            _ = &mut replaced => break "replaced",
            () = &mut deadline => {
                tracing::info!(
                    session_key = %key,
                    max_duration_secs = state.session.max_duration_secs,
                    "session reached maximum duration"
                );
                break "max_duration";
            }
            _ = &mut send_task => {
                writer_done = true;
                break "send_failed";
            }
        }
    };

    if let Err(e) = host.close(reason).await {
        tracing::warn!(session_key = %key, error = %e, "session teardown incomplete");
    }
    state.sessions.remove(&key, session_id);

    let _ = outbound.send(SessionOutput::Close);
    if !writer_done {
        let _ = send_task.await;
    }
}
