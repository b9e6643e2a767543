//! Session host: one voice pipeline per media connection.
//!
//! A [`SessionHost`] resolves the agent's voice configuration, wires a
//! [`VoicePipeline`] to the connection's outbound channel, persists the
//! conversation as it happens and reports usage when the call ends. The
//! [`SessionRegistry`] makes sure only one connection per logical call is
//! live at a time.

use crate::AppState;
use parlance_db::DbPool;
use parlance_store::{
    append_event, find_voice_config, report_usage, ConversationEventType, NewConversationEvent,
    StoreError, UsageReport,
};
use parlance_types::{AudioFormats, Role, TransportKind, UsageSnapshot, VoiceConfig};
use parlance_voice::{PipelineOptions, PipelineSink, VoiceError, VoicePipeline};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Errors raised while opening or tearing down a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("voice pipeline error: {0}")]
    Voice(#[from] VoiceError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Live sessions: session key -> (session id, close signal).
type SessionMap = HashMap<String, (Uuid, oneshot::Sender<()>)>;

/// Tracks which logical calls currently own a live connection.
///
/// Uses `std::sync::Mutex`: every acquisition is a brief map operation that
/// never spans an `.await`.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<SessionMap>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection for `key`, signalling any previous connection
    /// for the same key to close.
    ///
    /// Returns the new session id and the receiver that fires when this
    /// session is itself replaced.
    pub fn register(&self, key: &str) -> (Uuid, oneshot::Receiver<()>) {
        let session_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let previous = lock(&self.sessions).insert(key.to_string(), (session_id, tx));
        if let Some((previous_id, close)) = previous {
            tracing::info!(
                session_key = %key,
                previous_session = %previous_id,
                "replacing live session for duplicate connection"
            );
            // The old connection may already be gone.
            let _ = close.send(());
        }
        (session_id, rx)
    }

    /// Removes the entry for `key` if it still belongs to `session_id`.
    ///
    /// Returns `false` for a stale removal (the key was taken over).
    pub fn remove(&self, key: &str, session_id: Uuid) -> bool {
        let mut sessions = lock(&self.sessions);
        match sessions.get(key) {
            Some((current, _)) if *current == session_id => {
                sessions.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn is_live(&self, key: &str) -> bool {
        lock(&self.sessions).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transport-agnostic output of a session, framed by each transport.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutput {
    Audio(Vec<u8>),
    /// Playback must stop; buffered audio is stale.
    Interrupt { epoch: u64 },
    Transcript { role: Role, text: String },
    SpeechDone { epoch: u64 },
    /// The session is over; the writer should close the connection.
    Close,
}

/// Identity of one media session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    /// Registry key, e.g. `call:<callSid>`.
    pub key: String,
    /// Usage is reported under this id.
    pub call_id: String,
    pub conversation_id: String,
    pub agent_id: String,
    pub transport: TransportKind,
    pub formats: AudioFormats,
}

/// Ordered, per-conversation event writer.
///
/// Events are appended by a single background task so their sequence
/// numbers follow the order in which they were recorded.
struct EventLog {
    tx: Mutex<Option<mpsc::UnboundedSender<NewConversationEvent>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    call_id: String,
    session_key: String,
}

impl EventLog {
    fn spawn(pool: DbPool, spec: &SessionSpec) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_events(pool, spec.conversation_id.clone(), rx));
        Self {
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            call_id: spec.call_id.clone(),
            session_key: spec.key.clone(),
        }
    }

    fn metadata(&self, epoch: Option<u64>, extra: Value) -> Value {
        let mut metadata = json!({
            "call_id": self.call_id,
            "session_key": self.session_key,
        });
        if let Some(epoch) = epoch {
            metadata["epoch"] = json!(epoch);
        }
        if let (Some(target), Value::Object(extra)) = (metadata.as_object_mut(), extra) {
            target.extend(extra);
        }
        metadata
    }

    fn lifecycle(&self, event_type: ConversationEventType, epoch: Option<u64>, extra: Value) {
        let metadata = self.metadata(epoch, extra);
        self.record(NewConversationEvent::lifecycle(event_type, metadata));
    }

    fn message(&self, role: Role, text: &str, epoch: u64) {
        let metadata = self.metadata(Some(epoch), Value::Null);
        self.record(NewConversationEvent::message(role, text, metadata));
    }

    fn record(&self, event: NewConversationEvent) {
        if let Some(tx) = lock(&self.tx).as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Stops accepting events and waits until everything recorded is written.
    async fn finish(&self) -> Result<(), SessionError> {
        lock(&self.tx).take();
        let writer = lock(&self.writer).take();
        if let Some(writer) = writer {
            writer.await?;
        }
        Ok(())
    }
}

async fn write_events(
    pool: DbPool,
    conversation_id: String,
    mut rx: mpsc::UnboundedReceiver<NewConversationEvent>,
) {
    while let Some(event) = rx.recv().await {
        let pool = pool.clone();
        let id = conversation_id.clone();
        let event_type = event.event_type;
        let result = tokio::task::spawn_blocking(move || -> Result<(), SessionError> {
            let conn = pool.get()?;
            append_event(&conn, &id, &event)?;
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(
                conversation_id = %conversation_id,
                event_type = %event_type,
                error = %e,
                "failed to persist conversation event"
            ),
            Err(e) => tracing::warn!(
                conversation_id = %conversation_id,
                error = %e,
                "conversation event writer task failed"
            ),
        }
    }
}

/// Pipeline output port: forwards to the connection and persists turns.
struct ChannelSink {
    outbound: mpsc::UnboundedSender<SessionOutput>,
    events: Arc<EventLog>,
}

impl ChannelSink {
    fn send(&self, output: SessionOutput) {
        // A closed channel means the connection is being torn down.
        let _ = self.outbound.send(output);
    }
}

impl PipelineSink for ChannelSink {
    fn on_audio(&self, chunk: Vec<u8>) {
        self.send(SessionOutput::Audio(chunk));
    }

    fn on_interrupt(&self, epoch: u64) {
        self.send(SessionOutput::Interrupt { epoch });
        self.events
            .lifecycle(ConversationEventType::Interrupted, Some(epoch), Value::Null);
    }

    fn on_transcript_final(&self, text: &str, epoch: u64) {
        self.events.message(Role::User, text, epoch);
        self.send(SessionOutput::Transcript {
            role: Role::User,
            text: text.to_string(),
        });
    }

    fn on_assistant_message(&self, text: &str, epoch: u64) {
        self.events.message(Role::Assistant, text, epoch);
        self.send(SessionOutput::Transcript {
            role: Role::Assistant,
            text: text.to_string(),
        });
    }

    fn on_speech_done(&self, epoch: u64) {
        self.send(SessionOutput::SpeechDone { epoch });
    }
}

/// Outcome of [`resolve_voice_config`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedVoiceConfig {
    pub config: VoiceConfig,
    /// The stored configuration was not used.
    pub fallback: bool,
}

impl ResolvedVoiceConfig {
    fn stored(config: VoiceConfig) -> Self {
        Self {
            config,
            fallback: false,
        }
    }

    fn fallback() -> Self {
        Self {
            config: VoiceConfig::fallback(),
            fallback: true,
        }
    }
}

/// Resolves the agent's voice configuration, never failing the session.
///
/// Lookup errors, unknown agents and slow lookups all yield
/// [`VoiceConfig::fallback`].
pub async fn resolve_voice_config(
    pool: &DbPool,
    agent_id: &str,
    timeout: Duration,
) -> ResolvedVoiceConfig {
    let pool = pool.clone();
    let id = agent_id.to_string();
    let lookup = tokio::task::spawn_blocking(move || -> Result<Option<VoiceConfig>, SessionError> {
        let conn = pool.get()?;
        Ok(find_voice_config(&conn, &id)?)
    });

    match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(Ok(Some(config)))) => ResolvedVoiceConfig::stored(config),
        Ok(Ok(Ok(None))) => {
            tracing::info!(agent_id = %agent_id, "no voice configuration for agent; using fallback");
            ResolvedVoiceConfig::fallback()
        }
        Ok(Ok(Err(e))) => {
            tracing::warn!(agent_id = %agent_id, error = %e, "voice configuration lookup failed; using fallback");
            ResolvedVoiceConfig::fallback()
        }
        Ok(Err(e)) => {
            tracing::warn!(agent_id = %agent_id, error = %e, "voice configuration task failed; using fallback");
            ResolvedVoiceConfig::fallback()
        }
        Err(_) => {
            tracing::warn!(
                agent_id = %agent_id,
                timeout_ms = timeout.as_millis() as u64,
                "voice configuration lookup timed out; using fallback"
            );
            ResolvedVoiceConfig::fallback()
        }
    }
}

/// Owns the pipeline of one connected call.
pub struct SessionHost {
    spec: SessionSpec,
    pool: DbPool,
    pipeline: VoicePipeline,
    events: Arc<EventLog>,
    closed: AtomicBool,
}

impl SessionHost {
    /// Builds and starts the pipeline for `spec`.
    ///
    /// Pipeline output is delivered to `outbound`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Voice` when the pipeline refuses to start
    /// (for example, missing service credentials). The session is already
    /// closed in that case.
    pub async fn open(
        state: &AppState,
        spec: SessionSpec,
        outbound: mpsc::UnboundedSender<SessionOutput>,
    ) -> Result<Self, SessionError> {
        let resolved = resolve_voice_config(
            &state.pool,
            &spec.agent_id,
            state.session.config_lookup_timeout(),
        )
        .await;

        let events = Arc::new(EventLog::spawn(state.pool.clone(), &spec));
        events.lifecycle(
            ConversationEventType::SessionStarted,
            None,
            json!({
                "agent_id": spec.agent_id,
                "transport": spec.transport.as_str(),
                "fallback_config": resolved.fallback,
            }),
        );

        let options = PipelineOptions {
            formats: spec.formats,
            max_queued_utterances: state.session.max_queued_utterances,
            utterance_end_ms: state.services_config.utterance_end_ms,
            endpointing_ms: state.services_config.endpointing_ms,
        };
        let sink = Arc::new(ChannelSink {
            outbound,
            events: Arc::clone(&events),
        });
        let pipeline = VoicePipeline::new(resolved.config, state.services.clone(), options, sink);

        let host = Self {
            spec,
            pool: state.pool.clone(),
            pipeline,
            events,
            closed: AtomicBool::new(false),
        };

        if let Err(e) = host.pipeline.start() {
            if let Err(close_err) = host.close("start_failed").await {
                tracing::warn!(session_key = %host.spec.key, error = %close_err, "teardown after failed start");
            }
            return Err(e.into());
        }

        tracing::info!(
            session_key = %host.spec.key,
            call_id = %host.spec.call_id,
            agent_id = %host.spec.agent_id,
            transport = host.spec.transport.as_str(),
            "session opened"
        );
        Ok(host)
    }

    /// Feeds decoded inbound audio to the pipeline.
    pub fn handle_audio(&self, chunk: Vec<u8>) {
        self.pipeline.handle_audio(chunk);
    }

    /// Abandons the current reply, as if the caller had barged in.
    pub fn interrupt(&self) {
        self.pipeline.interrupt();
    }

    pub fn spec(&self) -> &SessionSpec {
        &self.spec
    }

    pub fn pipeline(&self) -> &VoicePipeline {
        &self.pipeline
    }

    /// Stops the pipeline, flushes the event log and reports usage.
    /// Idempotent: later calls return the final usage without side effects.
    ///
    /// # Errors
    ///
    /// Returns an error when the usage report cannot be written.
    pub async fn close(&self, reason: &str) -> Result<UsageSnapshot, SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(self.pipeline.usage());
        }

        let usage = self.pipeline.stop();
        self.events.lifecycle(
            ConversationEventType::SessionEnded,
            Some(self.pipeline.epoch()),
            json!({
                "reason": reason,
                "audio_bytes": usage.audio_bytes,
                "stt_seconds": usage.stt_seconds,
                "tts_characters": usage.tts_characters,
            }),
        );
        self.events.finish().await?;

        let pool = self.pool.clone();
        let call_id = self.spec.call_id.clone();
        let agent_id = self.spec.agent_id.clone();
        let transport = self.spec.transport;
        tokio::task::spawn_blocking(move || -> Result<(), SessionError> {
            let conn = pool.get()?;
            report_usage(
                &conn,
                &UsageReport {
                    call_id: &call_id,
                    agent_id: &agent_id,
                    transport,
                    usage,
                },
            )?;
            Ok(())
        })
        .await??;

        tracing::info!(
            session_key = %self.spec.key,
            call_id = %self.spec.call_id,
            reason,
            audio_bytes = usage.audio_bytes,
            stt_seconds = usage.stt_seconds,
            tts_characters = usage.tts_characters,
            "session closed"
        );
        Ok(usage)
    }
}
