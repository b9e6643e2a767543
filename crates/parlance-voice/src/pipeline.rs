//! The conversation orchestrator.
//!
//! A [`VoicePipeline`] owns one STT link, the utterance queue, the turn loop,
//! and the usage counters for a single call. All state transitions happen
//! under one mutex; the two long waits (model streaming and synthesis) run
//! outside it and are fenced by [`TurnGuard`]s.
//!
//! # Turn lifecycle
//!
//! ```text
//! Idle --start--> Listening --final / utterance end--> Responding
//! Responding --non-empty reply--> Speaking --flushed--> Listening
//! Speaking --barge-in--> Interrupted --> Listening
//! Responding | Speaking --interrupt--> Interrupted --> Listening
//! * --stop--> Stopped
//! ```
//!
//! At most one turn is in flight. Utterances that arrive meanwhile wait in the
//! queue and are answered in arrival order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use parlance_types::{AudioFormats, ConversationTurn, UsageSnapshot, VoiceConfig};
use tracing::{debug, error, info, warn};

use crate::epoch::{EpochClock, TurnGuard};
use crate::error::VoiceError;
use crate::responder::TurnResponder;
use crate::service::{SttEvent, SttSettings, TtsSettings, VoiceServices};
use crate::stt::SttClient;
use crate::tts::{SpeakOutcome, TtsClient};

/// Default bound on utterances waiting for a turn.
pub const DEFAULT_MAX_QUEUED_UTTERANCES: usize = 8;

/// Where the pipeline is in the turn lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    /// Constructed, `start` not yet called.
    Idle,
    /// Recognition active, no turn in flight.
    Listening,
    /// Waiting on the language model for the current epoch.
    Responding,
    /// Streaming synthesized audio for the current epoch.
    Speaking,
    /// The in-flight turn was abandoned; the turn loop has not yet moved on.
    Interrupted,
    Stopped,
}

/// Output port of a pipeline.
///
/// Every method is called synchronously while the pipeline's state lock is
/// held, in the order the pipeline produces output. Implementations must
/// return quickly and must not call back into the pipeline.
pub trait PipelineSink: Send + Sync {
    /// A chunk of synthesized audio in the outbound format.
    fn on_audio(&self, chunk: Vec<u8>);

    /// Playback was cut off; buffered outbound audio should be discarded.
    fn on_interrupt(&self, _epoch: u64) {}

    /// A caller utterance was accepted into the queue.
    fn on_transcript_final(&self, _text: &str, _epoch: u64) {}

    /// A reply was committed to history and is about to be spoken.
    fn on_assistant_message(&self, _text: &str, _epoch: u64) {}

    /// All audio for the reply of `epoch` has been delivered.
    fn on_speech_done(&self, _epoch: u64) {}
}

/// Tunables that do not come from the agent's [`VoiceConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineOptions {
    pub formats: AudioFormats,
    pub max_queued_utterances: usize,
    pub utterance_end_ms: u32,
    pub endpointing_ms: u32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            formats: AudioFormats::telephony(),
            max_queued_utterances: DEFAULT_MAX_QUEUED_UTTERANCES,
            utterance_end_ms: 1_000,
            endpointing_ms: 300,
        }
    }
}

struct PipelineCore {
    phase: PipelinePhase,
    queue: VecDeque<String>,
    /// A turn loop task is running.
    processing: bool,
    history: Vec<ConversationTurn>,
    /// Latest interim text not yet covered by a final transcript.
    last_interim: Option<String>,
}

struct Inner {
    config: VoiceConfig,
    options: PipelineOptions,
    services: VoiceServices,
    clock: EpochClock,
    core: Mutex<PipelineCore>,
    stt: SttClient,
    tts: TtsClient,
    responder: TurnResponder,
    sink: Arc<dyn PipelineSink>,
}

/// One call's conversation pipeline. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct VoicePipeline {
    inner: Arc<Inner>,
}

impl VoicePipeline {
    pub fn new(
        config: VoiceConfig,
        services: VoiceServices,
        options: PipelineOptions,
        sink: Arc<dyn PipelineSink>,
    ) -> Self {
        let stt = SttClient::new(
            Arc::clone(&services.stt),
            SttSettings {
                model: config.stt_model.clone(),
                locale: config.locale.clone(),
                format: options.formats.input,
                utterance_end_ms: options.utterance_end_ms,
                endpointing_ms: options.endpointing_ms,
            },
        );
        let tts = TtsClient::new(
            Arc::clone(&services.tts),
            TtsSettings {
                model: config.tts_model.clone(),
                voice: config.tts_voice.clone(),
                format: options.formats.output,
            },
        );
        let responder = TurnResponder::new(
            Arc::clone(&services.model),
            config.system_prompt.clone(),
            config.tools.clone(),
        );

        Self {
            inner: Arc::new(Inner {
                config,
                options,
                services,
                clock: EpochClock::new(),
                core: Mutex::new(PipelineCore {
                    phase: PipelinePhase::Idle,
                    queue: VecDeque::new(),
                    processing: false,
                    history: Vec::new(),
                    last_interim: None,
                }),
                stt,
                tts,
                responder,
                sink,
            }),
        }
    }

    /// Opens the recognition link. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `VoiceError::MissingCredentials` (or `Config`) when a service
    /// is not usable, and `VoiceError::Closed` after `stop`.
    pub fn start(&self) -> Result<(), VoiceError> {
        if let Err(e) = self.inner.services.validate() {
            error!(
                agent_id = %self.inner.config.agent_id,
                error = %e,
                "voice services not configured"
            );
            return Err(e);
        }

        {
            let mut core = self.inner.lock_core();
            match core.phase {
                PipelinePhase::Idle => core.phase = PipelinePhase::Listening,
                PipelinePhase::Stopped => return Err(VoiceError::Closed),
                _ => return Ok(()),
            }
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.stt.start(move |event| {
            if let Some(inner) = weak.upgrade() {
                Inner::on_stt_event(&inner, event);
            }
        });
        info!(
            agent_id = %self.inner.config.agent_id,
            barge_in = self.inner.config.barge_in,
            "voice pipeline started"
        );
        Ok(())
    }

    /// Feeds one inbound audio chunk. Never blocks; a no-op after `stop`.
    pub fn handle_audio(&self, chunk: Vec<u8>) {
        if self.inner.lock_core().phase == PipelinePhase::Stopped {
            return;
        }
        self.inner.stt.handle_audio(chunk);
    }

    /// Abandons the in-flight turn and everything queued behind it.
    pub fn interrupt(&self) {
        let mut core = self.inner.lock_core();
        if core.phase == PipelinePhase::Stopped {
            return;
        }
        self.inner.interrupt_locked(&mut core, "explicit");
    }

    /// Tears the pipeline down and returns final usage. Idempotent.
    pub fn stop(&self) -> UsageSnapshot {
        {
            let mut core = self.inner.lock_core();
            if core.phase != PipelinePhase::Stopped {
                let epoch = self.inner.clock.advance();
                core.phase = PipelinePhase::Stopped;
                core.queue.clear();
                core.last_interim = None;
                info!(agent_id = %self.inner.config.agent_id, epoch, "voice pipeline stopped");
            }
        }
        self.inner.stt.stop();
        self.usage()
    }

    pub fn usage(&self) -> UsageSnapshot {
        let audio_bytes = self.inner.stt.bytes_received();
        UsageSnapshot {
            audio_bytes,
            stt_seconds: self.inner.options.formats.input.bytes_to_seconds(audio_bytes),
            tts_characters: self.inner.tts.characters_requested(),
        }
    }

    pub fn phase(&self) -> PipelinePhase {
        self.inner.lock_core().phase
    }

    pub fn epoch(&self) -> u64 {
        self.inner.clock.current()
    }

    pub fn history(&self) -> Vec<ConversationTurn> {
        self.inner.lock_core().history.clone()
    }

    pub fn queued_utterances(&self) -> Vec<String> {
        self.inner.lock_core().queue.iter().cloned().collect()
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.inner.config
    }
}

impl Inner {
    fn lock_core(&self) -> MutexGuard<'_, PipelineCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_stt_event(self: &Arc<Self>, event: SttEvent) {
        let mut core = self.lock_core();
        if core.phase == PipelinePhase::Stopped {
            return;
        }

        let speaking = core.phase == PipelinePhase::Speaking;
        if speaking
            && !self.config.barge_in
            && matches!(event, SttEvent::Transcript { .. } | SttEvent::UtteranceEnd)
        {
            debug!("caller speech during playback ignored");
            return;
        }

        match event {
            SttEvent::Transcript {
                text,
                is_final: false,
            } => {
                let text = text.trim();
                if text.is_empty() {
                    return;
                }
                core.last_interim = Some(text.to_string());
                if speaking {
                    self.interrupt_locked(&mut core, "barge_in");
                }
            }
            SttEvent::Transcript {
                text,
                is_final: true,
            } => {
                core.last_interim = None;
                let text = text.trim();
                if !text.is_empty() {
                    self.enqueue_locked(&mut core, text.to_string());
                }
            }
            SttEvent::UtteranceEnd => {
                if let Some(text) = core.last_interim.take() {
                    debug!("utterance end without final; using last interim");
                    self.enqueue_locked(&mut core, text);
                }
            }
            SttEvent::Error(message) => warn!(error = %message, "STT error"),
            SttEvent::Closed => debug!("STT link closed"),
        }
    }

    fn enqueue_locked(self: &Arc<Self>, core: &mut PipelineCore, text: String) {
        self.sink.on_transcript_final(&text, self.clock.current());

        // Only playback is cut short. A reply still being generated answers
        // earlier speech, so the new utterance waits its turn behind it.
        if self.config.barge_in && core.phase == PipelinePhase::Speaking {
            self.interrupt_locked(core, "new_utterance");
        }

        let cap = self.options.max_queued_utterances.max(1);
        while core.queue.len() >= cap {
            if let Some(dropped) = core.queue.pop_front() {
                warn!(cap, dropped = %dropped, "utterance queue full; dropping oldest");
            }
        }
        core.queue.push_back(text);

        if !core.processing {
            core.processing = true;
            tokio::spawn(Arc::clone(self).run_turns());
        }
    }

    fn interrupt_locked(&self, core: &mut PipelineCore, reason: &'static str) {
        let epoch = self.clock.advance();
        core.queue.clear();
        if core.processing {
            core.phase = PipelinePhase::Interrupted;
        }
        info!(epoch, reason, "pipeline interrupted");
        self.sink.on_interrupt(epoch);
    }

    fn emit_audio(&self, guard: &TurnGuard, chunk: Vec<u8>) {
        let core = self.lock_core();
        if core.phase == PipelinePhase::Stopped || !guard.is_current() {
            return;
        }
        self.sink.on_audio(chunk);
    }

    /// Drains the queue one turn at a time. Exactly one of these runs while
    /// `processing` is set.
    async fn run_turns(self: Arc<Self>) {
        loop {
            let (text, guard, history) = {
                let mut core = self.lock_core();
                if core.phase == PipelinePhase::Stopped {
                    core.processing = false;
                    return;
                }
                let Some(text) = core.queue.pop_front() else {
                    core.processing = false;
                    core.phase = PipelinePhase::Listening;
                    return;
                };
                self.clock.advance();
                core.phase = PipelinePhase::Responding;
                (text, self.clock.guard(), core.history.clone())
            };
            let epoch = guard.epoch();
            debug!(epoch, "turn started");

            let reply = self.responder.respond(&history, &text, &guard).await;

            {
                let mut core = self.lock_core();
                if core.phase == PipelinePhase::Stopped || !guard.is_current() {
                    debug!(epoch, "turn discarded");
                    continue;
                }
                if reply.is_empty() {
                    core.phase = PipelinePhase::Listening;
                    continue;
                }
                core.history.push(ConversationTurn::user(text));
                core.history.push(ConversationTurn::assistant(reply.clone()));
                core.phase = PipelinePhase::Speaking;
                self.sink.on_assistant_message(&reply, epoch);
            }

            let outcome = self
                .tts
                .speak(&reply, &guard, |chunk| self.emit_audio(&guard, chunk))
                .await;

            let mut core = self.lock_core();
            if core.phase == PipelinePhase::Stopped || !guard.is_current() {
                continue;
            }
            if outcome == SpeakOutcome::Completed {
                self.sink.on_speech_done(epoch);
            }
            core.phase = PipelinePhase::Listening;
        }
    }
}
