//! Scripted in-memory services for exercising pipelines without a network.
//!
//! Enabled for dependent crates with the `test-util` feature.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::error::VoiceError;
use crate::pipeline::PipelineSink;
use crate::service::{
    LanguageModel, ModelEvent, ModelRequest, ModelStream, SttEvent, SttFrame, SttLink,
    SttSettings, SttTransport, TtsCommand, TtsEvent, TtsLink, TtsSettings, TtsTransport,
    VoiceServices,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Polls `check` until it returns true or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ── speech to text ───────────────────────────────────────────────────

#[derive(Default)]
struct SttShared {
    events: Mutex<Option<mpsc::UnboundedSender<SttEvent>>>,
    frames: Mutex<Vec<SttFrame>>,
    settings: Mutex<Option<SttSettings>>,
    gate: Mutex<Option<Arc<Notify>>>,
    opens: AtomicUsize,
}

/// Recognition service driven by the test: transcripts are injected with
/// [`ScriptedStt::emit`] and received audio is recorded.
#[derive(Clone, Default)]
pub struct ScriptedStt {
    shared: Arc<SttShared>,
    missing_key: bool,
}

impl ScriptedStt {
    pub fn new() -> Self {
        Self::default()
    }

    /// A service whose `validate` reports missing credentials.
    pub fn without_credentials() -> Self {
        Self {
            missing_key: true,
            ..Self::default()
        }
    }

    /// Holds the open acknowledgement until [`ScriptedStt::release`].
    pub fn gated(self) -> Self {
        *lock(&self.shared.gate) = Some(Arc::new(Notify::new()));
        self
    }

    pub fn release(&self) {
        if let Some(gate) = lock(&self.shared.gate).as_ref() {
            gate.notify_one();
        }
    }

    pub fn is_open(&self) -> bool {
        lock(&self.shared.events).is_some()
    }

    pub async fn wait_open(&self) -> bool {
        eventually(Duration::from_secs(2), || self.is_open()).await
    }

    pub fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Sends an event to the open link. Returns false when no link is open.
    pub fn emit(&self, event: SttEvent) -> bool {
        match lock(&self.shared.events).as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn interim(&self, text: &str) -> bool {
        self.emit(SttEvent::Transcript {
            text: text.to_string(),
            is_final: false,
        })
    }

    pub fn final_transcript(&self, text: &str) -> bool {
        self.emit(SttEvent::Transcript {
            text: text.to_string(),
            is_final: true,
        })
    }

    pub fn utterance_end(&self) -> bool {
        self.emit(SttEvent::UtteranceEnd)
    }

    /// Audio chunks received so far, in arrival order.
    pub fn received_audio(&self) -> Vec<Vec<u8>> {
        lock(&self.shared.frames)
            .iter()
            .filter_map(|frame| match frame {
                SttFrame::Audio(chunk) => Some(chunk.clone()),
                SttFrame::Finish => None,
            })
            .collect()
    }

    pub fn finished(&self) -> bool {
        lock(&self.shared.frames).contains(&SttFrame::Finish)
    }

    pub fn last_settings(&self) -> Option<SttSettings> {
        lock(&self.shared.settings).clone()
    }
}

#[async_trait]
impl SttTransport for ScriptedStt {
    fn validate(&self) -> Result<(), VoiceError> {
        if self.missing_key {
            return Err(VoiceError::MissingCredentials("scripted speech key".into()));
        }
        Ok(())
    }

    async fn open(&self, settings: &SttSettings) -> Result<SttLink, VoiceError> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        *lock(&self.shared.settings) = Some(settings.clone());
        let gate = lock(&self.shared.gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        *lock(&self.shared.events) = Some(event_tx);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let finish = frame == SttFrame::Finish;
                lock(&shared.frames).push(frame);
                if finish {
                    break;
                }
            }
        });

        Ok(SttLink {
            frames: frame_tx,
            events: event_rx,
        })
    }
}

// ── text to speech ───────────────────────────────────────────────────

#[derive(Default)]
struct TtsShared {
    spoken: Mutex<Vec<String>>,
    closes: AtomicUsize,
}

/// Synthesis service that answers each flush with `chunks` fake audio
/// frames, `chunk_delay` apart, then `Flushed`.
#[derive(Clone)]
pub struct ScriptedTts {
    shared: Arc<TtsShared>,
    chunks: usize,
    chunk_delay: Duration,
    fail_with: Option<String>,
}

impl Default for ScriptedTts {
    fn default() -> Self {
        Self {
            shared: Arc::default(),
            chunks: 3,
            chunk_delay: Duration::from_millis(5),
            fail_with: None,
        }
    }
}

impl ScriptedTts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunks(mut self, chunks: usize, chunk_delay: Duration) -> Self {
        self.chunks = chunks;
        self.chunk_delay = chunk_delay;
        self
    }

    /// Every synthesis ends in a service error instead of `Flushed`.
    pub fn failing(mut self, message: &str) -> Self {
        self.fail_with = Some(message.to_string());
        self
    }

    /// Texts submitted for synthesis, in order.
    pub fn spoken(&self) -> Vec<String> {
        lock(&self.shared.spoken).clone()
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TtsTransport for ScriptedTts {
    async fn open(&self, _settings: &TtsSettings) -> Result<TtsLink, VoiceError> {
        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::clone(&self.shared);
        let chunks = self.chunks;
        let delay = self.chunk_delay;
        let fail_with = self.fail_with.clone();

        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    TtsCommand::Speak(text) => {
                        lock(&shared.spoken).push(text);
                    }
                    TtsCommand::Flush => {
                        if let Some(message) = &fail_with {
                            let _ = event_tx.send(TtsEvent::Error(message.clone()));
                            continue;
                        }
                        for i in 0..chunks {
                            tokio::time::sleep(delay).await;
                            // Receiver gone: the speaker moved on.
                            if event_tx.send(TtsEvent::Audio(vec![i as u8 + 1; 160])).is_err() {
                                return;
                            }
                        }
                        let _ = event_tx.send(TtsEvent::Flushed);
                    }
                    TtsCommand::Close => {
                        shared.closes.fetch_add(1, Ordering::SeqCst);
                        return;
                    }
                }
            }
        });

        Ok(TtsLink {
            commands: command_tx,
            events: event_rx,
        })
    }
}

// ── language model ───────────────────────────────────────────────────

#[derive(Default)]
struct ModelShared {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<ModelRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight(Arc<ModelShared>);

impl InFlight {
    fn enter(shared: &Arc<ModelShared>) -> Self {
        let now = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        shared.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(shared))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Model that streams queued replies word by word.
///
/// When the queue is empty it answers `"Okay."`.
#[derive(Clone, Default)]
pub struct ScriptedModel {
    shared: Arc<ModelShared>,
    word_delay: Duration,
    fail: bool,
}

impl ScriptedModel {
    pub fn replying<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let model = Self::default();
        lock(&model.shared.replies).extend(replies.into_iter().map(Into::into));
        model
    }

    /// Delay before each streamed word.
    pub fn with_word_delay(mut self, delay: Duration) -> Self {
        self.word_delay = delay;
        self
    }

    /// Every request fails before streaming.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        lock(&self.shared.requests).clone()
    }

    /// Highest number of simultaneously open streams observed.
    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn stream(&self, request: ModelRequest) -> Result<ModelStream, VoiceError> {
        lock(&self.shared.requests).push(request);
        if self.fail {
            return Err(VoiceError::Model("scripted failure".into()));
        }
        let reply = lock(&self.shared.replies)
            .pop_front()
            .unwrap_or_else(|| "Okay.".to_string());

        // Split after each space so the concatenation is the exact reply.
        let mut words: VecDeque<String> = reply
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        if words.is_empty() {
            words.push_back(String::new());
        }

        let state = (words, Some(InFlight::enter(&self.shared)), self.word_delay);
        Ok(Box::pin(futures_util::stream::unfold(state, next_word)))
    }
}

type WordState = (VecDeque<String>, Option<InFlight>, Duration);

async fn next_word(state: WordState) -> Option<(Result<ModelEvent, VoiceError>, WordState)> {
    let (mut words, in_flight, delay) = state;
    in_flight.as_ref()?;
    tokio::time::sleep(delay).await;
    match words.pop_front() {
        Some(word) => Some((Ok(ModelEvent::Content(word)), (words, in_flight, delay))),
        None => Some((Ok(ModelEvent::Done), (words, None, delay))),
    }
}

// ── sink ─────────────────────────────────────────────────────────────

/// Everything a pipeline reported, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Audio(Vec<u8>),
    Interrupt(u64),
    TranscriptFinal(String),
    AssistantMessage(String),
    SpeechDone(u64),
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, predicate: impl Fn(&SinkEvent) -> bool) -> usize {
        lock(&self.events).iter().filter(|&e| predicate(e)).count()
    }

    pub fn audio_chunks(&self) -> usize {
        self.count(|e| matches!(e, SinkEvent::Audio(_)))
    }

    pub fn interrupts(&self) -> usize {
        self.count(|e| matches!(e, SinkEvent::Interrupt(_)))
    }

    /// Waits until `predicate` matches some recorded event.
    pub async fn wait_for(&self, predicate: impl Fn(&SinkEvent) -> bool) -> bool {
        eventually(Duration::from_secs(2), || self.count(&predicate) > 0).await
    }

    fn record(&self, event: SinkEvent) {
        lock(&self.events).push(event);
    }
}

impl PipelineSink for RecordingSink {
    fn on_audio(&self, chunk: Vec<u8>) {
        self.record(SinkEvent::Audio(chunk));
    }

    fn on_interrupt(&self, epoch: u64) {
        self.record(SinkEvent::Interrupt(epoch));
    }

    fn on_transcript_final(&self, text: &str, _epoch: u64) {
        self.record(SinkEvent::TranscriptFinal(text.to_string()));
    }

    fn on_assistant_message(&self, text: &str, _epoch: u64) {
        self.record(SinkEvent::AssistantMessage(text.to_string()));
    }

    fn on_speech_done(&self, epoch: u64) {
        self.record(SinkEvent::SpeechDone(epoch));
    }
}

/// Bundles scripted services as [`VoiceServices`].
pub fn scripted_services(
    stt: &ScriptedStt,
    tts: &ScriptedTts,
    model: &ScriptedModel,
) -> VoiceServices {
    VoiceServices {
        stt: Arc::new(stt.clone()),
        tts: Arc::new(tts.clone()),
        model: Arc::new(model.clone()),
    }
}
