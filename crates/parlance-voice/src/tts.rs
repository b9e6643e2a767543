//! Streaming text-to-speech client.
//!
//! One synthesis link is opened per spoken reply. The full reply text is sent
//! at once, followed by a flush; the link is closed as soon as the service
//! reports the flush complete.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::epoch::TurnGuard;
use crate::service::{TtsCommand, TtsEvent, TtsLink, TtsSettings, TtsTransport};

/// How a `speak` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    /// The service flushed all audio for the text.
    Completed,
    /// The turn's epoch moved on before synthesis finished.
    Cancelled,
    /// The link failed to open, errored, or closed early.
    Failed,
}

pub struct TtsClient {
    transport: Arc<dyn TtsTransport>,
    settings: TtsSettings,
    characters_requested: AtomicU64,
}

impl TtsClient {
    pub fn new(transport: Arc<dyn TtsTransport>, settings: TtsSettings) -> Self {
        Self {
            transport,
            settings,
            characters_requested: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &TtsSettings {
        &self.settings
    }

    /// Synthesizes `text`, handing each audio chunk to `on_audio` in arrival
    /// order while `guard` is current.
    ///
    /// The text's character count is billed immediately, whether or not the
    /// turn survives to completion.
    pub async fn speak<F>(&self, text: &str, guard: &TurnGuard, mut on_audio: F) -> SpeakOutcome
    where
        F: FnMut(Vec<u8>),
    {
        self.characters_requested
            .fetch_add(text.chars().count() as u64, Ordering::Relaxed);

        let opened = tokio::select! {
            biased;
            _ = guard.cancelled() => return SpeakOutcome::Cancelled,
            opened = self.transport.open(&self.settings) => opened,
        };
        let TtsLink {
            commands,
            mut events,
        } = match opened {
            Ok(link) => link,
            Err(e) => {
                warn!(error = %e, epoch = guard.epoch(), "TTS link failed to open");
                return SpeakOutcome::Failed;
            }
        };

        // An interruption may have landed while the open was in flight.
        if !guard.is_current() {
            let _ = commands.send(TtsCommand::Close);
            return SpeakOutcome::Cancelled;
        }

        if commands.send(TtsCommand::Speak(text.to_string())).is_err()
            || commands.send(TtsCommand::Flush).is_err()
        {
            warn!(epoch = guard.epoch(), "TTS link closed before text was sent");
            return SpeakOutcome::Failed;
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = guard.cancelled() => {
                    let _ = commands.send(TtsCommand::Close);
                    debug!(epoch = guard.epoch(), "synthesis abandoned");
                    return SpeakOutcome::Cancelled;
                }
                event = events.recv() => event,
            };

            match event {
                Some(TtsEvent::Audio(chunk)) => {
                    if !chunk.is_empty() && guard.is_current() {
                        on_audio(chunk);
                    }
                }
                Some(TtsEvent::Flushed) => {
                    let _ = commands.send(TtsCommand::Close);
                    return SpeakOutcome::Completed;
                }
                Some(TtsEvent::Error(message)) => {
                    warn!(error = %message, epoch = guard.epoch(), "TTS service error");
                    let _ = commands.send(TtsCommand::Close);
                    return SpeakOutcome::Failed;
                }
                Some(TtsEvent::Closed) | None => {
                    warn!(epoch = guard.epoch(), "TTS link closed before flush");
                    return SpeakOutcome::Failed;
                }
            }
        }
    }

    /// Characters submitted for synthesis so far.
    pub fn characters_requested(&self) -> u64 {
        self.characters_requested.load(Ordering::Relaxed)
    }
}
