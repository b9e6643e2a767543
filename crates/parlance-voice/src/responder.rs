//! Turn responder: one language-model call per user utterance.

use std::sync::Arc;

use futures_util::StreamExt;
use parlance_types::ConversationTurn;
use tracing::{debug, warn};

use crate::epoch::TurnGuard;
use crate::service::{LanguageModel, ModelEvent, ModelRequest};

/// Produces the assistant reply for a single turn.
///
/// Stateless between calls: history is passed in and never mutated here.
pub struct TurnResponder {
    model: Arc<dyn LanguageModel>,
    system_prompt: String,
    tools: Vec<serde_json::Value>,
}

impl TurnResponder {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        system_prompt: impl Into<String>,
        tools: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            model,
            system_prompt: system_prompt.into(),
            tools,
        }
    }

    /// Streams a reply to `user_text` given the prior `history`.
    ///
    /// Returns an empty string when the turn should be discarded: the guard
    /// went stale, the model failed, or it produced only whitespace.
    pub async fn respond(
        &self,
        history: &[ConversationTurn],
        user_text: &str,
        guard: &TurnGuard,
    ) -> String {
        if !guard.is_current() {
            return String::new();
        }

        let mut turns = Vec::with_capacity(history.len() + 1);
        turns.extend_from_slice(history);
        turns.push(ConversationTurn::user(user_text));
        let request = ModelRequest {
            system_prompt: self.system_prompt.clone(),
            history: turns,
            tools: self.tools.clone(),
        };

        let opened = tokio::select! {
            biased;
            _ = guard.cancelled() => return String::new(),
            opened = self.model.stream(request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, epoch = guard.epoch(), "model request failed");
                return String::new();
            }
        };

        let mut reply = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = guard.cancelled() => {
                    debug!(epoch = guard.epoch(), "model stream abandoned");
                    return String::new();
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(ModelEvent::Content(delta))) => reply.push_str(&delta),
                Some(Ok(ModelEvent::Done)) | None => break,
                Some(Err(e)) => {
                    warn!(error = %e, epoch = guard.epoch(), "model stream failed");
                    return String::new();
                }
            }
        }

        if !guard.is_current() {
            return String::new();
        }
        if reply.trim().is_empty() {
            return String::new();
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::EpochClock;
    use crate::error::VoiceError;
    use crate::service::ModelStream;
    use async_trait::async_trait;
    use parlance_types::Role;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Yields fixed deltas, one per `step`, and records each request.
    struct StepModel {
        deltas: Vec<&'static str>,
        step: Duration,
        fail: bool,
        requests: Mutex<Vec<ModelRequest>>,
    }

    impl StepModel {
        fn new(deltas: Vec<&'static str>) -> Self {
            Self {
                deltas,
                step: Duration::ZERO,
                fail: false,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for StepModel {
        async fn stream(&self, request: ModelRequest) -> Result<ModelStream, VoiceError> {
            self.requests.lock().expect("requests lock").push(request);
            if self.fail {
                return Err(VoiceError::Model("503 service unavailable".into()));
            }
            let step = self.step;
            let items: Vec<Result<ModelEvent, VoiceError>> = self
                .deltas
                .iter()
                .map(|d| Ok(ModelEvent::Content(d.to_string())))
                .chain(std::iter::once(Ok(ModelEvent::Done)))
                .collect();
            Ok(Box::pin(futures_util::stream::iter(items).then(
                move |item| async move {
                    tokio::time::sleep(step).await;
                    item
                },
            )))
        }
    }

    #[tokio::test]
    async fn accumulates_deltas_and_sends_history_plus_utterance() {
        let model = Arc::new(StepModel::new(vec!["It's ", "sunny", "."]));
        let responder = TurnResponder::new(model.clone(), "Be brief.", Vec::new());
        let clock = EpochClock::new();

        let history = vec![
            ConversationTurn::user("Hello"),
            ConversationTurn::assistant("Hi!"),
        ];
        let reply = responder
            .respond(&history, "What's the weather", &clock.guard())
            .await;
        assert_eq!(reply, "It's sunny.");

        let requests = model.requests.lock().expect("requests lock");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].system_prompt, "Be brief.");
        assert_eq!(requests[0].history.len(), 3);
        assert_eq!(requests[0].history[2].role, Role::User);
        assert_eq!(requests[0].history[2].content, "What's the weather");
    }

    #[tokio::test]
    async fn failure_yields_empty_reply() {
        let mut model = StepModel::new(vec!["unused"]);
        model.fail = true;
        let responder = TurnResponder::new(Arc::new(model), "", Vec::new());
        let clock = EpochClock::new();
        assert_eq!(responder.respond(&[], "Hi", &clock.guard()).await, "");
    }

    #[tokio::test]
    async fn stale_guard_skips_the_model() {
        let model = Arc::new(StepModel::new(vec!["never"]));
        let responder = TurnResponder::new(model.clone(), "", Vec::new());
        let clock = EpochClock::new();
        let guard = clock.guard();
        clock.advance();

        assert_eq!(responder.respond(&[], "Hi", &guard).await, "");
        assert!(model.requests.lock().expect("requests lock").is_empty());
    }

    #[tokio::test]
    async fn interruption_mid_stream_discards_partial_reply() {
        let mut model = StepModel::new(vec!["one ", "two ", "three ", "four"]);
        model.step = Duration::from_millis(30);
        let responder = TurnResponder::new(Arc::new(model), "", Vec::new());
        let clock = Arc::new(EpochClock::new());
        let guard = clock.guard();

        let interrupter = Arc::clone(&clock);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(45)).await;
            interrupter.advance();
        });

        assert_eq!(responder.respond(&[], "Count", &guard).await, "");
    }

    #[tokio::test]
    async fn reply_is_returned_exactly_as_streamed() {
        let model = StepModel::new(vec![" It's ", "sunny.\n"]);
        let responder = TurnResponder::new(Arc::new(model), "", Vec::new());
        let clock = EpochClock::new();
        assert_eq!(
            responder.respond(&[], "Weather?", &clock.guard()).await,
            " It's sunny.\n"
        );
    }

    #[tokio::test]
    async fn whitespace_only_reply_is_empty() {
        let model = StepModel::new(vec!["  ", "\n"]);
        let responder = TurnResponder::new(Arc::new(model), "", Vec::new());
        let clock = EpochClock::new();
        assert_eq!(responder.respond(&[], "Hm", &clock.guard()).await, "");
    }
}
