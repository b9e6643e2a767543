//! Streaming speech-to-text client.
//!
//! Owns one recognition link for the lifetime of a pipeline. Audio handed in
//! before the link is open is buffered and flushed in submission order under
//! the same lock that publishes the open sender, so no chunk can overtake an
//! earlier one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::service::{SttEvent, SttFrame, SttSettings, SttTransport};

/// Upper bound on audio buffered while the link is opening (about 30 s of
/// 16 kHz linear16).
pub const DEFAULT_MAX_PENDING_BYTES: usize = 1024 * 1024;

/// Observable link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SttState {
    /// `start` not yet called; audio is buffered.
    Idle,
    /// Waiting for the open acknowledgement; audio is buffered.
    Connecting,
    Open,
    /// The link failed or dropped. Audio is counted and discarded.
    Failed,
    /// `stop` was called.
    Closed,
}

enum Link {
    Pending {
        started: bool,
        queue: VecDeque<Vec<u8>>,
        queued_bytes: usize,
    },
    Open(mpsc::UnboundedSender<SttFrame>),
    Failed,
    Closed,
}

impl Link {
    fn state(&self) -> SttState {
        match self {
            Self::Pending { started: false, .. } => SttState::Idle,
            Self::Pending { started: true, .. } => SttState::Connecting,
            Self::Open(_) => SttState::Open,
            Self::Failed => SttState::Failed,
            Self::Closed => SttState::Closed,
        }
    }
}

pub struct SttClient {
    transport: Arc<dyn SttTransport>,
    settings: SttSettings,
    link: Arc<Mutex<Link>>,
    bytes_received: AtomicU64,
    max_pending_bytes: usize,
}

impl SttClient {
    pub fn new(transport: Arc<dyn SttTransport>, settings: SttSettings) -> Self {
        Self {
            transport,
            settings,
            link: Arc::new(Mutex::new(Link::Pending {
                started: false,
                queue: VecDeque::new(),
                queued_bytes: 0,
            })),
            bytes_received: AtomicU64::new(0),
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
        }
    }

    /// Overrides the pre-open buffer bound.
    pub fn with_max_pending_bytes(mut self, max: usize) -> Self {
        self.max_pending_bytes = max.max(1);
        self
    }

    pub fn settings(&self) -> &SttSettings {
        &self.settings
    }

    /// Opens the link in the background and routes every event to `on_event`.
    ///
    /// Only the first call has any effect. Open failures are logged, reported
    /// to `on_event` as [`SttEvent::Error`], and leave the client `Failed`.
    pub fn start<F>(&self, on_event: F)
    where
        F: Fn(SttEvent) + Send + Sync + 'static,
    {
        {
            let mut link = lock(&self.link);
            match &mut *link {
                Link::Pending { started, .. } if !*started => *started = true,
                _ => return,
            }
        }

        let transport = Arc::clone(&self.transport);
        let settings = self.settings.clone();
        let link = Arc::clone(&self.link);

        tokio::spawn(async move {
            let opened = match transport.open(&settings).await {
                Ok(opened) => opened,
                Err(e) => {
                    warn!(error = %e, model = %settings.model, "STT link failed to open");
                    {
                        let mut link = lock(&link);
                        if !matches!(*link, Link::Closed) {
                            *link = Link::Failed;
                        }
                    }
                    on_event(SttEvent::Error(e.to_string()));
                    return;
                }
            };

            let mut events = opened.events;
            {
                let frames = opened.frames;
                let mut link = lock(&link);
                match std::mem::replace(&mut *link, Link::Open(frames.clone())) {
                    Link::Pending {
                        queue,
                        queued_bytes,
                        ..
                    } => {
                        if !queue.is_empty() {
                            debug!(
                                chunks = queue.len(),
                                bytes = queued_bytes,
                                "flushing buffered audio"
                            );
                        }
                        for chunk in queue {
                            let _ = frames.send(SttFrame::Audio(chunk));
                        }
                    }
                    Link::Closed | Link::Failed | Link::Open(_) => {
                        // Stopped while connecting.
                        *link = Link::Closed;
                        let _ = frames.send(SttFrame::Finish);
                        return;
                    }
                }
            }
            info!(model = %settings.model, "STT link open");

            while let Some(event) = events.recv().await {
                let closed = matches!(event, SttEvent::Closed);
                on_event(event);
                if closed {
                    break;
                }
            }

            let mut link = lock(&link);
            if matches!(*link, Link::Open(_)) {
                warn!("STT link dropped; further audio will be discarded");
                *link = Link::Failed;
            }
        });
    }

    /// Forwards one audio chunk, buffering it while the link is opening.
    ///
    /// The chunk is counted for usage in every state.
    pub fn handle_audio(&self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.bytes_received
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);

        let mut link = lock(&self.link);
        let writer_gone = match &mut *link {
            Link::Pending {
                queue,
                queued_bytes,
                ..
            } => {
                *queued_bytes += chunk.len();
                queue.push_back(chunk);
                while *queued_bytes > self.max_pending_bytes {
                    match queue.pop_front() {
                        Some(dropped) => {
                            *queued_bytes -= dropped.len();
                            warn!(
                                bytes = dropped.len(),
                                "pre-open audio buffer full; dropping oldest chunk"
                            );
                        }
                        None => break,
                    }
                }
                false
            }
            Link::Open(frames) => frames.send(SttFrame::Audio(chunk)).is_err(),
            Link::Failed | Link::Closed => false,
        };
        if writer_gone {
            warn!("STT link writer gone; further audio will be discarded");
            *link = Link::Failed;
        }
    }

    /// Finishes the link. Idempotent, and safe before `start`.
    pub fn stop(&self) {
        let mut link = lock(&self.link);
        if let Link::Open(frames) = std::mem::replace(&mut *link, Link::Closed) {
            let _ = frames.send(SttFrame::Finish);
            debug!("STT link finished");
        }
    }

    /// Total inbound audio bytes seen, in any state.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> SttState {
        lock(&self.link).state()
    }
}

fn lock(link: &Mutex<Link>) -> MutexGuard<'_, Link> {
    link.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VoiceError;
    use crate::service::SttLink;
    use async_trait::async_trait;
    use parlance_types::AudioFormat;
    use std::time::Duration;
    use tokio::sync::oneshot;

    /// Opens only after the test releases the gate, then hands the service
    /// side of the link back to the test.
    struct GatedStt {
        gate: Mutex<Option<oneshot::Receiver<()>>>,
        service_side: Mutex<Option<oneshot::Sender<ServiceSide>>>,
    }

    struct ServiceSide {
        frames: mpsc::UnboundedReceiver<SttFrame>,
        events: mpsc::UnboundedSender<SttEvent>,
    }

    #[async_trait]
    impl SttTransport for GatedStt {
        async fn open(&self, _settings: &SttSettings) -> Result<SttLink, VoiceError> {
            let gate = self.gate.lock().expect("gate lock").take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            let (frame_tx, frame_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            if let Some(tx) = self.service_side.lock().expect("side lock").take() {
                let _ = tx.send(ServiceSide {
                    frames: frame_rx,
                    events: event_tx,
                });
            }
            Ok(SttLink {
                frames: frame_tx,
                events: event_rx,
            })
        }
    }

    struct FailingStt;

    #[async_trait]
    impl SttTransport for FailingStt {
        async fn open(&self, _settings: &SttSettings) -> Result<SttLink, VoiceError> {
            Err(VoiceError::Connection("refused".into()))
        }
    }

    fn settings() -> SttSettings {
        SttSettings {
            model: "nova-2".into(),
            locale: "en-US".into(),
            format: AudioFormat::telephony(),
            utterance_end_ms: 1000,
            endpointing_ms: 300,
        }
    }

    fn gated() -> (
        Arc<GatedStt>,
        oneshot::Sender<()>,
        oneshot::Receiver<ServiceSide>,
    ) {
        let (gate_tx, gate_rx) = oneshot::channel();
        let (side_tx, side_rx) = oneshot::channel();
        let transport = Arc::new(GatedStt {
            gate: Mutex::new(Some(gate_rx)),
            service_side: Mutex::new(Some(side_tx)),
        });
        (transport, gate_tx, side_rx)
    }

    async fn next_frame(side: &mut ServiceSide) -> SttFrame {
        tokio::time::timeout(Duration::from_secs(1), side.frames.recv())
            .await
            .expect("frame should arrive")
            .expect("link open")
    }

    #[tokio::test]
    async fn buffered_audio_is_flushed_in_order_after_open() {
        let (transport, gate, side) = gated();
        let client = SttClient::new(transport, settings());

        client.handle_audio(vec![1]);
        assert_eq!(client.state(), SttState::Idle);
        client.start(|_| {});
        client.handle_audio(vec![2, 2]);
        client.handle_audio(vec![3, 3, 3]);
        assert_eq!(client.state(), SttState::Connecting);

        gate.send(()).expect("release gate");
        let mut side = side.await.expect("service side");
        assert_eq!(next_frame(&mut side).await, SttFrame::Audio(vec![1]));
        assert_eq!(next_frame(&mut side).await, SttFrame::Audio(vec![2, 2]));
        assert_eq!(next_frame(&mut side).await, SttFrame::Audio(vec![3, 3, 3]));

        // Audio after open goes straight through.
        tokio::time::timeout(Duration::from_secs(1), async {
            while client.state() != SttState::Open {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("client should open");
        client.handle_audio(vec![4]);
        assert_eq!(next_frame(&mut side).await, SttFrame::Audio(vec![4]));
        assert_eq!(client.bytes_received(), 7);
    }

    #[tokio::test]
    async fn events_reach_the_handler() {
        let (transport, gate, side) = gated();
        let client = SttClient::new(transport, settings());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        client.start(move |event| {
            let _ = seen_tx.send(event);
        });
        gate.send(()).expect("release gate");
        let side = side.await.expect("service side");

        side.events
            .send(SttEvent::Transcript {
                text: "hello".into(),
                is_final: true,
            })
            .expect("send");
        side.events.send(SttEvent::UtteranceEnd).expect("send");

        let first = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .expect("event")
            .expect("open");
        assert_eq!(
            first,
            SttEvent::Transcript {
                text: "hello".into(),
                is_final: true
            }
        );
        let second = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .expect("event")
            .expect("open");
        assert_eq!(second, SttEvent::UtteranceEnd);
    }

    #[tokio::test]
    async fn open_failure_counts_but_drops_audio() {
        let client = SttClient::new(Arc::new(FailingStt), settings());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        client.start(move |event| {
            let _ = seen_tx.send(event);
        });

        let event = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .expect("error event")
            .expect("open");
        assert!(matches!(event, SttEvent::Error(_)));
        assert_eq!(client.state(), SttState::Failed);

        client.handle_audio(vec![0; 160]);
        client.handle_audio(vec![0; 160]);
        assert_eq!(client.bytes_received(), 320);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_sends_finish_once() {
        let (transport, gate, side) = gated();
        let client = SttClient::new(transport, settings());
        client.start(|_| {});
        gate.send(()).expect("release gate");
        let mut side = side.await.expect("service side");

        tokio::time::timeout(Duration::from_secs(1), async {
            while client.state() != SttState::Open {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("client should open");

        client.stop();
        client.stop();
        assert_eq!(client.state(), SttState::Closed);
        assert_eq!(next_frame(&mut side).await, SttFrame::Finish);

        client.handle_audio(vec![9]);
        drop(client);
        assert!(side.frames.recv().await.is_none(), "nothing after finish");
    }

    #[tokio::test]
    async fn stop_before_start_is_harmless() {
        let (transport, _gate, _side) = gated();
        let client = SttClient::new(transport, settings());
        client.stop();
        client.stop();
        assert_eq!(client.state(), SttState::Closed);
        client.start(|_| {});
        assert_eq!(client.state(), SttState::Closed);
    }

    #[tokio::test]
    async fn pending_buffer_drops_oldest_when_full() {
        let (transport, gate, side) = gated();
        let client = SttClient::new(transport, settings()).with_max_pending_bytes(4);
        client.start(|_| {});
        client.handle_audio(vec![1, 1]);
        client.handle_audio(vec![2, 2]);
        client.handle_audio(vec![3, 3]);
        assert_eq!(client.bytes_received(), 6);

        gate.send(()).expect("release gate");
        let mut side = side.await.expect("service side");
        assert_eq!(next_frame(&mut side).await, SttFrame::Audio(vec![2, 2]));
        assert_eq!(next_frame(&mut side).await, SttFrame::Audio(vec![3, 3]));
    }
}
