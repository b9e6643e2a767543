use std::sync::Arc;
use std::time::Duration;

use parlance_types::{ConversationTurn, VoiceConfig};
use parlance_voice::testing::{
    eventually, scripted_services, RecordingSink, ScriptedModel, ScriptedStt, ScriptedTts,
    SinkEvent,
};
use parlance_voice::{PipelineOptions, PipelinePhase, VoiceError, VoicePipeline};

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    stt: ScriptedStt,
    tts: ScriptedTts,
    model: ScriptedModel,
    sink: Arc<RecordingSink>,
    pipeline: VoicePipeline,
}

fn harness(barge_in: bool, stt: ScriptedStt, tts: ScriptedTts, model: ScriptedModel) -> Harness {
    harness_with(barge_in, stt, tts, model, PipelineOptions::default())
}

fn harness_with(
    barge_in: bool,
    stt: ScriptedStt,
    tts: ScriptedTts,
    model: ScriptedModel,
    options: PipelineOptions,
) -> Harness {
    let sink = RecordingSink::new();
    let config = VoiceConfig {
        barge_in,
        ..VoiceConfig::fallback()
    };
    let pipeline = VoicePipeline::new(
        config,
        scripted_services(&stt, &tts, &model),
        options,
        sink.clone(),
    );
    Harness {
        stt,
        tts,
        model,
        sink,
        pipeline,
    }
}

async fn started(h: &Harness) {
    h.pipeline.start().expect("pipeline should start");
    assert!(h.stt.wait_open().await, "STT link should open");
}

fn speech_done(e: &SinkEvent) -> bool {
    matches!(e, SinkEvent::SpeechDone(_))
}

fn is_audio(e: &SinkEvent) -> bool {
    matches!(e, SinkEvent::Audio(_))
}

async fn phase_becomes(pipeline: &VoicePipeline, phase: PipelinePhase) -> bool {
    eventually(WAIT, || pipeline.phase() == phase).await
}

#[tokio::test]
async fn weather_question_is_answered_and_spoken() {
    let h = harness(
        true,
        ScriptedStt::new(),
        ScriptedTts::new(),
        ScriptedModel::replying(["It's sunny."]),
    );
    assert_eq!(h.pipeline.phase(), PipelinePhase::Idle);
    started(&h).await;
    assert_eq!(h.pipeline.phase(), PipelinePhase::Listening);

    assert!(h.stt.final_transcript("What's the weather"));
    assert!(h.sink.wait_for(speech_done).await);

    let audio: Vec<Vec<u8>> = h
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SinkEvent::Audio(chunk) => Some(chunk),
            _ => None,
        })
        .collect();
    assert!(!audio.is_empty());
    assert!(audio.iter().all(|chunk| !chunk.is_empty()));

    assert_eq!(
        h.pipeline.history(),
        vec![
            ConversationTurn::user("What's the weather"),
            ConversationTurn::assistant("It's sunny."),
        ]
    );
    assert_eq!(h.pipeline.usage().tts_characters, 11);
    assert_eq!(h.tts.spoken(), vec!["It's sunny.".to_string()]);
    assert!(phase_becomes(&h.pipeline, PipelinePhase::Listening).await);

    let events = h.sink.events();
    assert_eq!(
        events.first(),
        Some(&SinkEvent::TranscriptFinal("What's the weather".into()))
    );
    assert_eq!(
        events.get(1),
        Some(&SinkEvent::AssistantMessage("It's sunny.".into()))
    );
}

async fn answers_back_to_back_utterances_in_order(barge_in: bool) {
    let h = harness(
        barge_in,
        ScriptedStt::new(),
        ScriptedTts::new(),
        ScriptedModel::replying(["Hi there.", "I'm well, thanks."])
            .with_word_delay(Duration::from_millis(40)),
    );
    started(&h).await;

    h.stt.final_transcript("Hello");
    assert!(phase_becomes(&h.pipeline, PipelinePhase::Responding).await);
    h.stt.final_transcript("How are you");

    assert!(eventually(WAIT, || h.sink.count(speech_done) == 2).await);

    let requests = h.model.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[1].history,
        vec![
            ConversationTurn::user("Hello"),
            ConversationTurn::assistant("Hi there."),
            ConversationTurn::user("How are you"),
        ]
    );
    assert_eq!(h.model.max_in_flight(), 1, "turns must never overlap");
    assert_eq!(
        h.pipeline.history(),
        vec![
            ConversationTurn::user("Hello"),
            ConversationTurn::assistant("Hi there."),
            ConversationTurn::user("How are you"),
            ConversationTurn::assistant("I'm well, thanks."),
        ]
    );
    assert_eq!(h.tts.spoken(), vec!["Hi there.", "I'm well, thanks."]);
    assert_eq!(h.sink.interrupts(), 0);
}

#[tokio::test]
async fn back_to_back_utterances_are_answered_in_order() {
    answers_back_to_back_utterances_in_order(false).await;
}

#[tokio::test]
async fn utterance_during_response_waits_when_barge_in_enabled() {
    answers_back_to_back_utterances_in_order(true).await;
}

#[tokio::test]
async fn barge_in_interrupts_once_and_drops_stale_audio() {
    let h = harness(
        true,
        ScriptedStt::new(),
        ScriptedTts::new().with_chunks(20, Duration::from_millis(20)),
        ScriptedModel::replying(["Once upon a time there was a very long story."]),
    );
    started(&h).await;

    h.stt.final_transcript("Tell me a story");
    assert!(h.sink.wait_for(is_audio).await);
    assert_eq!(h.pipeline.phase(), PipelinePhase::Speaking);
    let epoch_before = h.pipeline.epoch();

    h.stt.interim("wait");
    assert!(eventually(WAIT, || h.sink.interrupts() == 1).await);
    assert!(h.pipeline.epoch() > epoch_before);
    assert!(h.pipeline.queued_utterances().is_empty());

    // Give the old synthesis time to keep producing; none of it may surface.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let events = h.sink.events();
    let interrupt_at = events
        .iter()
        .position(|e| matches!(e, SinkEvent::Interrupt(_)))
        .expect("interrupt recorded");
    assert!(
        !events[interrupt_at..].iter().any(is_audio),
        "audio after interrupt: {events:?}"
    );
    assert_eq!(h.sink.count(speech_done), 0);

    // Not speaking any more, so further interims are not barge-ins.
    h.stt.interim("wait a second");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.sink.interrupts(), 1);
    assert!(phase_becomes(&h.pipeline, PipelinePhase::Listening).await);
}

#[tokio::test]
async fn barge_in_disabled_ignores_speech_during_playback() {
    let h = harness(
        false,
        ScriptedStt::new(),
        ScriptedTts::new().with_chunks(10, Duration::from_millis(20)),
        ScriptedModel::replying(["Let me read you the full menu."]),
    );
    started(&h).await;

    h.stt.final_transcript("What's on the menu");
    assert!(h.sink.wait_for(is_audio).await);
    h.stt.interim("hey");
    h.stt.final_transcript("hey stop");
    h.stt.utterance_end();

    assert!(h.sink.wait_for(speech_done).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.sink.interrupts(), 0);
    assert_eq!(
        h.sink.count(|e| matches!(e, SinkEvent::TranscriptFinal(_))),
        1
    );
    assert_eq!(h.model.requests().len(), 1);
    assert!(h.pipeline.queued_utterances().is_empty());
}

#[tokio::test]
async fn usage_bills_full_text_and_audio_only_grows() {
    let reply = "This reply is cut short.";
    let h = harness(
        true,
        ScriptedStt::new(),
        ScriptedTts::new().with_chunks(20, Duration::from_millis(20)),
        ScriptedModel::replying([reply]),
    );
    started(&h).await;

    for _ in 0..3 {
        h.pipeline.handle_audio(vec![0x7f; 160]);
    }
    h.stt.final_transcript("Say something");
    assert!(h.sink.wait_for(is_audio).await);
    h.pipeline.interrupt();

    let usage = h.pipeline.usage();
    assert_eq!(usage.tts_characters, reply.chars().count() as u64);
    assert_eq!(usage.audio_bytes, 480);
    assert!((usage.stt_seconds - 0.06).abs() < 1e-9);

    h.pipeline.handle_audio(vec![0x7f; 160]);
    let later = h.pipeline.usage();
    assert_eq!(later.audio_bytes, 640);
    assert_eq!(later.tts_characters, usage.tts_characters);
}

#[tokio::test]
async fn utterance_end_without_final_uses_last_interim() {
    let h = harness(
        true,
        ScriptedStt::new(),
        ScriptedTts::new(),
        ScriptedModel::replying(["Booked.", "Done."]),
    );
    started(&h).await;

    h.stt.interim("book a");
    h.stt.interim("book a table");
    h.stt.utterance_end();
    assert!(h.sink.wait_for(speech_done).await);

    let requests = h.model.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].history.last(),
        Some(&ConversationTurn::user("book a table"))
    );

    // A final covers its interims; the following utterance end adds nothing.
    h.stt.interim("for two");
    h.stt.final_transcript("for two people");
    h.stt.utterance_end();
    assert!(eventually(WAIT, || h.sink.count(speech_done) == 2).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.model.requests().len(), 2);
}

#[tokio::test]
async fn audio_before_open_reaches_recognizer_in_order() {
    let stt = ScriptedStt::new().gated();
    let h = harness(true, stt, ScriptedTts::new(), ScriptedModel::default());

    h.pipeline.handle_audio(vec![1]);
    h.pipeline.start().expect("start");
    h.pipeline.handle_audio(vec![2, 2]);
    h.pipeline.handle_audio(vec![3, 3, 3]);
    assert!(h.stt.received_audio().is_empty());

    h.stt.release();
    assert!(h.stt.wait_open().await);
    assert!(eventually(WAIT, || h.stt.received_audio().len() == 3).await);

    h.pipeline.handle_audio(vec![4]);
    assert!(eventually(WAIT, || h.stt.received_audio().len() == 4).await);
    assert_eq!(
        h.stt.received_audio(),
        vec![vec![1], vec![2, 2], vec![3, 3, 3], vec![4]]
    );
    assert_eq!(h.pipeline.usage().audio_bytes, 7);
}

#[tokio::test]
async fn stop_is_idempotent_and_silences_in_flight_turn() {
    let h = harness(
        true,
        ScriptedStt::new(),
        ScriptedTts::new(),
        ScriptedModel::replying(["Too late."]).with_word_delay(Duration::from_millis(50)),
    );
    started(&h).await;
    h.pipeline.handle_audio(vec![0; 80]);

    h.stt.final_transcript("Hello");
    assert!(phase_becomes(&h.pipeline, PipelinePhase::Responding).await);

    let first = h.pipeline.stop();
    let second = h.pipeline.stop();
    assert_eq!(first, second);
    assert_eq!(h.pipeline.phase(), PipelinePhase::Stopped);
    assert!(eventually(WAIT, || h.stt.finished()).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        h.sink.count(|e| matches!(e, SinkEvent::AssistantMessage(_))),
        0
    );
    assert_eq!(h.sink.audio_chunks(), 0);
    assert!(h.pipeline.history().is_empty());

    h.pipeline.handle_audio(vec![0; 80]);
    assert_eq!(h.pipeline.usage(), first);
    assert!(matches!(h.pipeline.start(), Err(VoiceError::Closed)));
}

#[tokio::test]
async fn full_queue_drops_oldest_utterance() {
    let options = PipelineOptions {
        max_queued_utterances: 2,
        ..PipelineOptions::default()
    };
    let h = harness_with(
        false,
        ScriptedStt::new(),
        ScriptedTts::new().with_chunks(1, Duration::from_millis(1)),
        ScriptedModel::default().with_word_delay(Duration::from_millis(60)),
        options,
    );
    started(&h).await;

    h.stt.final_transcript("one");
    assert!(phase_becomes(&h.pipeline, PipelinePhase::Responding).await);
    h.stt.final_transcript("two");
    h.stt.final_transcript("three");
    h.stt.final_transcript("four");
    assert!(eventually(WAIT, || h.pipeline.queued_utterances() == ["three", "four"]).await);

    assert!(eventually(WAIT, || h.model.requests().len() == 3).await);
    let asked: Vec<String> = h
        .model
        .requests()
        .iter()
        .filter_map(|r| r.history.last().map(|t| t.content.clone()))
        .collect();
    assert_eq!(asked, vec!["one", "three", "four"]);
}

#[tokio::test]
async fn missing_credentials_refuse_to_start() {
    let h = harness(
        true,
        ScriptedStt::without_credentials(),
        ScriptedTts::new(),
        ScriptedModel::default(),
    );
    let err = h.pipeline.start().expect_err("start must fail");
    assert!(matches!(err, VoiceError::MissingCredentials(_)));
    assert_eq!(h.pipeline.phase(), PipelinePhase::Idle);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.stt.opens(), 0);
}

#[tokio::test]
async fn failed_model_call_leaves_pipeline_listening() {
    let h = harness(
        true,
        ScriptedStt::new(),
        ScriptedTts::new(),
        ScriptedModel::failing(),
    );
    started(&h).await;

    h.stt.final_transcript("Hello");
    assert!(eventually(WAIT, || h.model.requests().len() == 1).await);
    assert!(phase_becomes(&h.pipeline, PipelinePhase::Listening).await);
    assert!(h.pipeline.history().is_empty());
    assert_eq!(h.sink.audio_chunks(), 0);
    assert!(h.tts.spoken().is_empty());
}

#[tokio::test]
async fn failed_synthesis_ends_turn_without_speech_done() {
    let h = harness(
        true,
        ScriptedStt::new(),
        ScriptedTts::new().failing("quota exceeded"),
        ScriptedModel::replying(["Sure."]),
    );
    started(&h).await;

    h.stt.final_transcript("Hello");
    assert!(
        h.sink
            .wait_for(|e| matches!(e, SinkEvent::AssistantMessage(_)))
            .await
    );
    assert!(phase_becomes(&h.pipeline, PipelinePhase::Listening).await);
    assert_eq!(h.sink.count(speech_done), 0);
    assert_eq!(h.pipeline.history().len(), 2);
    assert_eq!(h.pipeline.usage().tts_characters, 5);
}

#[tokio::test]
async fn burst_of_utterances_never_overlaps_turns() {
    let options = PipelineOptions {
        max_queued_utterances: 64,
        ..PipelineOptions::default()
    };
    let h = harness_with(
        true,
        ScriptedStt::new(),
        ScriptedTts::new().with_chunks(2, Duration::from_millis(2)),
        ScriptedModel::default().with_word_delay(Duration::from_millis(3)),
        options,
    );
    started(&h).await;

    for i in 0..20 {
        h.stt.final_transcript(&format!("utterance {i}"));
        if i % 3 == 0 {
            h.stt.interim("uh");
        }
        tokio::time::sleep(Duration::from_millis(4)).await;
    }
    assert!(
        eventually(WAIT, || {
            h.pipeline.phase() == PipelinePhase::Listening
                && h.pipeline.queued_utterances().is_empty()
        })
        .await
    );

    assert_eq!(h.model.max_in_flight(), 1);

    // Utterances are asked about in arrival order, possibly with gaps.
    let asked: Vec<usize> = h
        .model
        .requests()
        .iter()
        .filter_map(|r| r.history.last())
        .filter_map(|t| t.content.strip_prefix("utterance ")?.parse().ok())
        .collect();
    assert!(!asked.is_empty());
    assert!(asked.windows(2).all(|w| w[0] < w[1]), "{asked:?}");

    // Interrupt epochs only ever increase.
    let epochs: Vec<u64> = h
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SinkEvent::Interrupt(epoch) => Some(epoch),
            _ => None,
        })
        .collect();
    assert!(epochs.windows(2).all(|w| w[0] < w[1]));
}
