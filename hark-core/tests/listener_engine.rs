//! Headless engine: samples pushed into the ring become turns.
//!
//! Run with: `cargo test -p hark-core --test listener_engine`

use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use hark_core::buffering::Producer;
use hark_core::stages::{EchoGenerator, SimulatedPlayer, StubTranscriber, ToneSynthesizer};
use hark_core::{
    ActivityKind, ClassifierHandle, EnergyClassifier, EngineConfig, EngineStatus, HarkEngine,
    SpeechActivityEvent, StageSet,
};

fn engine() -> HarkEngine {
    let stages = StageSet::new(
        Arc::new(StubTranscriber::new(Duration::from_millis(5))),
        Arc::new(EchoGenerator::new(Duration::from_millis(5))),
        Arc::new(ToneSynthesizer::new(Duration::from_millis(5))),
        Arc::new(SimulatedPlayer::new(50.0)),
    );
    HarkEngine::new(
        EngineConfig::default(),
        stages,
        ClassifierHandle::new(EnergyClassifier::default()),
    )
    .expect("engine")
}

fn tone(sample_rate: u32, secs: f32) -> Vec<f32> {
    let n = (sample_rate as f32 * secs) as usize;
    let step = TAU * 220.0 / sample_rate as f32;
    (0..n).map(|i| 0.3 * (step * i as f32).sin()).collect()
}

fn silence(sample_rate: u32, secs: f32) -> Vec<f32> {
    vec![0.0; (sample_rate as f32 * secs) as usize]
}

async fn next_activity(rx: &mut broadcast::Receiver<SpeechActivityEvent>) -> SpeechActivityEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("activity event in time")
        .expect("activity channel open")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn utterance_followed_by_silence_becomes_a_completed_turn() {
    let engine = engine();
    let mut activity = engine.subscribe_activity();
    let mut producer = engine.start_headless(48_000).expect("start headless");

    producer.push_slice(&silence(48_000, 0.2));
    producer.push_slice(&tone(48_000, 0.6));
    producer.push_slice(&silence(48_000, 0.6));

    let started = next_activity(&mut activity).await;
    assert_eq!(started.kind, ActivityKind::Started);
    let ended = next_activity(&mut activity).await;
    assert_eq!(ended.kind, ActivityKind::Ended);
    assert_eq!(ended.submitted_version, Some(1));
    // 0.6 s of tone plus the 12-frame silence tail, give or take resampler delay.
    assert!(
        (900..=1_050).contains(&ended.duration_ms),
        "duration_ms={}",
        ended.duration_ms
    );

    let status = tokio::time::timeout(Duration::from_secs(5), engine.handle().settled())
        .await
        .expect("settled in time");
    assert_eq!(status.last_done_version, 1);
    let turn = status.turn.expect("turn record");
    let transcript = turn.transcript.expect("audio turns are transcribed");
    assert!(transcript.starts_with("[stub: "), "{transcript}");
    assert!(transcript.ends_with("@ 16000 Hz]"), "{transcript}");
    assert_eq!(status.last_reply, Some(format!("Reply: {transcript}")));

    let diag = engine.listener_diagnostics();
    assert_eq!(diag.utterances_submitted, 1);
    assert!(diag.speech_frames >= 8);

    engine.stop().await.expect("stop");
    assert_eq!(engine.engine_status(), EngineStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_mid_utterance_submits_what_was_heard() {
    let engine = engine();
    let mut activity = engine.subscribe_activity();
    let mut producer = engine.start_headless(16_000).expect("start headless");

    // Speech that never goes quiet.
    producer.push_slice(&tone(16_000, 0.5));
    let started = next_activity(&mut activity).await;
    assert_eq!(started.kind, ActivityKind::Started);

    engine.stop().await.expect("stop");

    let ended = next_activity(&mut activity).await;
    assert_eq!(ended.kind, ActivityKind::Ended);
    assert_eq!(ended.samples, 16 * 480);
    assert_eq!(ended.submitted_version, Some(1));
    assert_eq!(engine.status().input_version, 1);
    assert!(!engine.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silence_never_submits() {
    let engine = engine();
    let mut producer = engine.start_headless(16_000).expect("start headless");

    producer.push_slice(&silence(16_000, 1.0));
    engine.stop().await.expect("stop");

    let diag = engine.listener_diagnostics();
    assert_eq!(diag.samples_in, 16_000);
    assert_eq!(diag.frames_classified, 33);
    assert_eq!(diag.speech_frames, 0);
    assert_eq!(engine.status().input_version, 0);
}
