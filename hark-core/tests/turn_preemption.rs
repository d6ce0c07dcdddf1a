//! End-to-end behaviour of the turn controller with scripted stages.
//!
//! Run with: `cargo test -p hark-core --test turn_preemption`

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use hark_core::stages::{Generator, Player, Synthesizer, Transcriber};
use hark_core::turn::TurnController;
use hark_core::{
    AudioChunk, StageContext, StageError, StageKind, StageSet, StageTimeouts, TurnEvent,
    TurnEventKind, TurnFailure, TurnHandle, TurnState,
};

/// One stage call as seen by the scripted stages.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Transcribe(u64),
    Generate(u64, String),
    Synthesize(u64),
    PlayStart(u64),
    PlayEnd(u64, bool),
}

#[derive(Default)]
struct Journal {
    calls: Mutex<Vec<Call>>,
    playing: AtomicUsize,
    max_playing: AtomicUsize,
}

impl Journal {
    fn push(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn generated_versions(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Generate(v, _) => Some(v),
                _ => None,
            })
            .collect()
    }
}

struct Latencies {
    transcribe: Duration,
    generate: Duration,
    synthesize: Duration,
    play: Duration,
}

impl Default for Latencies {
    fn default() -> Self {
        Self {
            transcribe: Duration::from_millis(50),
            generate: Duration::from_millis(200),
            synthesize: Duration::from_millis(100),
            play: Duration::from_millis(500),
        }
    }
}

struct Scripted {
    journal: Arc<Journal>,
    latency: Latencies,
}

#[async_trait]
impl Transcriber for Scripted {
    async fn transcribe(&self, audio: &AudioChunk, ctx: &StageContext) -> Result<String, StageError> {
        self.journal.push(Call::Transcribe(ctx.version));
        tokio::time::sleep(self.latency.transcribe).await;
        Ok(format!("heard {} samples", audio.len()))
    }
}

#[async_trait]
impl Generator for Scripted {
    async fn generate(&self, prompt: &str, ctx: &StageContext) -> Result<String, StageError> {
        self.journal.push(Call::Generate(ctx.version, prompt.to_owned()));
        tokio::time::sleep(self.latency.generate).await;
        match prompt {
            "What time is it?" => Ok("It is noon.".into()),
            "Never mind, tell me a joke." => {
                Ok("Why did the scarecrow win an award? He was outstanding in his field.".into())
            }
            "fail" => Err(StageError::Generation("model unavailable".into())),
            other => Ok(format!("re: {other}")),
        }
    }
}

#[async_trait]
impl Synthesizer for Scripted {
    async fn synthesize(&self, text: &str, ctx: &StageContext) -> Result<AudioChunk, StageError> {
        self.journal.push(Call::Synthesize(ctx.version));
        tokio::time::sleep(self.latency.synthesize).await;
        Ok(AudioChunk::new(vec![0.1; text.len().max(1) * 16], 16_000))
    }
}

#[async_trait]
impl Player for Scripted {
    async fn play(&self, _audio: &AudioChunk, ctx: &StageContext) -> Result<(), StageError> {
        let now = self.journal.playing.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal.max_playing.fetch_max(now, Ordering::SeqCst);
        self.journal.push(Call::PlayStart(ctx.version));

        let finished = tokio::select! {
            _ = tokio::time::sleep(self.latency.play) => true,
            _ = ctx.cancel.cancelled() => false,
        };

        self.journal.push(Call::PlayEnd(ctx.version, finished));
        self.journal.playing.fetch_sub(1, Ordering::SeqCst);
        if finished {
            Ok(())
        } else {
            Err(StageError::Cancelled(StageKind::Play))
        }
    }

    fn supports_cancel(&self) -> bool {
        true
    }
}

struct Session {
    handle: TurnHandle,
    journal: Arc<Journal>,
    events: broadcast::Receiver<TurnEvent>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Session {
    async fn close(self) {
        self.shutdown.cancel();
        self.task.await.expect("run loop panicked");
    }
}

fn start(latency: Latencies, timeouts: StageTimeouts) -> Session {
    start_with_player(latency, timeouts, None)
}

/// Like [`start`], with `player` standing in for the scripted one.
fn start_with_player(
    latency: Latencies,
    timeouts: StageTimeouts,
    player: Option<Arc<dyn Player>>,
) -> Session {
    let handle = TurnHandle::new(4_096);
    let journal = Arc::new(Journal::default());
    let scripted = Arc::new(Scripted {
        journal: Arc::clone(&journal),
        latency,
    });
    let mut stages = StageSet::new(
        scripted.clone(),
        scripted.clone(),
        scripted.clone(),
        scripted,
    );
    if let Some(player) = player {
        stages = stages.with_player(player);
    }
    let events = handle.subscribe();
    let controller = TurnController::new(&handle, stages, timeouts);
    let shutdown = controller.shutdown_token();
    let task = tokio::spawn(controller.run());
    Session {
        handle,
        journal,
        events,
        shutdown,
        task,
    }
}

fn default_session() -> Session {
    start(Latencies::default(), StageTimeouts::uniform(Duration::from_secs(5)))
}

/// Wait until `version` enters `state` on the event stream.
async fn wait_for_state(
    events: &mut broadcast::Receiver<TurnEvent>,
    version: u64,
    state: TurnState,
) {
    loop {
        let event = events.recv().await.expect("event stream");
        if event.version == version
            && matches!(event.kind, TurnEventKind::State { state: s, .. } if s == state)
        {
            return;
        }
    }
}

fn drain(events: &mut broadcast::Receiver<TurnEvent>) -> Vec<TurnEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn states_of(events: &[TurnEvent], version: u64) -> Vec<TurnState> {
    events
        .iter()
        .filter(|e| e.version == version)
        .filter_map(|e| match e.kind {
            TurnEventKind::State { state, .. } => Some(state),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn never_mind_tell_me_a_joke() {
    let mut s = default_session();

    let v1 = s.handle.submit("What time is it?");
    wait_for_state(&mut s.events, v1, TurnState::Generating).await;
    let v2 = s.handle.submit("Never mind, tell me a joke.");

    let status = s.handle.settled().await;
    assert_eq!((v1, v2), (1, 2));
    assert_eq!(status.input_version, 2);
    assert_eq!(status.last_done_version, 2);
    assert!(!status.running);
    assert_eq!(
        status.last_reply.as_deref(),
        Some("Why did the scarecrow win an award? He was outstanding in his field.")
    );

    let calls = s.journal.calls();
    assert!(!calls.contains(&Call::Synthesize(v1)), "stale turn was synthesized: {calls:?}");
    assert!(!calls.contains(&Call::PlayStart(v1)), "stale turn was played: {calls:?}");
    assert!(calls.contains(&Call::PlayEnd(v2, true)));

    let events = drain(&mut s.events);
    // The stale reply is still reported, flagged as superseded.
    assert!(events.iter().any(|e| e.version == v1
        && matches!(&e.kind, TurnEventKind::Reply { text, superseded: true } if text == "It is noon.")));
    assert!(events
        .iter()
        .all(|e| !(e.version == v1 && e.kind == TurnEventKind::Played)));

    s.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn versions_are_unique_and_gapless_under_concurrent_submitters() {
    let handle = TurnHandle::default();
    let submitters: Vec<_> = (0..8)
        .map(|id| {
            let handle = handle.clone();
            tokio::spawn(async move {
                let mut mine = Vec::new();
                for n in 0..50 {
                    mine.push(handle.submit(format!("submitter {id} line {n}")));
                    if n % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                mine
            })
        })
        .collect();

    let mut all = BTreeSet::new();
    for submitter in submitters {
        let mine = submitter.await.expect("submitter");
        assert!(mine.windows(2).all(|w| w[0] < w[1]), "not increasing: {mine:?}");
        for v in mine {
            assert!(all.insert(v), "version {v} handed out twice");
        }
    }

    assert_eq!(all.len(), 400);
    assert_eq!(all.first(), Some(&1));
    assert_eq!(all.last(), Some(&400));
    assert_eq!(handle.status().input_version, 400);
}

#[tokio::test(start_paused = true)]
async fn at_most_one_turn_is_ever_active() {
    let mut s = default_session();

    for n in 0..30u64 {
        s.handle.submit(format!("line {n}"));
        // Land submissions in every stage of the chain.
        tokio::time::sleep(Duration::from_millis(37 * (n % 7))).await;
    }
    let status = s.handle.settled().await;
    assert_eq!(status.last_done_version, 30);

    let events = drain(&mut s.events);
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));

    let mut active = BTreeSet::new();
    for event in &events {
        if let TurnEventKind::State { state, .. } = event.kind {
            if state == TurnState::Queued {
                active.insert(event.version);
            } else if state.is_terminal() {
                active.remove(&event.version);
            }
        }
        assert!(active.len() <= 1, "two active turns after seq {}: {active:?}", event.seq);
    }
    assert!(active.is_empty());
    assert!(s.journal.max_playing.load(Ordering::SeqCst) <= 1);

    s.close().await;
}

#[tokio::test(start_paused = true)]
async fn a_turn_superseded_while_synthesizing_is_never_played() {
    let mut s = default_session();
    let mut log = s.handle.subscribe();

    let v1 = s.handle.submit("first");
    wait_for_state(&mut s.events, v1, TurnState::Synthesizing).await;
    let v2 = s.handle.submit("second");
    let status = s.handle.settled().await;

    assert_eq!(status.last_reply.as_deref(), Some("re: second"));
    let calls = s.journal.calls();
    // Synthesis is not cancellable: it finishes, then the checkpoint stops the turn.
    assert!(calls.contains(&Call::Synthesize(v1)));
    assert!(!calls.contains(&Call::PlayStart(v1)));
    assert!(calls.contains(&Call::PlayEnd(v2, true)));

    let events = drain(&mut log);
    assert_eq!(
        states_of(&events, v1),
        vec![
            TurnState::Queued,
            TurnState::Generating,
            TurnState::Synthesizing,
            TurnState::Superseded
        ]
    );
    assert_eq!(
        states_of(&events, v2).last(),
        Some(&TurnState::Completed)
    );

    s.close().await;
}

#[tokio::test]
async fn rapid_fire_input_only_runs_the_latest() {
    let s = default_session();

    // No await between submissions: the loop only ever sees the last one.
    let last = (1..=20)
        .map(|n| s.handle.submit(format!("input {n}")))
        .last()
        .expect("twenty submissions");
    let status = tokio::time::timeout(Duration::from_secs(10), s.handle.settled())
        .await
        .expect("settled in time");

    assert_eq!(last, 20);
    assert_eq!(status.last_done_version, 20);
    assert_eq!(status.last_reply.as_deref(), Some("re: input 20"));
    assert_eq!(s.journal.generated_versions(), vec![20]);
    assert_eq!(s.handle.diagnostics().turns_superseded, 19);

    s.close().await;
}

#[tokio::test(start_paused = true)]
async fn playback_is_cancelled_before_the_next_turn_plays() {
    let latency = Latencies {
        play: Duration::from_secs(3),
        ..Latencies::default()
    };
    let mut s = start(latency, StageTimeouts::uniform(Duration::from_secs(10)));

    let v1 = s.handle.submit("tell me a long story");
    wait_for_state(&mut s.events, v1, TurnState::Playing).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let v2 = s.handle.submit("stop");
    s.handle.settled().await;

    let plays: Vec<_> = s
        .journal
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::PlayStart(_) | Call::PlayEnd(..)))
        .collect();
    assert_eq!(
        plays,
        vec![
            Call::PlayStart(v1),
            Call::PlayEnd(v1, false),
            Call::PlayStart(v2),
            Call::PlayEnd(v2, true),
        ]
    );
    assert_eq!(s.journal.max_playing.load(Ordering::SeqCst), 1);

    let events = drain(&mut s.events);
    assert_eq!(states_of(&events, v1).last(), Some(&TurnState::Superseded));

    s.close().await;
}

#[tokio::test(start_paused = true)]
async fn failures_and_timeouts_return_the_loop_to_waiting() {
    let latency = Latencies {
        synthesize: Duration::from_secs(2),
        ..Latencies::default()
    };
    let timeouts = StageTimeouts {
        synthesize: Duration::from_secs(1),
        ..StageTimeouts::uniform(Duration::from_secs(5))
    };
    let s = start(latency, timeouts);

    let failed = s.handle.submit("fail");
    let status = s.handle.settled().await;
    assert_eq!(status.last_done_version, failed);
    assert!(!status.running);
    let turn = status.turn.expect("turn record");
    assert_eq!(turn.state, TurnState::Failed);
    assert!(matches!(
        turn.failure,
        Some(TurnFailure::Stage {
            stage: StageKind::Generate,
            timed_out: false,
            ..
        })
    ));

    let slow = s.handle.submit("anything");
    let status = s.handle.settled().await;
    assert_eq!(status.last_done_version, slow);
    let turn = status.turn.expect("turn record");
    assert!(matches!(
        turn.failure,
        Some(TurnFailure::Stage {
            stage: StageKind::Synthesize,
            timed_out: true,
            ..
        })
    ));
    // Generation succeeded before the timeout, but nothing completed.
    assert_eq!(turn.reply.as_deref(), Some("re: anything"));
    assert_eq!(status.last_reply, None);

    let diagnostics = s.handle.diagnostics();
    assert_eq!(diagnostics.turns_failed, 2);
    assert_eq!(diagnostics.stage_timeouts, 1);
    assert!(s.handle.is_loop_active());

    s.close().await;
}

#[tokio::test(start_paused = true)]
async fn audio_input_is_transcribed_first() {
    let mut s = default_session();

    let v = s.handle.submit(AudioChunk::new(vec![0.2; 4_800], 16_000));
    let status = s.handle.settled().await;
    assert_eq!(status.last_reply.as_deref(), Some("re: heard 4800 samples"));

    let events = drain(&mut s.events);
    assert_eq!(
        states_of(&events, v),
        vec![
            TurnState::Queued,
            TurnState::Transcribing,
            TurnState::Generating,
            TurnState::Synthesizing,
            TurnState::Playing,
            TurnState::Completed,
        ]
    );
    let transcripts: HashMap<u64, String> = events
        .iter()
        .filter_map(|e| match &e.kind {
            TurnEventKind::Transcript { text } => Some((e.version, text.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(transcripts.get(&v).map(String::as_str), Some("heard 4800 samples"));

    s.close().await;
}

#[tokio::test(start_paused = true)]
async fn status_reads_do_not_change_anything() {
    let mut s = default_session();

    s.handle.submit("What time is it?");
    wait_for_state(&mut s.events, 1, TurnState::Generating).await;
    let during = s.handle.status();
    assert_eq!(during, s.handle.status());
    assert!(during.running);

    let settled = s.handle.settled().await;
    let first = s.handle.status();
    let second = s.handle.status();
    assert_eq!(first, second);
    assert_eq!(first, settled);
    assert_eq!(
        serde_json::to_string(&first).expect("serialize"),
        serde_json::to_string(&second).expect("serialize")
    );

    s.close().await;
}

/// Hands each clip to a detached worker the way a device player does. The
/// worker only goes quiet when the stage's cancellation token fires.
#[derive(Default)]
struct DetachedPlayer {
    sounding: Arc<AtomicUsize>,
    max_sounding: Arc<AtomicUsize>,
}

const CLIP: Duration = Duration::from_secs(5);

#[async_trait]
impl Player for DetachedPlayer {
    async fn play(&self, _audio: &AudioChunk, ctx: &StageContext) -> Result<(), StageError> {
        let sounding = Arc::clone(&self.sounding);
        let max_sounding = Arc::clone(&self.max_sounding);
        let cancel = ctx.cancel.clone();
        let worker = tokio::spawn(async move {
            let now = sounding.fetch_add(1, Ordering::SeqCst) + 1;
            max_sounding.fetch_max(now, Ordering::SeqCst);
            let finished = tokio::select! {
                _ = tokio::time::sleep(CLIP) => true,
                _ = cancel.cancelled() => false,
            };
            sounding.fetch_sub(1, Ordering::SeqCst);
            finished
        });
        match worker.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(StageError::Cancelled(StageKind::Play)),
            Err(e) => Err(StageError::Playback(e.to_string())),
        }
    }

    fn supports_cancel(&self) -> bool {
        true
    }
}

#[tokio::test(start_paused = true)]
async fn playback_past_its_deadline_is_silenced_before_the_next_turn() {
    let player = Arc::new(DetachedPlayer::default());
    let timeouts = StageTimeouts {
        play: Duration::from_secs(1),
        ..StageTimeouts::uniform(Duration::from_secs(5))
    };
    let s = start_with_player(
        Latencies::default(),
        timeouts,
        Some(player.clone() as Arc<dyn Player>),
    );

    let v1 = s.handle.submit("tell me a long story");
    let status = s.handle.settled().await;
    assert_eq!(status.last_done_version, v1);
    let turn = status.turn.expect("turn record");
    assert!(matches!(
        turn.failure,
        Some(TurnFailure::Stage {
            stage: StageKind::Play,
            timed_out: true,
            ..
        })
    ));
    assert_eq!(player.sounding.load(Ordering::SeqCst), 0, "v1 still sounding");

    let v2 = s.handle.submit("and another one");
    let status = s.handle.settled().await;
    assert_eq!(status.last_done_version, v2);
    assert_eq!(player.sounding.load(Ordering::SeqCst), 0);
    assert_eq!(player.max_sounding.load(Ordering::SeqCst), 1);
    assert_eq!(s.handle.diagnostics().stage_timeouts, 2);

    s.close().await;
}

/// Stops when asked but reports the clip as played anyway.
struct ShruggingPlayer;

#[async_trait]
impl Player for ShruggingPlayer {
    async fn play(&self, _audio: &AudioChunk, ctx: &StageContext) -> Result<(), StageError> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(3)) => {}
            _ = ctx.cancel.cancelled() => {}
        }
        Ok(())
    }

    fn supports_cancel(&self) -> bool {
        true
    }
}

#[tokio::test(start_paused = true)]
async fn interrupted_playback_is_not_reported_as_played() {
    let mut s = start_with_player(
        Latencies::default(),
        StageTimeouts::uniform(Duration::from_secs(10)),
        Some(Arc::new(ShruggingPlayer)),
    );
    let mut log = s.handle.subscribe();

    let v1 = s.handle.submit("first");
    wait_for_state(&mut s.events, v1, TurnState::Playing).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let v2 = s.handle.submit("second");
    let status = s.handle.settled().await;
    assert_eq!(status.last_reply.as_deref(), Some("re: second"));

    let events = drain(&mut log);
    assert!(events
        .iter()
        .all(|e| !(e.version == v1 && e.kind == TurnEventKind::Played)));
    assert!(events
        .iter()
        .any(|e| e.version == v2 && e.kind == TurnEventKind::Played));
    assert_eq!(states_of(&events, v1).last(), Some(&TurnState::Superseded));

    s.close().await;
}
