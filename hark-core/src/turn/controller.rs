//! `TurnController`: the preemption core.
//!
//! ## Run loop
//!
//! ```text
//! loop {
//!     wait until latest_input is set and input_version > last_done_version
//!     claim (version, input), running = true
//!     [checkpoint] transcribe   (audio input only)
//!     [checkpoint] generate     → reply recorded even if stale
//!     [checkpoint] synthesize
//!     [checkpoint] play         (skipped for empty audio)
//!     finish: completed / superseded / failed, running = false
//! }
//! ```
//!
//! A checkpoint compares the turn's version with the newest submitted one;
//! on mismatch the rest of the chain is skipped. Stages that support
//! cancellation are cancelled the moment a newer input arrives, and the loop
//! waits for them to return before doing anything else, so two turns never
//! have stage calls in flight at the same time.
//!
//! ## Shared state
//!
//! The session cursor sits in a `tokio::sync::watch` channel. Every mutation
//! (submission, state change, completion) goes through a single
//! `send_modify`, so readers always see a consistent snapshot and waiters are
//! woken without polling. `TurnEvent` sequence numbers are assigned inside the
//! same mutation.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{InputSummary, StatusProjection, TurnFailure, TurnInput, TurnRecord, TurnState};
use crate::error::StageError;
use crate::ipc::events::{TurnEvent, TurnEventKind};
use crate::stages::{StageContext, StageKind, StageSet, StageTimeouts};

/// Default broadcast capacity for turn events.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// How long a cancellable stage gets to wind down after its deadline.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct SessionCursor {
    latest_input: Option<Arc<TurnInput>>,
    input_version: u64,
    last_done_version: u64,
    last_reply: Option<String>,
    running: bool,
    turn: Option<TurnRecord>,
    next_seq: u64,
}

impl SessionCursor {
    fn projection(&self) -> StatusProjection {
        StatusProjection {
            input_version: self.input_version,
            last_done_version: self.last_done_version,
            latest_input: self.latest_input.as_deref().map(InputSummary::from),
            last_reply: self.last_reply.clone(),
            running: self.running,
            turn: self.turn.clone(),
        }
    }

    fn is_settled(&self) -> bool {
        !self.running && self.last_done_version == self.input_version
    }

    fn has_pending(&self) -> bool {
        self.latest_input.is_some() && self.input_version > self.last_done_version
    }

    /// The record for `version` if it is still the newest turn and not yet
    /// terminal.
    fn active_turn(&mut self, version: u64) -> Option<&mut TurnRecord> {
        self.turn
            .as_mut()
            .filter(|turn| turn.version == version && turn.is_active())
    }

    fn event(&mut self, version: u64, kind: TurnEventKind) -> TurnEvent {
        self.next_seq += 1;
        TurnEvent {
            seq: self.next_seq,
            version,
            kind,
        }
    }
}

/// Controller counters.
#[derive(Debug, Default)]
pub struct TurnDiagnostics {
    pub submitted: AtomicUsize,
    pub turns_started: AtomicUsize,
    pub turns_completed: AtomicUsize,
    pub turns_superseded: AtomicUsize,
    pub turns_failed: AtomicUsize,
    pub turns_dropped: AtomicUsize,
    pub stage_timeouts: AtomicUsize,
}

impl TurnDiagnostics {
    pub fn snapshot(&self) -> TurnDiagnosticsSnapshot {
        TurnDiagnosticsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            turns_started: self.turns_started.load(Ordering::Relaxed),
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
            turns_superseded: self.turns_superseded.load(Ordering::Relaxed),
            turns_failed: self.turns_failed.load(Ordering::Relaxed),
            turns_dropped: self.turns_dropped.load(Ordering::Relaxed),
            stage_timeouts: self.stage_timeouts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnDiagnosticsSnapshot {
    pub submitted: usize,
    pub turns_started: usize,
    pub turns_completed: usize,
    pub turns_superseded: usize,
    pub turns_failed: usize,
    pub turns_dropped: usize,
    pub stage_timeouts: usize,
}

struct Shared {
    cursor: watch::Sender<SessionCursor>,
    events: broadcast::Sender<TurnEvent>,
    diagnostics: TurnDiagnostics,
    loop_active: AtomicBool,
}

impl Shared {
    /// Apply `f` to the cursor as one atomic update, then broadcast the
    /// events it produced.
    fn mutate<R: Default>(
        &self,
        f: impl FnOnce(&mut SessionCursor, &mut Vec<TurnEvent>) -> R,
    ) -> R {
        let mut events = Vec::new();
        let mut out = R::default();
        self.cursor.send_modify(|cursor| out = f(cursor, &mut events));
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        out
    }

    fn is_stale(&self, version: u64) -> bool {
        self.cursor.borrow().input_version != version
    }

    /// Resolves once a version other than `version` has been submitted.
    async fn newer_than(&self, version: u64) {
        let mut rx = self.cursor.subscribe();
        loop {
            let current = rx.borrow_and_update().input_version;
            if current != version {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Cloneable front of a session: submit input, read status, observe events.
///
/// Submitting never blocks and never waits for the run loop.
#[derive(Clone)]
pub struct TurnHandle {
    shared: Arc<Shared>,
}

impl TurnHandle {
    pub fn new(event_capacity: usize) -> Self {
        let (cursor, _) = watch::channel(SessionCursor::default());
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                cursor,
                events,
                diagnostics: TurnDiagnostics::default(),
                loop_active: AtomicBool::new(false),
            }),
        }
    }

    /// Accept new input and return its version.
    ///
    /// Any turn still in progress is marked `Superseded` in the same update
    /// that bumps the version, so at most one turn is ever active.
    pub fn submit(&self, input: impl Into<TurnInput>) -> u64 {
        let input = Arc::new(input.into());
        let diagnostics = &self.shared.diagnostics;
        let version = self.shared.mutate(|cursor, events| {
            cursor.input_version += 1;
            let version = cursor.input_version;

            if let Some(turn) = cursor.turn.as_mut().filter(|turn| turn.is_active()) {
                let stale = turn.version;
                if turn.advance(TurnState::Superseded) {
                    diagnostics.turns_superseded.fetch_add(1, Ordering::Relaxed);
                    let event = cursor.event(
                        stale,
                        TurnEventKind::State {
                            state: TurnState::Superseded,
                            detail: Some(format!("superseded by v{version}")),
                        },
                    );
                    events.push(event);
                }
            }

            cursor.latest_input = Some(input);
            cursor.turn = Some(TurnRecord::queued(version));
            let event = cursor.event(
                version,
                TurnEventKind::State {
                    state: TurnState::Queued,
                    detail: None,
                },
            );
            events.push(event);
            version
        });
        diagnostics.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(version, "input submitted");
        version
    }

    /// Consistent snapshot of the session.
    pub fn status(&self) -> StatusProjection {
        self.shared.cursor.borrow().projection()
    }

    /// Live turn events. Lagging receivers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until nothing is running and every submitted version has been
    /// handled, then return that status.
    pub async fn settled(&self) -> StatusProjection {
        let mut rx = self.shared.cursor.subscribe();
        loop {
            {
                let cursor = rx.borrow_and_update();
                if cursor.is_settled() {
                    return cursor.projection();
                }
            }
            if rx.changed().await.is_err() {
                return self.status();
            }
        }
    }

    pub fn diagnostics(&self) -> TurnDiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }

    /// `true` while a `TurnController::run` loop is attached.
    pub fn is_loop_active(&self) -> bool {
        self.shared.loop_active.load(Ordering::SeqCst)
    }
}

impl Default for TurnHandle {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for TurnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnHandle").finish_non_exhaustive()
    }
}

/// How a turn's stage chain ended.
#[derive(Debug)]
enum Outcome {
    Completed(String),
    Superseded,
    Failed(TurnFailure),
}

/// The run loop for one session. Consumed by [`TurnController::run`].
pub struct TurnController {
    shared: Arc<Shared>,
    stages: StageSet,
    timeouts: StageTimeouts,
    shutdown: CancellationToken,
}

impl TurnController {
    pub fn new(handle: &TurnHandle, stages: StageSet, timeouts: StageTimeouts) -> Self {
        Self {
            shared: Arc::clone(&handle.shared),
            stages,
            timeouts,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this token ends the run loop. A turn in flight ends as
    /// `Failed(Shutdown)`; cancellable stages are told to stop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Process turns until shut down. Only one loop may be attached to a
    /// session at a time; a second call returns immediately.
    pub async fn run(self) {
        if self.shared.loop_active.swap(true, Ordering::SeqCst) {
            warn!("a turn run loop is already attached to this session");
            return;
        }
        info!("turn run loop started");

        let mut rx = self.shared.cursor.subscribe();
        while let Some((version, input)) = self.next_turn(&mut rx).await {
            self.shared
                .diagnostics
                .turns_started
                .fetch_add(1, Ordering::Relaxed);
            let span = info_span!("turn", version);
            let outcome = match self.execute(version, &input).instrument(span.clone()).await {
                Ok(reply) => Outcome::Completed(reply),
                Err(outcome) => outcome,
            };
            span.in_scope(|| self.finish(version, outcome));
        }

        self.shared.mutate(|cursor, _| cursor.running = false);
        self.shared.loop_active.store(false, Ordering::SeqCst);
        info!("turn run loop stopped");
    }

    /// Suspend until there is unprocessed input, then claim the newest.
    async fn next_turn(
        &self,
        rx: &mut watch::Receiver<SessionCursor>,
    ) -> Option<(u64, Arc<TurnInput>)> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            // Mark the current value seen before checking it, so any later
            // submission wakes `changed()`.
            let _ = rx.borrow_and_update();

            let mut claimed = None;
            self.shared.cursor.send_if_modified(|cursor| {
                if !cursor.has_pending() {
                    return false;
                }
                cursor.running = true;
                claimed = cursor
                    .latest_input
                    .clone()
                    .map(|input| (cursor.input_version, input));
                true
            });
            if claimed.is_some() {
                return claimed;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    async fn execute(&self, version: u64, input: &TurnInput) -> Result<String, Outcome> {
        let ctx = StageContext::new(version, self.shutdown.child_token());

        let prompt = match input {
            TurnInput::Text(text) => text.trim().to_owned(),
            TurnInput::Audio(audio) => {
                if audio.is_empty() {
                    return Err(Outcome::Failed(TurnFailure::EmptyAudio));
                }
                self.enter(version, TurnState::Transcribing)?;
                let transcriber = &self.stages.transcriber;
                let text = self
                    .call(
                        StageKind::Transcribe,
                        transcriber.supports_cancel(),
                        &ctx,
                        transcriber.transcribe(audio, &ctx),
                    )
                    .await?;
                let text = text.trim().to_owned();
                self.record_transcript(version, &text);
                text
            }
        };
        if prompt.is_empty() {
            return Err(Outcome::Failed(TurnFailure::EmptyTranscript));
        }

        self.enter(version, TurnState::Generating)?;
        let generator = &self.stages.generator;
        let reply = self
            .call(
                StageKind::Generate,
                generator.supports_cancel(),
                &ctx,
                generator.generate(&prompt, &ctx),
            )
            .await?;
        if !self.record_reply(version, &reply) {
            return Err(Outcome::Superseded);
        }

        self.enter(version, TurnState::Synthesizing)?;
        let synthesizer = &self.stages.synthesizer;
        let audio = self
            .call(
                StageKind::Synthesize,
                synthesizer.supports_cancel(),
                &ctx,
                synthesizer.synthesize(&reply, &ctx),
            )
            .await?;
        if audio.is_empty() {
            debug!("synthesized audio is empty, nothing to play");
            return Ok(reply);
        }

        // Last checkpoint before the user hears anything.
        self.enter(version, TurnState::Playing)?;
        let player = &self.stages.player;
        self.call(
            StageKind::Play,
            player.supports_cancel(),
            &ctx,
            player.play(&audio, &ctx),
        )
        .await?;
        let played = self.shared.mutate(|cursor, events| {
            if cursor.input_version != version {
                return false;
            }
            let event = cursor.event(version, TurnEventKind::Played);
            events.push(event);
            true
        });
        if !played {
            // The player returned normally after being told to stop.
            return Err(Outcome::Superseded);
        }
        Ok(reply)
    }

    /// Run one stage call under its deadline.
    ///
    /// A cancellable stage is told to stop through `ctx.cancel` when newer
    /// input arrives or its deadline passes, and is awaited (for at most
    /// [`CANCEL_GRACE`]) before the turn moves on. `None` means the deadline
    /// passed.
    async fn call<T>(
        &self,
        stage: StageKind,
        cancellable: bool,
        ctx: &StageContext,
        fut: impl Future<Output = Result<T, StageError>>,
    ) -> Result<T, Outcome> {
        let deadline = self.timeouts.for_stage(stage);
        let started = Instant::now();
        let expiry = tokio::time::sleep(deadline);
        tokio::pin!(fut);
        tokio::pin!(expiry);

        let result = if cancellable {
            tokio::select! {
                biased;
                result = &mut fut => Some(result),
                _ = self.shared.newer_than(ctx.version) => {
                    debug!(%stage, "newer input arrived, cancelling stage");
                    ctx.cancel.cancel();
                    tokio::select! {
                        result = &mut fut => Some(result),
                        _ = &mut expiry => None,
                    }
                }
                _ = &mut expiry => {
                    debug!(%stage, "deadline passed, cancelling stage");
                    ctx.cancel.cancel();
                    if tokio::time::timeout(CANCEL_GRACE, &mut fut).await.is_err() {
                        warn!(%stage, "stage ignored cancellation, dropping it");
                    }
                    None
                }
            }
        } else {
            tokio::select! {
                biased;
                result = &mut fut => Some(result),
                _ = &mut expiry => None,
                _ = self.shutdown.cancelled() => {
                    debug!(%stage, "shutdown while stage in flight");
                    return Err(Outcome::Failed(TurnFailure::Shutdown));
                }
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let err = match result {
            Some(Ok(value)) => {
                debug!(%stage, elapsed_ms, "stage finished");
                return Ok(value);
            }
            Some(Err(err)) => err,
            None => StageError::Timeout {
                stage,
                after: deadline,
            },
        };

        if self.shared.is_stale(ctx.version) {
            debug!(%stage, elapsed_ms, error = %err, "stage ended after supersession");
            return Err(Outcome::Superseded);
        }
        if self.shutdown.is_cancelled() {
            return Err(Outcome::Failed(TurnFailure::Shutdown));
        }
        if err.is_timeout() {
            self.shared
                .diagnostics
                .stage_timeouts
                .fetch_add(1, Ordering::Relaxed);
        }
        warn!(%stage, elapsed_ms, error = %err, "stage failed");
        Err(Outcome::Failed(TurnFailure::Stage {
            stage,
            timed_out: err.is_timeout(),
            message: err.to_string(),
        }))
    }

    /// Staleness checkpoint plus state change, as one update.
    fn enter(&self, version: u64, state: TurnState) -> Result<(), Outcome> {
        if self.shutdown.is_cancelled() {
            return Err(Outcome::Failed(TurnFailure::Shutdown));
        }
        let entered = self.shared.mutate(|cursor, events| {
            if cursor.input_version != version {
                return false;
            }
            let Some(turn) = cursor.active_turn(version) else {
                return false;
            };
            if !turn.advance(state) {
                return false;
            }
            let event = cursor.event(
                version,
                TurnEventKind::State {
                    state,
                    detail: None,
                },
            );
            events.push(event);
            true
        });
        if entered {
            debug!(%state, "turn advanced");
            Ok(())
        } else {
            debug!(%state, "turn is stale, skipping remaining stages");
            Err(Outcome::Superseded)
        }
    }

    fn record_transcript(&self, version: u64, text: &str) {
        self.shared.mutate(|cursor, events| {
            if let Some(turn) = cursor.active_turn(version) {
                turn.transcript = Some(text.to_owned());
            }
            let event = cursor.event(
                version,
                TurnEventKind::Transcript {
                    text: text.to_owned(),
                },
            );
            events.push(event);
        });
    }

    /// Record the generated reply. Returns `false` if the turn is already
    /// stale; the reply is still published, flagged as superseded.
    fn record_reply(&self, version: u64, reply: &str) -> bool {
        self.shared.mutate(|cursor, events| {
            let current = cursor.input_version == version;
            if let Some(turn) = cursor.active_turn(version) {
                turn.reply = Some(reply.to_owned());
            }
            let event = cursor.event(
                version,
                TurnEventKind::Reply {
                    text: reply.to_owned(),
                    superseded: !current,
                },
            );
            events.push(event);
            current
        })
    }

    /// Publish the turn's outcome and release the loop, as one update.
    fn finish(&self, version: u64, outcome: Outcome) {
        let diagnostics = &self.shared.diagnostics;
        self.shared.mutate(|cursor, events| {
            cursor.running = false;
            cursor.last_done_version = cursor.last_done_version.max(version);
            let current = cursor.input_version == version;

            match outcome {
                Outcome::Completed(reply) if current => {
                    if let Some(turn) = cursor.active_turn(version) {
                        turn.reply = Some(reply.clone());
                        turn.advance(TurnState::Completed);
                    }
                    cursor.last_reply = Some(reply);
                    cursor.latest_input = None;
                    let event = cursor.event(
                        version,
                        TurnEventKind::State {
                            state: TurnState::Completed,
                            detail: None,
                        },
                    );
                    events.push(event);
                    diagnostics.turns_completed.fetch_add(1, Ordering::Relaxed);
                    info!("turn completed");
                }
                // Superseded turns were marked by `submit`.
                Outcome::Completed(_) | Outcome::Superseded => {
                    debug!("turn superseded");
                }
                Outcome::Failed(failure) => {
                    let Some(turn) = cursor.active_turn(version) else {
                        debug!(%failure, "turn failed after supersession");
                        return;
                    };
                    turn.advance(TurnState::Failed);
                    turn.failure = Some(failure.clone());
                    let event = cursor.event(
                        version,
                        TurnEventKind::State {
                            state: TurnState::Failed,
                            detail: Some(failure.to_string()),
                        },
                    );
                    events.push(event);
                    if failure.is_empty_result() {
                        diagnostics.turns_dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(%failure, "turn dropped");
                    } else {
                        diagnostics.turns_failed.fetch_add(1, Ordering::Relaxed);
                        warn!(%failure, "turn failed");
                    }
                }
            }
        });
    }
}
