//! Blocking listener loop.
//!
//! ## Per iteration
//!
//! ```text
//! 1. Drain the ring buffer (capture rate)
//! 2. Resample to the classifier rate
//! 3. Slice into fixed frames (remainder carried over)
//! 4. VAD observe → SpeechStarted / SpeechEnded(audio)
//! 5. SpeechEnded → TurnHandle::submit(audio), SpeechActivityEvent broadcast
//! ```
//!
//! Runs inside `spawn_blocking` so the Tokio workers stay free for the turn
//! controller. When `running` is cleared the loop drains whatever is left in
//! the ring, flushes the detector (an utterance cut off mid-speech is still
//! submitted) and returns.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    audio::resample::RateConverter,
    buffering::{frames::FrameSlicer, AudioConsumer, Consumer},
    error::HarkError,
    ipc::events::{ActivityKind, EngineStatus, EngineStatusEvent, SpeechActivityEvent},
    turn::{TurnHandle, TurnInput},
    vad::{VadEvent, VoiceActivityDetector},
};

/// Listener counters.
#[derive(Debug, Default)]
pub struct ListenerDiagnostics {
    pub samples_in: AtomicUsize,
    pub frames_classified: AtomicUsize,
    pub speech_frames: AtomicUsize,
    pub utterances_submitted: AtomicUsize,
    pub empty_utterances_skipped: AtomicUsize,
    /// Samples the capture callback dropped because the ring was full.
    pub ring_overflows: AtomicUsize,
}

impl ListenerDiagnostics {
    pub fn reset(&self) {
        self.samples_in.store(0, Ordering::Relaxed);
        self.frames_classified.store(0, Ordering::Relaxed);
        self.speech_frames.store(0, Ordering::Relaxed);
        self.utterances_submitted.store(0, Ordering::Relaxed);
        self.empty_utterances_skipped.store(0, Ordering::Relaxed);
        self.ring_overflows.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ListenerDiagnosticsSnapshot {
        ListenerDiagnosticsSnapshot {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            frames_classified: self.frames_classified.load(Ordering::Relaxed),
            speech_frames: self.speech_frames.load(Ordering::Relaxed),
            utterances_submitted: self.utterances_submitted.load(Ordering::Relaxed),
            empty_utterances_skipped: self.empty_utterances_skipped.load(Ordering::Relaxed),
            ring_overflows: self.ring_overflows.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerDiagnosticsSnapshot {
    pub samples_in: usize,
    pub frames_classified: usize,
    pub speech_frames: usize,
    pub utterances_submitted: usize,
    pub empty_utterances_skipped: usize,
    pub ring_overflows: usize,
}

/// Everything the listener thread owns or shares.
pub struct ListenerContext {
    pub detector: VoiceActivityDetector,
    pub consumer: AudioConsumer,
    /// Rate of the samples in the ring.
    pub capture_sample_rate: u32,
    pub running: Arc<AtomicBool>,
    pub turns: TurnHandle,
    pub activity_tx: broadcast::Sender<SpeechActivityEvent>,
    pub status_tx: broadcast::Sender<EngineStatusEvent>,
    pub status: Arc<Mutex<EngineStatus>>,
    pub activity_seq: Arc<AtomicU64>,
    pub diagnostics: Arc<ListenerDiagnostics>,
    /// Drop counter of the capture callback, when there is one.
    pub capture_overflow: Option<Arc<AtomicUsize>>,
}

/// Samples drained from the ring per iteration (20 ms at 48 kHz).
const DRAIN_CHUNK: usize = 960;

/// Sleep when the ring is empty (avoids busy-waiting a core).
const DEFAULT_SLEEP_EMPTY_MS: u64 = 5;

/// Run until `ctx.running` is cleared or a frame precondition fails.
pub fn run(mut ctx: ListenerContext) {
    let target_rate = ctx.detector.format().sample_rate();
    info!(
        capture_rate = ctx.capture_sample_rate,
        target_rate, "listener started"
    );

    let mut resampler = match RateConverter::new(ctx.capture_sample_rate, target_rate, DRAIN_CHUNK)
    {
        Ok(r) => r,
        Err(e) => {
            fail(&ctx, &e);
            return;
        }
    };
    let mut slicer = FrameSlicer::new(ctx.detector.format().samples_per_frame());
    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut overflow_seen = 0usize;

    loop {
        let stopping = !ctx.running.load(Ordering::Relaxed);
        overflow_seen = report_overflow(&ctx, overflow_seen);

        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            if stopping {
                break;
            }
            std::thread::sleep(Duration::from_millis(empty_sleep_ms()));
            continue;
        }
        let resampled = resampler.process(&raw[..n]);
        for frame in slicer.push(&resampled) {
            if let Err(e) = observe(&mut ctx, &frame) {
                fail(&ctx, &e);
                return;
            }
        }
        // Counted once the samples' frames have been handled.
        ctx.diagnostics.samples_in.fetch_add(n, Ordering::Relaxed);
    }

    if let Some(event) = ctx.detector.flush() {
        debug!("stream ended mid-utterance, flushing");
        handle_event(&ctx, event);
    }
    info!("listener stopped");
}

fn observe(ctx: &mut ListenerContext, frame: &[f32]) -> Result<(), HarkError> {
    let event = ctx.detector.observe(frame)?;
    ctx.diagnostics
        .frames_classified
        .fetch_add(1, Ordering::Relaxed);
    if ctx.detector.state().speech_streak > 0 {
        ctx.diagnostics.speech_frames.fetch_add(1, Ordering::Relaxed);
    }
    if let Some(event) = event {
        handle_event(ctx, event);
    }
    Ok(())
}

fn handle_event(ctx: &ListenerContext, event: VadEvent) {
    let seq = ctx.activity_seq.fetch_add(1, Ordering::Relaxed);
    let activity = match event {
        VadEvent::SpeechStarted => SpeechActivityEvent {
            seq,
            kind: ActivityKind::Started,
            samples: 0,
            duration_ms: 0,
            submitted_version: None,
        },
        VadEvent::SpeechEnded(audio) => {
            let samples = audio.len();
            let duration_ms = audio.duration_ms();
            let submitted_version = if audio.is_empty() {
                ctx.diagnostics
                    .empty_utterances_skipped
                    .fetch_add(1, Ordering::Relaxed);
                debug!("empty utterance skipped");
                None
            } else {
                let version = ctx.turns.submit(TurnInput::Audio(audio));
                ctx.diagnostics
                    .utterances_submitted
                    .fetch_add(1, Ordering::Relaxed);
                info!(version, samples, duration_ms, "utterance submitted");
                Some(version)
            };
            SpeechActivityEvent {
                seq,
                kind: ActivityKind::Ended,
                samples,
                duration_ms,
                submitted_version,
            }
        }
    };
    // No subscribers is fine.
    let _ = ctx.activity_tx.send(activity);
}

fn report_overflow(ctx: &ListenerContext, seen: usize) -> usize {
    let Some(counter) = ctx.capture_overflow.as_ref() else {
        return seen;
    };
    let total = counter.load(Ordering::Relaxed);
    if total > seen {
        warn!(dropped = total - seen, "ring buffer full, capture samples dropped");
        ctx.diagnostics
            .ring_overflows
            .fetch_add(total - seen, Ordering::Relaxed);
    }
    total
}

/// Configuration failure inside the listener thread: reported once, stops
/// listening. The turn controller is unaffected.
fn fail(ctx: &ListenerContext, err: &HarkError) {
    error!("listener stopped: {err}");
    ctx.running.store(false, Ordering::SeqCst);
    *ctx.status.lock() = EngineStatus::Error;
    let _ = ctx.status_tx.send(EngineStatusEvent {
        status: EngineStatus::Error,
        detail: Some(err.to_string()),
    });
}

fn empty_sleep_ms() -> u64 {
    static EMPTY_SLEEP_MS: OnceLock<u64> = OnceLock::new();
    *EMPTY_SLEEP_MS.get_or_init(|| {
        std::env::var("HARK_LISTENER_EMPTY_SLEEP_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_SLEEP_EMPTY_MS)
    })
}
