//! `HarkEngine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! HarkEngine::new()            → frame format validated, status = Idle
//!     ├─► start()              → controller spawned, microphone open, status = Listening
//!     ├─► start_headless()     → controller spawned, caller feeds the ring
//!     ├─► start_text_only()    → controller spawned, no listener
//!     └─► stop().await         → listener drained + flushed, controller shut down,
//!                                status = Stopped
//! ```
//!
//! Input is accepted at any time through `submit_text` / `submit_audio`,
//! even before `start()`; it waits in the session until a run loop picks it
//! up.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS. `AudioCapture` is therefore
//! created *inside* the `spawn_blocking` closure that then runs the
//! listener, so it never crosses a thread boundary. A bounded(1) channel
//! propagates the open result back to the `start()` caller.
//!
//! The start methods spawn onto the current Tokio runtime and fail with
//! `HarkError::Other` when called outside one.

pub mod listener;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    audio::AudioCapture,
    buffering::{chunk::AudioChunk, create_audio_ring, AudioConsumer, AudioProducer},
    error::{HarkError, Result},
    ipc::events::{EngineStatus, EngineStatusEvent, SpeechActivityEvent, TurnEvent},
    stages::{StageSet, StageTimeouts},
    turn::{
        controller::DEFAULT_EVENT_CAPACITY, StatusProjection, TurnController,
        TurnDiagnosticsSnapshot, TurnHandle, TurnInput,
    },
    vad::{ClassifierHandle, EnergyClassifier, FrameFormat, VadConfig, VoiceActivityDetector},
};

use listener::{ListenerContext, ListenerDiagnostics, ListenerDiagnosticsSnapshot};

/// Configuration for `HarkEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Classifier sample rate (Hz). Captured audio is resampled to it.
    /// Default: 16000.
    pub sample_rate: u32,
    /// Classifier frame duration (ms). Default: 30.
    pub frame_ms: u32,
    /// Consecutive speech frames before `SpeechStarted`. Default: 8.
    pub start_trigger_frames: u32,
    /// Consecutive silence frames before `SpeechEnded`. Default: 12.
    pub end_trigger_frames: u32,
    /// RMS threshold of the default energy classifier. Default: 0.01.
    pub energy_threshold: f32,
    /// Per-stage deadlines.
    pub timeouts: StageTimeouts,
    /// Buffered events per broadcast channel for slow observers.
    pub event_capacity: usize,
    /// Preferred microphone name for `start()`. `None` = system default.
    pub input_device: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_ms: 30,
            start_trigger_frames: 8,
            end_trigger_frames: 12,
            energy_threshold: 0.01,
            timeouts: StageTimeouts::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            input_device: None,
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// `HarkError::UnsupportedFrameFormat` for a rate/duration the
    /// classifier cannot take.
    pub fn frame_format(&self) -> Result<FrameFormat> {
        FrameFormat::new(self.sample_rate, self.frame_ms)
    }

    pub fn vad_config(&self) -> VadConfig {
        VadConfig {
            start_trigger_frames: self.start_trigger_frames,
            end_trigger_frames: self.end_trigger_frames,
        }
    }
}

/// Tasks owned by one `start*()` … `stop()` cycle.
struct Session {
    shutdown: CancellationToken,
    controller: JoinHandle<()>,
    listener: Option<JoinHandle<()>>,
}

/// The top-level engine handle.
///
/// `HarkEngine` is `Send + Sync`; all fields use interior mutability. Wrap
/// it in an `Arc` to share it between the host's input loop and its event
/// printers.
pub struct HarkEngine {
    config: EngineConfig,
    format: FrameFormat,
    stages: StageSet,
    classifier: ClassifierHandle,
    turns: TurnHandle,
    session: Mutex<Option<Session>>,
    /// `true` while the listener thread should keep draining.
    running: Arc<AtomicBool>,
    status: Arc<Mutex<EngineStatus>>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    activity_tx: broadcast::Sender<SpeechActivityEvent>,
    activity_seq: Arc<AtomicU64>,
    diagnostics: Arc<ListenerDiagnostics>,
}

impl HarkEngine {
    /// # Errors
    /// `HarkError::UnsupportedFrameFormat` / `InvalidConfig` when the
    /// listener settings are unusable.
    pub fn new(config: EngineConfig, stages: StageSet, classifier: ClassifierHandle) -> Result<Self> {
        let format = config.frame_format()?;
        if config.start_trigger_frames == 0 || config.end_trigger_frames == 0 {
            return Err(HarkError::InvalidConfig(
                "trigger frame counts must be >= 1".into(),
            ));
        }
        let capacity = config.event_capacity.max(1);
        let (status_tx, _) = broadcast::channel(capacity);
        let (activity_tx, _) = broadcast::channel(capacity);

        Ok(Self {
            turns: TurnHandle::new(capacity),
            config,
            format,
            stages,
            classifier,
            session: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            status_tx,
            activity_tx,
            activity_seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(ListenerDiagnostics::default()),
        })
    }

    /// Engine with the default energy classifier at
    /// `config.energy_threshold`.
    pub fn with_energy_classifier(config: EngineConfig, stages: StageSet) -> Result<Self> {
        let classifier = ClassifierHandle::new(EnergyClassifier::new(config.energy_threshold));
        Self::new(config, stages, classifier)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the turn controller and listen on the configured microphone.
    ///
    /// # Errors
    /// `AlreadyRunning`, or the device error that prevented capture (status
    /// becomes `Error` and nothing is left running).
    pub fn start(&self) -> Result<()> {
        let preferred = self.config.input_device.clone();
        self.start_with_device(preferred)
    }

    /// Like [`start`](Self::start) with an explicit device preference.
    pub fn start_with_device(&self, preferred_input_device: Option<String>) -> Result<()> {
        let (producer, consumer) = create_audio_ring();
        // Capture rate is filled in once the device is open.
        let mut ctx = self.listener_context(consumer, 0)?;
        let runtime = self.claim()?;

        let running = Arc::clone(&self.running);
        let (open_tx, open_rx) = bounded::<Result<u32>>(1);

        let listener = runtime.spawn_blocking(move || {
            // Must happen on THIS thread (cpal::Stream is !Send).
            let capture = match AudioCapture::open(
                producer,
                Arc::clone(&running),
                preferred_input_device.as_deref(),
            ) {
                Ok(c) => {
                    let _ = open_tx.send(Ok(c.sample_rate));
                    c
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            };
            ctx.capture_sample_rate = capture.sample_rate;
            ctx.capture_overflow = Some(capture.dropped_counter());

            listener::run(ctx);

            capture.stop();
            // Stream drops here, releasing the device on this thread.
            drop(capture);
        });

        // Block until the device open is confirmed.
        let opened = match open_rx.recv() {
            Ok(Ok(rate)) => Ok(rate),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(HarkError::Other(anyhow::anyhow!(
                "listener thread died before opening the device"
            ))),
        };
        match opened {
            Ok(rate) => {
                let mut session = self.spawn_controller(&runtime);
                session.listener = Some(listener);
                *self.session.lock() = Some(session);
                self.set_status(EngineStatus::Listening, None);
                info!(capture_rate = rate, "engine started, listening");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.set_status(EngineStatus::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Start the controller and a listener fed by the caller instead of a
    /// device. Push mono f32 samples at `input_sample_rate` into the
    /// returned producer.
    ///
    /// # Errors
    /// `AlreadyRunning`, or `Resample` for a zero input rate.
    pub fn start_headless(&self, input_sample_rate: u32) -> Result<AudioProducer> {
        if input_sample_rate == 0 {
            return Err(HarkError::Resample("input sample rate must be > 0".into()));
        }
        let (producer, consumer) = create_audio_ring();
        let ctx = self.listener_context(consumer, input_sample_rate)?;
        let runtime = self.claim()?;

        let mut session = self.spawn_controller(&runtime);
        session.listener = Some(runtime.spawn_blocking(move || listener::run(ctx)));
        *self.session.lock() = Some(session);
        self.set_status(EngineStatus::Listening, None);
        info!(input_sample_rate, "engine started headless");
        Ok(producer)
    }

    /// Start only the turn controller; input comes through `submit_*`.
    ///
    /// # Errors
    /// `AlreadyRunning`.
    pub fn start_text_only(&self) -> Result<()> {
        let runtime = self.claim()?;
        let session = self.spawn_controller(&runtime);
        *self.session.lock() = Some(session);
        self.set_status(EngineStatus::Listening, None);
        info!("engine started, text input only");
        Ok(())
    }

    /// Stop listening and shut the controller down.
    ///
    /// The listener drains what is left in the ring and submits an
    /// utterance that was still in progress before the controller is
    /// cancelled.
    ///
    /// # Errors
    /// `HarkError::NotRunning` if no session is active.
    pub async fn stop(&self) -> Result<()> {
        let session = self.session.lock().take().ok_or(HarkError::NotRunning)?;
        self.running.store(false, Ordering::SeqCst);
        info!("engine stop requested");

        if let Some(listener) = session.listener {
            if let Err(e) = listener.await {
                warn!("listener thread ended abnormally: {e}");
            }
        }
        session.shutdown.cancel();
        if let Err(e) = session.controller.await {
            warn!("turn controller ended abnormally: {e}");
        }

        self.set_status(EngineStatus::Stopped, None);
        info!("engine stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Submit typed input as a new turn. Never rejected.
    pub fn submit_text(&self, text: impl Into<String>) -> u64 {
        self.turns.submit(TurnInput::Text(text.into()))
    }

    /// Submit an utterance captured elsewhere as a new turn. Never rejected.
    pub fn submit_audio(&self, audio: AudioChunk) -> u64 {
        self.turns.submit(TurnInput::Audio(audio))
    }

    /// Current turn status projection.
    pub fn status(&self) -> StatusProjection {
        self.turns.status()
    }

    /// Current engine lifecycle status (snapshot).
    pub fn engine_status(&self) -> EngineStatus {
        *self.status.lock()
    }

    /// Session handle for submitting, reading status and awaiting settlement.
    pub fn handle(&self) -> TurnHandle {
        self.turns.clone()
    }

    pub fn subscribe_turns(&self) -> broadcast::Receiver<TurnEvent> {
        self.turns.subscribe()
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<SpeechActivityEvent> {
        self.activity_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn listener_diagnostics(&self) -> ListenerDiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn turn_diagnostics(&self) -> TurnDiagnosticsSnapshot {
        self.turns.diagnostics()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    /// Reserve the engine for a new session.
    fn claim(&self) -> Result<Handle> {
        if self.session.lock().is_some() {
            return Err(HarkError::AlreadyRunning);
        }
        let runtime = Handle::try_current().map_err(|e| {
            HarkError::Other(anyhow::anyhow!("engine must be started inside a Tokio runtime: {e}"))
        })?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(HarkError::AlreadyRunning);
        }
        self.diagnostics.reset();
        Ok(runtime)
    }

    fn spawn_controller(&self, runtime: &Handle) -> Session {
        let controller = TurnController::new(&self.turns, self.stages.clone(), self.config.timeouts);
        let shutdown = controller.shutdown_token();
        Session {
            shutdown,
            controller: runtime.spawn(controller.run()),
            listener: None,
        }
    }

    fn listener_context(&self, consumer: AudioConsumer, capture_sample_rate: u32) -> Result<ListenerContext> {
        let detector = VoiceActivityDetector::new(
            self.classifier.clone(),
            self.format,
            self.config.vad_config(),
        )?;
        Ok(ListenerContext {
            detector,
            consumer,
            capture_sample_rate,
            running: Arc::clone(&self.running),
            turns: self.turns.clone(),
            activity_tx: self.activity_tx.clone(),
            status_tx: self.status_tx.clone(),
            status: Arc::clone(&self.status),
            activity_seq: Arc::clone(&self.activity_seq),
            diagnostics: Arc::clone(&self.diagnostics),
            capture_overflow: None,
        })
    }

    fn set_status(&self, new_status: EngineStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(EngineStatusEvent {
            status: new_status,
            detail,
        });
    }
}
