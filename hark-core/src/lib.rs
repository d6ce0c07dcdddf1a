//! # hark-core
//!
//! Conversational turn engine: detects where an utterance starts and ends,
//! and runs each utterance (or typed line) through a
//! transcribe → generate → synthesize → play chain where newer input always
//! preempts older work.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC RingBuffer → Listener(spawn_blocking)
//!                                                    │
//!                                    resample → frames → VAD hysteresis
//!                                                    │ SpeechEnded(audio)
//!                                                    ▼
//!                       submit_text ───────►  TurnHandle::submit  (version += 1)
//!                                                    │ watch
//!                                                    ▼
//!                                   TurnController::run (Tokio task)
//!                        transcribe → generate → synthesize → play, with a
//!                        staleness checkpoint before every stage
//!                                                    │
//!                         broadcast::Sender<TurnEvent> + StatusProjection
//! ```
//!
//! The audio callback is zero-alloc. All heap work happens in the listener
//! thread or in the controller task.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod stages;
pub mod turn;
pub mod vad;

// Convenience re-exports for downstream crates
pub use buffering::chunk::AudioChunk;
pub use engine::{EngineConfig, HarkEngine};
pub use error::{HarkError, StageError};
pub use ipc::events::{
    ActivityKind, EngineStatus, EngineStatusEvent, SpeechActivityEvent, TurnEvent, TurnEventKind,
};
pub use stages::{StageContext, StageKind, StageSet, StageTimeouts};
pub use turn::{StatusProjection, TurnFailure, TurnHandle, TurnInput, TurnState};
pub use vad::{ClassifierHandle, EnergyClassifier, FrameClassifier, FrameFormat};

#[cfg(feature = "audio-cpal")]
pub use audio::CpalPlayer;
