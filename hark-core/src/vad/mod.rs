//! Voice activity detection.
//!
//! Two layers:
//!
//! - [`FrameClassifier`]: a per-frame speech/silence verdict. This is the
//!   noisy part and is meant to be swapped out (energy threshold by default,
//!   any neural model behind the same trait).
//! - [`VoiceActivityDetector`]: hysteresis over those verdicts, turning the
//!   flickering per-frame stream into discrete `SpeechStarted` /
//!   `SpeechEnded` events.

pub mod detector;
pub mod energy;

pub use detector::{VadConfig, VadEvent, VadState, VoiceActivityDetector};
pub use energy::EnergyClassifier;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{HarkError, Result};

/// Sample rates a frame classifier accepts.
pub const SUPPORTED_SAMPLE_RATES: [u32; 4] = [8_000, 16_000, 32_000, 48_000];

/// Frame durations a frame classifier accepts.
pub const SUPPORTED_FRAME_MS: [u32; 3] = [10, 20, 30];

/// Whether a given audio frame contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// The classifier heard speech in this frame.
    Speech,
    /// The frame is silent or noise.
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

impl From<bool> for VadDecision {
    fn from(is_speech: bool) -> Self {
        if is_speech {
            VadDecision::Speech
        } else {
            VadDecision::Silence
        }
    }
}

/// Sample rate and duration of one classifier frame.
///
/// Only the combinations in [`SUPPORTED_SAMPLE_RATES`] × [`SUPPORTED_FRAME_MS`]
/// can be constructed; anything else is a configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameFormat {
    sample_rate: u32,
    frame_ms: u32,
}

impl FrameFormat {
    pub fn new(sample_rate: u32, frame_ms: u32) -> Result<Self> {
        if !SUPPORTED_SAMPLE_RATES.contains(&sample_rate) || !SUPPORTED_FRAME_MS.contains(&frame_ms)
        {
            return Err(HarkError::UnsupportedFrameFormat {
                sample_rate,
                frame_ms,
            });
        }
        Ok(Self {
            sample_rate,
            frame_ms,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_ms(&self) -> u32 {
        self.frame_ms
    }

    /// Number of mono samples in one frame (e.g. 480 for 16 kHz / 30 ms).
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_ms: 30,
        }
    }
}

/// Per-frame speech classifier.
///
/// Implementors may be stateful (smoothing, RNN hidden states, etc.).
pub trait FrameClassifier: Send + 'static {
    /// Classify one frame of exactly `format.samples_per_frame()` samples.
    fn classify(&mut self, frame: &[f32], format: FrameFormat) -> VadDecision;

    /// Reset any internal state between streams.
    fn reset(&mut self) {}
}

/// Thread-safe reference-counted handle to any `FrameClassifier` implementor.
///
/// The engine keeps one handle and hands a clone to each listener run, so a
/// classifier with expensive setup is only built once.
#[derive(Clone)]
pub struct ClassifierHandle(pub Arc<Mutex<dyn FrameClassifier>>);

impl ClassifierHandle {
    /// Wrap any `FrameClassifier` in a `ClassifierHandle`.
    pub fn new<C: FrameClassifier>(classifier: C) -> Self {
        Self(Arc::new(Mutex::new(classifier)))
    }
}

impl std::fmt::Debug for ClassifierHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifierHandle").finish_non_exhaustive()
    }
}
