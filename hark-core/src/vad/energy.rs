//! Energy-based frame classifier using an RMS threshold.
//!
//! No smoothing of its own: a frame is speech iff its RMS reaches the
//! threshold. Flicker suppression is the detector's job.

use super::{FrameClassifier, FrameFormat, VadDecision};

/// A simple energy-based frame classifier.
#[derive(Debug, Clone)]
pub struct EnergyClassifier {
    /// RMS amplitude threshold. Frames at or above this are speech.
    /// Typical range: 0.005–0.05 for a close microphone.
    threshold: f32,
}

impl EnergyClassifier {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.max(0.0),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Default for EnergyClassifier {
    fn default() -> Self {
        Self::new(0.01)
    }
}

impl FrameClassifier for EnergyClassifier {
    fn classify(&mut self, frame: &[f32], _format: FrameFormat) -> VadDecision {
        if frame.is_empty() {
            return VadDecision::Silence;
        }
        VadDecision::from(rms(frame) >= self.threshold)
    }
}

/// Root-mean-square of a sample slice (0.0 for an empty slice).
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
