use std::time::Duration;

use thiserror::Error;

use crate::stages::StageKind;

/// Configuration and lifecycle errors produced by hark-core.
///
/// These are the only errors that reach the process boundary. Everything that
/// goes wrong inside a single turn is a [`StageError`] and stays local to it.
#[derive(Debug, Error)]
pub enum HarkError {
    #[error("unsupported frame format: {sample_rate} Hz / {frame_ms} ms (allowed: 8/16/32/48 kHz × 10/20/30 ms)")]
    UnsupportedFrameFormat { sample_rate: u32, frame_ms: u32 },

    #[error("frame has {actual} samples, expected {expected}")]
    FrameSizeMismatch { expected: usize, actual: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("resampler error: {0}")]
    Resample(String),

    #[error("WAV decode error: {0}")]
    Wav(String),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, HarkError>;

/// Failure of one pipeline stage call.
///
/// The controller treats every variant the same way for preemption purposes
/// (the rest of the turn is abandoned) but reports timeouts separately.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("generation backend timed out")]
    GenerationTimeout,

    #[error("synthesis failed: {0}")]
    Synthesis(String),

    #[error("playback failed: {0}")]
    Playback(String),

    #[error("{stage} exceeded its {after:?} deadline")]
    Timeout { stage: StageKind, after: Duration },

    #[error("{0} cancelled")]
    Cancelled(StageKind),
}

impl StageError {
    /// `true` for deadline overruns, whether enforced by the controller or
    /// reported by the backend itself.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::GenerationTimeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_distinguished_from_failures() {
        let deadline = StageError::Timeout {
            stage: StageKind::Play,
            after: Duration::from_secs(60),
        };
        assert!(deadline.is_timeout());
        assert!(StageError::GenerationTimeout.is_timeout());
        assert!(!StageError::Generation("backend 500".into()).is_timeout());
        assert!(!StageError::Cancelled(StageKind::Play).is_timeout());
    }

    #[test]
    fn frame_format_error_names_the_offending_values() {
        let err = HarkError::UnsupportedFrameFormat {
            sample_rate: 44_100,
            frame_ms: 25,
        };
        let msg = err.to_string();
        assert!(msg.contains("44100"), "{msg}");
        assert!(msg.contains("25 ms"), "{msg}");
    }
}
