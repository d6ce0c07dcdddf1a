//! Hysteresis over per-frame verdicts.
//!
//! ## Algorithm
//!
//! 1. Classify the frame; bump the matching streak counter and zero the other.
//! 2. Not speaking: remember the audio of the current speech streak. Once the
//!    streak reaches `start_trigger_frames`, switch to speaking, seed the
//!    utterance with the streak audio and emit `SpeechStarted`.
//! 3. Speaking: append every frame. Once the silence streak reaches
//!    `end_trigger_frames`, switch back and emit `SpeechEnded` with the
//!    utterance audio.
//!
//! Streaks count *consecutive* frames only; a single opposite verdict resets
//! them. A stream that ends mid-utterance must be closed with
//! [`VoiceActivityDetector::flush`].

use tracing::debug;

use super::{ClassifierHandle, FrameFormat, VadDecision};
use crate::buffering::chunk::AudioChunk;
use crate::error::{HarkError, Result};

/// Trigger thresholds, in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VadConfig {
    /// Consecutive speech frames needed to enter the speaking state.
    pub start_trigger_frames: u32,
    /// Consecutive silence frames needed to leave the speaking state.
    pub end_trigger_frames: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            start_trigger_frames: 8,
            end_trigger_frames: 12,
        }
    }
}

/// Hysteresis counters. `speech_streak` and `silence_streak` are never both
/// positive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VadState {
    pub is_speaking: bool,
    pub speech_streak: u32,
    pub silence_streak: u32,
}

/// Discrete speech boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    SpeechStarted,
    /// Everything buffered since `SpeechStarted`.
    SpeechEnded(AudioChunk),
}

/// Converts a stream of fixed-size frames into speech boundary events.
pub struct VoiceActivityDetector {
    classifier: ClassifierHandle,
    format: FrameFormat,
    config: VadConfig,
    state: VadState,
    /// Audio of the speech streak that has not yet reached the start trigger.
    onset: Vec<f32>,
    /// Audio of the utterance in progress.
    utterance: Vec<f32>,
}

impl VoiceActivityDetector {
    /// # Errors
    /// `HarkError::InvalidConfig` when either trigger is zero.
    pub fn new(classifier: ClassifierHandle, format: FrameFormat, config: VadConfig) -> Result<Self> {
        if config.start_trigger_frames == 0 || config.end_trigger_frames == 0 {
            return Err(HarkError::InvalidConfig(format!(
                "VAD trigger frames must be >= 1 (start={}, end={})",
                config.start_trigger_frames, config.end_trigger_frames
            )));
        }
        let frame_len = format.samples_per_frame();
        Ok(Self {
            classifier,
            format,
            config,
            state: VadState::default(),
            onset: Vec::with_capacity(frame_len * config.start_trigger_frames as usize),
            utterance: Vec::new(),
        })
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn config(&self) -> VadConfig {
        self.config
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    pub fn is_speaking(&self) -> bool {
        self.state.is_speaking
    }

    /// Classify `frame` and advance the hysteresis.
    ///
    /// # Errors
    /// `HarkError::FrameSizeMismatch` if the frame length differs from the
    /// configured format. This is a precondition violation; callers should
    /// stop feeding the detector.
    pub fn observe(&mut self, frame: &[f32]) -> Result<Option<VadEvent>> {
        let expected = self.format.samples_per_frame();
        if frame.len() != expected {
            return Err(HarkError::FrameSizeMismatch {
                expected,
                actual: frame.len(),
            });
        }
        let decision = self.classifier.0.lock().classify(frame, self.format);
        Ok(self.apply(frame, decision))
    }

    /// Advance the hysteresis with an already-made verdict for `frame`.
    pub fn apply(&mut self, frame: &[f32], decision: VadDecision) -> Option<VadEvent> {
        match decision {
            VadDecision::Speech => {
                self.state.speech_streak = self.state.speech_streak.saturating_add(1);
                self.state.silence_streak = 0;
            }
            VadDecision::Silence => {
                self.state.silence_streak = self.state.silence_streak.saturating_add(1);
                self.state.speech_streak = 0;
            }
        }

        if !self.state.is_speaking {
            if decision.is_speech() {
                self.onset.extend_from_slice(frame);
            } else {
                self.onset.clear();
            }
            if self.state.speech_streak >= self.config.start_trigger_frames {
                self.state.is_speaking = true;
                self.utterance = std::mem::take(&mut self.onset);
                debug!(
                    streak = self.state.speech_streak,
                    "speech started"
                );
                return Some(VadEvent::SpeechStarted);
            }
            return None;
        }

        self.utterance.extend_from_slice(frame);
        if self.state.silence_streak >= self.config.end_trigger_frames {
            self.state.is_speaking = false;
            let audio = self.take_utterance();
            debug!(samples = audio.len(), "speech ended");
            return Some(VadEvent::SpeechEnded(audio));
        }
        None
    }

    /// Force the end of an utterance in progress (stream closed while the
    /// speaker was still talking). Returns `None` when not speaking.
    pub fn flush(&mut self) -> Option<VadEvent> {
        let was_speaking = self.state.is_speaking;
        let audio = self.take_utterance();
        self.state = VadState::default();
        self.onset.clear();
        if !was_speaking {
            return None;
        }
        debug!(samples = audio.len(), "speech flushed");
        Some(VadEvent::SpeechEnded(audio))
    }

    /// Drop all state, including the classifier's.
    pub fn reset(&mut self) {
        self.state = VadState::default();
        self.onset.clear();
        self.utterance.clear();
        self.classifier.0.lock().reset();
    }

    fn take_utterance(&mut self) -> AudioChunk {
        AudioChunk::new(
            std::mem::take(&mut self.utterance),
            self.format.sample_rate(),
        )
    }
}
