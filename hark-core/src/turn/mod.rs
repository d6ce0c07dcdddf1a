//! Turns and the preemption controller.
//!
//! A turn is one attempt to answer one user input. Every submission gets the
//! next version number; the controller only ever works on the newest one and
//! abandons (supersedes) anything older the moment a newer input arrives.
//!
//! ```text
//! Queued ─► Transcribing ─► Generating ─► Synthesizing ─► Playing ─► Completed
//!   │  └──────────────────────►┘              └──────────────────────►┘
//!   └──────── any non-terminal state ──► Superseded | Failed
//! ```

pub mod controller;
pub mod status;

pub use controller::{TurnController, TurnDiagnostics, TurnDiagnosticsSnapshot, TurnHandle};
pub use status::{InputSummary, StatusProjection};

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::buffering::chunk::AudioChunk;
use crate::stages::StageKind;

/// Lifecycle state of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    Queued,
    Transcribing,
    Generating,
    Synthesizing,
    Playing,
    Completed,
    Superseded,
    Failed,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TurnState::Completed | TurnState::Superseded | TurnState::Failed
        )
    }

    /// The allowed-transition table.
    pub fn can_transition_to(self, next: TurnState) -> bool {
        use TurnState::*;
        match (self, next) {
            (from, Superseded | Failed) => !from.is_terminal(),
            (Queued, Transcribing | Generating) => true,
            (Transcribing, Generating) => true,
            (Generating, Synthesizing) => true,
            // Empty synthesized audio completes without playback.
            (Synthesizing, Playing | Completed) => true,
            (Playing, Completed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TurnState::Queued => "queued",
            TurnState::Transcribing => "transcribing",
            TurnState::Generating => "generating",
            TurnState::Synthesizing => "synthesizing",
            TurnState::Playing => "playing",
            TurnState::Completed => "completed",
            TurnState::Superseded => "superseded",
            TurnState::Failed => "failed",
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the user said: captured audio, or text supplied directly.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnInput {
    Text(String),
    Audio(AudioChunk),
}

impl TurnInput {
    pub fn is_audio(&self) -> bool {
        matches!(self, TurnInput::Audio(_))
    }
}

impl From<String> for TurnInput {
    fn from(text: String) -> Self {
        TurnInput::Text(text)
    }
}

impl From<&str> for TurnInput {
    fn from(text: &str) -> Self {
        TurnInput::Text(text.to_owned())
    }
}

impl From<AudioChunk> for TurnInput {
    fn from(audio: AudioChunk) -> Self {
        TurnInput::Audio(audio)
    }
}

/// Why a turn ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum TurnFailure {
    #[error("{stage} {}: {message}", stage_outcome(.timed_out))]
    #[serde(rename_all = "camelCase")]
    Stage {
        stage: StageKind,
        timed_out: bool,
        message: String,
    },
    #[error("captured audio was empty")]
    EmptyAudio,
    #[error("transcript was empty")]
    EmptyTranscript,
    #[error("engine shut down")]
    Shutdown,
}

fn stage_outcome(timed_out: &bool) -> &'static str {
    if *timed_out {
        "timed out"
    } else {
        "failed"
    }
}

impl TurnFailure {
    /// Empty results are an expected outcome, not an error.
    pub fn is_empty_result(&self) -> bool {
        matches!(self, TurnFailure::EmptyAudio | TurnFailure::EmptyTranscript)
    }
}

/// Progress of one turn, as shown in the status projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRecord {
    pub version: u64,
    pub state: TurnState,
    pub transcript: Option<String>,
    pub reply: Option<String>,
    pub failure: Option<TurnFailure>,
}

impl TurnRecord {
    pub fn queued(version: u64) -> Self {
        Self {
            version,
            state: TurnState::Queued,
            transcript: None,
            reply: None,
            failure: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Move to `next`. Illegal transitions are refused (and panic in debug
    /// builds).
    pub fn advance(&mut self, next: TurnState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                version = self.version,
                from = %self.state,
                to = %next,
                "illegal turn transition"
            );
            debug_assert!(
                false,
                "illegal turn transition {} -> {}",
                self.state, next
            );
            return false;
        }
        self.state = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TurnState; 8] = [
        TurnState::Queued,
        TurnState::Transcribing,
        TurnState::Generating,
        TurnState::Synthesizing,
        TurnState::Playing,
        TurnState::Completed,
        TurnState::Superseded,
        TurnState::Failed,
    ];

    #[test]
    fn happy_path_is_allowed() {
        let path = [
            TurnState::Queued,
            TurnState::Transcribing,
            TurnState::Generating,
            TurnState::Synthesizing,
            TurnState::Playing,
            TurnState::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn text_input_skips_transcription() {
        assert!(TurnState::Queued.can_transition_to(TurnState::Generating));
        assert!(!TurnState::Queued.can_transition_to(TurnState::Synthesizing));
    }

    #[test]
    fn terminal_states_are_final() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn every_active_state_can_be_superseded_or_fail() {
        for from in ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(TurnState::Superseded));
            assert!(from.can_transition_to(TurnState::Failed));
            assert!(!from.can_transition_to(from), "self loop on {from}");
        }
    }

    #[test]
    fn no_going_backwards() {
        assert!(!TurnState::Playing.can_transition_to(TurnState::Generating));
        assert!(!TurnState::Generating.can_transition_to(TurnState::Transcribing));
        assert!(!TurnState::Queued.can_transition_to(TurnState::Completed));
    }

    #[test]
    fn record_advances_along_legal_edges() {
        let mut record = TurnRecord::queued(3);
        assert!(record.advance(TurnState::Generating));
        assert!(record.advance(TurnState::Synthesizing));
        assert!(record.advance(TurnState::Completed));
        assert!(!record.is_active());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "illegal turn transition")]
    fn illegal_transition_panics_in_debug() {
        let mut record = TurnRecord::queued(1);
        record.advance(TurnState::Playing);
    }

    #[test]
    fn failure_messages_distinguish_timeouts() {
        let timeout = TurnFailure::Stage {
            stage: StageKind::Generate,
            timed_out: true,
            message: "generate exceeded its 30s deadline".into(),
        };
        assert!(timeout.to_string().starts_with("generate timed out"));
        let failed = TurnFailure::Stage {
            stage: StageKind::Play,
            timed_out: false,
            message: "device lost".into(),
        };
        assert_eq!(failed.to_string(), "play failed: device lost");
        assert!(TurnFailure::EmptyTranscript.is_empty_result());
        assert!(!TurnFailure::Shutdown.is_empty_result());
    }

    #[test]
    fn failure_serializes_with_reason_tag() {
        let json = serde_json::to_value(TurnFailure::Stage {
            stage: StageKind::Synthesize,
            timed_out: false,
            message: "boom".into(),
        })
        .expect("serialize failure");
        assert_eq!(json["reason"], "stage");
        assert_eq!(json["stage"], "synthesize");
        assert_eq!(json["timedOut"], false);
    }
}
