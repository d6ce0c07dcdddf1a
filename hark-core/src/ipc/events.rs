//! Events broadcast by the engine.
//!
//! | Event | Source | Subscribe with |
//! |-------|--------|----------------|
//! | `TurnEvent` | turn controller | `HarkEngine::subscribe_turns` |
//! | `SpeechActivityEvent` | listener (VAD boundaries) | `HarkEngine::subscribe_activity` |
//! | `EngineStatusEvent` | engine lifecycle | `HarkEngine::subscribe_status` |
//!
//! Broadcast channels drop the oldest events for slow subscribers; the
//! authoritative state is always `HarkEngine::status()`.

use serde::{Deserialize, Serialize};

use crate::turn::TurnState;

// ---------------------------------------------------------------------------
// Turn events
// ---------------------------------------------------------------------------

/// Something happened to the turn with `version`.
///
/// `seq` is assigned at the point where the change was applied, so sorting
/// by `seq` reproduces the order of mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnEvent {
    pub seq: u64,
    pub version: u64,
    pub kind: TurnEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TurnEventKind {
    /// The turn entered `state`. `detail` carries the failure reason for
    /// `Failed` turns and the superseding version for `Superseded` ones.
    State {
        state: TurnState,
        detail: Option<String>,
    },
    /// Transcription result.
    Transcript { text: String },
    /// Generated reply. `superseded` is `true` when the turn was already
    /// stale by the time the reply arrived; such replies are never played.
    Reply { text: String, superseded: bool },
    /// Playback ran to the end.
    Played,
}

impl TurnEvent {
    /// Terminal state carried by this event, if any.
    pub fn terminal_state(&self) -> Option<TurnState> {
        match &self.kind {
            TurnEventKind::State { state, .. } if state.is_terminal() => Some(*state),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Speech activity events
// ---------------------------------------------------------------------------

/// A speech boundary found by the listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechActivityEvent {
    pub seq: u64,
    pub kind: ActivityKind,
    /// Utterance length in samples (0 for `Started`).
    pub samples: usize,
    pub duration_ms: u64,
    /// Turn version the utterance was submitted as. `None` for `Started`
    /// and for empty utterances that were not submitted.
    pub submitted_version: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Started,
    Ended,
}

// ---------------------------------------------------------------------------
// Engine status events
// ---------------------------------------------------------------------------

/// Emitted when the engine lifecycle state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Lifecycle state of a `HarkEngine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Created, `start*()` not yet called.
    Idle,
    /// Turn controller running (with or without an audio source).
    Listening,
    /// Stopped; may be restarted.
    Stopped,
    /// Start failed (device error); see `detail`.
    Error,
}
