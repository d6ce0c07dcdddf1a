//! Read model of a session.

use serde::{Deserialize, Serialize};

use super::{TurnInput, TurnRecord};

/// Consistent snapshot of the session cursor.
///
/// Produced from a single read of the controller's state, so all fields
/// belong to the same instant: a reader can never see `last_done_version`
/// advanced while `last_reply` still holds the previous answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusProjection {
    /// Version of the most recent submission (0 before the first one).
    pub input_version: u64,
    /// Highest version the run loop has finished with, by any outcome.
    pub last_done_version: u64,
    /// Input not yet answered. Cleared when its turn completes.
    pub latest_input: Option<InputSummary>,
    /// Reply of the most recent `Completed` turn.
    pub last_reply: Option<String>,
    /// `true` while the run loop is executing a turn.
    pub running: bool,
    /// Record of the newest turn.
    pub turn: Option<TurnRecord>,
}

impl StatusProjection {
    /// No turn in flight and nothing left to pick up.
    pub fn is_settled(&self) -> bool {
        !self.running && self.last_done_version == self.input_version
    }
}

/// Serializable description of a [`TurnInput`]. Audio is summarised rather
/// than copied into every snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InputSummary {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Audio {
        samples: usize,
        sample_rate: u32,
        duration_ms: u64,
    },
}

impl From<&TurnInput> for InputSummary {
    fn from(input: &TurnInput) -> Self {
        match input {
            TurnInput::Text(text) => InputSummary::Text { text: text.clone() },
            TurnInput::Audio(audio) => InputSummary::Audio {
                samples: audio.len(),
                sample_rate: audio.sample_rate,
                duration_ms: audio.duration_ms(),
            },
        }
    }
}
