//! Pipeline stage collaborators.
//!
//! The turn controller drives four stages in order:
//!
//! ```text
//! Transcriber → Generator → Synthesizer → Player
//! ```
//!
//! Each one is an async request/response call behind a trait object so the
//! backends (local stubs, network services, audio devices) can be swapped
//! independently. A stage that can abort its own work early returns `true`
//! from `supports_cancel()` and watches [`StageContext::cancel`]; the
//! controller then cancels it as soon as a newer turn is submitted and waits
//! for it to return before starting anything else.

pub mod stub;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::buffering::chunk::AudioChunk;
use crate::error::StageError;

pub use stub::{EchoGenerator, SimulatedPlayer, StubTranscriber, ToneSynthesizer};

/// Which stage a call, timeout or failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Transcribe,
    Generate,
    Synthesize,
    Play,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Transcribe => "transcribe",
            StageKind::Generate => "generate",
            StageKind::Synthesize => "synthesize",
            StageKind::Play => "play",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call context handed to every stage.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Version of the turn this call belongs to.
    pub version: u64,
    /// Fires when the turn is superseded or the engine shuts down.
    pub cancel: CancellationToken,
}

impl StageContext {
    pub fn new(version: u64, cancel: CancellationToken) -> Self {
        Self { version, cancel }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Speech-to-text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &AudioChunk, ctx: &StageContext)
        -> Result<String, StageError>;

    fn supports_cancel(&self) -> bool {
        false
    }
}

/// Reply generation.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str, ctx: &StageContext) -> Result<String, StageError>;

    fn supports_cancel(&self) -> bool {
        false
    }
}

/// Text-to-speech.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, ctx: &StageContext) -> Result<AudioChunk, StageError>;

    fn supports_cancel(&self) -> bool {
        false
    }
}

/// Audio output. The only stage with a user-visible side effect.
#[async_trait]
pub trait Player: Send + Sync {
    /// Play `audio` to completion, or return early with
    /// `StageError::Cancelled` once `ctx.cancel` fires.
    async fn play(&self, audio: &AudioChunk, ctx: &StageContext) -> Result<(), StageError>;

    fn supports_cancel(&self) -> bool {
        false
    }
}

/// Deadline for each stage call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub transcribe: Duration,
    pub generate: Duration,
    pub synthesize: Duration,
    pub play: Duration,
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: StageKind) -> Duration {
        match stage {
            StageKind::Transcribe => self.transcribe,
            StageKind::Generate => self.generate,
            StageKind::Synthesize => self.synthesize,
            StageKind::Play => self.play,
        }
    }

    /// Same deadline for every stage. Handy in tests.
    pub fn uniform(deadline: Duration) -> Self {
        Self {
            transcribe: deadline,
            generate: deadline,
            synthesize: deadline,
            play: deadline,
        }
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            transcribe: Duration::from_secs(30),
            generate: Duration::from_secs(30),
            synthesize: Duration::from_secs(30),
            play: Duration::from_secs(60),
        }
    }
}

/// The four collaborators a turn controller drives.
#[derive(Clone)]
pub struct StageSet {
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn Generator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub player: Arc<dyn Player>,
}

impl StageSet {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        generator: Arc<dyn Generator>,
        synthesizer: Arc<dyn Synthesizer>,
        player: Arc<dyn Player>,
    ) -> Self {
        Self {
            transcriber,
            generator,
            synthesizer,
            player,
        }
    }

    /// Local stubs with no artificial latency.
    pub fn stub() -> Self {
        Self::new(
            Arc::new(StubTranscriber::default()),
            Arc::new(EchoGenerator::default()),
            Arc::new(ToneSynthesizer::default()),
            Arc::new(SimulatedPlayer::default()),
        )
    }

    /// Replace the player, keeping the other stages.
    pub fn with_player(mut self, player: Arc<dyn Player>) -> Self {
        self.player = player;
        self
    }
}

impl fmt::Debug for StageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSet")
            .field("player_cancellable", &self.player.supports_cancel())
            .finish_non_exhaustive()
    }
}
