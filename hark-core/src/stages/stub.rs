//! Local stand-ins for the four stages.
//!
//! They do no real work but take (configurable) time the way the real
//! backends do, so the preemption behaviour can be exercised end-to-end
//! without a speech model, an LLM or an audio device.

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Generator, Player, StageContext, StageKind, Synthesizer, Transcriber};
use crate::buffering::chunk::AudioChunk;
use crate::error::StageError;

/// Sleep for `latency`, or return `Cancelled` early if `ctx` fires and the
/// caller allows it.
async fn simulate(
    latency: Duration,
    ctx: &StageContext,
    stage: StageKind,
    cancellable: bool,
) -> Result<(), StageError> {
    if latency.is_zero() {
        return Ok(());
    }
    if !cancellable {
        tokio::time::sleep(latency).await;
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(latency) => Ok(()),
        _ = ctx.cancel.cancelled() => {
            debug!(version = ctx.version, %stage, "stub stage cancelled");
            Err(StageError::Cancelled(stage))
        }
    }
}

/// Describes the audio it receives instead of recognising it:
/// `"[stub: <N> samples @ <SR> Hz]"`.
#[derive(Debug, Clone, Default)]
pub struct StubTranscriber {
    latency: Duration,
}

impl StubTranscriber {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl Transcriber for StubTranscriber {
    async fn transcribe(
        &self,
        audio: &AudioChunk,
        ctx: &StageContext,
    ) -> Result<String, StageError> {
        simulate(self.latency, ctx, StageKind::Transcribe, false).await?;
        if audio.is_empty() {
            return Ok(String::new());
        }
        Ok(format!(
            "[stub: {} samples @ {} Hz]",
            audio.len(),
            audio.sample_rate
        ))
    }
}

/// Answers every prompt with `"Reply: <prompt>"`.
#[derive(Debug, Clone, Default)]
pub struct EchoGenerator {
    latency: Duration,
}

impl EchoGenerator {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(&self, prompt: &str, ctx: &StageContext) -> Result<String, StageError> {
        simulate(self.latency, ctx, StageKind::Generate, false).await?;
        Ok(format!("Reply: {prompt}"))
    }
}

/// Renders text as a sine tone whose length grows with the text.
#[derive(Debug, Clone)]
pub struct ToneSynthesizer {
    latency: Duration,
    sample_rate: u32,
    frequency_hz: f32,
    per_char: Duration,
    max_len: Duration,
}

impl ToneSynthesizer {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn with_per_char(mut self, per_char: Duration) -> Self {
        self.per_char = per_char;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate.max(1);
        self
    }

    fn render(&self, text: &str) -> AudioChunk {
        let chars = text.chars().count() as u32;
        let len = self.per_char.saturating_mul(chars).min(self.max_len);
        let n = (len.as_secs_f64() * f64::from(self.sample_rate)).round() as usize;
        let step = TAU * self.frequency_hz / self.sample_rate as f32;
        let samples = (0..n).map(|i| 0.2 * (step * i as f32).sin()).collect();
        AudioChunk::new(samples, self.sample_rate)
    }
}

impl Default for ToneSynthesizer {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            sample_rate: 16_000,
            frequency_hz: 440.0,
            per_char: Duration::from_millis(40),
            max_len: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl Synthesizer for ToneSynthesizer {
    async fn synthesize(&self, text: &str, ctx: &StageContext) -> Result<AudioChunk, StageError> {
        simulate(self.latency, ctx, StageKind::Synthesize, false).await?;
        Ok(self.render(text))
    }
}

/// Pretends to play audio by waiting out its duration (divided by `speed`).
/// Cancellable: returns `Cancelled` as soon as the turn is superseded.
#[derive(Debug)]
pub struct SimulatedPlayer {
    speed: f32,
    finished: AtomicUsize,
}

impl SimulatedPlayer {
    /// `speed` > 1.0 plays faster than real time.
    pub fn new(speed: f32) -> Self {
        Self {
            speed: if speed.is_finite() && speed > 0.0 {
                speed
            } else {
                1.0
            },
            finished: AtomicUsize::new(0),
        }
    }

    /// Number of clips played to the end.
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::Relaxed)
    }
}

impl Default for SimulatedPlayer {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[async_trait]
impl Player for SimulatedPlayer {
    async fn play(&self, audio: &AudioChunk, ctx: &StageContext) -> Result<(), StageError> {
        let wall = Duration::from_secs_f64(audio.duration_secs() / f64::from(self.speed));
        simulate(wall, ctx, StageKind::Play, true).await?;
        self.finished.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn supports_cancel(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> StageContext {
        StageContext::new(1, CancellationToken::new())
    }

    #[tokio::test]
    async fn echo_generator_prefixes_the_prompt() {
        let reply = EchoGenerator::default()
            .generate("What time is it?", &ctx())
            .await
            .expect("generate");
        assert_eq!(reply, "Reply: What time is it?");
    }

    #[tokio::test]
    async fn stub_transcriber_describes_audio() {
        let audio = AudioChunk::new(vec![0.0; 480], 16_000);
        let text = StubTranscriber::default()
            .transcribe(&audio, &ctx())
            .await
            .expect("transcribe");
        assert_eq!(text, "[stub: 480 samples @ 16000 Hz]");
    }

    #[tokio::test]
    async fn tone_length_scales_with_text() {
        let synth = ToneSynthesizer::default().with_per_char(Duration::from_millis(10));
        let short = synth.synthesize("hi", &ctx()).await.expect("synth");
        let long = synth.synthesize("hello there", &ctx()).await.expect("synth");
        assert_eq!(short.len(), 320);
        assert_eq!(long.len(), 1_760);
        assert!(synth.synthesize("", &ctx()).await.expect("synth").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_player_stops_when_cancelled() {
        let player = SimulatedPlayer::default();
        let audio = AudioChunk::new(vec![0.0; 16_000 * 5], 16_000);
        let ctx = ctx();
        let token = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let started = tokio::time::Instant::now();
        let result = player.play(&audio, &ctx).await;
        assert_eq!(result, Err(StageError::Cancelled(StageKind::Play)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(player.finished(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_player_honours_speed() {
        let player = SimulatedPlayer::new(2.0);
        let audio = AudioChunk::new(vec![0.0; 16_000], 16_000);
        let started = tokio::time::Instant::now();
        player.play(&audio, &ctx()).await.expect("play");
        assert_eq!(started.elapsed(), Duration::from_millis(500));
        assert_eq!(player.finished(), 1);
    }
}
