//! `CpalPlayer` plays synthesized speech on an output device.
//!
//! Each `play` call opens an output stream on a blocking thread (the stream
//! is `!Send`), feeds it from a shared cursor in the callback, and waits for
//! the clip to drain. Cancellation sets a stop flag that the callback and the
//! waiting thread both observe; `play` returns only after the stream has been
//! dropped, so a superseded clip is silent before the next one starts. The
//! flag is also raised when the `play` future itself is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, error, info};

use super::resample::RateConverter;
use crate::buffering::chunk::AudioChunk;
use crate::error::{HarkError, Result, StageError};
use crate::stages::{Player, StageContext, StageKind};

/// How often the waiting thread re-checks the stop flag.
const STOP_POLL: Duration = Duration::from_millis(20);

/// Output device player with a real cancellation hook.
#[derive(Debug, Clone)]
pub struct CpalPlayer {
    device_name: String,
    speed: f32,
}

/// Raises the stop flag when dropped.
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl CpalPlayer {
    /// Resolve the default output device now, so a missing device is a
    /// startup error rather than a failure on every turn.
    ///
    /// # Errors
    /// `HarkError::NoDefaultOutputDevice` when the host has no output.
    pub fn open_default() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(HarkError::NoDefaultOutputDevice)?;
        let device_name = device
            .name()
            .map_err(|e| HarkError::AudioDevice(e.to_string()))?;
        info!(device = device_name.as_str(), "playback device selected");
        Ok(Self {
            device_name,
            speed: 1.0,
        })
    }

    /// Play clips `speed` times faster (pitch rises with it). Values outside
    /// 0.25..=8.0 are clamped; non-finite values mean normal speed.
    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = if speed.is_finite() {
            speed.clamp(0.25, 8.0)
        } else {
            1.0
        };
        self
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }
}

/// Rate to declare for a clip so that converting it to the device rate
/// plays it `speed` times faster.
fn source_rate(sample_rate: u32, speed: f32) -> u32 {
    let scaled = (f64::from(sample_rate) * f64::from(speed)).round();
    (scaled as u32).max(1)
}

#[async_trait]
impl Player for CpalPlayer {
    async fn play(
        &self,
        audio: &AudioChunk,
        ctx: &StageContext,
    ) -> std::result::Result<(), StageError> {
        let stop = Arc::new(AtomicBool::new(false));
        let _guard = StopOnDrop(Arc::clone(&stop));
        let task = tokio::task::spawn_blocking({
            let device_name = self.device_name.clone();
            let audio = audio.clone();
            let speed = self.speed;
            let stop = Arc::clone(&stop);
            move || play_blocking(&device_name, &audio, speed, &stop)
        });
        tokio::pin!(task);

        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = ctx.cancel.cancelled() => {
                stop.store(true, Ordering::SeqCst);
                // Wait for the stream to be torn down before reporting.
                let _ = task.as_mut().await;
                debug!(version = ctx.version, "playback cancelled");
                return Err(StageError::Cancelled(StageKind::Play));
            }
        };

        match joined {
            Ok(result) => result.map_err(|e| StageError::Playback(e.to_string())),
            Err(e) => Err(StageError::Playback(format!("playback thread died: {e}"))),
        }
    }

    fn supports_cancel(&self) -> bool {
        true
    }
}

fn play_blocking(
    device_name: &str,
    audio: &AudioChunk,
    speed: f32,
    stop: &Arc<AtomicBool>,
) -> Result<()> {
    let host = cpal::default_host();
    let device = host
        .output_devices()
        .map_err(|e| HarkError::AudioDevice(e.to_string()))?
        .find(|d| d.name().map(|n| n == device_name).unwrap_or(false))
        .or_else(|| host.default_output_device())
        .ok_or(HarkError::NoDefaultOutputDevice)?;

    let supported = device
        .default_output_config()
        .map_err(|e| HarkError::AudioDevice(e.to_string()))?;
    let config: StreamConfig = supported.config();

    let from_rate = source_rate(audio.sample_rate, speed);
    let samples = RateConverter::new(from_rate, config.sample_rate.0, 1_024)?
        .process_all(&audio.samples);
    let samples = Arc::new(samples);
    let (done_tx, done_rx) = bounded::<()>(1);

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_output::<f32>(&device, &config, &samples, stop, done_tx),
        SampleFormat::I16 => build_output::<i16>(&device, &config, &samples, stop, done_tx),
        SampleFormat::U16 => build_output::<u16>(&device, &config, &samples, stop, done_tx),
        fmt => {
            return Err(HarkError::AudioStream(format!(
                "unsupported playback sample format: {fmt:?}"
            )))
        }
    }?;
    stream
        .play()
        .map_err(|e| HarkError::AudioStream(e.to_string()))?;

    loop {
        match done_rx.recv_timeout(STOP_POLL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) if stop.load(Ordering::SeqCst) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
    drop(stream);
    Ok(())
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    samples: &Arc<Vec<f32>>,
    stop: &Arc<AtomicBool>,
    done: Sender<()>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = usize::from(config.channels.max(1));
    let samples = Arc::clone(samples);
    let stop = Arc::clone(stop);
    let mut position = 0usize;

    device
        .build_output_stream(
            config,
            move |out: &mut [T], _info| {
                let silent = stop.load(Ordering::Relaxed);
                for frame in out.chunks_mut(channels) {
                    let value = if silent {
                        0.0
                    } else {
                        samples.get(position).copied().unwrap_or(0.0)
                    };
                    frame.fill(T::from_sample(value));
                    position += 1;
                }
                if silent || position >= samples.len() {
                    let _ = done.try_send(());
                }
            },
            |err| error!("playback stream error: {err}"),
            None,
        )
        .map_err(|e| HarkError::AudioStream(e.to_string()))
}
