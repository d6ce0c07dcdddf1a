//! Audio I/O: microphone capture, device playback, WAV loading, resampling.
//!
//! # Capture callback constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It must not block or do I/O, so it only downmixes into a reused scratch
//! buffer and pushes into the SPSC ring (`push_slice` is wait-free). Samples
//! that do not fit are counted, not logged; the listener reports them.
//!
//! # Threading
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `AudioCapture` must be created and dropped on the same thread; the
//! engine does both inside its `spawn_blocking` listener thread.

pub mod device;
#[cfg(feature = "audio-cpal")]
pub mod playback;
pub mod resample;
pub mod wav;

#[cfg(feature = "audio-cpal")]
pub use playback::CpalPlayer;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

use crate::buffering::AudioProducer;
#[cfg(feature = "audio-cpal")]
use crate::buffering::Producer;
use crate::error::{HarkError, Result};

/// Average interleaved frames of `data` into mono, reusing `out`.
pub fn downmix_into<T>(data: &[T], channels: usize, out: &mut Vec<f32>)
where
    T: Copy + Into<f64>,
{
    let channels = channels.max(1);
    out.clear();
    out.extend(data.chunks_exact(channels).map(|frame| {
        let sum: f64 = frame.iter().map(|&s| s.into()).sum();
        (sum / channels as f64) as f32
    }));
}

/// Handle to an active capture stream. Not `Send`.
pub struct AudioCapture {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicUsize>,
    /// Sample rate reported by the device (Hz).
    pub sample_rate: u32,
}

impl AudioCapture {
    /// Open `preferred_device_name` if it exists, otherwise the system
    /// default input, otherwise the most microphone-like input.
    ///
    /// # Errors
    /// `HarkError::NoDefaultInputDevice` when there is no input at all,
    /// `HarkError::AudioDevice`/`AudioStream` when cpal refuses the device.
    #[cfg(feature = "audio-cpal")]
    pub fn open(
        producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        let host = cpal::default_host();
        let device = select_input(&host, preferred_device_name)?;
        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| HarkError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let config: StreamConfig = supported.config();
        info!(sample_rate, channels = config.channels, "capture config selected");

        let dropped = Arc::new(AtomicUsize::new(0));
        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_capture::<f32>(&device, &config, producer, &running, &dropped),
            SampleFormat::I16 => build_capture::<i16>(&device, &config, producer, &running, &dropped),
            SampleFormat::U8 => build_capture::<u8>(&device, &config, producer, &running, &dropped),
            fmt => {
                return Err(HarkError::AudioStream(format!(
                    "unsupported capture sample format: {fmt:?}"
                )))
            }
        }?;
        stream
            .play()
            .map_err(|e| HarkError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            dropped,
            sample_rate,
        })
    }

    /// Stub when the `audio-cpal` feature is disabled.
    #[cfg(not(feature = "audio-cpal"))]
    pub fn open(
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        Err(HarkError::AudioStream(
            "compiled without the audio-cpal feature".into(),
        ))
    }

    /// Counter of samples the callback could not push into the full ring.
    pub fn dropped_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.dropped)
    }

    /// Signal the callback to no-op from its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(feature = "audio-cpal")]
fn select_input(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
    if let Some(wanted) = preferred {
        let found = host
            .input_devices()
            .map_err(|e| HarkError::AudioDevice(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false));
        match found {
            Some(device) => return Ok(device),
            None => warn!("preferred input device '{wanted}' not found, falling back"),
        }
    }
    if let Some(device) = host.default_input_device() {
        return Ok(device);
    }

    let devices: Vec<(String, cpal::Device)> = host
        .input_devices()
        .map_err(|e| HarkError::AudioDevice(e.to_string()))?
        .filter_map(|d| d.name().ok().map(|n| (n, d)))
        .collect();
    let best = device::best_input_name(devices.iter().map(|(name, _)| name.as_str()))
        .map(str::to_owned)
        .ok_or(HarkError::NoDefaultInputDevice)?;
    warn!("no default input device, using '{best}'");
    devices
        .into_iter()
        .find(|(name, _)| *name == best)
        .map(|(_, d)| d)
        .ok_or(HarkError::NoDefaultInputDevice)
}

#[cfg(feature = "audio-cpal")]
fn build_capture<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: &Arc<AtomicBool>,
    dropped: &Arc<AtomicUsize>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels);
    let running = Arc::clone(running);
    let dropped = Arc::clone(dropped);
    let mut converted: Vec<f32> = Vec::new();
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                converted.clear();
                converted.extend(data.iter().map(|s| s.to_sample::<f32>()));
                let samples = if channels == 1 {
                    &converted
                } else {
                    downmix_into(&converted, channels, &mut mono);
                    &mono
                };
                let written = producer.push_slice(samples);
                if written < samples.len() {
                    dropped.fetch_add(samples.len() - written, Ordering::Relaxed);
                }
            },
            |err| error!("capture stream error: {err}"),
            None,
        )
        .map_err(|e| HarkError::AudioStream(e.to_string()))
}
