//! WAV loading for replaying recorded utterances through the listener.

use std::path::Path;

use hound::{SampleFormat, WavReader};

use super::downmix_into;
use crate::buffering::chunk::AudioChunk;
use crate::error::{HarkError, Result};

/// Read any PCM/float WAV file as mono f32 at its native rate.
///
/// # Errors
/// `HarkError::Wav` when the file is missing, malformed or uses a bit depth
/// hound cannot decode.
pub fn read_wav_mono(path: impl AsRef<Path>) -> Result<AudioChunk> {
    let path = path.as_ref();
    let mut reader = WavReader::open(path)
        .map_err(|e| HarkError::Wav(format!("{}: {e}", path.display())))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| HarkError::Wav(e.to_string()))?,
        SampleFormat::Int => {
            let scale = 2f32.powi(i32::from(spec.bits_per_sample) - 1);
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| HarkError::Wav(e.to_string()))?
        }
    };

    let mut mono = Vec::with_capacity(interleaved.len() / usize::from(spec.channels.max(1)));
    downmix_into(&interleaved, usize::from(spec.channels), &mut mono);
    Ok(AudioChunk::new(mono, spec.sample_rate))
}
