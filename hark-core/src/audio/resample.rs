//! Sample-rate conversion with a rubato `FastFixedIn` resampler.
//!
//! Capture devices usually run at 44.1 or 48 kHz while the frame classifier
//! wants one of its fixed rates (16 kHz by default); playback goes the other
//! way. `RateConverter` handles both on non-real-time threads.
//!
//! When the two rates match it is a passthrough and no rubato session is
//! created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use crate::error::{HarkError, Result};

/// Streaming mono f32 converter between two fixed rates.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Input carried over until a full block is available.
    pending: Vec<f32>,
    /// Input samples rubato consumes per call.
    block: usize,
    output: Vec<Vec<f32>>,
    from_rate: u32,
    to_rate: u32,
}

impl RateConverter {
    /// # Errors
    /// `HarkError::Resample` for a zero rate or block size, or when rubato
    /// rejects the ratio.
    pub fn new(from_rate: u32, to_rate: u32, block: usize) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 || block == 0 {
            return Err(HarkError::Resample(format!(
                "invalid conversion {from_rate} Hz -> {to_rate} Hz (block {block})"
            )));
        }
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                block,
                output: Vec::new(),
                from_rate,
                to_rate,
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            f64::from(to_rate) / f64::from(from_rate),
            1.0,
            PolynomialDegree::Cubic,
            block,
            1,
        )
        .map_err(|e| HarkError::Resample(e.to_string()))?;
        let output = vec![vec![0f32; resampler.output_frames_max()]; 1];
        debug!(from_rate, to_rate, block, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::with_capacity(block * 2),
            block,
            output,
            from_rate,
            to_rate,
        })
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Convert `samples`, returning whatever output full blocks produced.
    /// A partial block is kept for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return samples.to_vec();
        };
        self.pending.extend_from_slice(samples);

        let mut converted = Vec::new();
        let mut consumed = 0;
        while self.pending.len() - consumed >= self.block {
            let input = &self.pending[consumed..consumed + self.block];
            match resampler.process_into_buffer(&[input], &mut self.output, None) {
                Ok((_, produced)) => converted.extend_from_slice(&self.output[0][..produced]),
                Err(e) => error!("resampler process error: {e}"),
            }
            consumed += self.block;
        }
        self.pending.drain(..consumed);
        converted
    }

    /// Convert a complete clip, zero-padding the last partial block so no
    /// input is lost.
    pub fn process_all(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return samples.to_vec();
        }
        let mut converted = self.process(samples);
        if !self.pending.is_empty() {
            let tail = self.pending.len();
            let padding = vec![0.0; self.block - tail];
            let flushed = self.process(&padding);
            // Keep only the share of the padded block that came from real input.
            let keep = (flushed.len() * tail).div_ceil(self.block);
            converted.extend_from_slice(&flushed[..keep.min(flushed.len())]);
        }
        converted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_returns_input() {
        let mut rc = RateConverter::new(16_000, 16_000, 960).expect("converter");
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        assert_eq!(rc.process(&samples), samples);
    }

    #[test]
    fn downsampling_48k_to_16k_divides_length_by_three() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).expect("converter");
        let out = rc.process(&vec![0.0f32; 960]);
        assert!(
            (out.len() as isize - 320).unsigned_abs() <= 10,
            "output len={}",
            out.len()
        );
    }

    #[test]
    fn partial_blocks_accumulate() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).expect("converter");
        assert!(rc.process(&vec![0.0f32; 500]).is_empty());
        assert!(!rc.process(&vec![0.0f32; 500]).is_empty());
    }

    #[test]
    fn process_all_keeps_the_tail() {
        let mut rc = RateConverter::new(16_000, 48_000, 320).expect("converter");
        let out = rc.process_all(&vec![0.1f32; 1_000]);
        // 1 000 samples at 16 kHz is 3 000 at 48 kHz.
        assert!(
            (out.len() as isize - 3_000).unsigned_abs() <= 40,
            "output len={}",
            out.len()
        );
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(matches!(
            RateConverter::new(0, 16_000, 960),
            Err(HarkError::Resample(_))
        ));
    }
}
