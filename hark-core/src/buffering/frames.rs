//! Fixed-size frame cutting for the per-frame classifier.

/// Cuts an arbitrary-length sample stream into frames of exactly
/// `frame_len` samples. Samples that do not fill a frame are carried over
/// to the next [`push`](FrameSlicer::push).
#[derive(Debug, Clone)]
pub struct FrameSlicer {
    frame_len: usize,
    pending: Vec<f32>,
}

impl FrameSlicer {
    pub fn new(frame_len: usize) -> Self {
        Self {
            frame_len: frame_len.max(1),
            pending: Vec::with_capacity(frame_len * 2),
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Append `samples` and return every complete frame now available.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let complete = self.pending.len() / self.frame_len;
        if complete == 0 {
            return Vec::new();
        }
        let frames = self
            .pending
            .chunks_exact(self.frame_len)
            .map(<[f32]>::to_vec)
            .collect();
        self.pending.drain(..complete * self.frame_len);
        frames
    }

    /// Samples waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
