/// STFT module - short-time Fourier transform
///
/// Centered framing (n_fft/2 zeros on both sides), periodic Hann window and a
/// forward FFT planned once per instance. Produces the magnitude spectrogram
/// as one row of n_fft/2 + 1 bins per analysis frame.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Magnitude spectrogram, `frames[t][k]`
pub type Spectrogram = Vec<Vec<f32>>;

pub struct Stft {
    n_fft: usize,
    hop_length: usize,
    /// Periodic Hann window (pre-computed)
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl Stft {
    pub fn new(n_fft: usize, hop_length: usize) -> Self {
        let window = (0..n_fft)
            .map(|i| 0.5 - 0.5 * ((2.0 * std::f32::consts::PI * i as f32) / n_fft as f32).cos())
            .collect();

        let fft = FftPlanner::new().plan_fft_forward(n_fft);

        Self {
            n_fft,
            hop_length,
            window,
            fft,
        }
    }

    pub fn n_fft(&self) -> usize {
        self.n_fft
    }

    /// Bins per frame (positive frequencies only)
    pub fn n_bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Number of frames produced for a signal of `len` samples
    pub fn frame_count(&self, len: usize) -> usize {
        let padded = len + 2 * (self.n_fft / 2);
        1 + padded.saturating_sub(self.n_fft) / self.hop_length
    }

    /// Centre frequency in Hz of every bin
    pub fn frequencies(&self, sample_rate: u32) -> Vec<f32> {
        (0..self.n_bins())
            .map(|k| k as f32 * sample_rate as f32 / self.n_fft as f32)
            .collect()
    }

    /// Magnitude spectrogram of a real signal
    pub fn magnitudes(&self, signal: &[f32]) -> Spectrogram {
        let pad = self.n_fft / 2;
        let mut padded = vec![0.0f32; pad];
        padded.extend_from_slice(signal);
        padded.resize(padded.len() + pad, 0.0);
        if padded.len() < self.n_fft {
            padded.resize(self.n_fft, 0.0);
        }

        let n_frames = self.frame_count(signal.len());
        let mut buffer = vec![Complex::new(0.0f32, 0.0); self.n_fft];
        let mut scratch = vec![Complex::new(0.0f32, 0.0); self.fft.get_inplace_scratch_len()];
        let mut frames = Vec::with_capacity(n_frames);

        for t in 0..n_frames {
            let start = t * self.hop_length;
            let chunk = &padded[start..start + self.n_fft];

            for ((slot, &sample), &w) in buffer.iter_mut().zip(chunk).zip(&self.window) {
                *slot = Complex::new(sample * w, 0.0);
            }

            self.fft.process_with_scratch(&mut buffer, &mut scratch);

            frames.push(buffer[..self.n_bins()].iter().map(|c| c.norm()).collect());
        }

        frames
    }
}

/// Element-wise square of a magnitude spectrogram
pub fn power(magnitudes: &Spectrogram) -> Spectrogram {
    magnitudes
        .iter()
        .map(|frame| frame.iter().map(|&m| m * m).collect())
        .collect()
}
