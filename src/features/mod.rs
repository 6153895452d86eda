/// Feature extraction module
///
/// Deterministic transform from a segment to the fixed-length vector the
/// classifier was trained on: per-frame mel, cepstral, contrast, centroid and
/// chroma features, summarized by their mean and standard deviation.

pub mod mel;
pub mod spectral;
pub mod stft;

use crate::audio_source::AudioSample;
use crate::config::FeatureConfig;
use crate::window_buffer::Segment;
use mel::DbReference;
use spectral::{SpectralContrast, N_CHROMA};
use stft::{Spectrogram, Stft};
use thiserror::Error;
use tracing::{debug, warn};

/// Fixed-length feature vector
pub type FeatureVector = Vec<f32>;

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("Segment has {actual} samples, extractor expects {expected}")]
    SegmentLength { expected: usize, actual: usize },
}

/// Sizes of the feature groups, in vector order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureLayout {
    pub mel_bands: usize,
    pub mfcc: usize,
    pub delta: usize,
    pub contrast: usize,
    pub centroid: usize,
    pub chroma: usize,
}

impl FeatureLayout {
    pub fn from_config(config: &FeatureConfig) -> Self {
        Self {
            mel_bands: config.n_mels,
            mfcc: config.n_mfcc,
            delta: config.n_mfcc,
            contrast: config.contrast_bands + 1,
            centroid: 1,
            chroma: N_CHROMA,
        }
    }

    /// Every group contributes a mean and a standard deviation per row
    pub fn dimension(&self) -> usize {
        2 * (self.mel_bands + self.mfcc + self.delta + self.contrast + self.centroid + self.chroma)
    }
}

/// Segment to feature-vector transform
pub struct FeatureExtractor {
    sample_rate: u32,
    segment_samples: usize,
    layout: FeatureLayout,
    stft: Stft,
    aux_stft: Stft,
    mel_filters: Vec<Vec<f32>>,
    dct: Vec<Vec<f32>>,
    contrast: SpectralContrast,
    chroma_filters: Vec<Vec<f32>>,
    frequencies: Vec<f32>,
}

impl FeatureExtractor {
    /// Pre-compute windows, filterbanks and FFT plans
    pub fn new(config: &FeatureConfig, sample_rate: u32, segment_samples: usize) -> Self {
        let layout = FeatureLayout::from_config(config);

        debug!(
            "Creating feature extractor: n_fft={}, hop={}, mels={}, mfcc={}, dim={}",
            config.n_fft,
            config.hop_length,
            config.n_mels,
            config.n_mfcc,
            layout.dimension()
        );

        let stft = Stft::new(config.n_fft, config.hop_length);
        let frequencies = stft.frequencies(sample_rate);

        Self {
            sample_rate,
            segment_samples,
            layout,
            mel_filters: mel::mel_filterbank(sample_rate, config.n_fft, config.n_mels),
            dct: mel::dct_basis(config.n_mels, config.n_mfcc),
            contrast: SpectralContrast::new(
                sample_rate,
                config.aux_n_fft,
                config.contrast_bands,
                config.contrast_fmin,
            ),
            chroma_filters: spectral::chroma_filterbank(sample_rate, config.aux_n_fft),
            aux_stft: Stft::new(config.aux_n_fft, config.hop_length),
            stft,
            frequencies,
        }
    }

    /// Length of every vector this extractor produces
    pub fn dimension(&self) -> usize {
        self.layout.dimension()
    }

    pub fn layout(&self) -> FeatureLayout {
        self.layout
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Extract the feature vector of a segment
    pub fn extract(&self, segment: &Segment) -> Result<FeatureVector, FeatureError> {
        self.extract_samples(&segment.samples)
    }

    /// Extract from raw samples (must be exactly one segment long)
    pub fn extract_samples(&self, samples: &[AudioSample]) -> Result<FeatureVector, FeatureError> {
        if samples.len() != self.segment_samples {
            return Err(FeatureError::SegmentLength {
                expected: self.segment_samples,
                actual: samples.len(),
            });
        }

        let signal = Self::normalize(samples);

        let magnitudes = self.stft.magnitudes(&signal);
        let mel_power = mel::apply_filterbank(&stft::power(&magnitudes), &self.mel_filters);
        let mel_db = mel::power_to_db(&mel_power, DbReference::Max);
        let mfcc = mel::apply_filterbank(&mel_db, &self.dct);
        let mfcc_delta = mel::delta(&mfcc);
        let centroid: Spectrogram = spectral::centroid(&magnitudes, &self.frequencies)
            .into_iter()
            .map(|c| vec![c])
            .collect();

        let aux_magnitudes = self.aux_stft.magnitudes(&signal);
        let contrast = self.contrast.compute(&aux_magnitudes);
        let chroma = spectral::chroma(&stft::power(&aux_magnitudes), &self.chroma_filters);

        let mut vector = Vec::with_capacity(self.dimension());
        for (group, rows) in [
            (&mel_db, self.layout.mel_bands),
            (&mfcc, self.layout.mfcc),
            (&mfcc_delta, self.layout.delta),
            (&contrast, self.layout.contrast),
            (&centroid, self.layout.centroid),
            (&chroma, self.layout.chroma),
        ] {
            push_mean_std(&mut vector, group, rows);
        }

        let mut replaced = 0;
        for value in vector.iter_mut().filter(|v| !v.is_finite()) {
            *value = 0.0;
            replaced += 1;
        }
        if replaced > 0 {
            warn!("Replaced {} non-finite feature values with 0", replaced);
        }

        debug_assert_eq!(vector.len(), self.dimension());
        Ok(vector)
    }

    /// Scale to [-1, 1] and peak-normalize; silence stays all zeros
    fn normalize(samples: &[AudioSample]) -> Vec<f32> {
        let scaled: Vec<f32> = samples.iter().map(|&s| s as f32 / 32768.0).collect();
        let peak = scaled.iter().fold(0.0f32, |acc, &s| acc.max(s.abs()));

        if peak > 0.0 {
            scaled.iter().map(|&s| s / peak).collect()
        } else {
            scaled
        }
    }
}

/// Append per-row mean and population std (across frames) of `frames[t][row]`
fn push_mean_std(out: &mut Vec<f32>, frames: &Spectrogram, rows: usize) {
    let n = frames.len().max(1) as f64;

    let means: Vec<f64> = (0..rows)
        .map(|r| frames.iter().map(|f| f[r] as f64).sum::<f64>() / n)
        .collect();

    let stds: Vec<f64> = (0..rows)
        .map(|r| {
            let var = frames
                .iter()
                .map(|f| {
                    let d = f[r] as f64 - means[r];
                    d * d
                })
                .sum::<f64>()
                / n;
            var.sqrt()
        })
        .collect();

    out.extend(means.iter().map(|&m| m as f32));
    out.extend(stds.iter().map(|&s| s as f32));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new(&FeatureConfig::default(), 16000, 16000)
    }

    fn tone(frequency: f32, amplitude: f32) -> Vec<i16> {
        (0..16000)
            .map(|i| {
                let t = i as f32 / 16000.0;
                (amplitude * (2.0 * PI * frequency * t).sin() * i16::MAX as f32) as i16
            })
            .collect()
    }

    #[test]
    fn test_default_dimension() {
        let layout = FeatureLayout::from_config(&FeatureConfig::default());
        // 2 × (40 mel + 20 mfcc + 20 delta + 7 contrast + 1 centroid + 12 chroma)
        assert_eq!(layout.dimension(), 200);
        assert_eq!(extractor().dimension(), 200);
    }

    #[test]
    fn test_silence_produces_finite_vector() {
        let fx = extractor();
        let vector = fx.extract_samples(&vec![0; 16000]).unwrap();

        assert_eq!(vector.len(), fx.dimension());
        assert!(vector.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_tone_produces_finite_vector() {
        let fx = extractor();
        let vector = fx.extract_samples(&tone(1000.0, 0.5)).unwrap();

        assert_eq!(vector.len(), 200);
        assert!(vector.iter().all(|v| v.is_finite()));
        assert!(vector.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let fx = extractor();
        let samples = tone(850.0, 0.3);
        assert_eq!(
            fx.extract_samples(&samples).unwrap(),
            fx.extract_samples(&samples).unwrap()
        );
    }

    #[test]
    fn test_peak_normalization_removes_gain() {
        let fx = extractor();
        let quiet = tone(650.0, 0.25);
        let loud: Vec<i16> = quiet.iter().map(|&s| s * 2).collect();

        assert_eq!(
            fx.extract_samples(&quiet).unwrap(),
            fx.extract_samples(&loud).unwrap()
        );
    }

    #[test]
    fn test_tones_200hz_apart_are_distinguished() {
        let fx = extractor();
        let a = fx.extract_samples(&tone(800.0, 0.5)).unwrap();
        let b = fx.extract_samples(&tone(1000.0, 0.5)).unwrap();

        let centroid_mean = 2 * (40 + 20 + 20 + 7);
        assert!((a[centroid_mean] - b[centroid_mean]).abs() > 100.0);
    }

    #[test]
    fn test_wrong_segment_length_is_an_error() {
        let fx = extractor();
        match fx.extract_samples(&vec![0; 100]) {
            Err(FeatureError::SegmentLength { expected, actual }) => {
                assert_eq!(expected, 16000);
                assert_eq!(actual, 100);
            }
            other => panic!("expected SegmentLength, got {:?}", other),
        }
    }

    #[test]
    fn test_extract_from_segment() {
        let fx = extractor();
        let segment = Segment {
            samples: tone(1200.0, 0.4),
            index: 0,
            end: std::time::Duration::from_secs(1),
        };
        assert_eq!(fx.extract(&segment).unwrap().len(), 200);
    }
}
