/// Spectral module - contrast, chroma and centroid
///
/// Spectral contrast separates narrow-band tonal energy (a chime) from diffuse
/// noise per octave band; chroma folds the spectrum onto 12 pitch classes;
/// the centroid tracks overall brightness.

use super::mel::{power_to_db, DbReference};
use super::stft::Spectrogram;

/// Pitch classes per octave
pub const N_CHROMA: usize = 12;

/// Fraction of a band's bins averaged for the peak and the valley
const CONTRAST_QUANTILE: f64 = 0.02;

/// Chroma weighting: Gaussian over octaves centred on octave 5, two octaves wide
const CHROMA_CENTER_OCTAVE: f64 = 5.0;
const CHROMA_OCTAVE_WIDTH: f64 = 2.0;

/// Values below this are treated as zero when normalizing
const TINY: f32 = f32::MIN_POSITIVE;

/// Octave-band spectral contrast
pub struct SpectralContrast {
    /// Inclusive bin range of each band (n_bands + 1 bands)
    bands: Vec<BandSpec>,
}

#[derive(Debug, Clone)]
struct BandSpec {
    /// Bins sorted for the statistics
    rows: std::ops::Range<usize>,
    /// Number of bins averaged at each end
    n_quantile: usize,
}

impl SpectralContrast {
    /// Build band edges `[0, fmin, 2·fmin, …, fmin·2^n_bands]`
    pub fn new(sample_rate: u32, n_fft: usize, n_bands: usize, fmin: f32) -> Self {
        let n_bins = n_fft / 2 + 1;
        let freq = |k: usize| k as f64 * sample_rate as f64 / n_fft as f64;

        let mut edges = vec![0.0f64];
        edges.extend((0..=n_bands).map(|i| fmin as f64 * 2f64.powi(i as i32)));

        let bands = edges
            .windows(2)
            .enumerate()
            .map(|(k, pair)| {
                let (low, high) = (pair[0], pair[1]);
                let inside: Vec<usize> =
                    (0..n_bins).filter(|&b| freq(b) >= low && freq(b) <= high).collect();

                let (mut first, mut last) = match (inside.first(), inside.last()) {
                    (Some(&f), Some(&l)) => (f, l),
                    _ => return BandSpec { rows: 0..0, n_quantile: 1 },
                };

                if k > 0 && first > 0 {
                    first -= 1;
                }
                if k == n_bands {
                    last = n_bins - 1;
                }

                let selected = last - first + 1;
                let n_quantile = ((CONTRAST_QUANTILE * selected as f64).round() as usize).max(1);

                // All but the topmost band drop their last bin
                let end = if k < n_bands { last } else { last + 1 };

                BandSpec {
                    rows: first..end,
                    n_quantile,
                }
            })
            .collect();

        Self { bands }
    }

    pub fn n_rows(&self) -> usize {
        self.bands.len()
    }

    /// Contrast per frame, `out[t][band]`, in dB
    pub fn compute(&self, magnitudes: &Spectrogram) -> Spectrogram {
        let mut peaks = Vec::with_capacity(magnitudes.len());
        let mut valleys = Vec::with_capacity(magnitudes.len());

        for frame in magnitudes {
            let mut peak_row = Vec::with_capacity(self.bands.len());
            let mut valley_row = Vec::with_capacity(self.bands.len());

            for band in &self.bands {
                let mut sub: Vec<f32> = frame[band.rows.clone()].to_vec();
                if sub.is_empty() {
                    peak_row.push(0.0);
                    valley_row.push(0.0);
                    continue;
                }
                sub.sort_by(|a, b| a.total_cmp(b));

                let q = band.n_quantile.min(sub.len());
                valley_row.push(mean(&sub[..q]));
                peak_row.push(mean(&sub[sub.len() - q..]));
            }

            peaks.push(peak_row);
            valleys.push(valley_row);
        }

        let peak_db = power_to_db(&peaks, DbReference::Value(1.0));
        let valley_db = power_to_db(&valleys, DbReference::Value(1.0));

        peak_db
            .iter()
            .zip(&valley_db)
            .map(|(p, v)| p.iter().zip(v).map(|(p, v)| p - v).collect())
            .collect()
    }
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

/// Pitch-class filterbank over the positive FFT bins, `weights[c][k]`, C first
pub fn chroma_filterbank(sample_rate: u32, n_fft: usize) -> Vec<Vec<f32>> {
    let n_chroma = N_CHROMA as f64;
    let a440_base = 440.0 / 16.0;

    // Fractional chroma bin of every FFT bin; 0 Hz sits 1.5 octaves below bin 1
    let mut frqbins: Vec<f64> = (1..n_fft)
        .map(|k| {
            let hz = k as f64 * sample_rate as f64 / n_fft as f64;
            n_chroma * (hz / a440_base).log2()
        })
        .collect();
    let zero_bin = frqbins.first().copied().unwrap_or(0.0) - 1.5 * n_chroma;
    frqbins.insert(0, zero_bin);

    let mut binwidth: Vec<f64> = frqbins
        .windows(2)
        .map(|w| (w[1] - w[0]).max(1.0))
        .collect();
    binwidth.push(1.0);

    let half = (n_chroma / 2.0).round();
    let mut weights = vec![vec![0.0f64; n_fft]; N_CHROMA];
    for (c, row) in weights.iter_mut().enumerate() {
        for (k, w) in row.iter_mut().enumerate() {
            let d = (frqbins[k] - c as f64 + half + 10.0 * n_chroma).rem_euclid(n_chroma) - half;
            *w = (-0.5 * (2.0 * d / binwidth[k]).powi(2)).exp();
        }
    }

    // L2-normalize each column, then weight by octave
    for k in 0..n_fft {
        let norm = weights.iter().map(|row| row[k] * row[k]).sum::<f64>().sqrt();
        let octave_weight =
            (-0.5 * ((frqbins[k] / n_chroma - CHROMA_CENTER_OCTAVE) / CHROMA_OCTAVE_WIDTH).powi(2))
                .exp();
        for row in weights.iter_mut() {
            if norm > f64::MIN_POSITIVE {
                row[k] /= norm;
            }
            row[k] *= octave_weight;
        }
    }

    // Rows start at A; rotate so C comes first
    let n_bins = n_fft / 2 + 1;
    (0..N_CHROMA)
        .map(|c| {
            weights[(c + 3) % N_CHROMA][..n_bins]
                .iter()
                .map(|&w| w as f32)
                .collect()
        })
        .collect()
}

/// Chroma energies per frame, each frame scaled so its strongest class is 1
pub fn chroma(power: &Spectrogram, filters: &[Vec<f32>]) -> Spectrogram {
    power
        .iter()
        .map(|frame| {
            let mut row: Vec<f32> = filters
                .iter()
                .map(|f| f.iter().zip(frame).map(|(w, p)| w * p).sum())
                .collect();

            let peak = row.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));
            if peak > TINY {
                row.iter_mut().for_each(|v| *v /= peak);
            }
            row
        })
        .collect()
}

/// Spectral centroid (Hz) per frame; silent frames give 0
pub fn centroid(magnitudes: &Spectrogram, frequencies: &[f32]) -> Vec<f32> {
    magnitudes
        .iter()
        .map(|frame| {
            let total: f32 = frame.iter().sum();
            if total > TINY {
                frame.iter().zip(frequencies).map(|(m, f)| m * f).sum::<f32>() / total
            } else {
                0.0
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_contrast_band_count() {
        let contrast = SpectralContrast::new(16000, 2048, 6, 100.0);
        assert_eq!(contrast.n_rows(), 7);
    }

    #[test]
    fn test_contrast_of_flat_spectrum_is_zero() {
        let contrast = SpectralContrast::new(16000, 2048, 6, 100.0);
        let flat = vec![vec![1.0f32; 1025]; 3];
        let out = contrast.compute(&flat);
        assert!(out.iter().flatten().all(|&v| v.abs() < 1e-4));
    }

    #[test]
    fn test_contrast_of_tone_is_positive() {
        let contrast = SpectralContrast::new(16000, 2048, 6, 100.0);
        // Strong bin at ~1000 Hz over a quiet floor
        let mut frame = vec![0.001f32; 1025];
        frame[128] = 10.0;
        let out = contrast.compute(&vec![frame]);
        // 1000 Hz falls in the 800-1600 Hz band (index 4)
        assert!(out[0][4] > 30.0);
        assert!(out[0][0].abs() < 1e-4);
    }

    #[test]
    fn test_chroma_filterbank_shape() {
        let fb = chroma_filterbank(16000, 2048);
        assert_eq!(fb.len(), N_CHROMA);
        assert!(fb.iter().all(|row| row.len() == 1025));
        assert!(fb.iter().flatten().all(|w| w.is_finite() && *w >= 0.0));
    }

    #[test]
    fn test_chroma_of_a440_peaks_on_a() {
        let fb = chroma_filterbank(16000, 2048);
        // 440 Hz is bin 56.32 at 7.8125 Hz resolution
        let mut frame = vec![0.0f32; 1025];
        frame[56] = 1.0;
        let out = chroma(&vec![frame], &fb);
        let best = out[0]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(best, 9); // C=0 … A=9
        assert_relative_eq!(out[0][9], 1.0);
    }

    #[test]
    fn test_chroma_of_silence_stays_zero() {
        let fb = chroma_filterbank(16000, 2048);
        let out = chroma(&vec![vec![0.0; 1025]], &fb);
        assert!(out[0].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_centroid() {
        let freqs = vec![0.0, 100.0, 200.0, 300.0];
        let c = centroid(&vec![vec![0.0, 1.0, 0.0, 1.0], vec![0.0; 4]], &freqs);
        assert_relative_eq!(c[0], 200.0);
        assert_relative_eq!(c[1], 0.0);
    }
}
