/// Mel module - mel filterbank, decibel scaling, cepstrum and deltas
///
/// Slaney-style mel scale (linear below 1 kHz, logarithmic above) with
/// area-normalized triangular filters, matching the representation the
/// classifier was trained on.

use super::stft::Spectrogram;

/// Floor applied before taking logarithms
pub const AMIN: f32 = 1e-10;

/// Dynamic range kept by `power_to_db`
pub const TOP_DB: f32 = 80.0;

/// Savitzky-Golay window used for the first derivative
pub const DELTA_WIDTH: usize = 9;

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

pub fn hz_to_mel(hz: f64) -> f64 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

pub fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mel
    }
}

/// Triangular mel filters over the positive FFT bins, `weights[m][k]`
pub fn mel_filterbank(sample_rate: u32, n_fft: usize, n_mels: usize) -> Vec<Vec<f32>> {
    let n_bins = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..n_bins)
        .map(|k| k as f64 * sample_rate as f64 / n_fft as f64)
        .collect();

    let mel_min = hz_to_mel(0.0);
    let mel_max = hz_to_mel(sample_rate as f64 / 2.0);
    let points = n_mels + 2;
    let mel_f: Vec<f64> = (0..points)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (points - 1) as f64))
        .collect();

    (0..n_mels)
        .map(|m| {
            let lower_width = mel_f[m + 1] - mel_f[m];
            let upper_width = mel_f[m + 2] - mel_f[m + 1];
            let enorm = 2.0 / (mel_f[m + 2] - mel_f[m]);

            fft_freqs
                .iter()
                .map(|&f| {
                    let lower = (f - mel_f[m]) / lower_width;
                    let upper = (mel_f[m + 2] - f) / upper_width;
                    (lower.min(upper).max(0.0) * enorm) as f32
                })
                .collect()
        })
        .collect()
}

/// Project every spectrogram frame through a filterbank
pub fn apply_filterbank(spectrogram: &Spectrogram, filters: &[Vec<f32>]) -> Spectrogram {
    spectrogram
        .iter()
        .map(|frame| {
            filters
                .iter()
                .map(|filter| filter.iter().zip(frame).map(|(w, x)| w * x).sum())
                .collect()
        })
        .collect()
}

/// Reference level for decibel conversion
#[derive(Debug, Clone, Copy)]
pub enum DbReference {
    /// Maximum value of the whole matrix
    Max,
    Value(f32),
}

/// 10·log10 of a power matrix relative to `reference`, floored at `AMIN`
/// and clipped to `TOP_DB` below the loudest value
pub fn power_to_db(values: &Spectrogram, reference: DbReference) -> Spectrogram {
    let ref_value = match reference {
        DbReference::Max => values
            .iter()
            .flatten()
            .fold(0.0f32, |acc, &v| acc.max(v)),
        DbReference::Value(v) => v.abs(),
    };
    let ref_db = 10.0 * ref_value.max(AMIN).log10();

    let mut db: Spectrogram = values
        .iter()
        .map(|row| row.iter().map(|&v| 10.0 * v.max(AMIN).log10() - ref_db).collect())
        .collect();

    let max_db = db.iter().flatten().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    if max_db.is_finite() {
        let floor = max_db - TOP_DB;
        for v in db.iter_mut().flatten() {
            *v = v.max(floor);
        }
    }

    db
}

/// Orthonormal DCT-II basis, `basis[c][m]`, first `n_out` coefficients of `n_in` inputs
pub fn dct_basis(n_in: usize, n_out: usize) -> Vec<Vec<f32>> {
    let n = n_in as f64;
    (0..n_out)
        .map(|c| {
            let scale = if c == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
            (0..n_in)
                .map(|m| {
                    let angle = std::f64::consts::PI * c as f64 * (2 * m + 1) as f64 / (2.0 * n);
                    (scale * angle.cos()) as f32
                })
                .collect()
        })
        .collect()
}

/// First-order derivative of each column across frames
///
/// Savitzky-Golay (polyorder 1, width 9) in the interior; edge frames reuse
/// the fit of the first/last full window. Sequences shorter than the window
/// fall back to the same regression with edge-clamped neighbours.
pub fn delta(frames: &Spectrogram) -> Spectrogram {
    let n = frames.len();
    if n == 0 {
        return Vec::new();
    }

    let half = DELTA_WIDTH / 2;
    let denom: f32 = (1..=half).map(|k| 2 * k * k).sum::<usize>() as f32;
    let cols = frames[0].len();

    let slope_at = |t: usize, col: usize| -> f32 {
        (1..=half)
            .map(|k| {
                let ahead = frames[(t + k).min(n - 1)][col];
                let behind = frames[t.saturating_sub(k)][col];
                k as f32 * (ahead - behind)
            })
            .sum::<f32>()
            / denom
    };

    (0..n)
        .map(|t| {
            let centre = if n >= DELTA_WIDTH {
                t.clamp(half, n - 1 - half)
            } else {
                t
            };
            (0..cols).map(|col| slope_at(centre, col)).collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mel_scale_round_trip_points() {
        assert_relative_eq!(hz_to_mel(1000.0), 15.0, epsilon = 1e-9);
        assert_relative_eq!(hz_to_mel(500.0), 7.5, epsilon = 1e-9);
        assert_relative_eq!(mel_to_hz(hz_to_mel(4000.0)), 4000.0, epsilon = 1e-6);
    }

    #[test]
    fn test_filterbank_shape_and_coverage() {
        let fb = mel_filterbank(16000, 1024, 40);
        assert_eq!(fb.len(), 40);
        assert!(fb.iter().all(|f| f.len() == 513));
        assert!(fb.iter().all(|f| f.iter().all(|&w| w >= 0.0)));
        // Every filter catches at least one bin at 15.6 Hz resolution
        assert!(fb.iter().all(|f| f.iter().any(|&w| w > 0.0)));
    }

    #[test]
    fn test_power_to_db_reference_max() {
        let db = power_to_db(&vec![vec![1.0, 0.1, 0.0]], DbReference::Max);
        assert_relative_eq!(db[0][0], 0.0);
        assert_relative_eq!(db[0][1], -10.0, epsilon = 1e-4);
        assert_relative_eq!(db[0][2], -80.0, epsilon = 1e-4);
    }

    #[test]
    fn test_power_to_db_silence_is_finite() {
        let db = power_to_db(&vec![vec![0.0; 4]; 3], DbReference::Max);
        assert!(db.iter().flatten().all(|&v| v == 0.0));
    }

    #[test]
    fn test_dct_is_orthonormal() {
        let basis = dct_basis(8, 8);
        for a in 0..8 {
            for b in 0..8 {
                let dot: f32 = basis[a].iter().zip(&basis[b]).map(|(x, y)| x * y).sum();
                let expected = if a == b { 1.0 } else { 0.0 };
                assert_relative_eq!(dot, expected, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_delta_of_linear_ramp_is_constant() {
        let frames: Spectrogram = (0..20).map(|t| vec![2.0 * t as f32]).collect();
        let d = delta(&frames);
        assert!(d.iter().all(|row| (row[0] - 2.0).abs() < 1e-5));
    }

    #[test]
    fn test_delta_of_constant_is_zero() {
        let frames: Spectrogram = vec![vec![3.0, -1.0]; 5];
        let d = delta(&frames);
        assert!(d.iter().flatten().all(|&v| v.abs() < 1e-6));
    }
}
