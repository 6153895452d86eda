/// Amplitude gate module
///
/// Cheap peak-amplitude pre-filter in front of the window buffer. Frames whose
/// peak does not exceed the configured threshold are not worth analyzing.

use crate::audio_source::AudioSample;
use crate::config::GateConfig;
use tracing::{debug, trace};

/// Amplitude gate with a smoothed rolling peak estimate
pub struct AmplitudeGate {
    config: GateConfig,
    rolling_peak: f32,
    frames_seen: u64,
    frames_passed: u64,
}

impl AmplitudeGate {
    /// Create a gate from configuration
    pub fn new(config: GateConfig) -> Self {
        debug!("Initializing amplitude gate with config: {:?}", config);

        Self {
            config,
            rolling_peak: 0.0,
            frames_seen: 0,
            frames_passed: 0,
        }
    }

    /// Decide whether a frame is worth analyzing
    ///
    /// Never fails: an empty or all-zero frame simply does not pass.
    pub fn check(&mut self, samples: &[AudioSample]) -> bool {
        let peak = Self::peak(samples);

        let alpha = self.config.smoothing;
        self.rolling_peak = alpha * peak as f32 + (1.0 - alpha) * self.rolling_peak;
        self.frames_seen += 1;

        let passed = i64::from(peak) > i64::from(self.config.amplitude_threshold);
        if passed {
            self.frames_passed += 1;
        }

        trace!(
            "Gate: peak={}, rolling={:.1}, passed={}",
            peak, self.rolling_peak, passed
        );

        passed
    }

    /// Peak absolute sample value (`i16::MIN` maps to 32768 without overflow)
    fn peak(samples: &[AudioSample]) -> u32 {
        samples
            .iter()
            .map(|&s| (s as i32).unsigned_abs())
            .max()
            .unwrap_or(0)
    }

    /// Smoothed peak estimate over recent frames
    pub fn rolling_peak(&self) -> f32 {
        self.rolling_peak
    }

    /// Fraction of frames that passed the gate so far
    pub fn pass_ratio(&self) -> f32 {
        if self.frames_seen == 0 {
            0.0
        } else {
            self.frames_passed as f32 / self.frames_seen as f32
        }
    }

    pub fn reset(&mut self) {
        self.rolling_peak = 0.0;
        self.frames_seen = 0;
        self.frames_passed = 0;
        debug!("Amplitude gate reset");
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }
}

impl Default for AmplitudeGate {
    fn default() -> Self {
        Self::new(GateConfig::default())
    }
}
