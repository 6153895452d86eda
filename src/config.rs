/// Engine configuration
///
/// One immutable value built at startup (defaults, then an optional JSON file,
/// then environment overrides) and passed to each component explicitly.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse environment variable {var}={value:?}: {reason}")]
    Env {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read config file {path}: {reason}")]
    File { path: PathBuf, reason: String },

    #[error("model artifact error ({path}): {reason}")]
    Model { path: PathBuf, reason: String },

    #[error(
        "feature dimension mismatch: extractor produces {extractor} values, \
         classifier expects {classifier}"
    )]
    DimensionMismatch { extractor: usize, classifier: usize },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Upper bound for every seconds-valued setting (one day)
pub const MAX_SECONDS: f32 = 86_400.0;

/// Seconds to `Duration`, saturating instead of panicking on unvalidated input
fn seconds(value: f32) -> Duration {
    Duration::try_from_secs_f32(value).unwrap_or(if value > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

fn check_seconds(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(invalid(field, "must be a non-negative number of seconds"));
    }
    if value > MAX_SECONDS {
        return Err(invalid(
            field,
            format!("must not exceed {} seconds", MAX_SECONDS),
        ));
    }
    Ok(())
}

/// Capture parameters (fixed at configuration time, no negotiation)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz of the stream handed to the engine
    pub sample_rate: u32,

    /// Channel count delivered by the device (down-mixed to mono)
    pub channels: u16,

    /// Samples per SampleFrame
    pub frame_size: usize,

    /// Input device index (None = system default)
    pub device_index: Option<usize>,

    /// Re-open attempts after a device error before giving up
    pub reopen_attempts: u32,

    /// Wait between re-open attempts, in seconds
    pub reopen_backoff: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_size: 512,
            device_index: None,
            reopen_attempts: 5,
            reopen_backoff: 2.0,
        }
    }
}

impl AudioConfig {
    pub fn reopen_backoff(&self) -> Duration {
        seconds(self.reopen_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Peak magnitude (raw i16 units) a frame must exceed to be analyzed
    pub amplitude_threshold: i32,

    /// Smoothing factor of the rolling peak estimate (0, 1]
    pub smoothing: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            amplitude_threshold: 2300,
            smoothing: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Seconds of audio per segment
    pub segment_duration: f32,

    /// Seconds between successive segments
    pub hop_duration: f32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            segment_duration: 1.0,
            hop_duration: 0.5,
        }
    }
}

impl WindowConfig {
    pub fn segment_samples(&self, sample_rate: u32) -> usize {
        (self.segment_duration as f64 * sample_rate as f64).round() as usize
    }

    pub fn hop_samples(&self, sample_rate: u32) -> usize {
        (self.hop_duration as f64 * sample_rate as f64).round() as usize
    }
}

/// Feature-extraction parameters; must match what the classifier was trained with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub n_mfcc: usize,

    /// FFT size of the auxiliary STFT used for spectral contrast and chroma
    pub aux_n_fft: usize,

    pub contrast_bands: usize,
    pub contrast_fmin: f32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            n_fft: 1024,
            hop_length: 512,
            n_mels: 40,
            n_mfcc: 20,
            aux_n_fft: 2048,
            contrast_bands: 6,
            contrast_fmin: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Minimum score counted as a hit (inclusive)
    pub detection_threshold: f32,

    /// Consecutive hits needed to emit an event
    pub consecutive_detections_required: u32,

    /// Seconds after an event during which no new event is emitted
    pub cooldown_period: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            detection_threshold: 0.5,
            consecutive_detections_required: 2,
            cooldown_period: 10.0,
        }
    }
}

impl DetectionConfig {
    pub fn cooldown(&self) -> Duration {
        seconds(self.cooldown_period)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// Fixed sentinel string understood by the relay firmware
    Sentinel,
    /// JSON record with timestamp, probability and sequence
    Json,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub event_topic: String,
    pub status_topic: String,

    /// Topics re-subscribed on every successful connect
    pub control_topics: Vec<String>,

    pub payload_format: PayloadFormat,
    pub event_payload: String,
    pub device_name: String,

    /// Seconds to wait between reconnect attempts
    pub reconnect_backoff: f32,
    pub connect_timeout: f32,
    pub flush_timeout: f32,
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "doorbell_detector_client".to_string(),
            username: None,
            password: None,
            event_topic: "home/doorbell/detect".to_string(),
            status_topic: "home/doorbell/status".to_string(),
            control_topics: Vec::new(),
            payload_format: PayloadFormat::Sentinel,
            event_payload: "doorbell_detected".to_string(),
            device_name: "doorbell_detector".to_string(),
            reconnect_backoff: 5.0,
            connect_timeout: 5.0,
            flush_timeout: 2.0,
            queue_capacity: 16,
        }
    }
}

// Keeps the password out of logs.
impl std::fmt::Debug for BusConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("event_topic", &self.event_topic)
            .field("status_topic", &self.status_topic)
            .field("control_topics", &self.control_topics)
            .field("payload_format", &self.payload_format)
            .field("reconnect_backoff", &self.reconnect_backoff)
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl BusConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        seconds(self.reconnect_backoff)
    }

    pub fn connect_timeout(&self) -> Duration {
        seconds(self.connect_timeout)
    }

    pub fn flush_timeout(&self) -> Duration {
        seconds(self.flush_timeout)
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub audio: AudioConfig,
    pub gate: GateConfig,
    pub window: WindowConfig,
    pub features: FeatureConfig,
    pub detection: DetectionConfig,
    pub bus: BusConfig,

    /// Path to the classifier artifact
    pub model_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            gate: GateConfig::default(),
            window: WindowConfig::default(),
            features: FeatureConfig::default(),
            detection: DetectionConfig::default(),
            bus: BusConfig::default(),
            model_path: PathBuf::from("models/doorbell_model.json"),
        }
    }
}

impl EngineConfig {
    /// Load configuration: defaults, then `DOORBELL_CONFIG` file, then environment
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("DOORBELL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;

        info!("Configuration loaded");
        debug!("{:?}", config);

        Ok(config)
    }

    /// Read a JSON config file (missing keys keep their defaults)
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        serde_json::from_str(&text).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Apply overrides from an environment lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError>
        where
            T::Err: std::fmt::Display,
        {
            value.trim().parse::<T>().map_err(|e| ConfigError::Env {
                var,
                reason: e.to_string(),
                value,
            })
        }

        if let Some(v) = lookup("SAMPLE_RATE") {
            self.audio.sample_rate = parse("SAMPLE_RATE", v)?;
        }
        if let Some(v) = lookup("AUDIO_DEVICE_INDEX") {
            self.audio.device_index = Some(parse("AUDIO_DEVICE_INDEX", v)?);
        }
        if let Some(v) = lookup("AMPLITUDE_THRESHOLD") {
            self.gate.amplitude_threshold = parse("AMPLITUDE_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("DETECTION_THRESHOLD") {
            self.detection.detection_threshold = parse("DETECTION_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("CONSECUTIVE_DETECTIONS") {
            self.detection.consecutive_detections_required = parse("CONSECUTIVE_DETECTIONS", v)?;
        }
        if let Some(v) = lookup("COOLDOWN_PERIOD") {
            self.detection.cooldown_period = parse("COOLDOWN_PERIOD", v)?;
        }
        if let Some(v) = lookup("MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("MQTT_BROKER") {
            self.bus.host = v;
        }
        if let Some(v) = lookup("MQTT_PORT") {
            self.bus.port = parse("MQTT_PORT", v)?;
        }
        if let Some(v) = lookup("MQTT_USERNAME") {
            self.bus.username = Some(v);
        }
        if let Some(v) = lookup("MQTT_PASSWORD") {
            self.bus.password = Some(v);
        }
        if let Some(v) = lookup("MQTT_TOPIC") {
            self.bus.event_topic = v;
        }
        if let Some(v) = lookup("MQTT_STATUS_TOPIC") {
            self.bus.status_topic = v;
        }
        if let Some(v) = lookup("MQTT_CLIENT_ID") {
            self.bus.client_id = v;
        }

        Ok(())
    }

    /// Number of samples per segment
    pub fn segment_samples(&self) -> usize {
        self.window.segment_samples(self.audio.sample_rate)
    }

    /// Number of samples between segments
    pub fn hop_samples(&self) -> usize {
        self.window.hop_samples(self.audio.sample_rate)
    }

    /// Validate every numeric range; the error names the failing field
    pub fn validate(&self) -> Result<(), ConfigError> {
        let audio = &self.audio;
        if audio.sample_rate == 0 {
            return Err(invalid("audio.sample_rate", "must be greater than 0"));
        }
        if audio.channels == 0 || audio.channels > 2 {
            return Err(invalid("audio.channels", "must be 1 or 2"));
        }
        if audio.frame_size == 0 {
            return Err(invalid("audio.frame_size", "must be greater than 0"));
        }
        check_seconds("audio.reopen_backoff", audio.reopen_backoff)?;

        if self.gate.amplitude_threshold < 0 {
            return Err(invalid("gate.amplitude_threshold", "must not be negative"));
        }
        if !(self.gate.smoothing > 0.0 && self.gate.smoothing <= 1.0) {
            return Err(invalid("gate.smoothing", "must be in (0, 1]"));
        }

        let window = &self.window;
        check_seconds("window.segment_duration", window.segment_duration)?;
        check_seconds("window.hop_duration", window.hop_duration)?;
        if window.segment_duration <= 0.0 {
            return Err(invalid("window.segment_duration", "must be greater than 0"));
        }
        if window.hop_duration <= 0.0 {
            return Err(invalid("window.hop_duration", "must be greater than 0"));
        }
        if window.hop_duration > window.segment_duration {
            return Err(invalid(
                "window.hop_duration",
                "must not exceed window.segment_duration",
            ));
        }
        let segment_samples = self.segment_samples();
        if segment_samples == 0 {
            return Err(invalid("window.segment_duration", "is shorter than one sample"));
        }
        if self.hop_samples() == 0 {
            return Err(invalid("window.hop_duration", "is shorter than one sample"));
        }

        let features = &self.features;
        if features.n_fft < 2 {
            return Err(invalid("features.n_fft", "must be at least 2"));
        }
        if features.n_fft > segment_samples {
            return Err(invalid(
                "features.n_fft",
                format!("must not exceed the segment length ({} samples)", segment_samples),
            ));
        }
        if features.aux_n_fft < 2 {
            return Err(invalid("features.aux_n_fft", "must be at least 2"));
        }
        if features.hop_length == 0 {
            return Err(invalid("features.hop_length", "must be greater than 0"));
        }
        if features.n_mels == 0 {
            return Err(invalid("features.n_mels", "must be greater than 0"));
        }
        if features.n_mfcc == 0 || features.n_mfcc > features.n_mels {
            return Err(invalid("features.n_mfcc", "must be between 1 and features.n_mels"));
        }
        if !features.contrast_fmin.is_finite() || features.contrast_fmin <= 0.0 {
            return Err(invalid("features.contrast_fmin", "must be greater than 0"));
        }
        let nyquist = audio.sample_rate as f32 / 2.0;
        let top_edge = features.contrast_fmin * 2f32.powi(features.contrast_bands as i32);
        if top_edge >= nyquist {
            return Err(invalid(
                "features.contrast_bands",
                format!(
                    "top band edge {:.0} Hz must be below the Nyquist frequency {:.0} Hz",
                    top_edge, nyquist
                ),
            ));
        }

        let detection = &self.detection;
        if !(0.0..=1.0).contains(&detection.detection_threshold) {
            return Err(invalid("detection.detection_threshold", "must be between 0.0 and 1.0"));
        }
        if detection.consecutive_detections_required == 0 {
            return Err(invalid(
                "detection.consecutive_detections_required",
                "must be at least 1",
            ));
        }
        check_seconds("detection.cooldown_period", detection.cooldown_period)?;

        let bus = &self.bus;
        if bus.host.trim().is_empty() {
            return Err(invalid("bus.host", "must not be empty"));
        }
        if bus.port == 0 {
            return Err(invalid("bus.port", "must be greater than 0"));
        }
        if bus.event_topic.trim().is_empty() {
            return Err(invalid("bus.event_topic", "must not be empty"));
        }
        if bus.queue_capacity == 0 {
            return Err(invalid("bus.queue_capacity", "must be greater than 0"));
        }
        for (field, secs) in [
            ("bus.reconnect_backoff", bus.reconnect_backoff),
            ("bus.connect_timeout", bus.connect_timeout),
            ("bus.flush_timeout", bus.flush_timeout),
        ] {
            check_seconds(field, secs)?;
        }

        Ok(())
    }
}
