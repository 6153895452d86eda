/// Doorbell detector library
///
/// This library provides streaming doorbell-sound detection: amplitude gating,
/// overlapping segment windows, spectral feature extraction, a pluggable
/// classifier, debounced detection events and MQTT delivery.

pub mod audio_source;
pub mod classifier;
pub mod config;
pub mod detector;
pub mod features;
pub mod gate;
pub mod publisher;
pub mod state_machine;
pub mod window_buffer;

// Re-export main types
pub use audio_source::{
    AudioSample, AudioSource, AudioSourceError, LossCounter, SampleFrame, WavSource,
};
pub use classifier::{Classifier, ClassifierError, DenseModel};
pub use config::{ConfigError, EngineConfig, PayloadFormat};
pub use detector::{
    run_capture_loop, CapturePolicy, DetectorError, DetectorStats, DoorbellDetector,
};
pub use features::{FeatureError, FeatureExtractor, FeatureVector};
pub use gate::AmplitudeGate;
pub use publisher::{
    BusError, BusTransport, ConnectionState, EventPublisher, MqttTransport, PublishOutcome,
    PublisherError,
};
pub use state_machine::{
    Clock, DetectionEvent, DetectionState, DetectionStateMachine, ManualClock, Score, StreamClock,
    SystemClock,
};
pub use window_buffer::{Segment, WindowBuffer};

#[cfg(feature = "capture")]
pub use audio_source::CpalSource;
