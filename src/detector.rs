/// Doorbell detector main module
///
/// Wires the pipeline stages together: gate, window buffer, feature
/// extraction, classification and the detection state machine. Every stage runs
/// synchronously for each frame, in arrival order, before the next frame is
/// accepted.

use crate::audio_source::{reopen_with_backoff, AudioSource, AudioSourceError, SampleFrame};
use crate::classifier::{Classifier, ClassifierError};
use crate::config::{AudioConfig, ConfigError, EngineConfig};
use crate::features::{FeatureError, FeatureExtractor};
use crate::gate::AmplitudeGate;
use crate::publisher::{EventPublisher, PublishOutcome};
use crate::state_machine::{Clock, DetectionEvent, DetectionStateMachine, Score};
use crate::window_buffer::WindowBuffer;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error(transparent)]
    Audio(#[from] AudioSourceError),

    /// Window and extractor disagree on the segment length
    #[error("Pipeline wiring error: {0}")]
    Pipeline(#[from] FeatureError),
}

/// Detector statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectorStats {
    pub frames_processed: u64,
    pub frames_passed_gate: u64,
    pub segments_analyzed: u64,
    pub segments_skipped: u64,
    /// Scores lost to classifier errors
    pub scores_dropped: u64,
    pub events_emitted: u64,
    pub last_score: Option<f32>,
}

/// Main doorbell detector
pub struct DoorbellDetector {
    gate: AmplitudeGate,
    window: WindowBuffer,
    extractor: FeatureExtractor,
    classifier: Box<dyn Classifier>,
    state_machine: DetectionStateMachine,
    clock: Arc<dyn Clock>,
    stats: DetectorStats,
}

impl DoorbellDetector {
    /// Build the pipeline; fails if the classifier expects a different feature dimension
    pub fn new(
        config: &EngineConfig,
        classifier: Box<dyn Classifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let sample_rate = config.audio.sample_rate;
        let window = WindowBuffer::new(&config.window, sample_rate);
        let extractor = FeatureExtractor::new(&config.features, sample_rate, window.segment_samples());

        if extractor.dimension() != classifier.input_dim() {
            return Err(ConfigError::DimensionMismatch {
                extractor: extractor.dimension(),
                classifier: classifier.input_dim(),
            });
        }

        info!("Initializing doorbell detector");
        info!(
            "Sample rate: {} Hz, segment: {} samples, hop: {} samples",
            sample_rate,
            window.segment_samples(),
            window.hop_samples()
        );
        info!("Feature dimension: {}", extractor.dimension());
        info!(
            "Detection: threshold={}, hits={}, cooldown={}s",
            config.detection.detection_threshold,
            config.detection.consecutive_detections_required,
            config.detection.cooldown_period
        );

        Ok(Self {
            gate: AmplitudeGate::new(config.gate.clone()),
            window,
            extractor,
            classifier,
            state_machine: DetectionStateMachine::new(config.detection.clone()),
            clock,
            stats: DetectorStats::default(),
        })
    }

    /// Run one frame through every stage; returns the events it confirmed
    ///
    /// A feature error means the pipeline is miswired and is returned; classifier
    /// failures only drop the affected score.
    pub fn process_frame(&mut self, frame: &SampleFrame) -> Result<Vec<DetectionEvent>, FeatureError> {
        let mut events = Vec::new();

        let active = self.gate.check(&frame.samples);
        self.stats.frames_processed += 1;
        if active {
            self.stats.frames_passed_gate += 1;
        }

        for segment in self.window.push(&frame.samples, active) {
            let features = self.extractor.extract(&segment).map_err(|e| {
                error!("Feature extraction failed for segment {}: {}", segment.index, e);
                e
            })?;
            self.stats.segments_analyzed += 1;

            let confidence = match self.classifier.score(&features) {
                Ok(confidence) => confidence,
                Err(ClassifierError::MalformedOutput(reason)) => {
                    warn!("Dropping score for segment {}: {}", segment.index, reason);
                    self.stats.scores_dropped += 1;
                    continue;
                }
                Err(e) => {
                    error!("Classifier error on segment {}: {}", segment.index, e);
                    self.stats.scores_dropped += 1;
                    continue;
                }
            };

            debug!(
                "Segment {} ({:.2}s): score {:.3}",
                segment.index,
                segment.end.as_secs_f32(),
                confidence
            );
            self.stats.last_score = Some(confidence);

            let score = Score {
                confidence,
                timestamp: segment.end,
            };
            self.clock.follow_stream(segment.end);
            if let Some(event) = self.state_machine.observe(score, self.clock.now()) {
                self.stats.events_emitted += 1;
                events.push(event);
            }
        }

        if self.stats.frames_processed % 1000 == 0 {
            debug!(
                "Processed {} frames, analyzed {} segments, detected {} doorbells",
                self.stats.frames_processed, self.stats.segments_analyzed, self.stats.events_emitted
            );
        }

        Ok(events)
    }

    /// Get current statistics
    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            segments_skipped: self.window.skipped_segments(),
            ..self.stats.clone()
        }
    }

    pub fn feature_dimension(&self) -> usize {
        self.extractor.dimension()
    }

    /// Reset detector state
    pub fn reset(&mut self) {
        self.gate.reset();
        self.window.reset();
        self.state_machine.reset();
        self.stats = DetectorStats::default();
        info!("Detector reset");
    }
}

/// Audio re-open policy of the capture loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapturePolicy {
    pub reopen_attempts: u32,
    pub reopen_backoff: Duration,
}

impl CapturePolicy {
    pub fn from_config(config: &AudioConfig) -> Self {
        Self {
            reopen_attempts: config.reopen_attempts,
            reopen_backoff: config.reopen_backoff(),
        }
    }
}

/// Blocking capture loop
///
/// Pulls frames until the stream ends or shutdown is requested, handing every
/// event to the publisher. A read error triggers a bounded re-open; running out
/// of attempts, an unusable input format or a miswired pipeline is returned as
/// a fatal error.
pub fn run_capture_loop(
    detector: &mut DoorbellDetector,
    source: &mut dyn AudioSource,
    publisher: &EventPublisher,
    shutdown: &CancellationToken,
    policy: CapturePolicy,
) -> Result<DetectorStats, DetectorError> {
    if !reopen(source, shutdown, policy)? {
        return Ok(detector.stats());
    }

    info!("Capture loop running. Listening for the doorbell...");

    loop {
        if shutdown.is_cancelled() {
            info!("Shutdown requested, leaving capture loop");
            break;
        }

        match source.next_frame() {
            Ok(Some(frame)) => {
                trace!("Frame {} ({} samples)", frame.sequence, frame.samples.len());

                for event in detector.process_frame(&frame)? {
                    match publisher.publish_event(&event) {
                        PublishOutcome::Queued => debug!("Event #{} queued", event.sequence),
                        PublishOutcome::Dropped => {
                            warn!("Event #{} dropped by publisher", event.sequence)
                        }
                    }
                }
            }
            Ok(None) => {
                info!("Audio stream ended");
                break;
            }
            Err(e) => {
                warn!("Audio read failed: {}", e);
                if !reopen(source, shutdown, policy)? {
                    break;
                }
            }
        }
    }

    let stats = detector.stats();
    info!(
        "Capture loop stopped: {} frames, {} segments analyzed, {} events",
        stats.frames_processed, stats.segments_analyzed, stats.events_emitted
    );
    Ok(stats)
}

/// Open the source; `Ok(false)` means shutdown interrupted the attempt
fn reopen(
    source: &mut dyn AudioSource,
    shutdown: &CancellationToken,
    policy: CapturePolicy,
) -> Result<bool, AudioSourceError> {
    match reopen_with_backoff(source, policy.reopen_attempts, policy.reopen_backoff, shutdown) {
        Ok(()) => Ok(true),
        Err(AudioSourceError::Cancelled) => Ok(false),
        Err(e) => Err(e),
    }
}
