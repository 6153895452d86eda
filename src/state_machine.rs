/// Detection state machine
///
/// Debounces classifier scores into events: N consecutive hits arm and fire,
/// a cooldown then suppresses duplicates from the same ring. Time is injected
/// through `Clock` so transitions are testable without sleeping.

use crate::config::DetectionConfig;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Source of monotonic time
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Stream position of the segment about to be scored
    fn follow_stream(&self, _position: Duration) {}
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }

    /// Time advanced since creation
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }
}

/// Clock that tracks stream position instead of wall time
///
/// Used for file replays, which run faster than real time: cooldown is then
/// measured in seconds of audio rather than seconds of processing.
#[derive(Debug)]
pub struct StreamClock {
    origin: Instant,
    position: Mutex<Duration>,
}

impl StreamClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            position: Mutex::new(Duration::ZERO),
        }
    }

    pub fn position(&self) -> Duration {
        *self.position.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for StreamClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StreamClock {
    fn now(&self) -> Instant {
        self.origin + self.position()
    }

    fn follow_stream(&self, position: Duration) {
        *self.position.lock().unwrap_or_else(|e| e.into_inner()) = position;
    }
}

/// Classifier output for one segment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    /// Probability in [0, 1]
    pub confidence: f32,

    /// Stream position of the end of the scored segment
    pub timestamp: Duration,
}

/// Confirmed detection
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionEvent {
    /// Stream position of the segment that confirmed the detection
    pub timestamp: Duration,

    /// Confidence of the confirming score
    pub confidence: f32,

    /// Starts at 1, increases by one per event
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionState {
    Idle,
    /// At least one hit seen, waiting for confirmation
    Armed { hits: u32 },
    /// Event emitted; no new event before `until`
    ///
    /// `until` is `None` when the deadline lies beyond what `Instant` can
    /// represent; only `reset` leaves that state.
    Cooldown { until: Option<Instant> },
}

pub struct DetectionStateMachine {
    config: DetectionConfig,
    state: DetectionState,
    sequence: u64,
}

impl DetectionStateMachine {
    pub fn new(config: DetectionConfig) -> Self {
        debug!(
            "Detection state machine: threshold={}, hits={}, cooldown={}s",
            config.detection_threshold, config.consecutive_detections_required, config.cooldown_period
        );

        Self {
            config,
            state: DetectionState::Idle,
            sequence: 0,
        }
    }

    pub fn state(&self) -> DetectionState {
        self.state
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Number of events emitted since creation or the last reset
    pub fn events_emitted(&self) -> u64 {
        self.sequence
    }

    /// Feed one score; returns an event when the hit count is reached
    pub fn observe(&mut self, score: Score, now: Instant) -> Option<DetectionEvent> {
        let hit = score.confidence >= self.config.detection_threshold;

        if let DetectionState::Cooldown { until } = self.state {
            if until.map_or(true, |until| now < until) {
                trace!(
                    "Cooldown: score {:.3} at {:?} ignored ({:?} left)",
                    score.confidence,
                    score.timestamp,
                    until.map(|until| until - now)
                );
                return None;
            }
            debug!("Cooldown elapsed, back to idle");
            self.state = DetectionState::Idle;
        }

        let hits = match (self.state, hit) {
            (DetectionState::Armed { hits }, true) => hits + 1,
            (_, true) => 1,
            (DetectionState::Armed { hits }, false) => {
                debug!(
                    "Score {:.3} below threshold, dropping {} hit(s)",
                    score.confidence, hits
                );
                self.state = DetectionState::Idle;
                return None;
            }
            (_, false) => return None,
        };

        if hits < self.config.consecutive_detections_required {
            debug!(
                "Hit {}/{} (score {:.3})",
                hits, self.config.consecutive_detections_required, score.confidence
            );
            self.state = DetectionState::Armed { hits };
            return None;
        }

        self.sequence += 1;
        let until = now.checked_add(self.config.cooldown());
        if until.is_none() {
            warn!(
                "Cooldown of {}s cannot be represented, suppressing further events until reset",
                self.config.cooldown_period
            );
        }
        self.state = DetectionState::Cooldown { until };

        info!(
            "Doorbell detected (confidence {:.3}, stream time {:.2}s, event #{})",
            score.confidence,
            score.timestamp.as_secs_f32(),
            self.sequence
        );

        Some(DetectionEvent {
            timestamp: score.timestamp,
            confidence: score.confidence,
            sequence: self.sequence,
        })
    }

    /// Back to Idle with the sequence counter cleared
    pub fn reset(&mut self) {
        self.state = DetectionState::Idle;
        self.sequence = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> DetectionStateMachine {
        DetectionStateMachine::new(DetectionConfig::default())
    }

    fn score(confidence: f32, secs: f32) -> Score {
        Score {
            confidence,
            timestamp: Duration::from_secs_f32(secs),
        }
    }

    /// Feed scores half a second apart, advancing the clock with them
    fn feed(
        sm: &mut DetectionStateMachine,
        clock: &ManualClock,
        confidences: &[f32],
    ) -> Vec<(usize, DetectionEvent)> {
        let mut events = Vec::new();
        for (i, &c) in confidences.iter().enumerate() {
            let t = clock.elapsed().as_secs_f32();
            if let Some(event) = sm.observe(score(c, t), clock.now()) {
                events.push((i, event));
            }
            clock.advance(Duration::from_millis(500));
        }
        events
    }

    #[test]
    fn test_two_hits_emit_one_event() {
        let clock = ManualClock::new();
        let mut sm = machine();

        let events = feed(&mut sm, &clock, &[0.9, 0.9]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 1);
        assert_eq!(events[0].1.sequence, 1);
        assert_eq!(events[0].1.confidence, 0.9);
        assert!(matches!(sm.state(), DetectionState::Cooldown { .. }));
    }

    #[test]
    fn test_miss_resets_hit_counter() {
        let clock = ManualClock::new();
        let mut sm = machine();

        let events = feed(&mut sm, &clock, &[0.9, 0.2, 0.9, 0.9]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 3);
    }

    #[test]
    fn test_miss_returns_to_idle() {
        let clock = ManualClock::new();
        let mut sm = machine();

        sm.observe(score(0.9, 0.0), clock.now());
        assert_eq!(sm.state(), DetectionState::Armed { hits: 1 });
        sm.observe(score(0.1, 0.5), clock.now());
        assert_eq!(sm.state(), DetectionState::Idle);
    }

    #[test]
    fn test_cooldown_suppresses_then_expires() {
        let clock = ManualClock::new();
        let mut sm = machine();

        assert_eq!(feed(&mut sm, &clock, &[0.9, 0.9]).len(), 1);
        let fired_at = clock.elapsed() - Duration::from_millis(500);

        // t + 2s
        clock.advance(fired_at + Duration::from_secs(2) - clock.elapsed());
        assert!(feed(&mut sm, &clock, &[0.9, 0.9]).is_empty());

        // t + 11s
        clock.advance(fired_at + Duration::from_secs(11) - clock.elapsed());
        let events = feed(&mut sm, &clock, &[0.9, 0.9]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.sequence, 2);
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        let clock = ManualClock::new();
        let mut sm = machine();
        assert_eq!(feed(&mut sm, &clock, &[0.5, 0.5]).len(), 1);

        let mut sm = machine();
        let below = 0.5 - f32::EPSILON;
        assert!(feed(&mut sm, &clock, &[below, below, below]).is_empty());
        assert_eq!(sm.state(), DetectionState::Idle);
    }

    #[test]
    fn test_replay_after_reset_is_identical() {
        let scores = [0.1, 0.9, 0.95, 0.3, 0.9, 0.9, 0.9, 0.2, 0.8, 0.7];

        let clock = ManualClock::new();
        let mut sm = machine();
        let first = feed(&mut sm, &clock, &scores);

        sm.reset();
        assert_eq!(sm.state(), DetectionState::Idle);
        assert_eq!(sm.events_emitted(), 0);

        let replay_clock = ManualClock::new();
        let second = feed(&mut sm, &replay_clock, &scores);

        let strip = |events: Vec<(usize, DetectionEvent)>| {
            events
                .into_iter()
                .map(|(i, e)| (i, e.confidence, e.sequence))
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(first), strip(second));
    }

    #[test]
    fn test_zero_cooldown_rearms_immediately() {
        let config = DetectionConfig {
            cooldown_period: 0.0,
            ..DetectionConfig::default()
        };
        let clock = ManualClock::new();
        let mut sm = DetectionStateMachine::new(config);

        let events = feed(&mut sm, &clock, &[0.9, 0.9, 0.9, 0.9]);
        assert_eq!(events.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_single_hit_config() {
        let config = DetectionConfig {
            consecutive_detections_required: 1,
            ..DetectionConfig::default()
        };
        let clock = ManualClock::new();
        let mut sm = DetectionStateMachine::new(config);

        let events = feed(&mut sm, &clock, &[0.2, 0.7]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 1);
    }

    #[test]
    fn test_event_carries_segment_timestamp() {
        let clock = ManualClock::new();
        let mut sm = machine();

        sm.observe(score(0.9, 3.0), clock.now());
        let event = sm.observe(score(0.8, 3.5), clock.now()).unwrap();
        assert_eq!(event.timestamp, Duration::from_secs_f32(3.5));
        assert_eq!(event.confidence, 0.8);
    }

    #[test]
    fn test_huge_cooldown_does_not_panic() {
        let config = DetectionConfig {
            cooldown_period: 1e20,
            ..DetectionConfig::default()
        };
        let clock = ManualClock::new();
        let mut sm = DetectionStateMachine::new(config);

        let events = feed(&mut sm, &clock, &[0.9, 0.9, 0.9, 0.9, 0.9]);
        assert_eq!(events.len(), 1);
        assert_eq!(sm.state(), DetectionState::Cooldown { until: None });

        sm.reset();
        assert_eq!(feed(&mut sm, &clock, &[0.9, 0.9]).len(), 1);
    }

    #[test]
    fn test_stream_clock_measures_cooldown_in_audio_time() {
        let clock = StreamClock::new();
        let mut sm = machine();
        let mut fired = Vec::new();

        // Two rings 15 s apart in the stream, scored back to back
        for secs in [2.0, 2.5, 17.0, 17.5] {
            let position = Duration::from_secs_f32(secs);
            clock.follow_stream(position);
            if let Some(event) = sm.observe(score(0.9, secs), clock.now()) {
                fired.push(event.timestamp);
            }
        }

        assert_eq!(
            fired,
            vec![Duration::from_secs_f32(2.5), Duration::from_secs_f32(17.5)]
        );
        assert_eq!(clock.position(), Duration::from_secs_f32(17.5));
    }

    #[test]
    fn test_wall_clocks_ignore_stream_position() {
        let clock = ManualClock::new();
        let before = clock.now();
        clock.follow_stream(Duration::from_secs(30));
        assert_eq!(clock.now(), before);
    }
}
