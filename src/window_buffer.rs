/// Window buffer module
///
/// Keeps the most recent `segment_duration` seconds of audio in a ring buffer
/// and cuts a new overlapping segment every `hop_duration` seconds. The ring
/// starts full of zeros, so the first segments are left zero-padded instead of
/// being withheld.

use crate::audio_source::AudioSample;
use crate::config::WindowConfig;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use std::collections::VecDeque;
use std::ops::Range;
use std::time::Duration;
use tracing::{debug, trace};

/// One fixed-length analysis window
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Exactly `segment_samples` samples, oldest first
    pub samples: Vec<AudioSample>,

    /// Position in the sequence of all cut segments (skipped ones included)
    pub index: u64,

    /// Stream position of the segment's last sample
    pub end: Duration,
}

/// Ring of recent samples producing overlapping segments
pub struct WindowBuffer {
    history: HeapRb<AudioSample>,
    pending: VecDeque<AudioSample>,
    /// Sample spans (absolute positions) of frames that passed the gate
    active_spans: VecDeque<Range<u64>>,
    segment_samples: usize,
    hop_samples: usize,
    sample_rate: u32,
    received: u64,
    consumed: u64,
    hop_fill: usize,
    next_index: u64,
    skipped: u64,
}

impl WindowBuffer {
    /// Create a buffer for the given window geometry
    pub fn new(config: &WindowConfig, sample_rate: u32) -> Self {
        let segment_samples = config.segment_samples(sample_rate).max(1);
        let hop_samples = config.hop_samples(sample_rate).max(1);

        debug!(
            "Creating window buffer: segment={} samples, hop={} samples",
            segment_samples, hop_samples
        );

        Self {
            history: Self::zeroed_ring(segment_samples),
            pending: VecDeque::with_capacity(hop_samples),
            active_spans: VecDeque::new(),
            segment_samples,
            hop_samples,
            sample_rate,
            received: 0,
            consumed: 0,
            hop_fill: 0,
            next_index: 0,
            skipped: 0,
        }
    }

    fn zeroed_ring(capacity: usize) -> HeapRb<AudioSample> {
        let mut ring = HeapRb::<AudioSample>::new(capacity);
        ring.push_iter_overwrite(std::iter::repeat(0).take(capacity));
        ring
    }

    /// Append a frame; `active` says whether it passed the amplitude gate
    ///
    /// The returned iterator cuts segments lazily. Dropping it early keeps the
    /// remaining samples queued for the next call.
    pub fn push(&mut self, samples: &[AudioSample], active: bool) -> Segments<'_> {
        let start = self.received;
        self.received += samples.len() as u64;
        self.pending.extend(samples.iter().copied());

        if active && !samples.is_empty() {
            self.active_spans.push_back(start..self.received);
        }

        Segments { buffer: self }
    }

    fn next_segment(&mut self) -> Option<Segment> {
        loop {
            if self.pending.is_empty() {
                return None;
            }

            let take = (self.hop_samples - self.hop_fill).min(self.pending.len());
            self.history.push_iter_overwrite(self.pending.drain(..take));
            self.consumed += take as u64;
            self.hop_fill += take;

            if self.hop_fill < self.hop_samples {
                return None;
            }
            self.hop_fill = 0;

            let index = self.next_index;
            self.next_index += 1;

            let end = self.consumed;
            let start = end.saturating_sub(self.segment_samples as u64);

            while self
                .active_spans
                .front()
                .map_or(false, |span| span.end <= start)
            {
                self.active_spans.pop_front();
            }

            let active = self
                .active_spans
                .iter()
                .any(|span| span.start < end && span.end > start);

            if !active {
                self.skipped += 1;
                trace!("Segment {} skipped: no frame passed the gate", index);
                continue;
            }

            let samples: Vec<AudioSample> = self.history.iter().copied().collect();
            debug_assert_eq!(samples.len(), self.segment_samples);

            return Some(Segment {
                samples,
                index,
                end: Duration::from_secs_f64(end as f64 / self.sample_rate as f64),
            });
        }
    }

    /// Samples per segment
    pub fn segment_samples(&self) -> usize {
        self.segment_samples
    }

    /// Samples between segments
    pub fn hop_samples(&self) -> usize {
        self.hop_samples
    }

    /// Samples received but not yet moved into the ring
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Segments dropped because no constituent frame passed the gate
    pub fn skipped_segments(&self) -> u64 {
        self.skipped
    }

    /// Current ring occupancy (always the segment length)
    pub fn len(&self) -> usize {
        self.history.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Restore the initial zero-padded state
    pub fn reset(&mut self) {
        self.history = Self::zeroed_ring(self.segment_samples);
        self.pending.clear();
        self.active_spans.clear();
        self.received = 0;
        self.consumed = 0;
        self.hop_fill = 0;
        self.next_index = 0;
        self.skipped = 0;
        debug!("Window buffer reset");
    }
}

/// Lazy sequence of segments completed by a `push`
pub struct Segments<'a> {
    buffer: &'a mut WindowBuffer,
}

impl Iterator for Segments<'_> {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        self.buffer.next_segment()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn small_window() -> WindowBuffer {
        // 10-sample segments, 5-sample hop
        let config = WindowConfig {
            segment_duration: 1.0,
            hop_duration: 0.5,
        };
        WindowBuffer::new(&config, 10)
    }

    #[test]
    fn test_buffer_creation() {
        let buffer = WindowBuffer::new(&WindowConfig::default(), 16000);
        assert_eq!(buffer.segment_samples(), 16000);
        assert_eq!(buffer.hop_samples(), 8000);
        assert_eq!(buffer.len(), 16000);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_first_segment_is_left_zero_padded() {
        let mut buffer = small_window();
        let segments: Vec<Segment> = buffer.push(&[1, 2, 3, 4, 5], true).collect();

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].samples, vec![0, 0, 0, 0, 0, 1, 2, 3, 4, 5]);
        assert_eq!(segments[0].index, 0);
        assert_relative_eq!(segments[0].end.as_secs_f64(), 0.5);
    }

    #[test]
    fn test_segments_overlap_by_segment_minus_hop() {
        let mut buffer = small_window();
        let input: Vec<i16> = (1..=15).collect();
        let segments: Vec<Segment> = buffer.push(&input, true).collect();

        assert_eq!(segments.len(), 3);
        assert_eq!(segments[1].samples, (1..=10).collect::<Vec<i16>>());
        assert_eq!(segments[2].samples, (6..=15).collect::<Vec<i16>>());
    }

    #[test]
    fn test_partial_hop_waits_for_more_input() {
        let mut buffer = small_window();
        assert_eq!(buffer.push(&[1, 2, 3], true).count(), 0);
        assert_eq!(buffer.push(&[4, 5], true).count(), 1);
    }

    #[test]
    fn test_segment_length_is_constant() {
        let mut buffer = WindowBuffer::new(&WindowConfig::default(), 16000);
        let frame = vec![5000i16; 512];

        let mut count = 0;
        for _ in 0..100 {
            for segment in buffer.push(&frame, true) {
                assert_eq!(segment.samples.len(), 16000);
                count += 1;
            }
        }

        // 51200 samples / 8000-sample hop
        assert_eq!(count, 6);
    }

    #[test]
    fn test_inactive_segments_are_skipped() {
        let mut buffer = small_window();

        assert_eq!(buffer.push(&[0; 5], false).count(), 0);
        assert_eq!(buffer.skipped_segments(), 1);

        // One active frame keeps every segment it overlaps
        let segments: Vec<Segment> = buffer.push(&[9; 5], true).collect();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].index, 1);

        let segments: Vec<Segment> = buffer.push(&[0; 5], false).collect();
        assert_eq!(segments.len(), 1, "active frame still inside the window");

        assert_eq!(buffer.push(&[0; 5], false).count(), 0);
        assert_eq!(buffer.skipped_segments(), 2);
    }

    #[test]
    fn test_restartable_iteration() {
        let mut buffer = small_window();
        let input: Vec<i16> = (1..=15).collect();

        {
            let mut segments = buffer.push(&input, true);
            assert!(segments.next().is_some());
            // dropped with samples still pending
        }
        assert_eq!(buffer.pending_len(), 10);

        let rest: Vec<Segment> = buffer.push(&[], false).collect();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].samples, (6..=15).collect::<Vec<i16>>());
    }

    #[test]
    fn test_reset() {
        let mut buffer = small_window();
        buffer.push(&[7; 12], true).count();
        buffer.reset();

        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(buffer.skipped_segments(), 0);

        let segments: Vec<Segment> = buffer.push(&[1; 5], true).collect();
        assert_eq!(segments[0].samples[..5], [0; 5]);
        assert_eq!(segments[0].index, 0);
    }
}
