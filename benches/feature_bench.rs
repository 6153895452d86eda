/// Feature extraction benchmarks
///
/// One segment must be analyzed well within a hop (0.5 s at the defaults).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use doorbell_detector::config::{FeatureConfig, WindowConfig};
use doorbell_detector::{AmplitudeGate, FeatureExtractor, WindowBuffer};
use std::time::Duration;

/// Generate synthetic audio for benchmarking
fn generate_audio(sample_rate: u32, duration_secs: f32) -> Vec<i16> {
    let num_samples = (sample_rate as f32 * duration_secs) as usize;

    // Two-tone chime
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            let s = 0.3 * (2.0 * std::f32::consts::PI * 659.0 * t).sin()
                + 0.2 * (2.0 * std::f32::consts::PI * 523.0 * t).sin();
            (s * i16::MAX as f32) as i16
        })
        .collect()
}

fn bench_feature_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("feature_extraction");

    for &sample_rate in &[16000u32, 22050] {
        let segment_samples = WindowConfig::default().segment_samples(sample_rate);
        let extractor = FeatureExtractor::new(&FeatureConfig::default(), sample_rate, segment_samples);
        let audio = generate_audio(sample_rate, 1.0);

        group.bench_with_input(
            BenchmarkId::new("segment", format!("{}Hz", sample_rate)),
            &audio[..segment_samples],
            |b, samples| {
                b.iter(|| {
                    let vector = extractor.extract_samples(black_box(samples)).unwrap();
                    black_box(vector);
                });
            },
        );
    }

    group.finish();
}

fn bench_extractor_setup(c: &mut Criterion) {
    c.bench_function("extractor_setup", |b| {
        b.iter(|| {
            let extractor = FeatureExtractor::new(black_box(&FeatureConfig::default()), 16000, 16000);
            black_box(extractor);
        });
    });
}

fn bench_front_end(c: &mut Criterion) {
    let audio = generate_audio(16000, 2.0);

    c.bench_function("gate_and_window_2s", |b| {
        b.iter(|| {
            let mut gate = AmplitudeGate::default();
            let mut window = WindowBuffer::new(&WindowConfig::default(), 16000);
            let mut segments = 0;

            for frame in audio.chunks(512) {
                let active = gate.check(frame);
                segments += window.push(black_box(frame), active).count();
            }
            black_box(segments);
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10));
    targets = bench_feature_extraction, bench_extractor_setup, bench_front_end
}
criterion_main!(benches);
