/// Doorbell detection service binary
///
/// Listens to the microphone (or replays a WAV file) and publishes an MQTT
/// event whenever the doorbell rings.

use anyhow::Context;
use doorbell_detector::{
    run_capture_loop, AudioSource, CapturePolicy, Clock, ConfigError, DenseModel,
    DoorbellDetector, EngineConfig, EventPublisher, MqttTransport, StreamClock, WavSource,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Replay this WAV file instead of capturing from a device
const WAV_INPUT_VAR: &str = "DOORBELL_WAV";

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("doorbell_detector=info".parse().expect("static directive")),
        )
        .init();

    info!("Starting doorbell detection service");

    if let Err(e) = run().await {
        error!("Fatal: {:#}", e);
        std::process::exit(1);
    }

    info!("Doorbell detection service stopped");
}

async fn run() -> anyhow::Result<()> {
    let config = EngineConfig::load().context("configuration rejected")?;

    let model = DenseModel::load(&config.model_path).map_err(|e| ConfigError::Model {
        path: config.model_path.clone(),
        reason: e.to_string(),
    })?;
    let (mut source, clock) = open_source(&config)?;
    let mut detector = DoorbellDetector::new(&config, Box::new(model), clock)
        .context("model does not match the feature configuration")?;

    let shutdown = CancellationToken::new();
    let publisher = EventPublisher::spawn(&config.bus, MqttTransport::new(&config.bus));
    publisher.publish_status("online");

    tokio::spawn(wait_for_signal(shutdown.clone()));

    let policy = CapturePolicy::from_config(&config.audio);
    let capture = {
        let publisher = publisher.clone();
        let shutdown = shutdown.clone();
        tokio::task::spawn_blocking(move || {
            run_capture_loop(&mut detector, source.as_mut(), &publisher, &shutdown, policy)
        })
    };

    let result = capture.await.context("capture loop panicked")?;
    shutdown.cancel();

    // The publisher outlives the capture loop so the final messages are flushed
    publisher.publish_status("offline");
    if let Err(e) = publisher.shutdown().await {
        warn!("Publisher did not stop cleanly: {}", e);
    }

    let stats = result.context("capture loop failed")?;
    info!(
        "Processed {} frames ({} passed the gate), analyzed {} segments, {} doorbell event(s)",
        stats.frames_processed, stats.frames_passed_gate, stats.segments_analyzed, stats.events_emitted
    );

    Ok(())
}

type Input = (Box<dyn AudioSource>, Arc<dyn Clock>);

/// Pick the audio input: a WAV replay if requested, otherwise the capture device
///
/// Replays run faster than real time, so their cooldown follows stream time.
fn open_source(config: &EngineConfig) -> anyhow::Result<Input> {
    if let Ok(path) = std::env::var(WAV_INPUT_VAR) {
        info!("Audio input: WAV file {}", path);
        let source: Box<dyn AudioSource> = Box::new(WavSource::new(path, config.audio.clone()));
        let clock: Arc<dyn Clock> = Arc::new(StreamClock::new());
        return Ok((source, clock));
    }

    #[cfg(feature = "capture")]
    {
        info!("Audio input: capture device {:?}", config.audio.device_index);
        let source: Box<dyn AudioSource> =
            Box::new(doorbell_detector::CpalSource::new(config.audio.clone()));
        let clock: Arc<dyn Clock> = Arc::new(doorbell_detector::SystemClock);
        return Ok((source, clock));
    }

    #[cfg(not(feature = "capture"))]
    {
        anyhow::bail!(
            "no audio input: set {} to a WAV file or build with the `capture` feature",
            WAV_INPUT_VAR
        );
    }
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Ctrl-C received"),
                    _ = term.recv() => info!("SIGTERM received"),
                    _ = shutdown.cancelled() => return,
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Ctrl-C received"),
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }

    #[cfg(not(unix))]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received"),
        _ = shutdown.cancelled() => return,
    }

    shutdown.cancel();
}
