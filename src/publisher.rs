/// Event publisher
///
/// Delivers detection events to the MQTT bus without ever blocking the capture
/// loop. A worker task owns the transport and runs an explicit connection state
/// machine; callers only push onto a bounded queue.

use crate::config::{BusConfig, PayloadFormat};
use crate::state_machine::DetectionEvent;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often a connected worker checks that the link is still alive
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Broker refused connection: {0}")]
    Refused(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Not connected")]
    NotConnected,
}

#[derive(Error, Debug)]
pub enum PublisherError {
    #[error("Failed to encode payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Publisher worker failed: {0}")]
    Worker(String),
}

/// Connection to the message bus
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BusTransport: Send {
    async fn connect(&mut self) -> Result<(), BusError>;

    /// Cheap liveness check, polled by the worker
    fn is_connected(&self) -> bool;

    async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), BusError>;

    async fn subscribe(&mut self, topic: &str) -> Result<(), BusError>;

    async fn disconnect(&mut self) -> Result<(), BusError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Result of handing a message to the publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted for delivery
    Queued,
    /// Queue full or publisher stopped; the message is lost
    Dropped,
}

#[derive(Debug)]
struct Outgoing {
    topic: String,
    payload: String,
    kind: &'static str,
}

#[derive(Serialize)]
struct EventPayload<'a> {
    event: &'a str,
    timestamp: f64,
    probability: f32,
    sequence: u64,
    device: &'a str,
}

/// Render the payload published for `event`
pub fn event_payload(config: &BusConfig, event: &DetectionEvent) -> Result<String, PublisherError> {
    match config.payload_format {
        PayloadFormat::Sentinel => Ok(config.event_payload.clone()),
        PayloadFormat::Json => {
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default();

            Ok(serde_json::to_string(&EventPayload {
                event: &config.event_payload,
                timestamp,
                probability: event.confidence,
                sequence: event.sequence,
                device: &config.device_name,
            })?)
        }
    }
}

/// Handle to the publisher worker (cheap to clone)
#[derive(Clone)]
pub struct EventPublisher {
    config: Arc<BusConfig>,
    queue: mpsc::Sender<Outgoing>,
    state: watch::Receiver<ConnectionState>,
    nudge: Arc<Notify>,
    stop: CancellationToken,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EventPublisher {
    /// Start the connection worker; must be called inside a tokio runtime
    ///
    /// The worker runs until `shutdown` is called, independent of the capture
    /// loop's lifetime, so messages queued while the engine stops still go out.
    pub fn spawn<T>(config: &BusConfig, transport: T) -> Self
    where
        T: BusTransport + 'static,
    {
        let config = Arc::new(config.clone());
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let nudge = Arc::new(Notify::new());
        let stop = CancellationToken::new();

        info!(
            "Starting event publisher for {}:{} (topic {})",
            config.host, config.port, config.event_topic
        );

        let worker = Worker {
            config: config.clone(),
            transport,
            rx,
            state: state_tx,
            nudge: nudge.clone(),
            stop: stop.clone(),
        };
        let handle = tokio::spawn(worker.run());

        Self {
            config,
            queue,
            state,
            nudge,
            stop,
            worker: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Queue a detection event; never blocks
    pub fn publish_event(&self, event: &DetectionEvent) -> PublishOutcome {
        match event_payload(&self.config, event) {
            Ok(payload) => self.enqueue(Outgoing {
                topic: self.config.event_topic.clone(),
                payload,
                kind: "event",
            }),
            Err(e) => {
                error!("Dropping event #{}: {}", event.sequence, e);
                PublishOutcome::Dropped
            }
        }
    }

    /// Queue a liveness/status message; never blocks
    pub fn publish_status(&self, text: &str) -> PublishOutcome {
        self.enqueue(Outgoing {
            topic: self.config.status_topic.clone(),
            payload: text.to_string(),
            kind: "status",
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stop the worker after flushing queued messages (bounded by `flush_timeout`)
    pub async fn shutdown(&self) -> Result<(), PublisherError> {
        self.stop.cancel();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| PublisherError::Worker(e.to_string())),
            None => Ok(()),
        }
    }

    fn enqueue(&self, message: Outgoing) -> PublishOutcome {
        if self.state() != ConnectionState::Connected {
            self.nudge.notify_one();
        }

        match self.queue.try_send(message) {
            Ok(()) => PublishOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(
                    "Publish queue full, dropping {} for {}",
                    message.kind, message.topic
                );
                PublishOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                warn!(
                    "Publisher stopped, dropping {} for {}",
                    message.kind, message.topic
                );
                PublishOutcome::Dropped
            }
        }
    }
}

enum Served {
    LinkLost,
    Shutdown,
}

struct Worker<T> {
    config: Arc<BusConfig>,
    transport: T,
    rx: mpsc::Receiver<Outgoing>,
    state: watch::Sender<ConnectionState>,
    nudge: Arc<Notify>,
    stop: CancellationToken,
}

impl<T: BusTransport> Worker<T> {
    async fn run(mut self) {
        let mut failures: u64 = 0;

        while !self.stop.is_cancelled() {
            match self.connect().await {
                Ok(()) => {
                    failures = 0;
                    if let Served::Shutdown = self.serve().await {
                        break;
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "Bus connection to {}:{} failed (attempt {}): {}",
                        self.config.host, self.config.port, failures, e
                    );
                }
            }
            self.set_state(ConnectionState::Disconnected);

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_backoff()) => {}
                _ = self.nudge.notified() => debug!("Reconnect requested by publish"),
            }
        }

        self.flush().await;
        if let Err(e) = self.transport.disconnect().await {
            debug!("Disconnect: {}", e);
        }
        self.set_state(ConnectionState::Disconnected);
        info!("Event publisher stopped");
    }

    /// Connect and re-subscribe control topics
    async fn connect(&mut self) -> Result<(), BusError> {
        self.set_state(ConnectionState::Connecting);

        match tokio::time::timeout(self.config.connect_timeout(), self.transport.connect()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(BusError::Connect(format!(
                    "no acknowledgement within {:?}",
                    self.config.connect_timeout()
                )))
            }
        }

        for topic in &self.config.control_topics {
            self.transport.subscribe(topic).await?;
            debug!("Subscribed to {}", topic);
        }

        self.set_state(ConnectionState::Connected);
        info!("Connected to bus at {}:{}", self.config.host, self.config.port);
        Ok(())
    }

    /// Deliver queued messages until the link drops or shutdown is requested
    async fn serve(&mut self) -> Served {
        let mut health = tokio::time::interval(HEALTH_CHECK_INTERVAL);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Served::Shutdown,
                message = self.rx.recv() => match message {
                    Some(message) => {
                        if let Err(e) = self.deliver(&message).await {
                            warn!("Lost {} for {}: {}", message.kind, message.topic, e);
                            return Served::LinkLost;
                        }
                    }
                    None => {
                        debug!("All publisher handles dropped");
                        return Served::Shutdown;
                    }
                },
                _ = health.tick() => {
                    if !self.transport.is_connected() {
                        warn!("Bus connection lost");
                        return Served::LinkLost;
                    }
                }
            }
        }
    }

    async fn deliver(&mut self, message: &Outgoing) -> Result<(), BusError> {
        let publish = self.transport.publish(&message.topic, &message.payload);
        match tokio::time::timeout(self.config.connect_timeout(), publish).await {
            Ok(result) => result?,
            Err(_) => return Err(BusError::Publish("timed out".to_string())),
        }
        info!("Published {} to {}: {}", message.kind, message.topic, message.payload);
        Ok(())
    }

    /// Send whatever is still queued, within `flush_timeout`
    async fn flush(&mut self) {
        self.rx.close();
        let first = match self.rx.try_recv() {
            Ok(message) => message,
            Err(_) => return,
        };

        let flush_timeout = self.config.flush_timeout();
        let mut delivered = 0usize;

        let drained = tokio::time::timeout(flush_timeout, async {
            if !self.transport.is_connected() {
                self.transport.connect().await?;
            }
            self.deliver(&first).await?;
            delivered += 1;
            while let Ok(message) = self.rx.try_recv() {
                self.deliver(&message).await?;
                delivered += 1;
            }
            Ok::<(), BusError>(())
        })
        .await;

        let mut lost = 0usize;
        while self.rx.try_recv().is_ok() {
            lost += 1;
        }

        match drained {
            Ok(Ok(())) => debug!("Flushed {} queued message(s)", delivered),
            Ok(Err(e)) => warn!(
                "Flush failed after {} message(s), {} more lost: {}",
                delivered,
                lost + 1,
                e
            ),
            Err(_) => warn!(
                "Flush timed out after {:?}, {} message(s) lost",
                flush_timeout,
                lost + 1
            ),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }
}

/// MQTT transport backed by rumqttc
pub struct MqttTransport {
    config: BusConfig,
    client: Option<rumqttc::AsyncClient>,
    connected: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
}

impl MqttTransport {
    pub fn new(config: &BusConfig) -> Self {
        Self {
            config: config.clone(),
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            poller: None,
        }
    }

    fn options(&self) -> rumqttc::MqttOptions {
        let mut options =
            rumqttc::MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(60));

        if let Some(username) = &self.config.username {
            options.set_credentials(
                username.clone(),
                self.config.password.clone().unwrap_or_default(),
            );
        }
        options
    }

    fn stop_poller(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

#[async_trait]
impl BusTransport for MqttTransport {
    async fn connect(&mut self) -> Result<(), BusError> {
        use rumqttc::{ConnectReturnCode, Event, Packet};

        self.stop_poller();
        let (client, mut eventloop) = rumqttc::AsyncClient::new(self.options(), 10);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(BusError::Refused(format!("{:?}", ack.code)));
                }
                Ok(_) => continue,
                Err(e) => return Err(BusError::Connect(e.to_string())),
            }
        }

        self.connected.store(true, Ordering::SeqCst);
        let connected = self.connected.clone();
        self.poller = Some(tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(message))) => {
                        info!(
                            "Control message on {}: {}",
                            message.topic,
                            String::from_utf8_lossy(&message.payload)
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT event loop error: {}", e);
                        connected.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }));
        self.client = Some(client);

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), BusError> {
        let client = self.client.as_ref().ok_or(BusError::NotConnected)?;
        client
            .publish(topic, rumqttc::QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), BusError> {
        let client = self.client.as_ref().ok_or(BusError::NotConnected)?;
        client
            .subscribe(topic, rumqttc::QoS::AtLeastOnce)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))
    }

    async fn disconnect(&mut self) -> Result<(), BusError> {
        let result = match self.client.take() {
            Some(client) => client
                .disconnect()
                .await
                .map_err(|e| BusError::Publish(e.to_string())),
            None => Ok(()),
        };
        self.stop_poller();
        result
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.stop_poller();
    }
}
