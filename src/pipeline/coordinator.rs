//! Detection session coordinator
//!
//! Owns the capture, the per-session connection and scheduler, and the
//! aggregate of inbound results. Start/stop operations are sequenced here and
//! every stop path is idempotent.

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::aggregator::{AggregateState, ResultAggregator};
use super::connection::{FrameSender, StreamConnection, StreamEvent};
use super::health::{HealthSummary, PipelineHealth};
use super::protocol::{FramePreview, ServerEvent};
use super::scheduler::{FrameProducer, FrameScheduler, FrameSink};
use super::state::ConnectionState;
use super::transport::Connector;
use super::types::EncodedFrame;
use crate::capture::{CaptureHandle, SourceSpec};
use crate::config::StreamConfig;
use crate::encoder::FrameEncoder;
use crate::error::{SendError, SessionError};
use crate::utils::lock;

const MALFORMED_NOTICE: &str = "Failed to process data from server";

type SharedCapture = Arc<tokio::sync::Mutex<Option<CaptureHandle>>>;

/// Read-only view of a session for renderers
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub capture_id: Option<String>,
    pub capture_active: bool,
    pub connection: Option<ConnectionState>,
    pub detection_active: bool,
    /// Detection started and nothing has come back yet
    pub awaiting_first_result: bool,
    pub aggregate: AggregateState,
    pub preview: Option<FramePreview>,
    pub last_error: Option<String>,
    pub health: HealthSummary,
}

/// State shared with the session's background tasks
struct Shared {
    capture: SharedCapture,
    aggregator: Mutex<ResultAggregator>,
    aggregate_tx: watch::Sender<AggregateState>,
    preview: Mutex<Option<FramePreview>>,
    last_error: Mutex<Option<String>>,
    detection_active: AtomicBool,
    awaiting_first_result: AtomicBool,
    health: Arc<PipelineHealth>,
}

impl Shared {
    fn set_error(&self, message: impl Into<String>) {
        lock(&self.last_error).replace(message.into());
    }

    fn reset_results(&self) {
        let mut aggregator = lock(&self.aggregator);
        aggregator.reset();
        self.aggregate_tx.send_replace(aggregator.snapshot());
        drop(aggregator);
        lock(&self.preview).take();
    }

    fn on_server_event(&self, event: ServerEvent) {
        if let Some(preview) = event.preview {
            lock(&self.preview).replace(preview);
            self.awaiting_first_result.store(false, Ordering::Release);
        }
        if let Some(stats) = event.stats {
            let mut aggregator = lock(&self.aggregator);
            let state = aggregator.apply(stats);
            self.aggregate_tx.send_replace(state);
        }
    }

    fn end_detection(&self) {
        self.detection_active.store(false, Ordering::Release);
        self.awaiting_first_result.store(false, Ordering::Release);
    }
}

/// Resources of one detection run
struct DetectionSession {
    connection: Arc<StreamConnection>,
    scheduler: FrameScheduler,
    events_task: JoinHandle<()>,
}

/// Grabs the current capture frame and encodes it
struct CaptureProducer {
    capture: SharedCapture,
    encoder: FrameEncoder,
}

impl FrameProducer for CaptureProducer {
    fn source_active(&self) -> bool {
        match self.capture.try_lock() {
            Ok(capture) => capture.as_ref().is_some_and(CaptureHandle::is_active),
            // Held by a start/stop in progress; that path decides
            Err(_) => true,
        }
    }

    fn produce(&mut self) -> anyhow::Result<EncodedFrame> {
        let frame = {
            let mut capture = self
                .capture
                .try_lock()
                .map_err(|_| anyhow::anyhow!("capture is locked"))?;
            let capture = capture
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("capture has been released"))?;
            capture.current_frame()?
        };
        self.encoder.encode(&frame)
    }
}

/// Hands frames to the session's connection while detection is active
struct ConnectionSink {
    sender: FrameSender,
    shared: Arc<Shared>,
}

impl FrameSink for ConnectionSink {
    fn ready(&self) -> bool {
        self.shared.detection_active.load(Ordering::Acquire) && self.sender.is_open()
    }

    fn send(&mut self, frame: EncodedFrame) -> Result<(), SendError> {
        self.sender.send(frame)
    }
}

pub struct DetectionCoordinator {
    config: StreamConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    session: Option<DetectionSession>,
}

impl DetectionCoordinator {
    pub fn new(config: StreamConfig, connector: Arc<dyn Connector>) -> Self {
        let (aggregate_tx, _) = watch::channel(AggregateState::default());
        Self {
            config,
            connector,
            shared: Arc::new(Shared {
                capture: Arc::new(tokio::sync::Mutex::new(None)),
                aggregator: Mutex::new(ResultAggregator::new()),
                aggregate_tx,
                preview: Mutex::new(None),
                last_error: Mutex::new(None),
                detection_active: AtomicBool::new(false),
                awaiting_first_result: AtomicBool::new(false),
                health: Arc::new(PipelineHealth::new()),
            }),
            session: None,
        }
    }

    /// Get the session health metrics
    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.shared.health
    }

    /// Watch aggregate updates
    pub fn subscribe(&self) -> watch::Receiver<AggregateState> {
        self.shared.aggregate_tx.subscribe()
    }

    /// Acquire a capture source, replacing the current one
    pub async fn start_capture(&mut self, source: &SourceSpec) -> Result<(), SessionError> {
        self.stop_capture().await;

        let (width, height) = self.config.resolution();
        let handle = source.open(width, height).map_err(|e| {
            error!("Coordinator: failed to start capture {}: {}", source, e);
            self.shared.set_error(e.to_string());
            e
        })?;

        lock(&self.shared.last_error).take();
        self.shared.capture.lock().await.replace(handle);
        Ok(())
    }

    /// Open a fresh connection and start streaming frames
    ///
    /// On failure detection stays inactive and the capture keeps running.
    pub async fn start_detection(&mut self) -> Result<(), SessionError> {
        if self.session.is_some() {
            self.stop_detection().await;
        }

        let capture_active = self
            .shared
            .capture
            .lock()
            .await
            .as_ref()
            .is_some_and(CaptureHandle::is_active);
        if !capture_active {
            self.shared.set_error("Capture is not active");
            return Err(SessionError::CaptureInactive);
        }

        self.shared.reset_results();
        lock(&self.shared.last_error).take();
        self.shared.awaiting_first_result.store(true, Ordering::Release);

        let connection = Arc::new(StreamConnection::new(
            self.config.stream_url.clone(),
            Arc::clone(&self.connector),
            self.config.connect_timeout(),
            Arc::clone(&self.shared.health),
        ));
        let Some(events) = connection.take_events() else {
            self.shared.end_detection();
            return Err(anyhow::anyhow!("connection events already taken").into());
        };

        if let Err(e) = connection.open().await {
            error!("Coordinator: failed to start detection: {}", e);
            self.shared.end_detection();
            self.shared.set_error(format!("Failed to connect: {}", e));
            return Err(e.into());
        }

        self.shared.detection_active.store(true, Ordering::Release);

        let (width, height) = self.config.resolution();
        let encoder = FrameEncoder::new(width, height, self.config.jpeg_quality);
        let (raster_w, raster_h) = encoder.resolution();
        debug!("Coordinator: encoding frames at {}x{}", raster_w, raster_h);
        let producer = CaptureProducer {
            capture: Arc::clone(&self.shared.capture),
            encoder,
        };
        let sink = ConnectionSink {
            sender: connection.sender(),
            shared: Arc::clone(&self.shared),
        };

        let mut scheduler = FrameScheduler::new(Arc::clone(&self.shared.health));
        if let Err(e) = scheduler.start(self.config.tick_interval(), producer, sink) {
            self.shared.end_detection();
            connection.close();
            self.shared.set_error(e.to_string());
            return Err(e.into());
        }
        let cancel = scheduler.cancel_token().unwrap_or_default();

        let events_task = tokio::spawn(handle_events(
            events,
            Arc::clone(&self.shared),
            Arc::clone(&connection),
            cancel,
        ));
        self.session = Some(DetectionSession {
            connection,
            scheduler,
            events_task,
        });
        info!("Coordinator: detection started");
        Ok(())
    }

    /// Stop streaming, close the connection and clear results. Idempotent.
    pub async fn stop_detection(&mut self) {
        self.shared.end_detection();

        if let Some(mut session) = self.session.take() {
            session.scheduler.stop().await;
            session.connection.close();
            session.events_task.abort();
            info!("Coordinator: detection stopped");
        }

        self.shared.reset_results();
    }

    /// Stop detection and release the capture device. Idempotent.
    pub async fn stop_capture(&mut self) {
        self.stop_detection().await;
        if let Some(mut capture) = self.shared.capture.lock().await.take() {
            capture.release();
        }
    }

    /// Release everything, whatever state the session is in
    pub async fn teardown(&mut self) {
        self.stop_detection().await;
        self.stop_capture().await;
    }

    pub fn is_detecting(&self) -> bool {
        self.shared.detection_active.load(Ordering::Acquire)
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let (capture_id, capture_active) = match self.shared.capture.lock().await.as_ref() {
            Some(capture) => (Some(capture.id().to_string()), capture.is_active()),
            None => (None, false),
        };

        SessionSnapshot {
            capture_id,
            capture_active,
            connection: self.session.as_ref().map(|s| s.connection.state()),
            detection_active: self.is_detecting(),
            awaiting_first_result: self.shared.awaiting_first_result.load(Ordering::Acquire),
            aggregate: lock(&self.shared.aggregator).snapshot(),
            preview: lock(&self.shared.preview).clone(),
            last_error: lock(&self.shared.last_error).clone(),
            health: self.shared.health.summary(),
        }
    }
}

/// Apply connection events in arrival order for the lifetime of a session
///
/// Also ends the session when the scheduler stops on its own, which happens
/// once a video source runs out of frames.
async fn handle_events(
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    shared: Arc<Shared>,
    connection: Arc<StreamConnection>,
    scheduler: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = scheduler.cancelled() => {
                if shared.detection_active.load(Ordering::Acquire) {
                    info!("Coordinator: capture source ended, closing connection");
                }
                connection.close();
                shared.end_detection();
                break;
            }
        };

        match event {
            StreamEvent::Server(event) => shared.on_server_event(event),
            StreamEvent::Malformed(reason) => {
                debug!("Coordinator: malformed message: {}", reason);
                shared.awaiting_first_result.store(false, Ordering::Release);
                shared.set_error(MALFORMED_NOTICE);
            }
            StreamEvent::Closed => {
                info!("Coordinator: connection closed by server");
                shared.end_detection();
                scheduler.cancel();
                break;
            }
            StreamEvent::Failed(e) => {
                warn!("Coordinator: {}, tearing down capture", e);
                shared.end_detection();
                shared.set_error(e.to_string());
                scheduler.cancel();
                if let Some(mut capture) = shared.capture.lock().await.take() {
                    capture.release();
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::device::is_acquired;
    use crate::pipeline::transport::TransportEvent;
    use crate::pipeline::transport::mock::{MockConnector, MockPeer};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn frames_dir() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        image::RgbaImage::from_pixel(16, 12, image::Rgba([90, 90, 90, 255]))
            .save(dir.path().join("0000.png"))
            .unwrap();
        dir
    }

    fn source(dir: &Path) -> SourceSpec {
        SourceSpec::Sequence {
            dir: dir.to_path_buf(),
            fps: 10.0,
            looping: true,
        }
    }

    fn coordinator(connector: &MockConnector) -> DetectionCoordinator {
        coordinator_ticking(connector, 200)
    }

    fn coordinator_ticking(connector: &MockConnector, tick_ms: u64) -> DetectionCoordinator {
        let config = StreamConfig {
            stream_url: "ws://backend.test/stream".into(),
            width: Some(32),
            height: Some(24),
            tick_interval_ms: tick_ms,
            ..StreamConfig::default()
        };
        DetectionCoordinator::new(config, Arc::new(connector.clone()))
    }

    async fn detecting(dir: &Path) -> (DetectionCoordinator, MockPeer) {
        let connector = MockConnector::new();
        let mut coordinator = coordinator(&connector);
        coordinator.start_capture(&source(dir)).await.unwrap();
        coordinator.start_detection().await.unwrap();
        (coordinator, connector.take_peer())
    }

    /// Wait until the event task has caught up with `cond`
    async fn until<F>(coordinator: &DetectionCoordinator, cond: F) -> SessionSnapshot
    where
        F: Fn(&SessionSnapshot) -> bool,
    {
        for _ in 0..200 {
            let snapshot = coordinator.snapshot().await;
            if cond(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_end_to_end_aggregate() {
        let dir = frames_dir();
        let (coordinator, peer) = detecting(dir.path()).await;
        assert!(coordinator.snapshot().await.awaiting_first_result);

        peer.stats(2, 1.0);
        peer.stats(2, 2.0);
        peer.stats(4, 5.0);

        let snapshot = until(&coordinator, |s| s.aggregate.last_count == Some(4)).await;
        assert_eq!(snapshot.aggregate.current_average_severity, 5.0);
        assert_eq!(snapshot.aggregate.cumulative_pothole_delta, 2);
        assert_eq!(snapshot.aggregate.severity_sample_count, 1);
        assert_eq!(*coordinator.subscribe().borrow(), snapshot.aggregate);
    }

    #[tokio::test]
    async fn test_frames_reach_the_transport() {
        let dir = frames_dir();
        let (mut coordinator, mut peer) = detecting(dir.path()).await;

        let frame = tokio::time::timeout(Duration::from_secs(2), peer.frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&frame.data[..2], &[0xFF, 0xD8]);
        assert_eq!((frame.width, frame.height), (32, 24));

        coordinator.teardown().await;
    }

    #[tokio::test]
    async fn test_preview_and_malformed_messages() {
        let dir = frames_dir();
        let (coordinator, peer) = detecting(dir.path()).await;

        peer.message("{ not json");
        let snapshot = until(&coordinator, |s| s.last_error.is_some()).await;
        assert_eq!(snapshot.last_error.as_deref(), Some(MALFORMED_NOTICE));
        assert!(!snapshot.awaiting_first_result);
        assert!(snapshot.detection_active);

        peer.message(r#"{"image":"/9j/2Q=="}"#);
        let snapshot = until(&coordinator, |s| s.preview.is_some()).await;
        assert_eq!(&snapshot.preview.unwrap().jpeg[..], &[0xFF, 0xD8, 0xFF, 0xD9]);
    }

    #[tokio::test]
    async fn test_stop_detection_is_idempotent() {
        let dir = frames_dir();
        let (mut coordinator, peer) = detecting(dir.path()).await;
        peer.stats(3, 0.5);
        until(&coordinator, |s| s.aggregate.last_count.is_some()).await;

        coordinator.stop_detection().await;
        let first = coordinator.snapshot().await;
        coordinator.stop_detection().await;
        let second = coordinator.snapshot().await;

        for snapshot in [&first, &second] {
            assert!(!snapshot.detection_active);
            assert!(snapshot.connection.is_none());
            assert!(snapshot.preview.is_none());
            assert_eq!(snapshot.aggregate, AggregateState::default());
            assert!(snapshot.capture_active);
        }
        assert!(peer.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_connect_failure_keeps_capture() {
        let dir = frames_dir();
        let mut coordinator = coordinator(&MockConnector::refusing());
        coordinator.start_capture(&source(dir.path())).await.unwrap();

        let err = coordinator.start_detection().await.unwrap_err();
        assert!(matches!(err, SessionError::Connect(_)));

        let snapshot = coordinator.snapshot().await;
        assert!(!snapshot.detection_active);
        assert!(!snapshot.awaiting_first_result);
        assert!(snapshot.capture_active);
        assert!(snapshot.last_error.unwrap().starts_with("Failed to connect"));
    }

    #[tokio::test]
    async fn test_detection_requires_capture() {
        let mut coordinator = coordinator(&MockConnector::new());
        assert!(matches!(
            coordinator.start_detection().await,
            Err(SessionError::CaptureInactive)
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_tears_down_capture() {
        let dir = frames_dir();
        let (coordinator, peer) = detecting(dir.path()).await;
        let id = source(dir.path()).id();
        assert!(is_acquired(&id));

        peer.events
            .send(TransportEvent::Error("connection reset".into()))
            .unwrap();
        let snapshot = until(&coordinator, |s| s.capture_id.is_none()).await;
        assert!(!snapshot.detection_active);
        assert_eq!(snapshot.connection, Some(ConnectionState::Failed));
        assert!(snapshot.last_error.is_some());
        assert!(!is_acquired(&id));
    }

    #[tokio::test]
    async fn test_remote_close_keeps_capture() {
        let dir = frames_dir();
        let (coordinator, peer) = detecting(dir.path()).await;

        peer.events.send(TransportEvent::Closed).unwrap();
        let snapshot = until(&coordinator, |s| !s.detection_active).await;
        assert_eq!(snapshot.connection, Some(ConnectionState::Closed));
        assert!(snapshot.capture_active);
    }

    #[tokio::test]
    async fn test_source_change_releases_previous_capture() {
        let first = frames_dir();
        let second = frames_dir();
        let mut coordinator = coordinator(&MockConnector::new());

        coordinator.start_capture(&source(first.path())).await.unwrap();
        coordinator.start_capture(&source(second.path())).await.unwrap();
        assert!(!is_acquired(&source(first.path()).id()));
        assert!(is_acquired(&source(second.path()).id()));

        coordinator.teardown().await;
        coordinator.teardown().await;
        assert!(!is_acquired(&source(second.path()).id()));
        assert!(coordinator.snapshot().await.capture_id.is_none());
    }
    #[tokio::test]
    async fn test_video_end_finishes_detection() {
        let dir = frames_dir();
        let connector = MockConnector::new();
        let mut coordinator = coordinator_ticking(&connector, 20);
        let video = SourceSpec::Sequence {
            dir: dir.path().to_path_buf(),
            fps: 10.0,
            looping: false,
        };
        coordinator.start_capture(&video).await.unwrap();
        coordinator.start_detection().await.unwrap();
        let peer = connector.take_peer();

        let snapshot = until(&coordinator, |s| !s.detection_active).await;
        assert!(!snapshot.capture_active);
        assert!(!snapshot.awaiting_first_result);
        assert_eq!(snapshot.connection, Some(ConnectionState::Closed));
        assert!(peer.shutdown.is_cancelled());

        // The user's stop afterwards is still clean
        coordinator.stop_detection().await;
        assert!(coordinator.snapshot().await.connection.is_none());
    }

    #[tokio::test]
    async fn test_stop_detection_without_session() {
        let mut coordinator = coordinator(&MockConnector::new());
        let before = coordinator.snapshot().await;
        coordinator.stop_detection().await;
        assert_eq!(coordinator.snapshot().await, before);
        coordinator.stop_detection().await;
        assert_eq!(coordinator.snapshot().await, before);

        let dir = frames_dir();
        coordinator.start_capture(&source(dir.path())).await.unwrap();
        let before = coordinator.snapshot().await;
        assert!(before.capture_active);
        assert!(!before.detection_active);

        coordinator.stop_detection().await;
        let once = coordinator.snapshot().await;
        coordinator.stop_detection().await;
        let twice = coordinator.snapshot().await;
        assert_eq!(once, before);
        assert_eq!(twice, before);
    }
}
