//! Stream connection to the detection backend
//!
//! Owns one transport link and drives the [`ConnectionState`] machine:
//!
//! ```text
//! Disconnected → Connecting → Open → Closing → Closed
//!                    │          │
//!                    └──────────┴──→ Failed
//! ```
//!
//! Inbound transport events are consumed by a single driver task, parsed,
//! and forwarded in arrival order on the channel returned by
//! [`StreamConnection::take_events`].

use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::health::PipelineHealth;
use super::protocol::ServerEvent;
use super::state::ConnectionState;
use super::transport::{Connector, TransportEvent, TransportLink};
use super::types::EncodedFrame;
use crate::error::{ConnectError, SendError, TransportError};
use crate::utils::lock;

/// Event delivered to the connection's subscriber
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A parsed backend message
    Server(ServerEvent),
    /// A message was dropped as malformed; the connection stays open
    Malformed(String),
    /// The remote end closed the connection
    Closed,
    /// The link broke mid-session
    Failed(TransportError),
}

/// Apply a validated transition, returning whether the state changed
fn advance(state: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    state.send_if_modified(|current| {
        if *current != next && current.can_transition_to(&next) {
            debug!("StreamConnection: {} -> {}", current, next);
            *current = next;
            true
        } else {
            false
        }
    })
}

/// Cloneable handle used to hand frames to the transport
#[derive(Clone)]
pub struct FrameSender {
    frames: mpsc::Sender<EncodedFrame>,
    state: watch::Receiver<ConnectionState>,
    health: Arc<PipelineHealth>,
}

impl FrameSender {
    pub fn is_open(&self) -> bool {
        self.state.borrow().is_open()
    }

    /// Hand a frame to the transport without waiting for delivery
    pub fn send(&self, frame: EncodedFrame) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::NotConnected);
        }
        let size = frame.size();
        match self.frames.try_send(frame) {
            Ok(()) => {
                self.health.record_frame_sent(size);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(SendError::Busy),
            Err(TrySendError::Closed(_)) => Err(SendError::NotConnected),
        }
    }
}

/// One connection per detection session; not reusable once terminal
pub struct StreamConnection {
    url: String,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    health: Arc<PipelineHealth>,
    state: Arc<watch::Sender<ConnectionState>>,
    sender: FrameSender,
    frames_rx: Mutex<Option<mpsc::Receiver<EncodedFrame>>>,
    link: Mutex<Option<TransportLink>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>,
}

impl StreamConnection {
    /// Create a connection in the `Disconnected` state
    pub fn new(
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        connect_timeout: Duration,
        health: Arc<PipelineHealth>,
    ) -> Self {
        // A single slot: the in-flight frame never waits behind another one
        let (frames_tx, frames_rx) = mpsc::channel::<EncodedFrame>(1);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            url: url.into(),
            connector,
            connect_timeout,
            sender: FrameSender {
                frames: frames_tx,
                state: state_rx,
                health: Arc::clone(&health),
            },
            health,
            state: Arc::new(state_tx),
            frames_rx: Mutex::new(Some(frames_rx)),
            link: Mutex::new(None),
            driver: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Get the inbound event channel; only the first caller receives it
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        lock(&self.events_rx).take()
    }

    /// Get a handle for sending frames
    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    /// Establish the transport link
    pub async fn open(&self) -> Result<(), ConnectError> {
        let current = self.state();
        if !advance(&self.state, ConnectionState::Connecting) {
            return Err(ConnectError::InvalidState(current));
        }
        let frames = lock(&self.frames_rx)
            .take()
            .ok_or(ConnectError::InvalidState(ConnectionState::Connecting))?;

        info!("StreamConnection: connecting to {}", self.url);
        let connecting = self.connector.connect(&self.url, frames);
        let result = match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout),
        };

        let mut link = match result {
            Ok(link) => link,
            Err(e) => {
                if advance(&self.state, ConnectionState::Failed) {
                    self.health.record_network_error();
                    warn!("StreamConnection: failed to connect: {}", e);
                    return Err(e);
                }
                return Err(ConnectError::Aborted);
            }
        };

        let mut slot = lock(&self.link);
        if !advance(&self.state, ConnectionState::Open) {
            // Closed while the handshake was in flight
            link.shutdown();
            return Err(ConnectError::Aborted);
        }

        if let Some(events) = link.take_events() {
            let driver = tokio::spawn(drive(
                events,
                Arc::clone(&self.state),
                self.events_tx.clone(),
                Arc::clone(&self.health),
            ));
            lock(&self.driver).replace(driver);
        }
        slot.replace(link);
        info!("StreamConnection: open");
        Ok(())
    }

    /// Hand a frame to the transport; a no-op reporting `NotConnected`
    /// outside of `Open`
    pub fn send(&self, frame: EncodedFrame) -> Result<(), SendError> {
        self.sender.send(frame)
    }

    /// Close the connection and release the transport. Safe to call repeatedly.
    pub fn close(&self) {
        let mut slot = lock(&self.link);
        let closing = advance(&self.state, ConnectionState::Closing);

        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
        }
        if let Some(mut link) = slot.take() {
            link.shutdown();
        }

        if closing {
            advance(&self.state, ConnectionState::Closed);
            info!("StreamConnection: closed");
        }
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consume transport events in order until the link ends
async fn drive(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    out: mpsc::UnboundedSender<StreamEvent>,
    health: Arc<PipelineHealth>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(payload) => {
                if !state.borrow().is_open() {
                    continue;
                }
                match ServerEvent::parse(&payload) {
                    Ok(server_event) => {
                        health.record_message();
                        if server_event.is_empty() {
                            debug!("StreamConnection: message carried no update");
                            continue;
                        }
                        let _ = out.send(StreamEvent::Server(server_event));
                    }
                    Err(e) => {
                        health.record_malformed();
                        warn!("StreamConnection: dropping malformed message: {}", e);
                        let _ = out.send(StreamEvent::Malformed(e.to_string()));
                    }
                }
            }
            TransportEvent::Closed => break,
            TransportEvent::Error(reason) => {
                if advance(&state, ConnectionState::Failed) {
                    health.record_network_error();
                    error!("StreamConnection: transport error: {}", reason);
                    let _ = out.send(StreamEvent::Failed(TransportError(reason)));
                }
                return;
            }
        }
    }

    // Remote close, or the transport went away without a word
    if advance(&state, ConnectionState::Closing) {
        advance(&state, ConnectionState::Closed);
        info!("StreamConnection: closed by remote");
        let _ = out.send(StreamEvent::Closed);
    }
}
