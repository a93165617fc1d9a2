//! Transport layer under the stream connection
//!
//! A [`Connector`] establishes the link and spawns the IO tasks. Outbound
//! frames travel through a bounded channel owned by the connection; inbound
//! traffic comes back as an ordered stream of [`TransportEvent`]s.

use async_trait::async_trait;
use async_tungstenite::tokio::connect_async;
use async_tungstenite::tungstenite::Message;
use bytes::Bytes;
use futures_util::StreamExt;
use log::{debug, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::types::EncodedFrame;
use crate::error::ConnectError;

/// Raw event produced by the transport, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Text or binary payload from the backend
    Message(Bytes),
    /// The remote end closed the connection
    Closed,
    /// The link broke
    Error(String),
}

/// A live link returned by a [`Connector`]
pub struct TransportLink {
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TransportLink {
    pub fn new(
        events: mpsc::UnboundedReceiver<TransportEvent>,
        shutdown: CancellationToken,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            events: Some(events),
            shutdown,
            tasks,
        }
    }

    /// Take the inbound event stream; there is exactly one consumer
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.take()
    }

    /// Stop the IO tasks and drop the underlying socket
    pub fn shutdown(&mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Establishes transport links to the streaming endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `url`; the link drains `frames` until it is shut down
    async fn connect(
        &self,
        url: &str,
        frames: mpsc::Receiver<EncodedFrame>,
    ) -> Result<TransportLink, ConnectError>;
}

/// WebSocket transport: one binary message per frame, JSON text back
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &str,
        mut frames: mpsc::Receiver<EncodedFrame>,
    ) -> Result<TransportLink, ConnectError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))?;
        info!("WsConnector: connected to {}", url);

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let shutdown = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Writer: the frame (and its in-flight permit) is dropped only once
        // the sink has accepted the message
        let writer_cancel = shutdown.clone();
        let writer_events = events_tx.clone();
        let writer = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let (payload, permit) = frame.into_parts();
                if let Err(e) = ws_tx.send(Message::binary(payload)).await {
                    let _ = writer_events.send(TransportEvent::Error(e.to_string()));
                    break;
                }
                drop(permit);
            }
            let _ = ws_tx.close(None).await;
            debug!("WsConnector: writer finished");
        });

        let reader_cancel = shutdown.clone();
        let reader = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    msg = ws_rx.next() => msg,
                };
                let event = match msg {
                    Some(Ok(Message::Text(text))) => {
                        TransportEvent::Message(Bytes::copy_from_slice(text.as_bytes()))
                    }
                    Some(Ok(Message::Binary(data))) => {
                        TransportEvent::Message(Bytes::copy_from_slice(&data))
                    }
                    Some(Ok(Message::Close(_))) | None => TransportEvent::Closed,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => TransportEvent::Error(e.to_string()),
                };
                let last = !matches!(event, TransportEvent::Message(_));
                if events_tx.send(event).is_err() || last {
                    break;
                }
            }
            debug!("WsConnector: reader finished");
        });

        Ok(TransportLink::new(events_rx, shutdown, vec![writer, reader]))
    }
}


#[cfg(test)]
pub(crate) mod mock {
    //! In-memory connector for tests

    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// The backend side of a mock link
    pub struct MockPeer {
        /// Frames handed to the transport; never read means never accepted
        pub frames: mpsc::Receiver<EncodedFrame>,
        pub events: mpsc::UnboundedSender<TransportEvent>,
        pub shutdown: CancellationToken,
    }

    impl MockPeer {
        pub fn message(&self, json: &str) {
            self.events
                .send(TransportEvent::Message(Bytes::copy_from_slice(json.as_bytes())))
                .unwrap();
        }

        pub fn stats(&self, count: u32, severity: f64) {
            self.message(&format!(
                r#"{{"pothole_count":{count},"average_severity":{severity:?}}}"#
            ));
        }
    }

    #[derive(Clone, Default)]
    pub struct MockConnector {
        fail: bool,
        delay: Option<Duration>,
        peer: Arc<Mutex<Option<MockPeer>>>,
    }

    impl MockConnector {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every connect attempt is refused
        pub fn refusing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        /// Connect attempts take `delay` before completing
        pub fn delayed(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn take_peer(&self) -> MockPeer {
            self.peer.lock().unwrap().take().expect("no link established")
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(
            &self,
            _url: &str,
            frames: mpsc::Receiver<EncodedFrame>,
        ) -> Result<TransportLink, ConnectError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(ConnectError::Transport("connection refused".into()));
            }
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let shutdown = CancellationToken::new();
            self.peer.lock().unwrap().replace(MockPeer {
                frames,
                events: events_tx,
                shutdown: shutdown.clone(),
            });
            Ok(TransportLink::new(events_rx, shutdown, Vec::new()))
        }
    }
}
