//! Frame-streaming detection pipeline
//!
//! Separates concerns between:
//! - Control/Coordination: connection state machine and session lifecycle
//! - Data Transport: the WebSocket link and single-slot backpressure
//! - Processing: periodic capture/encode ticks and result aggregation
//!
//! # Architecture
//!
//! ```text
//! CaptureHandle → FrameEncoder → FrameScheduler → StreamConnection ⇄ backend
//!                                                        │
//!                                     ResultAggregator ←─┘
//! ```
//!
//! - The scheduler runs in its own task and never waits on the network
//! - Inbound messages are parsed by the connection's driver task and reach
//!   the aggregator in arrival order
//! - Health counters are shared by every task of a session

pub mod aggregator;
pub mod connection;
pub mod coordinator;
pub mod health;
pub mod protocol;
pub mod scheduler;
pub mod state;
pub mod transport;
pub mod types;

pub use aggregator::{AggregateState, ResultAggregator};
pub use connection::{FrameSender, StreamConnection, StreamEvent};
pub use coordinator::{DetectionCoordinator, SessionSnapshot};
pub use health::{HealthSummary, PipelineHealth};
pub use protocol::{FramePreview, ServerEvent, Stats};
pub use scheduler::{FrameProducer, FrameScheduler, FrameSink, TickOutcome};
pub use state::ConnectionState;
pub use transport::{Connector, TransportEvent, TransportLink, WsConnector};
pub use types::{EncodedFrame, InFlightPermit, InFlightSlot, JPEG_MIME};
