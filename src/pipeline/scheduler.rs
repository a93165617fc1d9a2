//! Periodic frame driver
//!
//! Every tick pulls one frame from a [`FrameProducer`] and hands it to a
//! [`FrameSink`]. Ticks never queue: when the sink is not ready or the
//! previous frame is still in flight the tick is skipped and the next one
//! tries again with a fresh frame.

use anyhow::{Result, bail};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::health::PipelineHealth;
use super::types::{EncodedFrame, InFlightSlot};
use crate::error::SendError;

/// Capture + encode side of a tick
pub trait FrameProducer: Send + 'static {
    /// Whether the underlying source can still produce frames
    fn source_active(&self) -> bool;

    /// Grab and encode the current frame
    fn produce(&mut self) -> Result<EncodedFrame>;
}

/// Send side of a tick
pub trait FrameSink: Send + 'static {
    /// Connection open and detection session active
    fn ready(&self) -> bool;

    /// Hand the frame over without waiting for delivery
    fn send(&mut self, frame: EncodedFrame) -> Result<(), SendError>;
}

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Sent,
    NotReady,
    InFlight,
    Failed,
    SourceEnded,
}

/// Cancellable tick task; at most one runs per scheduler
pub struct FrameScheduler {
    slot: InFlightSlot,
    health: Arc<PipelineHealth>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl FrameScheduler {
    pub fn new(health: Arc<PipelineHealth>) -> Self {
        Self {
            slot: InFlightSlot::new(),
            health,
            cancel: None,
            task: None,
        }
    }

    /// Start ticking every `interval`; the first tick fires one interval
    /// from now
    pub fn start<P, S>(&mut self, interval: Duration, producer: P, sink: S) -> Result<()>
    where
        P: FrameProducer,
        S: FrameSink,
    {
        if self.is_running() {
            bail!("frame scheduler already running");
        }
        if interval.is_zero() {
            bail!("tick interval must be non-zero");
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            interval,
            producer,
            sink,
            self.slot.clone(),
            Arc::clone(&self.health),
            cancel.clone(),
        ));

        self.cancel = Some(cancel);
        self.task = Some(task);
        info!("FrameScheduler: started ({:?} interval)", interval);
        Ok(())
    }

    /// Stop ticking; once this returns no further tick runs. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await
                && e.is_panic()
            {
                warn!("FrameScheduler: tick task panicked: {}", e);
            }
            info!("FrameScheduler: stopped");
        }
    }

    /// Token that cancels the running tick task, if any
    pub fn cancel_token(&self) -> Option<CancellationToken> {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        match (&self.cancel, &self.task) {
            (Some(cancel), Some(task)) => !cancel.is_cancelled() && !task.is_finished(),
            _ => false,
        }
    }

    /// Whether a frame is waiting for the transport to accept it
    pub fn frame_in_flight(&self) -> bool {
        self.slot.is_busy()
    }
}

async fn run<P, S>(
    interval: Duration,
    mut producer: P,
    mut sink: S,
    slot: InFlightSlot,
    health: Arc<PipelineHealth>,
    cancel: CancellationToken,
) where
    P: FrameProducer,
    S: FrameSink,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if tick(&mut producer, &mut sink, &slot, &health) == TickOutcome::SourceEnded {
            info!("FrameScheduler: source ended, stopping");
            cancel.cancel();
            break;
        }
    }
}

/// Run one tick synchronously
fn tick<P, S>(
    producer: &mut P,
    sink: &mut S,
    slot: &InFlightSlot,
    health: &PipelineHealth,
) -> TickOutcome
where
    P: FrameProducer,
    S: FrameSink,
{
    if !producer.source_active() {
        return TickOutcome::SourceEnded;
    }
    if !sink.ready() {
        health.record_tick_not_ready();
        return TickOutcome::NotReady;
    }
    // Claimed before encoding so a slow transport never sees two frames
    let Some(permit) = slot.try_acquire() else {
        health.record_tick_in_flight();
        return TickOutcome::InFlight;
    };

    let frame = match producer.produce() {
        Ok(frame) => frame.with_permit(permit),
        Err(e) => {
            health.record_frame_failure();
            warn!("FrameScheduler: failed to produce frame: {:#}", e);
            return TickOutcome::Failed;
        }
    };

    match sink.send(frame) {
        Ok(()) => TickOutcome::Sent,
        Err(e) => {
            health.record_frame_failure();
            debug!("FrameScheduler: frame dropped: {}", e);
            TickOutcome::Failed
        }
    }
}
