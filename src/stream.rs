//! RX and TX streaming loops.
//!
//! One background worker per direction drives TRANSFER_BLOCK in a loop and
//! moves frames through a bounded queue. The worker never shares the wire
//! with anyone: every transfer takes the connection lock for its round-trip.
//! Frames reach the consumer in server-emission order.
//!
//! Backpressure: with `drop_if_full = false` the producer blocks on a full
//! queue (cooperatively polling the stop channel), so the pressure reaches
//! the wire. With `drop_if_full = true` the incoming frame is discarded and
//! counted instead. Crossing the high watermark signals once until the
//! queue drains below the low watermark, which signals once in turn; both
//! signal channels have capacity 1 and coalesce.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;
use crossbeam_channel::{bounded, Receiver, Sender, SendTimeoutError, TrySendError};
use log::{debug, warn};

use crate::buffer::BlockId;
use crate::conn::Manager;
use crate::proto::ValidationError;
use crate::transport::Wire;

/// How often a blocked worker polls for cancellation.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Bounded-queue configuration for a streaming direction.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue capacity in frames.
    pub depth: usize,
    /// Fill level that fires the high signal; 0 disables watermarks.
    pub high_watermark: usize,
    /// Fill level that re-arms the high signal and fires the low signal.
    pub low_watermark: usize,
    /// Discard the incoming frame instead of blocking when full.
    pub drop_if_full: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            depth: 16,
            high_watermark: 12,
            low_watermark: 4,
            drop_if_full: false,
        }
    }
}

impl QueueConfig {
    fn validate(&self) -> Result<()> {
        if self.depth == 0 {
            bail!(ValidationError("queue depth must be positive".to_string()));
        }
        if self.high_watermark > self.depth || self.low_watermark > self.high_watermark {
            bail!(ValidationError(format!(
                "watermarks {}/{} do not fit a queue of depth {}",
                self.low_watermark, self.high_watermark, self.depth
            )));
        }
        Ok(())
    }
}

/// Edge detector for the two one-shot fill-level signals.
struct Watermarks {
    high_mark: usize,
    low_mark: usize,
    above: bool,
    high: Sender<()>,
    low: Sender<()>,
}

impl Watermarks {
    fn new(cfg: &QueueConfig, high: Sender<()>, low: Sender<()>) -> Self {
        Watermarks {
            high_mark: cfg.high_watermark,
            low_mark: cfg.low_watermark,
            above: false,
            high,
            low,
        }
    }

    fn observe(&mut self, len: usize) {
        if self.high_mark == 0 {
            return;
        }
        if !self.above && len >= self.high_mark {
            // Coalesce: a full signal slot means the consumer has not looked
            // yet, and one pending edge is all it needs.
            let _ = self.high.try_send(());
            self.above = true;
        } else if self.above && len <= self.low_mark {
            let _ = self.low.try_send(());
            self.above = false;
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Publish {
    Sent,
    Dropped,
    Stopped,
    Disconnected,
}

/// Producer endpoint of the frame queue.
struct FramePublisher {
    tx: Sender<Vec<u8>>,
    marks: Watermarks,
    drop_if_full: bool,
    dropped: Arc<AtomicU64>,
}

impl FramePublisher {
    fn observe(&mut self) {
        self.marks.observe(self.tx.len());
    }

    fn publish(&mut self, frame: Vec<u8>, stop: &Receiver<()>) -> Publish {
        self.observe();
        let outcome = if self.drop_if_full {
            match self.tx.try_send(frame) {
                Ok(()) => Publish::Sent,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Publish::Dropped
                }
                Err(TrySendError::Disconnected(_)) => Publish::Disconnected,
            }
        } else {
            let mut frame = frame;
            loop {
                if stop.try_recv().is_ok() {
                    return Publish::Stopped;
                }
                match self.tx.send_timeout(frame, STOP_POLL) {
                    Ok(()) => break Publish::Sent,
                    Err(SendTimeoutError::Timeout(returned)) => {
                        frame = returned;
                        self.observe();
                    }
                    Err(SendTimeoutError::Disconnected(_)) => return Publish::Disconnected,
                }
            }
        };
        self.observe();
        outcome
    }
}

/// A running capture stream.
pub struct RxStream {
    frames: Receiver<Vec<u8>>,
    high: Receiver<()>,
    low: Receiver<()>,
    stop: Sender<()>,
    dropped: Arc<AtomicU64>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl RxStream {
    /// Received frames, in server-emission order.
    pub fn frames(&self) -> &Receiver<Vec<u8>> {
        &self.frames
    }

    /// One-shot signal that the queue crossed the high watermark.
    pub fn high_watermark(&self) -> &Receiver<()> {
        &self.high
    }

    /// One-shot signal that the queue drained back below the low watermark.
    pub fn low_watermark(&self) -> &Receiver<()> {
        &self.low
    }

    /// Frames discarded under the `drop_if_full` policy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Ask the worker to stop after the transfer in flight.
    pub fn stop(&self) {
        let _ = self.stop.try_send(());
    }

    /// Wait for the worker to finish.
    pub fn join(mut self) -> Result<()> {
        match self.worker.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| eyre!("rx stream worker panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for RxStream {
    fn drop(&mut self) {
        let _ = self.stop.try_send(());
    }
}

/// Spawn the capture loop for an enabled, non-cyclic block: each iteration
/// transfers into a reusable scratch buffer and publishes a copy.
pub fn start_rx_stream<W: Wire + 'static>(
    manager: Arc<Manager<W>>,
    block: BlockId,
    cfg: QueueConfig,
) -> Result<RxStream> {
    cfg.validate()?;
    let size = manager.block_size(block)?;
    let (frame_tx, frame_rx) = bounded(cfg.depth);
    let (high_tx, high_rx) = bounded(1);
    let (low_tx, low_rx) = bounded(1);
    let (stop_tx, stop_rx) = bounded(1);
    let dropped = Arc::new(AtomicU64::new(0));

    let mut publisher = FramePublisher {
        marks: Watermarks::new(&cfg, high_tx, low_tx),
        tx: frame_tx,
        drop_if_full: cfg.drop_if_full,
        dropped: Arc::clone(&dropped),
    };
    let worker = thread::Builder::new()
        .name("iiod-rx".to_string())
        .spawn(move || -> Result<()> {
            let mut scratch = vec![0u8; size];
            loop {
                if stop_rx.try_recv().is_ok() {
                    debug!(target: "iiod", "rx stream stopped");
                    return Ok(());
                }
                publisher.observe();
                let n = manager.transfer_block(block, &mut scratch)?;
                let frame = scratch[..n.min(scratch.len())].to_vec();
                match publisher.publish(frame, &stop_rx) {
                    Publish::Sent | Publish::Dropped => {}
                    Publish::Stopped => {
                        debug!(target: "iiod", "rx stream stopped");
                        return Ok(());
                    }
                    Publish::Disconnected => {
                        debug!(target: "iiod", "rx consumer went away");
                        return Ok(());
                    }
                }
            }
        })?;

    Ok(RxStream {
        frames: frame_rx,
        high: high_rx,
        low: low_rx,
        stop: stop_tx,
        dropped,
        worker: Some(worker),
    })
}

/// A running playback stream.
pub struct TxStream {
    stop: Sender<()>,
    submitted: Arc<AtomicU64>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl TxStream {
    /// Frames pushed to the device so far.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Abort: stop without waiting for the input channel to close.
    pub fn stop(&self) {
        let _ = self.stop.try_send(());
    }

    /// Wait for the worker to finish.
    pub fn join(mut self) -> Result<()> {
        match self.worker.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| eyre!("tx stream worker panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for TxStream {
    fn drop(&mut self) {
        let _ = self.stop.try_send(());
    }
}

/// Spawn the playback loop: frames from `input` are pushed to the device
/// one block at a time. Closing `input` is a clean end of stream; `stop`
/// aborts. The in-flight set is drained before the worker returns.
pub fn start_tx_stream<W: Wire + 'static>(
    manager: Arc<Manager<W>>,
    block: BlockId,
    input: Receiver<Vec<u8>>,
) -> Result<TxStream> {
    manager.block_size(block)?;
    let (stop_tx, stop_rx) = bounded(1);
    let submitted = Arc::new(AtomicU64::new(0));
    let submitted_in_worker = Arc::clone(&submitted);

    let worker = thread::Builder::new()
        .name("iiod-tx".to_string())
        .spawn(move || -> Result<()> {
            let mut in_flight = 0usize;
            loop {
                if stop_rx.try_recv().is_ok() {
                    debug!(target: "iiod", "tx stream stopped");
                    break;
                }
                match input.recv_timeout(STOP_POLL) {
                    Ok(frame) => {
                        in_flight += 1;
                        manager.submit_block(block, &frame)?;
                        in_flight -= 1;
                        submitted_in_worker.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                        debug!(target: "iiod", "tx input closed, stream done");
                        break;
                    }
                }
            }
            if in_flight != 0 {
                warn!(target: "iiod", "{in_flight} tx block(s) never completed");
            }
            Ok(())
        })?;

    Ok(TxStream {
        stop: stop_tx,
        submitted,
        worker: Some(worker),
    })
}
