//! Per-device command serialization.
//!
//! A tag accepts one control write at a time. [`CommandQueue`] keeps a FIFO
//! of operations and runs a single drain task per device: it pops the head,
//! performs it, completes the caller's [`PendingOperation`], and loops until
//! the queue is empty. Queues of different devices are independent.
//!
//! Every operation is bounded by [`QueueConfig::write_timeout`], so a write
//! whose completion never arrives (the link dropped mid-write) cannot stall
//! the queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use tagwatch_types::uuids::{
    CONTROL_CHARACTERISTIC, DEVICE_INFO_SERVICE, FIRMWARE_REVISION, NOTIFY_CHARACTERISTIC,
    TRACKER_SERVICE,
};
use tagwatch_types::{Command, PeripheralHandle};

use crate::error::{Error, Result};
use crate::radio::{RadioAdapter, RadioEvent, WriteKind};

/// Timing for queued operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Upper bound on a single operation.
    pub write_timeout: Duration,
    /// Pause inserted after the pairing write on connect.
    pub settle_delay: Duration,
    /// How long to wait for the tag's answer to commands that expect one.
    pub response_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_millis(500),
            response_timeout: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    /// Set the per-operation timeout.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the post-pairing settle delay.
    #[must_use]
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the response wait for commands that expect an answer.
    #[must_use]
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Validate the timings.
    pub fn validate(&self) -> Result<()> {
        if self.write_timeout.is_zero() {
            return Err(Error::invalid_config("write_timeout must be > 0"));
        }
        if self.settle_delay >= self.write_timeout {
            return Err(Error::invalid_config(
                "settle_delay must be shorter than write_timeout",
            ));
        }
        if self.response_timeout >= self.write_timeout {
            return Err(Error::invalid_config(
                "response_timeout must be shorter than write_timeout",
            ));
        }
        Ok(())
    }
}

/// A unit of work for the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Write a command frame to the control characteristic.
    Write(Command),
    /// Read the firmware revision string.
    ReadFirmwareVersion,
    /// Let the tag settle before the next write.
    Settle(Duration),
}

impl Operation {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Write(cmd) => cmd.name(),
            Operation::ReadFirmwareVersion => "read_firmware_version",
            Operation::Settle(_) => "settle",
        }
    }
}

impl From<Command> for Operation {
    fn from(cmd: Command) -> Self {
        Operation::Write(cmd)
    }
}

/// How a queued operation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// Done, nothing to report.
    Completed,
    /// Done, with a value read or a response frame from the tag.
    Value(Vec<u8>),
    /// The radio reported an error.
    Failed(String),
    /// No completion within the write timeout.
    TimedOut,
    /// Dropped before dispatch (disconnect or shutdown).
    Cancelled,
}

impl OperationOutcome {
    /// Whether the operation reached the tag.
    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Completed | OperationOutcome::Value(_))
    }
}

/// Completion handle for an enqueued operation.
#[derive(Debug)]
pub struct PendingOperation {
    rx: oneshot::Receiver<OperationOutcome>,
}

impl PendingOperation {
    /// Wait for the operation to finish.
    pub async fn wait(self) -> OperationOutcome {
        self.rx.await.unwrap_or(OperationOutcome::Cancelled)
    }
}

struct QueuedOperation {
    op: Operation,
    done: oneshot::Sender<OperationOutcome>,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<QueuedOperation>,
    in_process: bool,
}

struct QueueInner {
    handle: PeripheralHandle,
    radio: Arc<dyn RadioAdapter>,
    config: QueueConfig,
    state: Mutex<QueueState>,
    idle: watch::Sender<bool>,
}

/// FIFO of operations for one device with at most one in flight.
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("handle", &self.inner.handle)
            .field("idle", &*self.inner.idle.borrow())
            .finish()
    }
}

impl CommandQueue {
    /// Create an idle queue for one peripheral.
    pub fn new(handle: PeripheralHandle, radio: Arc<dyn RadioAdapter>, config: QueueConfig) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(QueueInner {
                handle,
                radio,
                config,
                state: Mutex::new(QueueState::default()),
                idle,
            }),
        }
    }

    /// Queue timings.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Append an operation and start dispatching if idle.
    ///
    /// Command arguments are validated here, so an unencodable command is
    /// rejected before it takes a slot in the queue.
    pub async fn enqueue(&self, op: impl Into<Operation>) -> Result<PendingOperation> {
        let op = op.into();
        if let Operation::Write(cmd) = &op {
            cmd.encode()?;
        }

        let (done, rx) = oneshot::channel();
        let mut state = self.inner.state.lock().await;
        debug!(device = %self.inner.handle, op = op.name(), depth = state.entries.len(), "Enqueued");
        state.entries.push_back(QueuedOperation { op, done });
        self.inner.idle.send_replace(false);
        self.start_locked(&mut state);

        Ok(PendingOperation { rx })
    }

    /// Start the drain task if it is not running.
    ///
    /// Idempotent: a no-op while a drain is in progress; on an empty queue it
    /// only marks the queue idle.
    pub async fn invoke(&self) {
        let mut state = self.inner.state.lock().await;
        self.start_locked(&mut state);
    }

    fn start_locked(&self, state: &mut QueueState) {
        if state.in_process {
            return;
        }
        if state.entries.is_empty() {
            self.inner.idle.send_replace(true);
            return;
        }
        state.in_process = true;
        tokio::spawn(drain(Arc::clone(&self.inner)));
    }

    /// Whether a drain task is running.
    pub async fn is_in_process(&self) -> bool {
        self.inner.state.lock().await.in_process
    }

    /// Number of operations waiting (excluding the one in flight).
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    /// Whether nothing is waiting.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether the queue is empty with nothing in flight.
    pub fn is_idle(&self) -> bool {
        *self.inner.idle.borrow()
    }

    /// Resolve once the queue is empty with nothing in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.idle.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    /// Cancel every operation that has not been dispatched yet.
    ///
    /// The write in flight, if any, still runs to completion or timeout.
    /// Returns the number of cancelled operations.
    pub async fn clear(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let cancelled = state.entries.len();
        for entry in state.entries.drain(..) {
            let _ = entry.done.send(OperationOutcome::Cancelled);
        }
        if !state.in_process {
            self.inner.idle.send_replace(true);
        }
        if cancelled > 0 {
            debug!(device = %self.inner.handle, cancelled, "Cleared command queue");
        }
        cancelled
    }
}

async fn drain(inner: Arc<QueueInner>) {
    loop {
        let next = {
            let mut state = inner.state.lock().await;
            match state.entries.pop_front() {
                Some(entry) => entry,
                None => {
                    state.in_process = false;
                    inner.idle.send_replace(true);
                    return;
                }
            }
        };

        let outcome = inner.execute(&next.op).await;
        let _ = next.done.send(outcome);
    }
}

impl QueueInner {
    #[tracing::instrument(level = "debug", skip_all, fields(device = %self.handle, op = op.name()))]
    async fn execute(&self, op: &Operation) -> OperationOutcome {
        let work = async {
            match op {
                Operation::Settle(delay) => {
                    sleep(*delay).await;
                    Ok(OperationOutcome::Completed)
                }
                Operation::ReadFirmwareVersion => self
                    .radio
                    .read_characteristic(&self.handle, DEVICE_INFO_SERVICE, FIRMWARE_REVISION)
                    .await
                    .map(OperationOutcome::Value),
                Operation::Write(cmd) => self.write(cmd).await,
            }
        };

        match timeout(self.config.write_timeout, work).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!("{} failed: {}", op.name(), e);
                OperationOutcome::Failed(e.to_string())
            }
            Err(_) => {
                warn!(
                    "{} timed out after {:?}, moving on",
                    op.name(),
                    self.config.write_timeout
                );
                OperationOutcome::TimedOut
            }
        }
    }

    async fn write(&self, cmd: &Command) -> Result<OperationOutcome> {
        let frame = cmd.encode()?;

        // Subscribe before writing so a fast answer is not missed.
        let responses = cmd.expects_response().then(|| self.radio.subscribe());

        self.radio
            .write_characteristic(
                &self.handle,
                TRACKER_SERVICE,
                CONTROL_CHARACTERISTIC,
                &frame,
                WriteKind::WithResponse,
            )
            .await?;

        let Some(mut rx) = responses else {
            return Ok(OperationOutcome::Completed);
        };

        let opcode = frame[0];
        let response = timeout(self.config.response_timeout, async {
            loop {
                match rx.recv().await {
                    Ok(RadioEvent::CharacteristicUpdated {
                        handle,
                        characteristic,
                        value,
                    }) if handle == self.handle
                        && characteristic == NOTIFY_CHARACTERISTIC
                        && value.first() == Some(&opcode) =>
                    {
                        return Some(value);
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .await
        .ok()
        .flatten();

        Ok(response.map_or(OperationOutcome::Completed, OperationOutcome::Value))
    }
}
