//! # Message bus: ordered delivery from many producers to one sink.
//!
//! [`MessageBus`] decouples test execution from reporting: producers enqueue
//! without blocking, a dedicated delivery thread drains the queue in FIFO order
//! and calls the sink. [`SynchronousMessageBus`] delivers inline for protocols
//! that need lockstep back-pressure.
//!
//! ## Architecture
//! ```text
//! Producers (many):                        Consumer (one):
//!   worker 1 ──┐
//!   worker 2 ──┼── queue_message() ──► [unbounded mpsc] ──► delivery thread ──► sink.on_message()
//!   worker N ──┘    (never blocks)                          (FIFO, one per bus)
//! ```
//!
//! ## State machine
//! ```text
//! Running ──dispose()──► ShutdownRequested ──► Draining ──► Disposed
//! ```
//!
//! ## Rules
//! - **FIFO per bus**: the sink sees messages in enqueue order; no ordering across buses.
//! - **Non-blocking producers**: `queue_message` returns the current "continue" latch,
//!   not a delivery guarantee.
//! - **Latch**: a sink returning `false`, or a `TestFailed` with `stop_on_fail`,
//!   turns the latch off for good. Already-queued messages are still delivered.
//! - **Sink panics**: caught on both buses, reported to the same sink as an
//!   `ErrorMessage` (best-effort; a second panic is dropped).
//! - **Dispose**: waits for a final drain; a second dispose is an error.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use tokio::sync::mpsc;

use crate::error::{RunnerError, panic_message};
use crate::messages::{ErrorMetadata, Message, MessageKind};
use crate::sinks::{MessageSink, SinkRef};

/// Common interface of the asynchronous and synchronous buses.
pub trait Bus: Send + Sync {
    /// Queues a message for delivery and returns whether producers should continue.
    ///
    /// Fails with [`RunnerError::AlreadyDisposed`] once the bus was disposed.
    fn queue_message(&self, message: Message) -> Result<bool, RunnerError>;

    /// Flushes and releases the bus. Calling it twice is an error.
    fn dispose(&self) -> Result<(), RunnerError>;
}

enum Envelope {
    Message(Message),
    Shutdown,
}

/// Asynchronous bus with a dedicated delivery thread.
pub struct MessageBus {
    tx: mpsc::UnboundedSender<Envelope>,
    continue_running: Arc<AtomicBool>,
    shutdown_requested: AtomicBool,
    stop_on_fail: bool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MessageBus {
    /// Creates a bus and starts its delivery thread immediately.
    ///
    /// Fails only if the OS refuses to spawn the delivery thread.
    pub fn new(sink: impl MessageSink, stop_on_fail: bool) -> Result<Self, RunnerError> {
        let sink: SinkRef = Arc::new(sink);
        let (tx, rx) = mpsc::unbounded_channel();
        let continue_running = Arc::new(AtomicBool::new(true));
        let latch = Arc::clone(&continue_running);

        let worker = std::thread::Builder::new()
            .name("testvisor-bus".into())
            .spawn(move || delivery_loop(sink, rx, latch))?;

        Ok(Self {
            tx,
            continue_running,
            shutdown_requested: AtomicBool::new(false),
            stop_on_fail,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Current value of the "continue" latch.
    pub fn continue_running(&self) -> bool {
        self.continue_running.load(Ordering::Acquire)
    }

    fn shutdown(&self) -> Result<(), RunnerError> {
        if self.shutdown_requested.swap(true, Ordering::AcqRel) {
            return Err(RunnerError::AlreadyDisposed {
                resource: "MessageBus",
            });
        }
        let _ = self.tx.send(Envelope::Shutdown);

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(target: "testvisor::bus", "delivery thread terminated abnormally");
            }
        }
        Ok(())
    }
}

impl Bus for MessageBus {
    fn queue_message(&self, message: Message) -> Result<bool, RunnerError> {
        if self.shutdown_requested.load(Ordering::Acquire) {
            return Err(RunnerError::AlreadyDisposed {
                resource: "MessageBus",
            });
        }
        if self.stop_on_fail && message.kind == MessageKind::TestFailed {
            self.continue_running.store(false, Ordering::Release);
        }
        self.tx
            .send(Envelope::Message(message))
            .map_err(|_| RunnerError::AlreadyDisposed {
                resource: "MessageBus",
            })?;
        Ok(self.continue_running())
    }

    fn dispose(&self) -> Result<(), RunnerError> {
        self.shutdown()
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        if !self.shutdown_requested.load(Ordering::Acquire) {
            let _ = self.shutdown();
        }
    }
}

/// Delivery thread body: drain in FIFO order until shutdown, then one final pass.
fn delivery_loop(
    sink: SinkRef,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    continue_running: Arc<AtomicBool>,
) {
    while let Some(envelope) = rx.blocking_recv() {
        match envelope {
            Envelope::Message(message) => deliver(&sink, &message, &continue_running),
            Envelope::Shutdown => {
                while let Ok(envelope) = rx.try_recv() {
                    if let Envelope::Message(message) = envelope {
                        deliver(&sink, &message, &continue_running);
                    }
                }
                break;
            }
        }
    }
    tracing::debug!(target: "testvisor::bus", sink = sink.name(), "delivery thread exiting");
}

fn deliver(sink: &SinkRef, message: &Message, continue_running: &AtomicBool) {
    if !deliver_guarded(sink, message) {
        continue_running.store(false, Ordering::Release);
    }
}

/// Calls the sink, turning a panic into an `ErrorMessage` sent to the same sink.
///
/// A panicking sink answers `true`; only an explicit `false` stops producers.
fn deliver_guarded(sink: &SinkRef, message: &Message) -> bool {
    match catch_unwind(AssertUnwindSafe(|| sink.on_message(message))) {
        Ok(answer) => answer,
        Err(payload) => {
            let info = panic_message(payload.as_ref());
            tracing::warn!(
                target: "testvisor::bus",
                sink = sink.name(),
                kind = message.kind.tag(),
                panic = %info,
                "sink panicked while handling message"
            );
            let report = Message::error_message(ErrorMetadata::single(
                "SinkPanic",
                format!("sink '{}' panicked handling {}: {info}", sink.name(), message.kind.tag()),
                None,
            ));
            let _ = catch_unwind(AssertUnwindSafe(|| sink.on_message(&report)));
            true
        }
    }
}

/// Bus that delivers inline on the caller's thread.
///
/// `queue_message` returns the sink's own answer; there is no queue and no
/// ordering beyond the caller's call order.
pub struct SynchronousMessageBus {
    sink: SinkRef,
    disposed: AtomicBool,
}

impl SynchronousMessageBus {
    /// Creates an inline bus over `sink`.
    pub fn new(sink: impl MessageSink) -> Self {
        Self {
            sink: Arc::new(sink),
            disposed: AtomicBool::new(false),
        }
    }
}

impl Bus for SynchronousMessageBus {
    fn queue_message(&self, message: Message) -> Result<bool, RunnerError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(RunnerError::AlreadyDisposed {
                resource: "SynchronousMessageBus",
            });
        }
        Ok(deliver_guarded(&self.sink, &message))
    }

    fn dispose(&self) -> Result<(), RunnerError> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Err(RunnerError::AlreadyDisposed {
                resource: "SynchronousMessageBus",
            });
        }
        Ok(())
    }
}

/// Forwarding a message into a bus answers with the bus latch.
///
/// Lets a bus sit behind crash detection or the out-of-process reader.
/// Use after dispose answers `false`.
impl MessageSink for MessageBus {
    fn on_message(&self, message: &Message) -> bool {
        forward(self, message)
    }

    fn name(&self) -> &'static str {
        "MessageBus"
    }
}

impl MessageSink for SynchronousMessageBus {
    fn on_message(&self, message: &Message) -> bool {
        forward(self, message)
    }

    fn name(&self) -> &'static str {
        "SynchronousMessageBus"
    }
}

fn forward(bus: &dyn Bus, message: &Message) -> bool {
    bus.queue_message(message.clone()).unwrap_or_else(|e| {
        tracing::warn!(target: "testvisor::bus", error = %e, kind = message.kind.tag(), "message dropped");
        false
    })
}
