//! # Message sink trait.
//!
//! Provides [`MessageSink`], the universal consumer contract used by the
//! message bus, crash detectors and the out-of-process reader.
//!
//! ## Rules
//! - `on_message` returns `true` to keep going and `false` to ask producers to stop.
//! - A sink is called from exactly one delivery thread per bus, in enqueue order.
//! - A sink that panics does not take the delivery thread down; the bus reports
//!   the panic as an `ErrorMessage` to the same sink.
//!
//! ## Example
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use testvisor::{Message, MessageKind, MessageSink};
//!
//! #[derive(Default)]
//! struct FailureCounter(AtomicUsize);
//!
//! impl MessageSink for FailureCounter {
//!     fn on_message(&self, message: &Message) -> bool {
//!         if message.kind == MessageKind::TestFailed {
//!             self.0.fetch_add(1, Ordering::Relaxed);
//!         }
//!         true
//!     }
//!
//!     fn name(&self) -> &'static str { "failure-counter" }
//! }
//! ```

use std::borrow::Cow;
use std::sync::Arc;

use crate::messages::Message;

/// Consumer of test messages.
///
/// ### Implementation requirements
/// - Return quickly; a slow sink delays every later message on its bus.
/// - Handle errors internally; panics are caught but reported as errors.
pub trait MessageSink: Send + Sync + 'static {
    /// Handles a single message. `false` asks the producer to stop.
    fn on_message(&self, message: &Message) -> bool;

    /// Returns the sink name used in logs and error reports.
    ///
    /// The default uses `type_name::<Self>()`; override it when possible.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl<S: MessageSink + ?Sized> MessageSink for Arc<S> {
    fn on_message(&self, message: &Message) -> bool {
        (**self).on_message(message)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Shared handle to a sink.
pub type SinkRef = Arc<dyn MessageSink>;

/// Function-backed sink.
///
/// ## Example
/// ```rust
/// use testvisor::{FnSink, Message, MessageKind, MessageSink};
///
/// let sink = FnSink::new("stop-on-error", |m: &Message| m.kind != MessageKind::ErrorMessage);
/// assert!(sink.on_message(&Message::diagnostic("hi")));
/// ```
pub struct FnSink<F> {
    name: Cow<'static, str>,
    f: F,
}

impl<F> FnSink<F> {
    /// Creates a new function-backed sink.
    pub fn new(name: impl Into<Cow<'static, str>>, f: F) -> Self {
        Self { name: name.into(), f }
    }

    /// Creates the sink and returns it as a shared handle.
    pub fn arc(name: impl Into<Cow<'static, str>>, f: F) -> Arc<Self> {
        Arc::new(Self::new(name, f))
    }

    /// The label given at construction.
    pub fn label(&self) -> &str {
        &self.name
    }
}

impl<F> MessageSink for FnSink<F>
where
    F: Fn(&Message) -> bool + Send + Sync + 'static,
{
    fn on_message(&self, message: &Message) -> bool {
        (self.f)(message)
    }

    fn name(&self) -> &'static str {
        "FnSink"
    }
}

/// Sink that accepts and drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MessageSink for NullSink {
    fn on_message(&self, _message: &Message) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "NullSink"
    }
}
