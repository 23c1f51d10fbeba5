//! Test messages: data model, line codec and buses.
//!
//! This module groups the message **data model**, the **wire codec** used by
//! the out-of-process protocol, and the **buses** that deliver messages from
//! execution to a sink.
//!
//! ## Contents
//! - [`MessageKind`], [`Message`], [`ErrorMetadata`], [`RunTotals`]
//! - [`wire`]: one JSON message per line
//! - [`Bus`], [`MessageBus`] (dedicated delivery thread), [`SynchronousMessageBus`] (inline)
//!
//! ## Quick reference
//! - **Producers**: `TestRunner` workers, the out-of-process reader loop.
//! - **Consumers**: any [`MessageSink`](crate::MessageSink), usually a chain of
//!   delegating sinks ending in a reporter.

mod bus;
mod message;
pub mod wire;

pub use bus::{Bus, MessageBus, SynchronousMessageBus};
pub use message::{ErrorMetadata, Message, MessageKind, RunTotals};
