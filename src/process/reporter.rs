//! Child side of the protocol: one JSON line per message on a writer.

use std::io::{BufRead, Write};
use std::sync::Mutex;

use crate::messages::{Message, wire};
use crate::sinks::MessageSink;

/// Writes each message as a line; in synchronous mode waits for the
/// parent's blank acknowledgement line before returning.
///
/// Returns `false` once the writer or the acknowledgement stream fails, so a
/// bus over this sink stops producers when the parent has gone away.
pub struct LineReporterSink<W, R = std::io::Empty> {
    out: Mutex<W>,
    ack: Option<Mutex<R>>,
}

impl<W: Write + Send + 'static> LineReporterSink<W> {
    /// Reporter without acknowledgements.
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            ack: None,
        }
    }
}

impl<W: Write + Send + 'static, R: BufRead + Send + 'static> LineReporterSink<W, R> {
    /// Reporter that waits for one line on `ack` after every message.
    pub fn synchronous(out: W, ack: R) -> Self {
        Self {
            out: Mutex::new(out),
            ack: Some(Mutex::new(ack)),
        }
    }
}

impl LineReporterSink<std::io::Stdout, std::io::BufReader<std::io::Stdin>> {
    /// Reporter over the process's own stdout (and stdin when `synchronous`).
    pub fn stdio(synchronous: bool) -> Self {
        Self {
            out: Mutex::new(std::io::stdout()),
            ack: synchronous.then(|| Mutex::new(std::io::BufReader::new(std::io::stdin()))),
        }
    }
}

impl<W, R> MessageSink for LineReporterSink<W, R>
where
    W: Write + Send + 'static,
    R: BufRead + Send + 'static,
{
    fn on_message(&self, message: &Message) -> bool {
        {
            let mut out = self.out.lock().unwrap_or_else(|p| p.into_inner());
            let written = writeln!(out, "{}", wire::to_line(message)).and_then(|()| out.flush());
            if let Err(e) = written {
                tracing::warn!(target: "testvisor::process", error = %e, "failed to report message");
                return false;
            }
        }
        if let Some(ack) = &self.ack {
            let mut line = String::new();
            let mut ack = ack.lock().unwrap_or_else(|p| p.into_inner());
            match ack.read_line(&mut line) {
                Ok(0) => return false,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(target: "testvisor::process", error = %e, "failed to read acknowledgement");
                    return false;
                }
            }
        }
        true
    }

    fn name(&self) -> &'static str {
        "LineReporterSink"
    }
}
