//! Error types for the bus: the listener-facing [`ListenerError`] distinction
//! between recoverable and fatal failures, the [`ChannelFailures`] aggregate
//! raised out of `publish`, and the crate-level [`BusError`] wrapping both.

use std::fmt;

use thiserror::Error;

use crate::channel::ChannelId;

/// Conventional log severities (§6). The numeric values match the levels a
/// `log`-channel listener is expected to compare against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug = 10,
    Info = 20,
    Warning = 30,
    Error = 40,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{name}")
    }
}

/// The exception info captured when a listener on channel `N` fails and `N`
/// has an entry in the bus's error map (§4.3). Passed as the argument to the
/// mapped error channel's listeners, mirroring the `sys.exc_info()` triple
/// the reference implementation forwards.
#[derive(Debug)]
pub struct CapturedError {
    /// The channel/state whose listeners raised.
    pub state: ChannelId,
    /// The failure that triggered the error transition — usually the
    /// [`ChannelFailures`] aggregate raised by the failing `publish`.
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl fmt::Display for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error entering {}: {}", self.state, self.error)
    }
}

/// The argument a listener receives, shaped by which channel it was
/// registered on. A plain lifecycle-state channel gets [`Payload::None`]; an
/// error channel (mapped via the bus's error map) gets [`Payload::Error`];
/// the `log` channel gets [`Payload::Log`].
pub enum Payload {
    None,
    Error(std::sync::Arc<CapturedError>),
    Log { message: String, level: LogLevel },
}

/// The two kinds of listener failure (§3 "Fatal exception set", §7).
///
/// A listener returns `Failure` for anything that should be collected into
/// the channel's [`ChannelFailures`] aggregate (and, if the channel has an
/// error mapping, trigger an error transition). It returns `Fatal` for
/// conditions that must never be caught by dispatch machinery — the Rust
/// equivalent of the reference implementation's `throws` set
/// (`KeyboardInterrupt`, `SystemExit`): these always propagate all the way
/// out of `publish`/`transition`, skipping any remaining listeners.
#[derive(Debug)]
pub enum ListenerError {
    Failure(Box<dyn std::error::Error + Send + Sync>),
    Fatal(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerError::Failure(e) => write!(f, "{e}"),
            ListenerError::Fatal(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ListenerError::Failure(e) | ListenerError::Fatal(e) => Some(e.as_ref()),
        }
    }
}

/// Aggregate of every non-fatal listener failure observed during one
/// `publish` call (§7, testable property "Failure aggregation"). Every
/// listener on the channel still runs even once failures start
/// accumulating; this is only ever raised after the last one has had its
/// turn. Stringifies as the newline-joined `Display` of its contents and is
/// empty iff no listener failed — the same truthiness the Python original's
/// `__bool__` gave it.
#[derive(Debug, Default)]
pub struct ChannelFailures {
    errors: Vec<Box<dyn std::error::Error + Send + Sync>>,
}

impl ChannelFailures {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(dyn std::error::Error + Send + Sync)> {
        self.errors.iter().map(|e| e.as_ref())
    }

    pub(crate) fn push(&mut self, error: Box<dyn std::error::Error + Send + Sync>) {
        self.errors.push(error);
    }
}

impl fmt::Display for ChannelFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for e in &self.errors {
            if !first {
                writeln!(f)?;
            }
            first = false;
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ChannelFailures {}

/// Crate-level error type (§9 of the expanded spec).
#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    ChannelFailures(#[from] ChannelFailures),

    /// A listener raised a fatal failure (§3 `throws`); always propagated,
    /// never collected.
    #[error("fatal listener failure: {0}")]
    Fatal(Box<dyn std::error::Error + Send + Sync>),

    /// Diagnostic only: `transition`'s desired state does not name a state
    /// known to the bus's graph. `transition` itself never returns this —
    /// per §4.4 and §7, an unreachable desired state is silent — but
    /// tooling built on top of the bus (e.g. a CLI that wants to fail loudly
    /// on a typo) can use [`crate::Bus::transition_checked`] to get it.
    #[error("state {0} is unreachable from the bus's current state")]
    Unreachable(ChannelId),
}
