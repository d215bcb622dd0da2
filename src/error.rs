//! Errors.

use std::fmt::{Display, Formatter};
use std::io;

/// Transport error.
///
/// Setup failures ([`Listen`](Error::Listen), [`Spawn`](Error::Spawn)) are
/// fatal and reported before any worker thread starts. [`Poll`](Error::Poll)
/// covers the readiness wait itself. Connection-level failures are not
/// reported through this type at all: they surface as disconnect callbacks.
#[derive(Debug)]
pub enum Error {
    /// The listening socket could not be resolved, created or bound.
    Listen(io::Error),

    /// The readiness wait failed.
    Poll(io::Error),

    /// The worker thread could not be spawned.
    Spawn(io::Error),

    /// Some other socket operation failed mid-flight.
    Io(io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use Error::*;
        match self {
            Listen(e) => write!(f, "Listen error: {}", e),
            Poll(e) => write!(f, "Poll error: {}", e),
            Spawn(e) => write!(f, "Spawn error: {}", e),
            Io(e) => write!(f, "Io error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use Error::*;
        match self {
            Listen(e) | Poll(e) | Spawn(e) | Io(e) => Some(e),
        }
    }
}

/// Whether an io error only means "nothing to do right now".
///
/// A would-block or interrupted peek is retried on the next readiness
/// signal; every other error on an established connection is terminal.
#[inline]
pub(crate) fn is_retriable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
