//! `postex` error types.
use std::{fmt, io};

use crate::postgres::{ProtocolError, ServerError};

/// A specialized [`Result`] type for `postex` operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// SQLSTATE-style codes for errors raised by the driver itself.
///
/// Errors reported by the backend carry their own code in [`ServerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlState {
    /// 08006: socket failure, or an invariant guard forced a disconnect.
    ConnectionFailure,
    /// 08P01: the backend broke the message contract.
    ProtocolViolation,
    /// 55000: an operation was used outside its valid connection state.
    ObjectNotInState,
    /// 22023: unusable parameter values (unset slots, oversized bind).
    InvalidParameterValue,
    /// 08S01: a response count did not match what was requested.
    CommunicationError,
    /// 0A000: the entry point does not support the operation.
    NotImplemented,
    /// 53200: allocation failed while materialising results.
    OutOfMemory,
}

impl SqlState {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionFailure => "08006",
            Self::ProtocolViolation => "08P01",
            Self::ObjectNotInState => "55000",
            Self::InvalidParameterValue => "22023",
            Self::CommunicationError => "08S01",
            Self::NotImplemented => "0A000",
            Self::OutOfMemory => "53200",
        }
    }
}

/// All possible errors from the `postex` library.
///
/// Within one Sync window the executor collects errors instead of failing
/// fast; later errors are linked through [`next`][Error::next].
pub struct Error {
    kind: ErrorKind,
    next: Option<Box<Error>>,
}

/// All possible error kinds from the `postex` library.
pub enum ErrorKind {
    Io(io::Error),
    Protocol(ProtocolError),
    Server(ServerError),
    Driver { state: SqlState, message: String },
}

impl Error {
    pub(crate) fn driver(state: SqlState, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Driver { state, message: message.into() },
            next: None,
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The SQLSTATE associated with this error.
    pub fn sql_state(&self) -> &str {
        match &self.kind {
            ErrorKind::Io(_) => SqlState::ConnectionFailure.code(),
            ErrorKind::Protocol(_) => SqlState::ProtocolViolation.code(),
            ErrorKind::Server(e) => e.code(),
            ErrorKind::Driver { state, .. } => state.code(),
        }
    }

    /// Whether this error was raised by the driver with the given state code.
    pub fn is_state(&self, state: SqlState) -> bool {
        matches!(&self.kind, ErrorKind::Driver { state: s, .. } if *s == state)
    }

    /// The next chained error, if any.
    pub fn next(&self) -> Option<&Error> {
        self.next.as_deref()
    }

    /// Whether this error is connection-level (socket failure or a broken
    /// message framing), as opposed to a reported query failure.
    pub(crate) fn is_io(&self) -> bool {
        matches!(self.kind, ErrorKind::Io(_) | ErrorKind::Protocol(_))
    }

    /// Append `next` at the end of this error's chain.
    pub(crate) fn chain(&mut self, next: Error) {
        match &mut self.next {
            Some(tail) => tail.chain(next),
            None => self.next = Some(Box::new(next)),
        }
    }

    /// Iterate this error and every chained one.
    pub fn iter(&self) -> impl Iterator<Item = &Error> {
        std::iter::successors(Some(self), |e| e.next())
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                Self { kind: $body, next: None }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<io::Error>e => ErrorKind::Io(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<ServerError>e => ErrorKind::Server(e));

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)?;
        if let Some(next) = &self.next {
            write!(f, "; {next}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Server(e) => e.fmt(f),
            Self::Driver { state, message } => write!(f, "{}: {message}", state.code()),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
