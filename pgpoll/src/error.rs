//! `pgpoll` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{
    connection::{AuthError, ConnectionLost, NotReady, ParseError},
    encode::EncodeError,
    postgres::{ProtocolError, ServerError},
    row::{AccessError, DecodeError},
};

/// A specialized [`Result`] type for `pgpoll` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `pgpoll` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Returns the server reported error, if any.
    pub fn as_server_error(&self) -> Option<&ServerError> {
        match &self.kind {
            ErrorKind::Database(e) => Some(e),
            _ => None,
        }
    }

    /// Prefix the error message with operation that fails.
    pub(crate) fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }
}

/// All possible error kind from `pgpoll` library.
pub enum ErrorKind {
    /// Malformed connection string, detected before any I/O.
    Config(ParseError),
    /// Backend sends message that violates the protocol.
    Protocol(ProtocolError),
    /// Transport failure.
    Io(io::Error),
    /// Connection is unusable until it is reset.
    ConnectionLost(ConnectionLost),
    /// Server reported error, the connection remains usable.
    Database(ServerError),
    /// Out of range index or missing column.
    Access(AccessError),
    /// Unsupported or malformed value encoding.
    Decode(DecodeError),
    /// Value cannot be encoded as parameter.
    Encode(EncodeError),
    /// Operation is not allowed in current connection status.
    NotReady(NotReady),
    /// Authentication failed on the client side.
    Auth(AuthError),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<ConnectionLost>e => ErrorKind::ConnectionLost(e));
from!(<ServerError>e => ErrorKind::Database(e));
from!(<AccessError>e => ErrorKind::Access(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<EncodeError>e => ErrorKind::Encode(e));
from!(<NotReady>e => ErrorKind::NotReady(e));
from!(<AuthError>e => ErrorKind::Auth(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => fmt::Display::fmt(e, f),
            Self::Protocol(e) => fmt::Display::fmt(e, f),
            Self::Io(e) => fmt::Display::fmt(e, f),
            Self::ConnectionLost(e) => fmt::Display::fmt(e, f),
            Self::Database(e) => fmt::Display::fmt(e, f),
            Self::Access(e) => fmt::Display::fmt(e, f),
            Self::Decode(e) => fmt::Display::fmt(e, f),
            Self::Encode(e) => fmt::Display::fmt(e, f),
            Self::NotReady(e) => fmt::Display::fmt(e, f),
            Self::Auth(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
