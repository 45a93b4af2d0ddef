//! Protocol and server reported errors
use bytes::{Buf, Bytes};
use std::{borrow::Cow, fmt};

use super::BackendMessage;
use crate::{common::ByteStr, ext::BytesExt};

/// An error when translating buffer from postgres
pub enum ProtocolError {
    Unexpected {
        found: u8,
        phase: Option<&'static str>,
    },
    UnknownAuth {
        auth: u32,
    },
    Malformed {
        reason: Cow<'static, str>,
    },
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Unexpected { found, phase } => {
                write!(f, "Unexpected message `{}`", BackendMessage::message_name(*found))?;
                if let Some(phase) = phase {
                    write!(f, " in `{phase}`")?
                }
                Ok(())
            },
            ProtocolError::UnknownAuth { auth } => write!(f, "Unknown authentication request `{auth}`"),
            ProtocolError::Malformed { reason } => write!(f, "Malformed message: {reason}"),
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected { found, phase: None }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected { found, phase: Some(phase) }
    }

    pub(crate) fn unknown_auth(auth: u32) -> ProtocolError {
        Self::UnknownAuth { auth }
    }

    pub(crate) fn malformed(reason: impl Into<Cow<'static, str>>) -> ProtocolError {
        Self::Malformed { reason: reason.into() }
    }
}

/// Fields of an `ErrorResponse` or `NoticeResponse` message.
///
/// Fields can appear in any order, unrecognized fields are kept and can be read with
/// [`field`][ServerError::field].
///
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Clone)]
pub struct ServerError {
    fields: Vec<(u8, ByteStr)>,
}

/// A non-fatal message reported by the server.
pub type Notice = ServerError;

impl ServerError {
    pub const SEVERITY: u8 = b'S';
    pub const SEVERITY_NONLOCALIZED: u8 = b'V';
    pub const CODE: u8 = b'C';
    pub const MESSAGE: u8 = b'M';
    pub const DETAIL: u8 = b'D';
    pub const HINT: u8 = b'H';
    pub const POSITION: u8 = b'P';
    pub const INTERNAL_POSITION: u8 = b'p';
    pub const INTERNAL_QUERY: u8 = b'q';
    pub const WHERE: u8 = b'W';
    pub const SCHEMA: u8 = b's';
    pub const TABLE: u8 = b't';
    pub const COLUMN: u8 = b'c';
    pub const DATA_TYPE: u8 = b'd';
    pub const CONSTRAINT: u8 = b'n';
    pub const FILE: u8 = b'F';
    pub const LINE: u8 = b'L';
    pub const ROUTINE: u8 = b'R';

    /// Decode message body.
    pub(crate) fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let mut fields = Vec::new();
        loop {
            body.need(1)?;
            let code = body.get_u8();
            if code == b'\0' {
                break;
            }
            fields.push((code, body.get_nul_bytestr()?));
        }
        Ok(Self { fields })
    }

    /// Create error that did not come from the server.
    pub(crate) fn local(severity: &'static str, code: &'static str, message: impl Into<ByteStr>) -> Self {
        Self {
            fields: vec![
                (Self::SEVERITY, ByteStr::from_static(severity)),
                (Self::CODE, ByteStr::from_static(code)),
                (Self::MESSAGE, message.into()),
            ],
        }
    }

    /// Returns field by its identification code.
    pub fn field(&self, code: u8) -> Option<&str> {
        self.fields
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_str())
    }

    /// `ERROR`, `FATAL`, or `PANIC` (in an error message), or `WARNING`, `NOTICE`, `DEBUG`,
    /// `INFO`, or `LOG` (in a notice message), possibly localized.
    pub fn severity(&self) -> &str {
        self.field(Self::SEVERITY).unwrap_or_default()
    }

    /// The SQLSTATE code for the error.
    ///
    /// <https://www.postgresql.org/docs/current/errcodes-appendix.html>
    pub fn code(&self) -> &str {
        self.field(Self::CODE).unwrap_or_default()
    }

    /// The primary human-readable error message.
    pub fn message(&self) -> &str {
        self.field(Self::MESSAGE).unwrap_or_default()
    }

    /// Optional secondary error message carrying more detail about the problem.
    pub fn detail(&self) -> Option<&str> {
        self.field(Self::DETAIL)
    }

    /// Optional suggestion what to do about the problem.
    pub fn hint(&self) -> Option<&str> {
        self.field(Self::HINT)
    }

    /// Error cursor position as an index into the original query string.
    pub fn position(&self) -> Option<u32> {
        self.field(Self::POSITION).and_then(|e| e.parse().ok())
    }

    /// Returns all fields in received order.
    pub fn fields(&self) -> impl Iterator<Item = (u8, &str)> {
        self.fields.iter().map(|(c, v)| (*c, v.as_str()))
    }
}

impl std::error::Error for ServerError { }

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity(), self.message())?;
        if let Some(code) = self.field(Self::CODE) {
            write!(f, " ({code})")?;
        }
        if let Some(detail) = self.detail() {
            write!(f, "\nDETAIL: {detail}")?;
        }
        if let Some(hint) = self.hint() {
            write!(f, "\nHINT: {hint}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (code, value) in &self.fields {
            map.entry(&(*code as char), value);
        }
        map.finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_fields() {
        let body = Bytes::from_static(
            b"SERROR\0C42P01\0Mrelation \"foo\" does not exist\0P15\0Zunknown\0\0",
        );
        let err = ServerError::decode(body).unwrap();
        assert_eq!(err.severity(), "ERROR");
        assert_eq!(err.code(), "42P01");
        assert_eq!(err.message(), "relation \"foo\" does not exist");
        assert_eq!(err.position(), Some(15));
        assert_eq!(err.detail(), None);
        assert_eq!(err.field(b'Z'), Some("unknown"));
        assert_eq!(err.to_string(), "ERROR: relation \"foo\" does not exist (42P01)");
    }

    #[test]
    fn decode_truncated() {
        assert!(ServerError::decode(Bytes::from_static(b"SERROR\0")).is_err());
    }
}
