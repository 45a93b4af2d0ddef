use super::ProtocolError;

/// Postgres data transmission format.
///
/// Clients can specify a format code for each transmitted parameter value and for each
/// column of a query result.
///
/// <https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES>
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Format {
    /// Text has format code zero.
    ///
    /// There is no trailing null character and the text format does not allow embedded nulls.
    #[default]
    Text,
    /// Binary has format code one.
    ///
    /// Integers use network byte order (most significant byte first).
    Binary,
}

impl Format {
    /// Return format code for current format.
    pub const fn format_code(&self) -> u16 {
        match self {
            Format::Text => 0,
            Format::Binary => 1,
        }
    }

    /// Get format from its code.
    pub fn from_code(code: u16) -> Result<Format, ProtocolError> {
        match code {
            0 => Ok(Format::Text),
            1 => Ok(Format::Binary),
            _ => Err(ProtocolError::malformed("unknown format code")),
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::Text => f.write_str("text"),
            Format::Binary => f.write_str("binary"),
        }
    }
}
