//! Postgres backend messages
//!
//! Only the messages the connection state machine consumes are decoded into fields,
//! bodies the state machine ignores are dropped.
use bytes::{Buf, Bytes};

use super::{Notice, Oid, ProtocolError, ServerError};
use crate::{common::ByteStr, ext::BytesExt};

/// A decoded backend message.
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData { process_id: u32, secret_key: u32 },
    BindComplete,
    CloseComplete,
    CommandComplete(CommandComplete),
    CopyInResponse,
    CopyOutResponse,
    CopyBothResponse,
    CopyData,
    CopyDone,
    DataRow(DataRow),
    ErrorResponse(ServerError),
    EmptyQueryResponse,
    NegotiateProtocolVersion { minor: u32 },
    NoData,
    NoticeResponse(Notice),
    /// Body is decoded by [`Notify`][crate::Notify].
    NotificationResponse(Bytes),
    ParameterDescription(Vec<Oid>),
    ParameterStatus { name: ByteStr, value: ByteStr },
    ParseComplete,
    PortalSuspended,
    /// `I` idle, `T` in a transaction block, `E` in a failed transaction block.
    ReadyForQuery { status: u8 },
    RowDescription(RowDescription),
}

/// Message type byte and name of every backend message.
const MESSAGES: [(u8, &str); 23] = [
    (b'R', "Authentication"),
    (b'K', "BackendKeyData"),
    (b'2', "BindComplete"),
    (b'3', "CloseComplete"),
    (b'C', "CommandComplete"),
    (b'G', "CopyInResponse"),
    (b'H', "CopyOutResponse"),
    (b'W', "CopyBothResponse"),
    (b'd', "CopyData"),
    (b'c', "CopyDone"),
    (b'D', "DataRow"),
    (b'E', "ErrorResponse"),
    (b'I', "EmptyQueryResponse"),
    (b'v', "NegotiateProtocolVersion"),
    (b'n', "NoData"),
    (b'N', "NoticeResponse"),
    (b'A', "NotificationResponse"),
    (b't', "ParameterDescription"),
    (b'S', "ParameterStatus"),
    (b'1', "ParseComplete"),
    (b's', "PortalSuspended"),
    (b'Z', "ReadyForQuery"),
    (b'T', "RowDescription"),
];

impl BackendMessage {
    /// Decode message body of the given message type.
    pub fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        use BackendMessage::*;

        let message = match msgtype {
            b'R' => Authentication(self::Authentication::decode(body)?),
            b'K' => {
                body.need(8)?;
                BackendKeyData { process_id: body.get_u32(), secret_key: body.get_u32() }
            },
            b'2' => BindComplete,
            b'3' => CloseComplete,
            b'C' => CommandComplete(self::CommandComplete { tag: body.get_nul_bytestr()? }),
            b'G' => CopyInResponse,
            b'H' => CopyOutResponse,
            b'W' => CopyBothResponse,
            b'd' => CopyData,
            b'c' => CopyDone,
            b'D' => DataRow(self::DataRow::new(body)?),
            b'E' => ErrorResponse(ServerError::decode(body)?),
            b'I' => EmptyQueryResponse,
            b'v' => {
                body.need(4)?;
                NegotiateProtocolVersion { minor: body.get_u32() }
            },
            b'n' => NoData,
            b'N' => NoticeResponse(ServerError::decode(body)?),
            b'A' => NotificationResponse(body),
            b't' => {
                body.need(2)?;
                let len = body.get_u16() as usize;
                body.need(len * 4)?;
                ParameterDescription((0..len).map(|_| body.get_u32()).collect())
            },
            b'S' => ParameterStatus {
                name: body.get_nul_bytestr()?,
                value: body.get_nul_bytestr()?,
            },
            b'1' => ParseComplete,
            b's' => PortalSuspended,
            b'Z' => {
                body.need(1)?;
                ReadyForQuery { status: body.get_u8() }
            },
            b'T' => RowDescription(self::RowDescription::new(body)?),
            _ => return Err(ProtocolError::unknown(msgtype)),
        };
        Ok(message)
    }

    /// Returns the message type byte.
    pub fn msgtype(&self) -> u8 {
        use BackendMessage::*;

        match self {
            Authentication(_) => b'R',
            BackendKeyData { .. } => b'K',
            BindComplete => b'2',
            CloseComplete => b'3',
            CommandComplete(_) => b'C',
            CopyInResponse => b'G',
            CopyOutResponse => b'H',
            CopyBothResponse => b'W',
            CopyData => b'd',
            CopyDone => b'c',
            DataRow(_) => b'D',
            ErrorResponse(_) => b'E',
            EmptyQueryResponse => b'I',
            NegotiateProtocolVersion { .. } => b'v',
            NoData => b'n',
            NoticeResponse(_) => b'N',
            NotificationResponse(_) => b'A',
            ParameterDescription(_) => b't',
            ParameterStatus { .. } => b'S',
            ParseComplete => b'1',
            PortalSuspended => b's',
            ReadyForQuery { .. } => b'Z',
            RowDescription(_) => b'T',
        }
    }

    pub fn name(&self) -> &'static str {
        Self::message_name(self.msgtype())
    }

    /// Returns `"Unknown"` for unknown message type.
    pub fn message_name(msgtype: u8) -> &'static str {
        MESSAGES
            .iter()
            .find(|(ty, _)| *ty == msgtype)
            .map_or("Unknown", |(_, name)| name)
    }
}

/// Authentication request.
#[derive(Debug)]
pub enum Authentication {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    /// Nul separated mechanism names, in the server's order of preference.
    Sasl { mechanisms: Bytes },
    SaslContinue { data: Bytes },
    SaslFinal { data: Bytes },
    /// A recognized method this client cannot perform.
    Unsupported(&'static str),
}

impl Authentication {
    fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        body.need(4)?;
        let auth = match body.get_u32() {
            0 => Self::Ok,
            2 => Self::Unsupported("Kerberos V5"),
            3 => Self::CleartextPassword,
            5 => {
                body.need(4)?;
                Self::Md5Password { salt: body.get_u32().to_be_bytes() }
            },
            7 | 8 => Self::Unsupported("GSSAPI"),
            9 => Self::Unsupported("SSPI"),
            10 => Self::Sasl { mechanisms: body },
            11 => Self::SaslContinue { data: body },
            12 => Self::SaslFinal { data: body },
            auth => return Err(ProtocolError::unknown_auth(auth)),
        };
        Ok(auth)
    }

    /// Iterate SASL mechanism names.
    pub fn sasl_mechanisms(mechanisms: &Bytes) -> impl Iterator<Item = &[u8]> {
        mechanisms.split(|e| *e == b'\0').filter(|e| !e.is_empty())
    }
}

/// Column descriptors, parsed by [`Column`][crate::Column].
#[derive(Debug)]
pub struct RowDescription {
    pub field_len: u16,
    pub body: Bytes,
}

impl RowDescription {
    pub(crate) fn new(mut body: Bytes) -> Result<Self, ProtocolError> {
        body.need(2)?;
        Ok(Self { field_len: body.get_u16(), body })
    }
}

/// One row, each value prefixed by its `i32` length, `-1` for NULL.
#[derive(Debug)]
pub struct DataRow {
    pub column_len: u16,
    pub body: Bytes,
}

impl DataRow {
    pub(crate) fn new(mut body: Bytes) -> Result<Self, ProtocolError> {
        body.need(2)?;
        Ok(Self { column_len: body.get_u16(), body })
    }
}

/// Command completion tag, e.g. `INSERT 0 3` or `CREATE TABLE`.
#[derive(Debug)]
pub struct CommandComplete {
    pub tag: ByteStr,
}

impl CommandComplete {
    /// Returns the row count carried by the tag, `0` for commands without one.
    pub fn rows(&self) -> u64 {
        let mut words = self.tag.split(' ');
        let count = match words.next() {
            // INSERT oid rows
            Some("INSERT") => words.nth(1),
            Some("SELECT" | "UPDATE" | "DELETE" | "MERGE" | "FETCH" | "MOVE" | "COPY") => words.next(),
            _ => None,
        };
        count.and_then(|n| n.parse().ok()).unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cmd(tag: &'static str) -> CommandComplete {
        CommandComplete { tag: ByteStr::from_static(tag) }
    }

    #[test]
    fn command_tag_rows() {
        assert_eq!(cmd("INSERT 0 3").rows(), 3);
        assert_eq!(cmd("SELECT 12").rows(), 12);
        assert_eq!(cmd("UPDATE 1").rows(), 1);
        assert_eq!(cmd("CREATE TABLE").rows(), 0);
        assert_eq!(cmd("BEGIN").rows(), 0);
    }

    #[test]
    fn decode_unknown() {
        let err = BackendMessage::decode(b'@', Bytes::new()).unwrap_err();
        assert_eq!(err.to_string(), "Unexpected message `Unknown`");
    }

    #[test]
    fn decode_short_body() {
        assert!(BackendMessage::decode(b'K', Bytes::from_static(&[0, 0, 0, 1])).is_err());
        assert!(BackendMessage::decode(b'Z', Bytes::new()).is_err());
        // declares two parameters, carries one
        assert!(BackendMessage::decode(b't', Bytes::from_static(&[0, 2, 0, 0, 0, 23])).is_err());
    }

    #[test]
    fn message_names() {
        for (msgtype, name) in MESSAGES {
            assert_eq!(BackendMessage::message_name(msgtype), name);
        }
        let message = BackendMessage::decode(b'Z', Bytes::from_static(b"I")).unwrap();
        assert_eq!(message.name(), "ReadyForQuery");
    }

    #[test]
    fn unsupported_auth() {
        let message = BackendMessage::decode(b'R', Bytes::from_static(&[0, 0, 0, 9])).unwrap();
        assert!(matches!(message, BackendMessage::Authentication(Authentication::Unsupported("SSPI"))));
        assert!(BackendMessage::decode(b'R', Bytes::from_static(&[0, 0, 0, 99])).is_err());
    }

    #[test]
    fn sasl_mechanism_list() {
        let list = Bytes::from_static(b"SCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0");
        let names: Vec<_> = Authentication::sasl_mechanisms(&list).collect();
        assert_eq!(names, [&b"SCRAM-SHA-256-PLUS"[..], b"SCRAM-SHA-256"]);
    }
}
