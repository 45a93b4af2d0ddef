//! Postgres frontend messages
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use bytes::{BufMut, BytesMut};

use super::{Format, Oid};
use crate::{encode::Param, ext::BufMutExt};

/// Largest message the server accepts, one byte short of 1GB.
///
/// Callers reject longer input before writing, so lengths always fit the `i32`/`u32`
/// fields of the protocol.
pub const MAX_MESSAGE: usize = 0x3fff_ffff;

/// A message with a type byte, written by [`write`].
pub trait FrontendMessage {
    const MSGTYPE: u8;

    /// Name used when tracing.
    const NAME: &'static str;

    /// Write the body, without type byte and length.
    fn body(&self, buf: &mut BytesMut);
}

/// Write a frontend message to `buf`.
pub fn write<F: FrontendMessage>(message: F, buf: &mut BytesMut) {
    buf.put_u8(F::MSGTYPE);
    with_length(buf, |buf| message.body(buf));
}

/// Reserve the length field, write with `f`, then fill the length in, which counts itself.
fn with_length(buf: &mut BytesMut, f: impl FnOnce(&mut BytesMut)) {
    let offset = buf.len();
    buf.put_u32(0);
    f(buf);
    let len = (buf.len() - offset) as u32;
    buf[offset..offset + 4].copy_from_slice(&len.to_be_bytes());
}

/// The first message on a connection, it has no type byte.
#[derive(Debug)]
pub struct Startup<'a> {
    pub user: &'a str,
    /// Defaults to the user name on the server.
    pub database: Option<&'a str>,
    /// Session defaults, e.g. `application_name`.
    pub params: &'a [(&'a str, &'a str)],
}

impl Startup<'_> {
    /// Major 3 minor 0.
    pub const PROTOCOL_VERSION: u32 = 3 << 16;

    pub fn write(self, buf: &mut BytesMut) {
        with_length(buf, |buf| {
            buf.put_u32(Self::PROTOCOL_VERSION);
            let database = self.database.map(|db| ("database", db));
            for (name, value) in [("user", self.user)].into_iter().chain(database) {
                buf.put_nul_string(name);
                buf.put_nul_string(value);
            }
            for (name, value) in self.params {
                buf.put_nul_string(name);
                buf.put_nul_string(value);
            }
            buf.put_u8(b'\0');
        });
    }
}

/// Sent on a fresh connection instead of [`Startup`], it has no type byte.
#[derive(Debug)]
pub struct CancelRequest {
    pub process_id: u32,
    pub secret_key: u32,
}

impl CancelRequest {
    /// `1234` in the high 16 bits, `5678` in the low 16 bits.
    pub const CODE: u32 = (1234 << 16) | 5678;

    pub fn write(self, buf: &mut BytesMut) {
        with_length(buf, |buf| {
            buf.put_u32(Self::CODE);
            buf.put_u32(self.process_id);
            buf.put_u32(self.secret_key);
        });
    }
}

macro_rules! message {
    (
        $(#[$doc:meta])*
        $name:ident$(<$lt:lifetime>)? { $($field:ident: $ty:ty),* $(,)? }, $msgtype:literal,
        |$me:ident, $buf:ident| $body:block
    ) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name$(<$lt>)? {
            $(pub $field: $ty,)*
        }

        impl$(<$lt>)? FrontendMessage for $name$(<$lt>)? {
            const MSGTYPE: u8 = $msgtype;
            const NAME: &'static str = stringify!($name);

            fn body(&self, $buf: &mut BytesMut) {
                let $me = self;
                $body
            }
        }
    };
}

message! {
    /// Cleartext or md5 hashed password.
    PasswordMessage<'a> { password: &'a str }, b'p',
    |me, buf| { buf.put_nul_string(me.password) }
}

message! {
    SaslInitialResponse<'a> { mechanism: &'a str, data: &'a [u8] }, b'p',
    |me, buf| {
        buf.put_nul_string(me.mechanism);
        buf.put_i32(me.data.len() as i32);
        buf.put_slice(me.data);
    }
}

message! {
    SaslResponse<'a> { data: &'a [u8] }, b'p',
    |me, buf| { buf.put_slice(me.data) }
}

message! {
    /// Simple query, may contain multiple statements.
    Query<'a> { sql: &'a str }, b'Q',
    |me, buf| { buf.put_nul_string(me.sql) }
}

message! {
    /// An empty `name` is the unnamed statement, a zero oid leaves the type to the server.
    Parse<'a> { name: &'a str, sql: &'a str, oids: &'a [Oid] }, b'P',
    |me, buf| {
        buf.put_nul_string(me.name);
        buf.put_nul_string(me.sql);
        buf.put_u16(me.oids.len() as u16);
        for oid in me.oids {
            buf.put_u32(*oid);
        }
    }
}

message! {
    /// Every parameter carries its own format, one format applies to all result columns.
    Bind<'a> { portal: &'a str, statement: &'a str, params: &'a [Param], result_format: Format }, b'B',
    |me, buf| {
        buf.put_nul_string(me.portal);
        buf.put_nul_string(me.statement);

        buf.put_u16(me.params.len() as u16);
        for param in me.params {
            buf.put_u16(param.format().format_code());
        }

        buf.put_u16(me.params.len() as u16);
        for param in me.params {
            match param.value() {
                Some(value) => {
                    buf.put_i32(value.len() as i32);
                    buf.put_slice(value);
                },
                None => buf.put_i32(-1),
            }
        }

        buf.put_u16(1);
        buf.put_u16(me.result_format.format_code());
    }
}

message! {
    /// `max_rows` of zero is no limit.
    Execute<'a> { portal: &'a str, max_rows: u32 }, b'E',
    |me, buf| {
        buf.put_nul_string(me.portal);
        buf.put_u32(me.max_rows);
    }
}

message! {
    /// `kind` is [`Describe::STATEMENT`] or [`Describe::PORTAL`].
    Describe<'a> { kind: u8, name: &'a str }, b'D',
    |me, buf| {
        buf.put_u8(me.kind);
        buf.put_nul_string(me.name);
    }
}

impl Describe<'_> {
    pub const STATEMENT: u8 = b'S';
    pub const PORTAL: u8 = b'P';
}

message! {
    /// Abort a COPY FROM STDIN, the server reports `message` as an error.
    CopyFail<'a> { message: &'a str }, b'f',
    |me, buf| { buf.put_nul_string(me.message) }
}

message! {
    Sync {}, b'S',
    |_me, _buf| {}
}

message! {
    Terminate {}, b'X',
    |_me, _buf| {}
}

#[cfg(test)]
mod test {
    use bytes::Buf;

    use super::*;

    #[test]
    fn startup_length() {
        let mut buf = BytesMut::new();
        Startup { user: "postgres", database: Some("test"), params: &[("client_encoding", "UTF8")] }
            .write(&mut buf);
        let len = (&buf[..4]).get_u32() as usize;
        assert_eq!(len, buf.len());
        assert_eq!((&buf[4..8]).get_u32(), 196_608);
        assert!(buf[8..].starts_with(b"user\0postgres\0database\0test\0"));
        assert!(buf.ends_with(b"client_encoding\0UTF8\0\0"));
    }

    #[test]
    fn cancel_request() {
        let mut buf = BytesMut::new();
        CancelRequest { process_id: 42, secret_key: 7 }.write(&mut buf);
        assert_eq!(
            &buf[..],
            &[0, 0, 0, 16, 0x04, 0xd2, 0x16, 0x2e, 0, 0, 0, 42, 0, 0, 0, 7]
        );
    }

    #[test]
    fn unit_message() {
        let mut buf = BytesMut::new();
        write(Sync {}, &mut buf);
        write(Terminate {}, &mut buf);
        assert_eq!(&buf[..], b"S\0\0\0\x04X\0\0\0\x04");
        assert_eq!(<Sync as FrontendMessage>::NAME, "Sync");
    }

    #[test]
    fn borrowed_message() {
        let mut buf = BytesMut::new();
        let sql = String::from("SELECT 1");
        write(Query { sql: &sql }, &mut buf);
        write(PasswordMessage { password: "secret" }, &mut buf);
        assert_eq!(&buf[..], b"Q\0\0\0\x0dSELECT 1\0p\0\0\0\x0bsecret\0");
        assert_eq!(<Parse<'_> as FrontendMessage>::NAME, "Parse");
    }

    #[test]
    fn bind_null_param() {
        let mut buf = BytesMut::new();
        let params = [Param::null(23), Param::binary(23, 1i32.to_be_bytes().to_vec())];
        write(
            Bind { portal: "", statement: "", params: &params, result_format: Format::Binary },
            &mut buf,
        );
        assert_eq!(buf[0], b'B');
        assert_eq!((&buf[1..5]).get_u32() as usize, buf.len() - 1);

        let mut body = &buf[5..];
        assert_eq!(body.get_u8(), 0); // portal
        assert_eq!(body.get_u8(), 0); // statement
        assert_eq!(body.get_u16(), 2);
        assert_eq!(body.get_u16(), 1);
        assert_eq!(body.get_u16(), 1);
        assert_eq!(body.get_u16(), 2);
        assert_eq!(body.get_i32(), -1);
        assert_eq!(body.get_i32(), 4);
        assert_eq!(body.get_i32(), 1);
        assert_eq!(body.get_u16(), 1);
        assert_eq!(body.get_u16(), 1);
        assert!(body.is_empty());
    }
}
