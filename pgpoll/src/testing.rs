//! Scripted backend for unit tests.
//!
//! [`Script`] is a [`Transport`] replaying canned backend messages from a shared [`Wire`],
//! and recording everything the connection writes.
use bytes::{BufMut, Bytes, BytesMut};
use std::{
    cell::RefCell,
    collections::VecDeque,
    io,
    rc::Rc,
    time::Duration,
};

use crate::{
    Connection,
    connection::{Config, PollStatus},
    ext::BufMutExt,
    transport::{Interest, Readiness, Transport},
};

thread_local! {
    static PENDING: RefCell<VecDeque<Rc<RefCell<Wire>>>> = const { RefCell::new(VecDeque::new()) };
}

/// Both ends of a scripted stream.
#[derive(Debug, Default)]
pub struct Wire {
    /// Framed backend messages not yet read.
    pub inbound: VecDeque<Bytes>,
    /// Bytes written by the client.
    pub outbound: BytesMut,
    /// Backend closed the stream, reads return `0` once inbound is drained.
    pub eof: bool,
    /// Client closed the stream.
    pub closed: bool,
}

impl Wire {
    pub fn push(&mut self, message: Bytes) {
        self.inbound.push_back(message);
    }

    /// Backend closes the stream.
    pub fn close(&mut self) {
        self.eof = true;
    }

    pub fn take_outbound(&mut self) -> BytesMut {
        self.outbound.split()
    }

    /// Successful trust authentication and the usual startup parameters.
    pub fn push_handshake(&mut self, process_id: u32) {
        self.push(frame::auth(0, &[]));
        self.push(frame::parameter_status("server_version", "16.2"));
        self.push(frame::parameter_status("standard_conforming_strings", "on"));
        self.push(frame::parameter_status("client_encoding", "UTF8"));
        self.push(frame::backend_key(process_id, 7));
        self.push(frame::ready(b'I'));
    }
}

/// Register a wire for the next [`Script::open`] on this thread.
pub fn script() -> Rc<RefCell<Wire>> {
    let wire = Rc::new(RefCell::new(Wire::default()));
    PENDING.with(|pending| pending.borrow_mut().push_back(wire.clone()));
    wire
}

/// An idle connection to backend pid `42` with secret key `7`.
pub fn connected() -> (Connection<Script>, Rc<RefCell<Wire>>) {
    let wire = script();
    wire.borrow_mut().push_handshake(42);

    let mut conn = Connection::start_with::<Script>("host=localhost user=postgres").unwrap();
    assert_eq!(conn.poll().unwrap(), PollStatus::Ready);
    wire.borrow_mut().take_outbound();
    (conn, wire)
}

/// [`Transport`] backed by a [`Wire`].
#[derive(Debug)]
pub struct Script {
    wire: Rc<RefCell<Wire>>,
}

impl Transport for Script {
    fn open(_: &Config) -> io::Result<Self> {
        match PENDING.with(|pending| pending.borrow_mut().pop_front()) {
            Some(wire) => Ok(Script { wire }),
            None => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "no scripted backend")),
        }
    }

    fn read(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        let mut wire = self.wire.borrow_mut();
        if wire.inbound.is_empty() {
            return match wire.eof {
                true => Ok(0),
                false => Err(io::ErrorKind::WouldBlock.into()),
            };
        }
        let mut read = 0;
        while let Some(message) = wire.inbound.pop_front() {
            read += message.len();
            buf.put(message);
        }
        Ok(read)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut wire = self.wire.borrow_mut();
        if wire.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        wire.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn readiness(&self) -> io::Result<Readiness> {
        let wire = self.wire.borrow();
        Ok(Readiness {
            readable: !wire.inbound.is_empty() || wire.eof,
            writable: !wire.closed,
        })
    }

    fn wait(&self, interest: Interest, timeout: Option<Duration>) -> io::Result<bool> {
        if self.readiness()?.is_ready(interest) {
            return Ok(true);
        }
        // nothing will ever arrive while the test thread waits
        match timeout {
            Some(_) => Ok(false),
            None => Err(io::Error::new(io::ErrorKind::TimedOut, "scripted backend has no more input")),
        }
    }

    fn duplicate(&self) -> io::Result<Self> {
        Ok(Script { wire: self.wire.clone() })
    }

    fn close(&mut self) -> io::Result<()> {
        self.wire.borrow_mut().closed = true;
        Ok(())
    }
}

/// Framed backend messages.
pub mod frame {
    use super::*;
    use crate::postgres::{Format, Oid};

    pub fn message(msgtype: u8, body: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + body.len());
        buf.put_u8(msgtype);
        buf.put_u32(4 + body.len() as u32);
        buf.put_slice(body);
        buf.freeze()
    }

    pub fn auth(code: u32, extra: &[u8]) -> Bytes {
        let mut body = code.to_be_bytes().to_vec();
        body.extend_from_slice(extra);
        message(b'R', &body)
    }

    pub fn backend_key(process_id: u32, secret_key: u32) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u32(process_id);
        body.put_u32(secret_key);
        message(b'K', &body)
    }

    pub fn parameter_status(name: &str, value: &str) -> Bytes {
        let mut body = BytesMut::new();
        body.put_nul_string(name);
        body.put_nul_string(value);
        message(b'S', &body)
    }

    pub fn ready(status: u8) -> Bytes {
        message(b'Z', &[status])
    }

    fn fields(severity: &str, code: &str, text: &str) -> BytesMut {
        let mut body = BytesMut::new();
        for (field, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', text)] {
            body.put_u8(field);
            body.put_nul_string(value);
        }
        body.put_u8(0);
        body
    }

    pub fn error(severity: &str, code: &str, text: &str) -> Bytes {
        message(b'E', &fields(severity, code, text))
    }

    pub fn notice(severity: &str, code: &str, text: &str) -> Bytes {
        message(b'N', &fields(severity, code, text))
    }

    pub fn notification(process_id: u32, channel: &str, payload: &str) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u32(process_id);
        body.put_nul_string(channel);
        body.put_nul_string(payload);
        message(b'A', &body)
    }

    pub fn row_description(columns: &[(&str, Oid, Format)]) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u16(columns.len() as u16);
        for (name, oid, format) in columns {
            body.put_nul_string(name);
            body.put_u32(0); // table oid
            body.put_i16(0); // column id
            body.put_u32(*oid);
            body.put_i16(-1); // type size
            body.put_i32(-1); // type modifier
            body.put_u16(format.format_code());
        }
        message(b'T', &body)
    }

    pub fn data_row(values: &[Option<&[u8]>]) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u16(values.len() as u16);
        for value in values {
            match value {
                Some(value) => {
                    body.put_i32(value.len() as i32);
                    body.put_slice(value);
                },
                None => body.put_i32(-1),
            }
        }
        message(b'D', &body)
    }

    pub fn command_complete(tag: &str) -> Bytes {
        let mut body = BytesMut::new();
        body.put_nul_string(tag);
        message(b'C', &body)
    }

    pub fn parameter_description(oids: &[Oid]) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u16(oids.len() as u16);
        for oid in oids {
            body.put_u32(*oid);
        }
        message(b't', &body)
    }

    pub fn parse_complete() -> Bytes {
        message(b'1', &[])
    }

    pub fn bind_complete() -> Bytes {
        message(b'2', &[])
    }

    pub fn no_data() -> Bytes {
        message(b'n', &[])
    }

    pub fn empty_query() -> Bytes {
        message(b'I', &[])
    }
}

/// Decoded backend messages.
pub mod backend {
    use bytes::Buf;

    use crate::postgres::{
        Format, Oid,
        backend::{DataRow, RowDescription},
    };

    fn body(mut message: bytes::Bytes) -> bytes::Bytes {
        message.advance(5);
        message
    }

    pub fn row_description(columns: &[(&str, Oid, Format)]) -> RowDescription {
        RowDescription::new(body(super::frame::row_description(columns))).unwrap()
    }

    pub fn data_row(values: &[Option<&[u8]>]) -> DataRow {
        DataRow::new(body(super::frame::data_row(values))).unwrap()
    }
}
