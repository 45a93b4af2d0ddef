//! Query cancellation.
//!
//! A cancel request is sent over a brand new transport carrying the backend key
//! received during startup. The server closes that transport without replying.
//!
//! <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-CANCELING-REQUESTS>
use bytes::{Buf, BytesMut};
use std::{
    fmt, io,
    marker::PhantomData,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    Result,
    common::verbose,
    connection::{Config, PollStatus},
    postgres::frontend,
    transport::{Interest, Socket, Transport},
};

/// Timeout of [`Connection::cancel`][crate::Connection::cancel].
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend process identity, shared by a connection and its cancellation tokens.
#[derive(Debug)]
pub(crate) struct BackendKey {
    pub(crate) process_id: u32,
    pub(crate) secret_key: u32,
}

/// Detached token to cancel the query running on a connection.
///
/// Token is independent of the connection, it can be moved to another thread and used
/// while the connection is busy. A token outliving a reset targets the old backend.
pub struct Cancellation<T: Transport = Socket> {
    config: Config,
    key: Arc<BackendKey>,
    _transport: PhantomData<fn() -> T>,
}

impl<T: Transport> Cancellation<T> {
    pub(crate) fn new(config: Config, key: Arc<BackendKey>) -> Cancellation<T> {
        Cancellation { config, key, _transport: PhantomData }
    }

    /// Returns the backend process id this token cancels.
    pub fn process_id(&self) -> u32 {
        self.key.process_id
    }

    /// Start a non-blocking cancel request.
    pub fn start(&self) -> CancelRequest<T> {
        CancelRequest {
            config: self.config.clone(),
            process_id: self.key.process_id,
            secret_key: self.key.secret_key,
            transport: None,
            buf: BytesMut::new(),
            done: false,
        }
    }

    /// Send a cancel request, blocking up to `timeout`.
    ///
    /// Success only means the request was delivered, the query may still complete normally.
    pub fn do_cancel(&self, timeout: Duration) -> Result<()> {
        let mut request = self.start();
        request.config.connect_timeout = Some(timeout);
        request.wait(Some(Instant::now() + timeout))
    }
}

impl<T: Transport> Clone for Cancellation<T> {
    fn clone(&self) -> Self {
        Cancellation { config: self.config.clone(), key: self.key.clone(), _transport: PhantomData }
    }
}

impl<T: Transport> fmt::Debug for Cancellation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellation")
            .field("host", &self.config.host())
            .field("port", &self.config.port())
            .field("process_id", &self.key.process_id)
            .finish()
    }
}

/// A cancel request in progress.
pub struct CancelRequest<T: Transport = Socket> {
    config: Config,
    process_id: u32,
    secret_key: u32,
    transport: Option<T>,
    buf: BytesMut,
    done: bool,
}

impl<T: Transport> CancelRequest<T> {
    /// Advance the request.
    ///
    /// Returns [`PollStatus::Ready`] once the server closed the transport.
    pub fn poll(&mut self) -> Result<PollStatus> {
        if self.done {
            return Ok(PollStatus::Ready);
        }

        let transport = match &mut self.transport {
            Some(transport) => transport,
            None => {
                verbose!(pid = self.process_id, "sending cancel request");
                frontend::CancelRequest {
                    process_id: self.process_id,
                    secret_key: self.secret_key,
                }
                .write(&mut self.buf);
                self.transport.insert(T::open(&self.config)?)
            },
        };

        while !self.buf.is_empty() {
            match transport.write(&self.buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => self.buf.advance(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(PollStatus::Writing),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {},
                Err(err) => return Err(err.into()),
            }
        }

        // server replies nothing, end of stream means the request was processed
        let mut sink = BytesMut::new();
        loop {
            match transport.read(&mut sink) {
                Ok(0) => break,
                Ok(_) => sink.clear(),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(PollStatus::Reading),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {},
                Err(err) if err.kind() == io::ErrorKind::ConnectionReset => break,
                Err(err) => return Err(err.into()),
            }
        }

        let _ = transport.close();
        self.transport = None;
        self.done = true;
        Ok(PollStatus::Ready)
    }

    /// Block until the request completes or `deadline` passes.
    pub fn wait(&mut self, deadline: Option<Instant>) -> Result<()> {
        loop {
            let interest = match self.poll()? {
                PollStatus::Ready => return Ok(()),
                PollStatus::Failed => return Err(io::Error::other("cancel request failed").into()),
                PollStatus::Reading => Interest::Readable,
                PollStatus::Writing => Interest::Writable,
            };
            let Some(transport) = &self.transport else {
                continue;
            };
            let timeout = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(timeout) => Some(timeout),
                    None => return Err(io::Error::new(io::ErrorKind::TimedOut, "cancel request timed out").into()),
                },
                None => None,
            };
            if !transport.wait(interest, timeout)? {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "cancel request timed out").into());
            }
        }
    }

    /// Returns the transport of the request, [`None`] before the first poll and once done.
    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ErrorKind, Status,
        postgres::{Format, OidType},
        row::ResultStatus,
        testing::{Script, connected, frame, script},
    };

    fn assert_send_sync<T: Send + Sync>() { }

    #[test]
    fn token_is_send_sync() {
        assert_send_sync::<Cancellation>();
        assert_send_sync::<Cancellation<Script>>();
    }

    #[test]
    fn token_requires_backend_key() {
        let conn = crate::Connection::start_with::<Script>("user=bob").unwrap();
        let err = conn.cancellation().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NotReady(_)));
    }

    #[test]
    fn cancel_request_packet() {
        let (conn, _) = connected();
        let token = conn.cancellation().unwrap();
        assert_eq!(token.process_id(), 42);
        assert_eq!(conn.cancellation_count(), 1);

        let wire = script();
        wire.borrow_mut().close();
        token.do_cancel(Duration::from_secs(1)).unwrap();

        let sent = wire.borrow_mut().take_outbound();
        assert_eq!(
            &sent[..],
            &[0, 0, 0, 16, 0x04, 0xd2, 0x16, 0x2e, 0, 0, 0, 42, 0, 0, 0, 7],
        );
        assert!(wire.borrow().closed);

        drop(token);
        assert_eq!(conn.cancellation_count(), 0);
    }

    #[test]
    fn cancel_waits_for_server_close() {
        let (conn, _) = connected();
        let wire = script();
        let mut request = conn.cancellation().unwrap().start();
        assert_eq!(request.poll().unwrap(), PollStatus::Reading);
        assert!(request.transport().is_some());

        wire.borrow_mut().close();
        assert_eq!(request.poll().unwrap(), PollStatus::Ready);
        assert!(request.transport().is_none());
        assert_eq!(request.poll().unwrap(), PollStatus::Ready);
    }

    /// The server either cancels the statement, or the statement finished first.
    /// Both leave the connection idle.
    #[test]
    fn cancel_race() {
        for cancelled in [true, false] {
            let (mut conn, wire) = connected();
            conn.send_query("SELECT pg_sleep(10)").unwrap();

            let cancel_wire = script();
            cancel_wire.borrow_mut().close();
            conn.cancel().unwrap();

            if cancelled {
                wire.borrow_mut().push(frame::error("ERROR", "57014", "canceling statement due to user request"));
            } else {
                wire.borrow_mut().push(frame::row_description(&[("pg_sleep", OidType::Text.oid(), Format::Text)]));
                wire.borrow_mut().push(frame::data_row(&[Some(b"")]));
                wire.borrow_mut().push(frame::command_complete("SELECT 1"));
            }
            wire.borrow_mut().push(frame::ready(b'I'));

            let result = conn.get_result().unwrap().ready().unwrap();
            match cancelled {
                true => assert_eq!(result.error().map(|e| e.code()), Some("57014")),
                false => assert_eq!(result.status(), ResultStatus::TuplesOk),
            }
            assert!(conn.get_result().unwrap().is_exhausted());
            assert_eq!(conn.status(), Status::Idle);
        }
    }
}
