//! Tokio integration.
//!
//! [`AsyncConnection`] drives the same [`Connection`] state machine in non-blocking mode,
//! awaiting socket readiness through [`AsyncFd`] between polls.
use futures_core::Stream;
use std::{
    io,
    os::unix::io::RawFd,
    pin::Pin,
    task::{Context, Poll, ready},
};
use ::tokio::io::unix::AsyncFd;

use crate::{
    Config, Connection, Result,
    cancel::DEFAULT_TIMEOUT,
    common::verbose,
    connection::{ConnectionLost, Fetch, PollStatus},
    encode::Param,
    notify::Notify,
    postgres::Format,
    row::QueryResult,
    transport::Socket,
};

/// Connection driven by tokio.
pub struct AsyncConnection {
    // deregistered before the connection closes the socket
    fd: AsyncFd<RawFd>,
    conn: Connection,
}

impl AsyncConnection {
    /// Connect without blocking the runtime.
    ///
    /// Opening the socket is bounded by `connect_timeout` and runs on the blocking pool.
    pub async fn connect(conninfo: &str) -> Result<AsyncConnection> {
        let mut config = Config::parse(conninfo)?;
        config.fill_env();
        Self::connect_config(config).await
    }

    /// Connect with config from environment variables, see [`Config::from_env`].
    pub async fn connect_env() -> Result<AsyncConnection> {
        Self::connect_config(Config::from_env()).await
    }

    /// Connect with parsed config without blocking the runtime.
    pub async fn connect_config(config: Config) -> Result<AsyncConnection> {
        let mut conn = Connection::with_config(config);
        conn.set_nonblocking(true)?;

        let (conn, status) = ::tokio::task::spawn_blocking(move || {
            let status = conn.poll();
            (conn, status)
        })
        .await
        .map_err(io::Error::other)?;

        Self::handshake(conn, status?).await
    }

    /// Drive the startup phase on an established socket.
    pub async fn from_socket(config: Config, socket: Socket) -> Result<AsyncConnection> {
        let mut conn = Connection::from_transport(config, socket);
        conn.set_nonblocking(true)?;
        let status = conn.poll()?;
        Self::handshake(conn, status).await
    }

    async fn handshake(conn: Connection, mut status: PollStatus) -> Result<AsyncConnection> {
        let fd = conn.socket().ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let mut me = AsyncConnection { fd: AsyncFd::new(fd)?, conn };
        loop {
            match status {
                PollStatus::Ready => break,
                PollStatus::Failed => return Err(ConnectionLost::new(me.conn.error_message()).into()),
                status => me.wait(status).await?,
            }
            status = me.conn.poll()?;
        }
        verbose!(pid = me.conn.backend_pid(), "async connection ready");
        Ok(me)
    }

    async fn wait(&self, status: PollStatus) -> io::Result<()> {
        // readiness is cleared before polling, so an event arriving during the poll is kept
        match status {
            PollStatus::Reading => self.fd.readable().await?.clear_ready(),
            PollStatus::Writing => self.fd.writable().await?.clear_ready(),
            PollStatus::Ready | PollStatus::Failed => {},
        }
        Ok(())
    }

    /// Write every queued message.
    async fn flush(&mut self) -> Result<()> {
        while !self.conn.flush()? {
            self.wait(PollStatus::Writing).await?;
        }
        Ok(())
    }

    /// Returns the next result of the running query, [`None`] when exhausted.
    pub async fn next_result(&mut self) -> Result<Option<QueryResult>> {
        self.flush().await?;
        loop {
            match self.conn.get_result()? {
                Fetch::Ready(result) => return Ok(Some(result)),
                Fetch::Exhausted => return Ok(None),
                Fetch::WouldBlock => {
                    let status = self.conn.poll()?;
                    self.wait(status).await?;
                },
            }
        }
    }

    /// Run a simple query and collect every result.
    pub async fn query(&mut self, sql: &str) -> Result<Vec<QueryResult>> {
        self.conn.send_query(sql)?;
        self.collect().await
    }

    /// Run a parameterized statement and collect every result.
    pub async fn query_params(&mut self, sql: &str, params: &[Param], result_format: Format) -> Result<Vec<QueryResult>> {
        self.conn.send_query_params(sql, params, result_format)?;
        self.collect().await
    }

    async fn collect(&mut self) -> Result<Vec<QueryResult>> {
        let mut results = vec![];
        while let Some(result) = self.next_result().await? {
            results.push(result);
        }
        Ok(results)
    }

    /// Cancel the running query on the blocking pool.
    pub async fn cancel(&self) -> Result<()> {
        let token = self.conn.cancellation()?;
        ::tokio::task::spawn_blocking(move || token.do_cancel(DEFAULT_TIMEOUT))
            .await
            .map_err(io::Error::other)?
    }

    /// Returns stream of received notifications.
    ///
    /// The stream ends when the connection is closed by the server.
    pub fn notifications(&mut self) -> Notifications<'_> {
        Notifications { me: self }
    }

    pub fn get_ref(&self) -> &Connection {
        &self.conn
    }

    /// Returns the inner connection, it is in non-blocking mode.
    pub fn get_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Returns the inner connection in blocking mode.
    pub fn into_inner(self) -> Result<Connection> {
        let AsyncConnection { fd, mut conn } = self;
        drop(fd);
        conn.set_nonblocking(false)?;
        Ok(conn)
    }
}

impl std::fmt::Debug for AsyncConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.conn, f)
    }
}

/// Stream returned by [`AsyncConnection::notifications`].
pub struct Notifications<'a> {
    me: &'a mut AsyncConnection,
}

impl Stream for Notifications<'_> {
    type Item = Result<Notify>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let AsyncConnection { fd, conn } = &mut *self.get_mut().me;
        loop {
            if let Some(notify) = conn.next_notify() {
                return Poll::Ready(Some(Ok(notify)));
            }
            if conn.status() != crate::Status::Idle && conn.status() != crate::Status::Busy {
                return Poll::Ready(None);
            }

            let mut guard = match ready!(fd.poll_read_ready(cx)) {
                Ok(guard) => guard,
                Err(err) => return Poll::Ready(Some(Err(err.into()))),
            };
            guard.clear_ready();
            if let Err(err) = conn.consume_input() {
                return Poll::Ready(Some(Err(err)));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        io::{Read, Write},
        os::unix::net::UnixStream,
        thread,
    };

    use super::*;
    use crate::{
        postgres::OidType,
        row::ResultStatus,
        testing::frame,
    };

    /// Minimal backend: reads the startup packet and one query, then replies.
    ///
    /// The stream is handed back so it stays open until the test is done.
    fn serve(mut server: UnixStream) -> thread::JoinHandle<UnixStream> {
        thread::spawn(move || {
            let mut len = [0u8; 4];
            server.read_exact(&mut len).unwrap();
            let mut startup = vec![0u8; u32::from_be_bytes(len) as usize - 4];
            server.read_exact(&mut startup).unwrap();

            for message in [
                frame::auth(0, &[]),
                frame::parameter_status("server_version", "16.2"),
                frame::backend_key(1, 2),
                frame::ready(b'I'),
            ] {
                server.write_all(&message).unwrap();
            }

            let mut header = [0u8; 5];
            server.read_exact(&mut header).unwrap();
            assert_eq!(header[0], b'Q');
            let mut query = vec![0u8; u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize - 4];
            server.read_exact(&mut query).unwrap();

            for message in [
                frame::row_description(&[("n", OidType::Int4.oid(), Format::Text)]),
                frame::data_row(&[Some(b"1")]),
                frame::command_complete("SELECT 1"),
                frame::ready(b'I'),
                frame::notification(1, "jobs", "done"),
            ] {
                server.write_all(&message).unwrap();
            }
            server
        })
    }

    #[::tokio::test]
    async fn query_and_notification() {
        let (client, server) = UnixStream::pair().unwrap();
        let backend = serve(server);

        let socket = Socket::from_unix(client).unwrap();
        let mut conn = AsyncConnection::from_socket(Config::default(), socket).await.unwrap();
        assert_eq!(conn.get_ref().backend_pid(), 1);

        let results = conn.query("SELECT 1").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status(), ResultStatus::TuplesOk);
        assert_eq!(results[0].answer().unwrap().get::<i32>(0, 0).unwrap(), 1);

        let mut notifications = conn.notifications();
        let notify = std::future::poll_fn(|cx| Pin::new(&mut notifications).poll_next(cx))
            .await
            .unwrap()
            .unwrap();
        assert_eq!((notify.channel(), notify.payload()), ("jobs", "done"));

        drop(backend.join().unwrap());
    }
}
