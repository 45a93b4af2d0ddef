//! The [`Transport`] trait.
use bytes::BytesMut;
use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::{
    io::{AsRawFd, RawFd},
    net::UnixStream,
};

use crate::connection::Config;

/// Establishing a connection is bounded by this when `connect_timeout` is not configured.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const READ_CHUNK: usize = 8 * 1024;

/// A non-blocking byte stream to the backend.
///
/// The connection state machine only moves bytes through this trait, framing and
/// protocol handling stay in [`Connection`][crate::Connection].
///
/// Implementor must never block in [`read`][Transport::read] or [`write`][Transport::write],
/// instead return [`io::ErrorKind::WouldBlock`].
pub trait Transport: Sized {
    /// Open a new stream to the server described by `config`.
    fn open(config: &Config) -> io::Result<Self>;

    /// Append available bytes into `buf`.
    ///
    /// Returns `0` when the server closed the stream.
    fn read(&mut self, buf: &mut BytesMut) -> io::Result<usize>;

    /// Write some bytes, returns how many were written.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Current readiness without waiting.
    fn readiness(&self) -> io::Result<Readiness>;

    /// Wait until the stream is ready for `interest`.
    ///
    /// Returns `false` when `timeout` elapsed first, [`None`] waits indefinitely.
    fn wait(&self, interest: Interest, timeout: Option<Duration>) -> io::Result<bool>;

    /// Returns another handle to the same stream.
    fn duplicate(&self) -> io::Result<Self>;

    /// Shutdown the stream.
    fn close(&mut self) -> io::Result<()>;

    /// Raw descriptor for external event loop integration.
    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

/// Readiness reported by [`Transport::readiness`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub fn is_ready(&self, interest: Interest) -> bool {
        match interest {
            Interest::Readable => self.readable,
            Interest::Writable => self.writable,
            Interest::Both => self.readable || self.writable,
        }
    }
}

/// Readiness to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    Both,
}

/// TCP or unix domain socket [`Transport`].
#[derive(Debug)]
pub struct Socket {
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Socket {
    /// Use an established TCP stream, see [`Connection::from_transport`][crate::Connection::from_transport].
    pub fn from_tcp(stream: TcpStream) -> io::Result<Socket> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self { kind: Kind::Tcp(stream) })
    }

    /// Use an established unix domain stream.
    #[cfg(unix)]
    pub fn from_unix(stream: UnixStream) -> io::Result<Socket> {
        stream.set_nonblocking(true)?;
        Ok(Self { kind: Kind::Unix(stream) })
    }

    fn connect_tcp(config: &Config) -> io::Result<TcpStream> {
        let host = config.hostaddr().unwrap_or(config.host());
        let timeout = config.connect_timeout().unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        let mut last_err = None;
        for addr in (host, config.port()).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                },
                Err(err) => last_err = Some(err),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("could not resolve host {host:?}"))
        }))
    }
}

impl Transport for Socket {
    fn open(config: &Config) -> io::Result<Self> {
        #[cfg(unix)]
        if let Some(path) = config.socket_path() {
            let stream = UnixStream::connect(path)?;
            stream.set_nonblocking(true)?;
            return Ok(Self { kind: Kind::Unix(stream) });
        }

        let stream = Self::connect_tcp(config)?;
        stream.set_nonblocking(true)?;
        Ok(Self { kind: Kind::Tcp(stream) })
    }

    fn read(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        // read in place into the tail, trimmed back to what was actually read
        let filled = buf.len();
        buf.resize(filled + READ_CHUNK, 0);
        let read = match &mut self.kind {
            Kind::Tcp(tcp) => tcp.read(&mut buf[filled..]),
            #[cfg(unix)]
            Kind::Unix(unix) => unix.read(&mut buf[filled..]),
        };
        buf.truncate(filled + *read.as_ref().unwrap_or(&0));
        read
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.kind {
            Kind::Tcp(tcp) => tcp.write(buf),
            #[cfg(unix)]
            Kind::Unix(unix) => unix.write(buf),
        }
    }

    fn readiness(&self) -> io::Result<Readiness> {
        #[cfg(unix)]
        return sys::poll(self.as_raw_fd(), Interest::Both, Some(Duration::ZERO));

        #[cfg(not(unix))]
        return Ok(Readiness { readable: true, writable: true });
    }

    fn wait(&self, interest: Interest, timeout: Option<Duration>) -> io::Result<bool> {
        #[cfg(unix)]
        return Ok(sys::poll(self.as_raw_fd(), interest, timeout)?.is_ready(interest));

        #[cfg(not(unix))]
        {
            let _ = (interest, timeout);
            std::thread::yield_now();
            Ok(true)
        }
    }

    fn duplicate(&self) -> io::Result<Self> {
        let kind = match &self.kind {
            Kind::Tcp(tcp) => Kind::Tcp(tcp.try_clone()?),
            #[cfg(unix)]
            Kind::Unix(unix) => Kind::Unix(unix.try_clone()?),
        };
        Ok(Self { kind })
    }

    fn close(&mut self) -> io::Result<()> {
        let result = match &self.kind {
            Kind::Tcp(tcp) => tcp.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Kind::Unix(unix) => unix.shutdown(Shutdown::Both),
        };
        match result {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            result => result,
        }
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }
}

#[cfg(unix)]
impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        match &self.kind {
            Kind::Tcp(tcp) => tcp.as_raw_fd(),
            Kind::Unix(unix) => unix.as_raw_fd(),
        }
    }
}

#[cfg(unix)]
mod sys {
    use std::{io, os::unix::io::RawFd, time::Duration};

    use super::{Interest, Readiness};

    pub(super) fn poll(fd: RawFd, interest: Interest, timeout: Option<Duration>) -> io::Result<Readiness> {
        let events = match interest {
            Interest::Readable => libc::POLLIN,
            Interest::Writable => libc::POLLOUT,
            Interest::Both => libc::POLLIN | libc::POLLOUT,
        };
        let timeout = timeout.map_or(-1, |t| t.as_millis().min(i32::MAX as u128) as libc::c_int);
        let mut pollfd = libc::pollfd { fd, events, revents: 0 };

        loop {
            // SAFETY: `pollfd` is a single valid element for the duration of the call
            let rc = unsafe { libc::poll(&mut pollfd, 1, timeout) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            break;
        }

        // hangup and error are reported as ready, the following read or write reports them
        let failed = pollfd.revents & (libc::POLLHUP | libc::POLLERR) != 0;
        Ok(Readiness {
            readable: pollfd.revents & libc::POLLIN != 0 || failed,
            writable: pollfd.revents & libc::POLLOUT != 0 || failed,
        })
    }
}
