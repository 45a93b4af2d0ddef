//! Non-blocking Postgres client
//!
//! The connection is a state machine driven by the caller, no thread or event loop is
//! spawned. It can be driven by hand, by the blocking conveniences, or by the tokio adapter.
//!
//! # Examples
//!
//! Blocking:
//!
//! ```no_run
//! use pgpoll::Connection;
//!
//! # fn app() -> pgpoll::Result<()> {
//! let mut conn = Connection::connect("host=localhost user=postgres")?;
//!
//! let result = conn.exec("SELECT 420, 'Foo'")?;
//! let answer = result.answer()?;
//!
//! assert_eq!(answer.get::<i32>(0, 0)?, 420);
//! assert_eq!(answer.get::<&str>(0, 1)?, "Foo");
//! # Ok(())
//! # }
//! ```
//!
//! Non-blocking, waiting for readiness between polls:
//!
//! ```no_run
//! use pgpoll::{Connection, Fetch, PollStatus};
//!
//! # fn app() -> pgpoll::Result<()> {
//! let mut conn = Connection::start("postgres://postgres@localhost/postgres")?;
//!
//! loop {
//!     match conn.poll()? {
//!         PollStatus::Ready => break,
//!         PollStatus::Failed => panic!("{}", conn.error_message()),
//!         PollStatus::Reading | PollStatus::Writing => {
//!             // wait for `status.interest()` on `conn.socket()` in an event loop
//!         },
//!     }
//! }
//!
//! conn.set_nonblocking(true)?;
//! conn.send_query("SELECT generate_series(1, 3)")?;
//! conn.set_single_row_mode();
//!
//! loop {
//!     match conn.get_result()? {
//!         Fetch::Ready(result) => println!("{result:?}"),
//!         Fetch::WouldBlock => { /* wait until readable */ },
//!         Fetch::Exhausted => break,
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod common;
mod ext;

// Protocol
pub mod postgres;

// Encoding
mod value;
pub mod encode;
pub mod array;
pub mod types;

// Component
pub mod row;
pub mod notify;

// Operation
pub mod transport;
pub mod query;
pub mod cancel;

// Connection
pub mod connection;

#[cfg(all(feature = "tokio", unix))]
pub mod tokio;

mod error;

#[cfg(test)]
mod testing;


pub use encode::{Encode, Param};
pub use value::Value;
pub use array::{Array, ArrayBuilder};
pub use row::{Answer, Column, Decode, DecodeError, Field, FromRow, QueryResult, ResultStatus, Row};
pub use postgres::{Format, Notice, Oid, OidType, ServerError};

pub use transport::{Interest, Readiness, Socket, Transport};
pub use connection::{Config, Connection, Fetch, Handshake, PollStatus, Status, TransactionStatus};
pub use cancel::{CancelRequest, Cancellation};
pub use notify::Notify;
pub use error::{Error, ErrorKind, Result};

#[cfg(all(feature = "tokio", unix))]
pub use crate::tokio::AsyncConnection;
