//! Value types beyond the rust primitives.
//!
//! Implementation [`Decode`][d] and [`Encode`][e] for:
//!
//! - [`Numeric`], postgres arbitrary precision number
//! - [`Uuid`]
//! - [`time`][::time]'s [`PrimitiveDateTime`][tp], [`OffsetDateTime`][to], [`Date`][td],
//!   [`Time`][tt], plus [`Interval`] and [`Infinite`] for infinite dates
//! - [`serde`]'s [`Deserialize`][sd] and [`Serialize`][ss] via [`Json`], requires `json` feature
//!
//! [d]: crate::Decode
//! [e]: crate::Encode
//! [sd]: serde::Deserialize
//! [ss]: serde::Serialize
//! [tp]: ::time::PrimitiveDateTime
//! [to]: ::time::OffsetDateTime
//! [td]: ::time::Date
//! [tt]: ::time::Time

pub(crate) mod numeric;
pub(crate) mod time;
pub(crate) mod uuid;

#[cfg(feature = "json")]
pub(crate) mod json;

pub use numeric::Numeric;
pub use time::{Infinite, Interval, PG_EPOCH_UNIX_OFFSET};
pub use uuid::Uuid;

#[cfg(feature = "json")]
pub use json::Json;
