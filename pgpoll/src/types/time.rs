use time::{
    Date, Duration, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset,
    format_description::BorrowedFormatItem,
    macros::format_description,
};

use crate::{
    Decode, DecodeError, Encode,
    encode::Param,
    postgres::{Format, Oid, OidType, PgType},
    row::Field,
    value::Value,
};

/// Julian day of the postgres epoch, 2000-01-01.
const PG_EPOCH_JULIAN_DAY: i32 = 2_451_545;

/// Seconds between the unix epoch and the postgres epoch.
pub const PG_EPOCH_UNIX_OFFSET: i64 = 946_684_800;

const PG_EPOCH: PrimitiveDateTime = {
    let date = match Date::from_julian_day(PG_EPOCH_JULIAN_DAY) {
        Ok(ok) => ok,
        Err(_) => panic!("postgres epoch is a valid date"),
    };
    PrimitiveDateTime::new(date, Time::MIDNIGHT)
};

const MICROS_PER_DAY: i64 = 86_400_000_000;

/// Date or timestamp value that may be infinite.
///
/// Postgres stores `infinity` and `-infinity` as the extreme values of the binary representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Infinite<T> {
    NegInfinity,
    Finite(T),
    Infinity,
}

impl<T> Infinite<T> {
    /// Returns the finite value.
    pub fn finite(self) -> Option<T> {
        match self {
            Infinite::Finite(t) => Some(t),
            _ => None,
        }
    }
}

impl<T: std::fmt::Display> std::fmt::Display for Infinite<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Infinite::NegInfinity => f.write_str("-infinity"),
            Infinite::Finite(t) => std::fmt::Display::fmt(t, f),
            Infinite::Infinity => f.write_str("infinity"),
        }
    }
}

/// Postgres `interval`.
///
/// Months and days are kept apart from the time part, as their length depends on the
/// date the interval is applied to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interval {
    pub months: i32,
    pub days: i32,
    pub microseconds: i64,
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} mons {} days {} us", self.months, self.days, self.microseconds)
    }
}

fn malformed(oid: Oid, reason: &'static str) -> DecodeError {
    DecodeError::Malformed { oid, reason: reason.into() }
}

fn be<const N: usize>(oid: Oid, bytes: &[u8]) -> Result<[u8; N], DecodeError> {
    bytes.try_into().map_err(|_| malformed(oid, "invalid length"))
}

fn infinite_text<T>(text: &str) -> Option<Infinite<T>> {
    match text {
        "infinity" => Some(Infinite::Infinity),
        "-infinity" => Some(Infinite::NegInfinity),
        _ => None,
    }
}

// ===== Decode =====

pub(crate) fn timestamp(oid: Oid, format: Format, bytes: &[u8]) -> Result<Infinite<PrimitiveDateTime>, DecodeError> {
    match format {
        Format::Binary => match i64::from_be_bytes(be(oid, bytes)?) {
            i64::MAX => Ok(Infinite::Infinity),
            i64::MIN => Ok(Infinite::NegInfinity),
            micros => PG_EPOCH
                .checked_add(Duration::microseconds(micros))
                .map(Infinite::Finite)
                .ok_or_else(|| malformed(oid, "timestamp out of range")),
        },
        Format::Text => {
            let text = std::str::from_utf8(bytes)?;
            if let Some(inf) = infinite_text(text) {
                return Ok(inf);
            }
            PrimitiveDateTime::parse(text, DATE_TIME)
                .map(Infinite::Finite)
                .map_err(|_| malformed(oid, "invalid timestamp"))
        },
    }
}

pub(crate) fn timestamptz(oid: Oid, format: Format, bytes: &[u8]) -> Result<Infinite<OffsetDateTime>, DecodeError> {
    match format {
        Format::Binary => Ok(timestamp(oid, format, bytes)?.map(PrimitiveDateTime::assume_utc)),
        Format::Text => {
            let text = std::str::from_utf8(bytes)?;
            if let Some(inf) = infinite_text(text) {
                return Ok(inf);
            }
            // offset follows the time part, e.g. `+07`, `-03:30`
            let time_start = text.find(' ').ok_or_else(|| malformed(oid, "invalid timestamptz"))?;
            let split = text[time_start..]
                .find(['+', '-'])
                .map(|i| i + time_start)
                .ok_or_else(|| malformed(oid, "missing time zone offset"))?;
            let (datetime, offset) = text.split_at(split);
            let datetime = PrimitiveDateTime::parse(datetime, DATE_TIME)
                .map_err(|_| malformed(oid, "invalid timestamptz"))?;
            let offset = parse_offset(offset).ok_or_else(|| malformed(oid, "invalid time zone offset"))?;
            Ok(Infinite::Finite(datetime.assume_offset(offset)))
        },
    }
}

pub(crate) fn date(oid: Oid, format: Format, bytes: &[u8]) -> Result<Infinite<Date>, DecodeError> {
    match format {
        Format::Binary => match i32::from_be_bytes(be(oid, bytes)?) {
            i32::MAX => Ok(Infinite::Infinity),
            i32::MIN => Ok(Infinite::NegInfinity),
            days => PG_EPOCH_JULIAN_DAY
                .checked_add(days)
                .and_then(|day| Date::from_julian_day(day).ok())
                .map(Infinite::Finite)
                .ok_or_else(|| malformed(oid, "date out of range")),
        },
        Format::Text => {
            let text = std::str::from_utf8(bytes)?;
            if let Some(inf) = infinite_text(text) {
                return Ok(inf);
            }
            Date::parse(text, DATE)
                .map(Infinite::Finite)
                .map_err(|_| malformed(oid, "invalid date"))
        },
    }
}

pub(crate) fn time(oid: Oid, format: Format, bytes: &[u8]) -> Result<Time, DecodeError> {
    match format {
        Format::Binary => {
            let micros = i64::from_be_bytes(be(oid, bytes)?);
            if !(0..MICROS_PER_DAY).contains(&micros) {
                return Err(malformed(oid, "time out of range"));
            }
            let secs = micros / 1_000_000;
            Time::from_hms_micro(
                (secs / 3600) as u8,
                (secs / 60 % 60) as u8,
                (secs % 60) as u8,
                (micros % 1_000_000) as u32,
            )
            .map_err(|_| malformed(oid, "time out of range"))
        },
        Format::Text => {
            let text = std::str::from_utf8(bytes)?;
            Time::parse(text, TIME).map_err(|_| malformed(oid, "invalid time"))
        },
    }
}

pub(crate) fn interval(oid: Oid, format: Format, bytes: &[u8]) -> Result<Interval, DecodeError> {
    match format {
        Format::Binary => {
            let bytes: [u8; 16] = be(oid, bytes)?;
            let (micros, rest) = bytes.split_at(8);
            let (days, months) = rest.split_at(4);
            Ok(Interval {
                microseconds: i64::from_be_bytes(be(oid, micros)?),
                days: i32::from_be_bytes(be(oid, days)?),
                months: i32::from_be_bytes(be(oid, months)?),
            })
        },
        // text output depends on the server `IntervalStyle`
        Format::Text => Err(DecodeError::Unsupported { oid, format }),
    }
}

impl<T> Infinite<T> {
    fn map<U>(self, f: impl FnOnce(T) -> U) -> Infinite<U> {
        match self {
            Infinite::NegInfinity => Infinite::NegInfinity,
            Infinite::Finite(t) => Infinite::Finite(f(t)),
            Infinite::Infinity => Infinite::Infinity,
        }
    }
}

fn parse_offset(text: &str) -> Option<UtcOffset> {
    let (sign, text) = match text.as_bytes().first()? {
        b'+' => (1, &text[1..]),
        b'-' => (-1, &text[1..]),
        _ => return None,
    };
    let mut parts = text.split(':').map(str::parse::<i8>);
    let h = parts.next()?.ok()?;
    let m = parts.next().transpose().ok()?.unwrap_or(0);
    let s = parts.next().transpose().ok()?.unwrap_or(0);
    UtcOffset::from_hms(sign * h, sign * m, sign * s).ok()
}

// ===== Encode =====

fn timestamp_micros(datetime: PrimitiveDateTime) -> i64 {
    (datetime - PG_EPOCH).whole_microseconds() as i64
}

impl PgType for PrimitiveDateTime {
    const OID: Oid = OidType::Timestamp.oid();
}

impl PgType for OffsetDateTime {
    const OID: Oid = OidType::TimestampTz.oid();
}

impl PgType for Date {
    const OID: Oid = OidType::Date.oid();
}

impl PgType for Time {
    const OID: Oid = OidType::Time.oid();
}

impl PgType for Interval {
    const OID: Oid = OidType::Interval.oid();
}

impl Encode for PrimitiveDateTime {
    fn encode(self) -> Param {
        Param::binary(Self::OID, timestamp_micros(self).to_be_bytes().to_vec())
    }
}

impl Encode for OffsetDateTime {
    fn encode(self) -> Param {
        let utc = self.to_offset(UtcOffset::UTC);
        let micros = timestamp_micros(PrimitiveDateTime::new(utc.date(), utc.time()));
        Param::binary(Self::OID, micros.to_be_bytes().to_vec())
    }
}

impl Encode for Date {
    fn encode(self) -> Param {
        let days = self.to_julian_day() - PG_EPOCH_JULIAN_DAY;
        Param::binary(Self::OID, days.to_be_bytes().to_vec())
    }
}

impl Encode for Time {
    fn encode(self) -> Param {
        let micros = (self - Time::MIDNIGHT).whole_microseconds() as i64;
        Param::binary(Self::OID, micros.to_be_bytes().to_vec())
    }
}

impl Encode for Interval {
    fn encode(self) -> Param {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&self.microseconds.to_be_bytes());
        buf.extend_from_slice(&self.days.to_be_bytes());
        buf.extend_from_slice(&self.months.to_be_bytes());
        Param::binary(Self::OID, buf)
    }
}

// ===== Decode trait =====

macro_rules! decode_finite {
    ($ty:ty, $variant:ident, $what:literal) => {
        impl Decode<'_> for $ty {
            fn decode(field: Field<'_>) -> Result<Self, DecodeError> {
                match field.value()? {
                    Value::$variant(Infinite::Finite(v)) => Ok(v),
                    Value::$variant(_) => Err(malformed(field.oid(), concat!("infinite ", $what))),
                    Value::Null => Err(DecodeError::Null),
                    _ => Err(DecodeError::mismatch::<Self>(field.oid())),
                }
            }
        }

        impl Decode<'_> for Infinite<$ty> {
            fn decode(field: Field<'_>) -> Result<Self, DecodeError> {
                match field.value()? {
                    Value::$variant(v) => Ok(v),
                    Value::Null => Err(DecodeError::Null),
                    _ => Err(DecodeError::mismatch::<Self>(field.oid())),
                }
            }
        }
    };
}

decode_finite!(PrimitiveDateTime, Timestamp, "timestamp");
decode_finite!(OffsetDateTime, TimestampTz, "timestamptz");
decode_finite!(Date, Date, "date");

impl Decode<'_> for Time {
    fn decode(field: Field<'_>) -> Result<Self, DecodeError> {
        match field.value()? {
            Value::Time(v) => Ok(v),
            Value::Null => Err(DecodeError::Null),
            _ => Err(DecodeError::mismatch::<Self>(field.oid())),
        }
    }
}

impl Decode<'_> for Interval {
    fn decode(field: Field<'_>) -> Result<Self, DecodeError> {
        match field.value()? {
            Value::Interval(v) => Ok(v),
            Value::Null => Err(DecodeError::Null),
            _ => Err(DecodeError::mismatch::<Self>(field.oid())),
        }
    }
}

const DATE: &[BorrowedFormatItem<'_>] = format_description!("[year]-[month]-[day]");

const TIME: &[BorrowedFormatItem<'_>] =
    format_description!("[hour]:[minute]:[second][optional [.[subsecond]]]");

const DATE_TIME: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]]");
