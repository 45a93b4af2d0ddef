//! Dynamically typed column value.
use bytes::Bytes;
use std::{borrow::Cow, fmt};
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time};

use crate::{
    array::Array,
    ext::FmtExt,
    postgres::{Format, Kind, Oid},
    row::DecodeError,
    types::{Infinite, Interval, Numeric, Uuid, numeric, time as pgtime, uuid},
};

/// Column value decoded by its [`Kind`].
///
/// Text and bytes borrow from the row storage when the wire representation allows it.
#[derive(Clone, PartialEq)]
pub enum Value<'a> {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Oid(Oid),
    Float4(f32),
    Float8(f64),
    Numeric(Numeric),
    Text(Cow<'a, str>),
    Bytes(Cow<'a, [u8]>),
    /// `json` or `jsonb` document text.
    Json(Cow<'a, str>),
    Uuid(Uuid),
    Date(Infinite<Date>),
    Time(Time),
    Timestamp(Infinite<PrimitiveDateTime>),
    TimestampTz(Infinite<OffsetDateTime>),
    Interval(Interval),
    Array(Array),
    /// Unregistered, range or composite type, passed through as is.
    Raw(&'a [u8]),
}

impl Value<'_> {
    /// Returns `true` if value is `NULL`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Decode raw column bytes given its type and format.
///
/// `owner` is the buffer `value` is borrowed from, arrays keep a shared slice of it.
pub(crate) fn decode<'a>(
    oid: Oid,
    format: Format,
    value: Option<&'a [u8]>,
    owner: &Bytes,
) -> Result<Value<'a>, DecodeError> {
    let Some(bytes) = value else {
        return Ok(Value::Null);
    };
    match format {
        Format::Binary => decode_binary(oid, bytes, owner),
        Format::Text => decode_text(oid, bytes, owner),
    }
}

fn malformed(oid: Oid, reason: &'static str) -> DecodeError {
    DecodeError::Malformed { oid, reason: reason.into() }
}

fn fixed<const N: usize>(oid: Oid, bytes: &[u8]) -> Result<[u8; N], DecodeError> {
    bytes.try_into().map_err(|_| malformed(oid, "invalid fixed width value length"))
}

fn decode_binary<'a>(oid: Oid, bytes: &'a [u8], owner: &Bytes) -> Result<Value<'a>, DecodeError> {
    let value = match Kind::of(oid) {
        Kind::Bool => Value::Bool(fixed::<1>(oid, bytes)?[0] != 0),
        Kind::FixedInt(2) => Value::Int2(i16::from_be_bytes(fixed(oid, bytes)?)),
        Kind::FixedInt(4) => Value::Int4(i32::from_be_bytes(fixed(oid, bytes)?)),
        Kind::FixedInt(_) => Value::Int8(i64::from_be_bytes(fixed(oid, bytes)?)),
        Kind::Oid => Value::Oid(u32::from_be_bytes(fixed(oid, bytes)?)),
        Kind::Float(4) => Value::Float4(f32::from_be_bytes(fixed(oid, bytes)?)),
        Kind::Float(_) => Value::Float8(f64::from_be_bytes(fixed(oid, bytes)?)),
        Kind::Numeric => Value::Numeric(numeric::decode(oid, Format::Binary, bytes)?),
        Kind::Text => Value::Text(Cow::Borrowed(std::str::from_utf8(bytes)?)),
        Kind::Binary => Value::Bytes(Cow::Borrowed(bytes)),
        Kind::Json => Value::Json(Cow::Borrowed(std::str::from_utf8(bytes)?)),
        Kind::Jsonb => match bytes.split_first() {
            Some((1, doc)) => Value::Json(Cow::Borrowed(std::str::from_utf8(doc)?)),
            _ => return Err(malformed(oid, "unknown jsonb version")),
        },
        Kind::Uuid => Value::Uuid(uuid::decode(oid, Format::Binary, bytes)?),
        Kind::Date => Value::Date(pgtime::date(oid, Format::Binary, bytes)?),
        Kind::Time => Value::Time(pgtime::time(oid, Format::Binary, bytes)?),
        Kind::Timestamp { tz: false } => Value::Timestamp(pgtime::timestamp(oid, Format::Binary, bytes)?),
        Kind::Timestamp { tz: true } => Value::TimestampTz(pgtime::timestamptz(oid, Format::Binary, bytes)?),
        Kind::Interval => Value::Interval(pgtime::interval(oid, Format::Binary, bytes)?),
        Kind::Array(_) => Value::Array(Array::parse(oid, Format::Binary, owner.slice_ref(bytes))?),
        Kind::Range(_) | Kind::Composite | Kind::Unknown => Value::Raw(bytes),
    };
    Ok(value)
}

fn decode_text<'a>(oid: Oid, bytes: &'a [u8], owner: &Bytes) -> Result<Value<'a>, DecodeError> {
    if let Kind::Array(_) = Kind::of(oid) {
        return Ok(Value::Array(Array::parse(oid, Format::Text, owner.slice_ref(bytes))?));
    }
    if let Kind::Range(_) | Kind::Composite | Kind::Unknown = Kind::of(oid) {
        return Ok(Value::Raw(bytes));
    }

    let text = std::str::from_utf8(bytes)?;
    let invalid = |what: &'static str| malformed(oid, what);
    let value = match Kind::of(oid) {
        Kind::Bool => match text {
            "t" => Value::Bool(true),
            "f" => Value::Bool(false),
            _ => return Err(invalid("invalid bool text")),
        },
        Kind::FixedInt(2) => Value::Int2(text.parse().map_err(|_| invalid("invalid int2 text"))?),
        Kind::FixedInt(4) => Value::Int4(text.parse().map_err(|_| invalid("invalid int4 text"))?),
        Kind::FixedInt(_) => Value::Int8(text.parse().map_err(|_| invalid("invalid int8 text"))?),
        Kind::Oid => Value::Oid(text.parse().map_err(|_| invalid("invalid oid text"))?),
        Kind::Float(4) => Value::Float4(text.parse().map_err(|_| invalid("invalid float4 text"))?),
        Kind::Float(_) => Value::Float8(text.parse().map_err(|_| invalid("invalid float8 text"))?),
        Kind::Numeric => Value::Numeric(numeric::decode(oid, Format::Text, bytes)?),
        Kind::Text => Value::Text(Cow::Borrowed(text)),
        Kind::Binary => Value::Bytes(Cow::Owned(bytea_hex(oid, text)?)),
        Kind::Json | Kind::Jsonb => Value::Json(Cow::Borrowed(text)),
        Kind::Uuid => Value::Uuid(uuid::decode(oid, Format::Text, bytes)?),
        Kind::Date => Value::Date(pgtime::date(oid, Format::Text, bytes)?),
        Kind::Time => Value::Time(pgtime::time(oid, Format::Text, bytes)?),
        Kind::Timestamp { tz: false } => Value::Timestamp(pgtime::timestamp(oid, Format::Text, bytes)?),
        Kind::Timestamp { tz: true } => Value::TimestampTz(pgtime::timestamptz(oid, Format::Text, bytes)?),
        Kind::Interval => Value::Interval(pgtime::interval(oid, Format::Text, bytes)?),
        Kind::Array(_) | Kind::Range(_) | Kind::Composite | Kind::Unknown => Value::Raw(bytes),
    };
    Ok(value)
}

/// `bytea_output = hex`, the server default since 9.0.
fn bytea_hex(oid: Oid, text: &str) -> Result<Vec<u8>, DecodeError> {
    let Some(hex) = text.strip_prefix("\\x") else {
        return Err(DecodeError::Unsupported { oid, format: Format::Text });
    };
    if hex.len() % 2 != 0 {
        return Err(malformed(oid, "odd bytea hex length"));
    }
    let nibble = |b: u8| match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(malformed(oid, "invalid bytea hex digit")),
    };
    hex.as_bytes()
        .chunks(2)
        .map(|pair| Ok(nibble(pair[0])? << 4 | nibble(pair[1])?))
        .collect()
}

impl fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(v) => f.write_str(if *v { "t" } else { "f" }),
            Value::Int2(v) => fmt::Display::fmt(v, f),
            Value::Int4(v) => fmt::Display::fmt(v, f),
            Value::Int8(v) => fmt::Display::fmt(v, f),
            Value::Oid(v) => fmt::Display::fmt(v, f),
            Value::Float4(v) => fmt::Display::fmt(v, f),
            Value::Float8(v) => fmt::Display::fmt(v, f),
            Value::Numeric(v) => fmt::Display::fmt(v, f),
            Value::Text(v) | Value::Json(v) => f.write_str(v),
            Value::Bytes(v) => {
                f.write_str("\\x")?;
                v.iter().try_for_each(|b| write!(f, "{b:02x}"))
            },
            Value::Uuid(v) => fmt::Display::fmt(v, f),
            Value::Date(v) => fmt::Display::fmt(v, f),
            Value::Time(v) => fmt::Display::fmt(v, f),
            Value::Timestamp(v) => fmt::Display::fmt(v, f),
            Value::TimestampTz(v) => fmt::Display::fmt(v, f),
            Value::Interval(v) => fmt::Display::fmt(v, f),
            Value::Array(v) => fmt::Display::fmt(v, f),
            Value::Raw(v) => fmt::Display::fmt(&v.lossy(), f),
        }
    }
}

impl fmt::Debug for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Text(v) => write!(f, "Text({v:?})"),
            Value::Bytes(v) => write!(f, "Bytes({:?})", v.lossy()),
            Value::Raw(v) => write!(f, "Raw({:?})", v.lossy()),
            Value::Array(v) => fmt::Debug::fmt(v, f),
            other => write!(f, "{other}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // scalar kinds never touch the owner buffer
    fn binary(oid: Oid, bytes: &[u8]) -> Value<'_> {
        decode(oid, Format::Binary, Some(bytes), &Bytes::new()).unwrap()
    }

    fn text(oid: Oid, bytes: &[u8]) -> Value<'_> {
        decode(oid, Format::Text, Some(bytes), &Bytes::new()).unwrap()
    }

    #[test]
    fn binary_scalar() {
        assert_eq!(binary(16, &[1]), Value::Bool(true));
        assert_eq!(binary(21, &[0xff, 0xfe]), Value::Int2(-2));
        assert_eq!(binary(23, &[0, 0, 0, 1]), Value::Int4(1));
        assert_eq!(binary(701, &1.5f64.to_be_bytes()), Value::Float8(1.5));
        assert_eq!(binary(25, b"hello"), Value::Text("hello".into()));
        assert_eq!(binary(3802, b"\x01{}"), Value::Json("{}".into()));
        assert_eq!(binary(999_999, b"raw"), Value::Raw(b"raw"));
    }

    #[test]
    fn text_scalar() {
        assert_eq!(text(16, b"f"), Value::Bool(false));
        assert_eq!(text(20, b"-9000000000"), Value::Int8(-9_000_000_000));
        assert_eq!(text(700, b"NaN").to_string(), "NaN");
        assert_eq!(text(17, b"\\x00ff"), Value::Bytes(vec![0, 255].into()));
        assert_eq!(text(1043, b"abc"), Value::Text("abc".into()));
    }

    #[test]
    fn null_and_errors() {
        let owner = Bytes::new();
        assert!(decode(23, Format::Binary, None, &owner).unwrap().is_null());

        let err = decode(23, Format::Binary, Some(&[0, 1]), &owner).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { oid: 23, .. }));

        let err = decode(1186, Format::Text, Some(b"1 day"), &owner).unwrap_err();
        assert!(matches!(err, DecodeError::Unsupported { oid: 1186, format: Format::Text }));
    }
}
