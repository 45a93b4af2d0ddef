//! Parameter encoding.
//!
//! - [`Param`]
//! - [`Encode`]
//! - [`EncodeError`]
use bytes::Bytes;
use std::{borrow::Cow, fmt};

use crate::{
    array::ArrayBuilder,
    ext::FmtExt,
    postgres::{Format, Oid, OidType, PgType},
};

/// Encoded query parameter.
///
/// Carries its own declared [`Oid`] and [`Format`], `oid` zero lets the server infer
/// the type from the statement.
#[derive(Clone, PartialEq, Eq)]
pub struct Param {
    oid: Oid,
    format: Format,
    value: Option<Bytes>,
}

impl Param {
    /// Create `NULL` parameter.
    pub fn null(oid: Oid) -> Param {
        Param { oid, format: Format::Binary, value: None }
    }

    /// Create parameter from binary encoded value.
    pub fn binary(oid: Oid, value: impl Into<Bytes>) -> Param {
        Param { oid, format: Format::Binary, value: Some(value.into()) }
    }

    /// Create parameter from text encoded value.
    ///
    /// The server parses the text with the type input function, use `oid` zero to let
    /// the server decide the type.
    pub fn text(oid: Oid, value: impl Into<Bytes>) -> Param {
        Param { oid, format: Format::Text, value: Some(value.into()) }
    }

    /// Override the declared oid.
    pub fn with_oid(mut self, oid: Oid) -> Param {
        self.oid = oid;
        self
    }

    /// Returns the declared oid.
    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// Returns the value format.
    pub fn format(&self) -> Format {
        self.format
    }

    /// Returns the encoded value, [`None`] if `NULL`.
    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    /// Returns `true` if value is `NULL`.
    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Param");
        dbg.field("oid", &self.oid);
        dbg.field("format", &self.format);
        match &self.value {
            Some(value) => dbg.field("value", &value.lossy()),
            None => dbg.field("value", &format_args!("NULL")),
        };
        dbg.finish()
    }
}

/// A type that can be encoded as query parameter.
pub trait Encode {
    /// Encode self into parameter.
    fn encode(self) -> Param;
}

impl Encode for Param {
    fn encode(self) -> Param {
        self
    }
}

impl<T: Encode + PgType> Encode for Option<T> {
    fn encode(self) -> Param {
        match self {
            Some(value) => value.encode(),
            None => Param::null(T::OID),
        }
    }
}

impl Encode for bool {
    fn encode(self) -> Param {
        Param::binary(Self::OID, vec![self as u8])
    }
}

macro_rules! encode_be {
    ($($ty:ty),*) => {$(
        impl Encode for $ty {
            fn encode(self) -> Param {
                Param::binary(Self::OID, self.to_be_bytes().to_vec())
            }
        }
    )*};
}

encode_be!(i16, i32, i64, u32, f32, f64);

impl Encode for &str {
    fn encode(self) -> Param {
        Param::binary(Self::OID, Bytes::copy_from_slice(self.as_bytes()))
    }
}

impl Encode for String {
    fn encode(self) -> Param {
        Param::binary(Self::OID, self.into_bytes())
    }
}

impl Encode for &String {
    fn encode(self) -> Param {
        self.as_str().encode()
    }
}

impl Encode for &[u8] {
    fn encode(self) -> Param {
        Param::binary(Self::OID, Bytes::copy_from_slice(self))
    }
}

impl Encode for Vec<u8> {
    fn encode(self) -> Param {
        Param::binary(Self::OID, self)
    }
}

impl Encode for Bytes {
    fn encode(self) -> Param {
        Param::binary(Self::OID, self)
    }
}

/// A type that can be an element of postgres array parameter.
pub trait ArrayElement: Encode + PgType + sealed::Sealed {
    /// Oid of the array type.
    const ARRAY_OID: Oid;
}

macro_rules! array_element {
    ($($ty:ty => $array:ident),* $(,)?) => {$(
        impl ArrayElement for $ty {
            const ARRAY_OID: Oid = OidType::$array.oid();
        }
        impl sealed::Sealed for $ty { }
    )*};
}

array_element! {
    bool => BoolArray,
    i16 => Int2Array,
    i32 => Int4Array,
    i64 => Int8Array,
    u32 => OidArray,
    f32 => Float4Array,
    f64 => Float8Array,
    String => TextArray,
    &str => TextArray,
    Vec<u8> => ByteaArray,
    Bytes => ByteaArray,
    crate::types::Numeric => NumericArray,
    crate::types::Uuid => UuidArray,
    crate::types::Interval => IntervalArray,
    time::Date => DateArray,
    time::Time => TimeArray,
    time::PrimitiveDateTime => TimestampArray,
    time::OffsetDateTime => TimestampTzArray,
}

impl<T: ArrayElement> ArrayElement for Option<T> {
    const ARRAY_OID: Oid = T::ARRAY_OID;
}

impl<T: ArrayElement> sealed::Sealed for Option<T> { }

impl<T: ArrayElement> PgType for Vec<T> {
    const OID: Oid = T::ARRAY_OID;
}

/// Encode as one dimensional array with lower bound of one.
impl<T: ArrayElement> Encode for Vec<T> {
    fn encode(self) -> Param {
        let mut builder = ArrayBuilder::new(T::OID);
        for element in self {
            let param = element.encode();
            builder.push(param.value().map(|value| &value[..]));
        }
        // implicit single dimension cannot mismatch the element count
        Param::binary(T::ARRAY_OID, builder.write())
    }
}

mod sealed {
    pub trait Sealed { }
}

/// An error when encoding parameter.
pub struct EncodeError {
    reason: Cow<'static, str>,
}

impl EncodeError {
    pub(crate) fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self { reason: reason.into() }
    }
}

impl std::error::Error for EncodeError { }

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to encode value, {}", self.reason)
    }
}

impl fmt::Debug for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scalar_param() {
        let param = 7i32.encode();
        assert_eq!(param.oid(), 23);
        assert_eq!(param.format(), Format::Binary);
        assert_eq!(param.value().unwrap().as_ref(), &[0, 0, 0, 7]);

        let param = "hi".encode();
        assert_eq!(param.oid(), 25);
        assert_eq!(param.value().unwrap().as_ref(), b"hi");

        let param = None::<i64>.encode();
        assert_eq!(param.oid(), 20);
        assert!(param.is_null());
    }

    #[test]
    fn explicit_oid() {
        let param = Param::text(0, "42").with_oid(21);
        assert_eq!(param.oid(), 21);
        assert_eq!(param.format(), Format::Text);
    }

    #[test]
    fn vec_param() {
        let param = vec![Some(1i32), None].encode();
        assert_eq!(param.oid(), 1007);
        let body = param.value().unwrap();
        // ndim, has_null, element oid
        assert_eq!(&body[..12], &[0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 23]);
    }
}
