/// Postgres object identifier.
///
/// The oid type is implemented as an unsigned four-byte integer.
///
/// <https://www.postgresql.org/docs/current/datatype-oid.html>
pub type Oid = u32;

/// A type that have corresponding postgres oid.
pub trait PgType {
    const OID: Oid;
}

/// Decoding strategy of a postgres type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Bool,
    /// Big endian signed integer with the given byte width.
    FixedInt(u8),
    /// IEEE 754 float with the given byte width.
    Float(u8),
    /// Unsigned object identifier.
    Oid,
    Numeric,
    Text,
    Binary,
    Json,
    Jsonb,
    Uuid,
    Date,
    Time,
    Timestamp { tz: bool },
    Interval,
    Array(OidType),
    Range(OidType),
    Composite,
    /// Not in the registry, value is passed through as raw bytes.
    Unknown,
}

impl Kind {
    /// Returns decoding strategy for given oid.
    ///
    /// Unregistered oid falls back to [`Kind::Unknown`].
    pub fn of(oid: Oid) -> Kind {
        match OidType::from_oid(oid) {
            Some(ty) => ty.kind(),
            None => Kind::Unknown,
        }
    }
}

macro_rules! oid_types {
    ($(
        $(#[$doc:meta])*
        $name:ident = $oid:literal, $array:ident = $array_oid:literal => $kind:expr;
    )*) => {
        /// Known postgres types, the discriminant is the catalog oid.
        ///
        /// <https://github.com/postgres/postgres/blob/master/src/include/catalog/pg_type.dat>
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum OidType {
            $(
                $(#[$doc])*
                $name = $oid,
                #[doc = concat!("Array of [`", stringify!($name), "`][OidType::", stringify!($name), "]")]
                $array = $array_oid,
            )*
        }

        impl OidType {
            /// Lookup registered type.
            pub const fn from_oid(oid: Oid) -> Option<OidType> {
                match oid {
                    $(
                        $oid => Some(OidType::$name),
                        $array_oid => Some(OidType::$array),
                    )*
                    _ => None,
                }
            }

            /// Returns the type name as it is in the catalog.
            pub const fn name(self) -> &'static str {
                match self {
                    $(
                        OidType::$name => stringify!($name),
                        OidType::$array => stringify!($array),
                    )*
                }
            }

            /// Returns decoding strategy of this type.
            pub const fn kind(self) -> Kind {
                match self {
                    $(
                        OidType::$name => $kind,
                        OidType::$array => Kind::Array(OidType::$name),
                    )*
                }
            }

            /// Returns the element type if this is an array type.
            pub const fn element(self) -> Option<OidType> {
                match self {
                    $(OidType::$array => Some(OidType::$name),)*
                    _ => None,
                }
            }

            /// Returns the array type which element is this type.
            pub const fn array(self) -> Option<OidType> {
                match self {
                    $(OidType::$name => Some(OidType::$array),)*
                    _ => None,
                }
            }
        }
    };
}

oid_types! {
    /// `bool`
    Bool = 16, BoolArray = 1000 => Kind::Bool;
    /// `bytea` variable-length string, binary values escaped
    Bytea = 17, ByteaArray = 1001 => Kind::Binary;
    /// `char` single character
    Char = 18, CharArray = 1002 => Kind::Text;
    /// `name` 63-byte type for storing system identifiers
    Name = 19, NameArray = 1003 => Kind::Text;
    /// `int8` ~18 digit integer, 8-byte storage
    Int8 = 20, Int8Array = 1016 => Kind::FixedInt(8);
    /// `int2` -32 thousand to 32 thousand, 2-byte storage
    Int2 = 21, Int2Array = 1005 => Kind::FixedInt(2);
    /// `int4` -2 billion to 2 billion integer, 4-byte storage
    Int4 = 23, Int4Array = 1007 => Kind::FixedInt(4);
    /// `text` variable-length string, no limit specified
    Text = 25, TextArray = 1009 => Kind::Text;
    /// `oid` object identifier
    Oid = 26, OidArray = 1028 => Kind::Oid;
    /// `json` JSON stored as text
    Json = 114, JsonArray = 199 => Kind::Json;
    /// `xml` XML content
    Xml = 142, XmlArray = 143 => Kind::Text;
    /// `float4` single-precision floating point number, 4-byte storage
    Float4 = 700, Float4Array = 1021 => Kind::Float(4);
    /// `float8` double-precision floating point number, 8-byte storage
    Float8 = 701, Float8Array = 1022 => Kind::Float(8);
    /// `bpchar` blank-padded string, fixed storage length
    Bpchar = 1042, BpcharArray = 1014 => Kind::Text;
    /// `varchar` variable-length string, specified max length
    Varchar = 1043, VarcharArray = 1015 => Kind::Text;
    /// `date`
    Date = 1082, DateArray = 1182 => Kind::Date;
    /// `time` time of day
    Time = 1083, TimeArray = 1183 => Kind::Time;
    /// `timestamp` date and time
    Timestamp = 1114, TimestampArray = 1115 => Kind::Timestamp { tz: false };
    /// `timestamptz` date and time with time zone
    TimestampTz = 1184, TimestampTzArray = 1185 => Kind::Timestamp { tz: true };
    /// `interval` time interval
    Interval = 1186, IntervalArray = 1187 => Kind::Interval;
    /// `numeric` arbitrary precision number
    Numeric = 1700, NumericArray = 1231 => Kind::Numeric;
    /// `record` anonymous composite
    Record = 2249, RecordArray = 2287 => Kind::Composite;
    /// `uuid` UUID
    Uuid = 2950, UuidArray = 2951 => Kind::Uuid;
    /// `jsonb` Binary JSON
    Jsonb = 3802, JsonbArray = 3807 => Kind::Jsonb;
    /// `int4range` range of integers
    Int4Range = 3904, Int4RangeArray = 3905 => Kind::Range(OidType::Int4);
    /// `numrange` range of numerics
    NumRange = 3906, NumRangeArray = 3907 => Kind::Range(OidType::Numeric);
    /// `tsrange` range of timestamps without time zone
    TsRange = 3908, TsRangeArray = 3909 => Kind::Range(OidType::Timestamp);
    /// `tstzrange` range of timestamps with time zone
    TsTzRange = 3910, TsTzRangeArray = 3911 => Kind::Range(OidType::TimestampTz);
    /// `daterange` range of dates
    DateRange = 3912, DateRangeArray = 3913 => Kind::Range(OidType::Date);
    /// `int8range` range of bigints
    Int8Range = 3926, Int8RangeArray = 3927 => Kind::Range(OidType::Int8);
}

impl OidType {
    /// Returns the catalog oid.
    pub const fn oid(self) -> Oid {
        self as Oid
    }
}

impl PartialEq<Oid> for OidType {
    fn eq(&self, other: &Oid) -> bool {
        self.oid() == *other
    }
}

impl std::fmt::Display for OidType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

macro_rules! oid {
    ($ty:ty, $oid:ident) => {
        impl PgType for $ty {
            const OID: Oid = OidType::$oid.oid();
        }
    };
}

oid!(bool, Bool);
oid!(i16, Int2);
oid!(i32, Int4);
oid!(i64, Int8);
oid!(u32, Oid);
oid!(f32, Float4);
oid!(f64, Float8);
oid!(str, Text);
oid!(String, Text);
oid!([u8], Bytea);
oid!(Vec<u8>, Bytea);
oid!(bytes::Bytes, Bytea);

impl<T: PgType + ?Sized> PgType for &T {
    const OID: Oid = T::OID;
}

impl<T: PgType> PgType for Option<T> {
    const OID: Oid = T::OID;
}
