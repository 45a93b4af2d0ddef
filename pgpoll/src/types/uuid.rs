use std::{fmt, str::FromStr};

use crate::{
    Decode, DecodeError, Encode,
    encode::{EncodeError, Param},
    postgres::{Format, Oid, OidType, PgType},
    row::Field,
    value::Value,
};

/// Postgres `uuid`, 16 raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Uuid(pub [u8; 16]);

impl Uuid {
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

fn hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

impl FromStr for Uuid {
    type Err = EncodeError;

    /// Accepts the canonical hyphenated form, with or without braces, or 32 hex digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EncodeError::new(format!("invalid uuid {s:?}"));
        let s = s.strip_prefix('{').and_then(|s| s.strip_suffix('}')).unwrap_or(s);

        let mut out = [0u8; 16];
        let mut digits = s.bytes().filter(|b| *b != b'-');
        for byte in &mut out {
            let hi = digits.next().and_then(hex).ok_or_else(invalid)?;
            let lo = digits.next().and_then(hex).ok_or_else(invalid)?;
            *byte = hi << 4 | lo;
        }
        if digits.next().is_some() {
            return Err(invalid());
        }
        Ok(Uuid(out))
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uuid({self})")
    }
}

pub(crate) fn decode(oid: Oid, format: Format, bytes: &[u8]) -> Result<Uuid, DecodeError> {
    match format {
        Format::Binary => bytes
            .try_into()
            .map(Uuid)
            .map_err(|_| DecodeError::Malformed { oid, reason: "uuid must be 16 bytes".into() }),
        Format::Text => std::str::from_utf8(bytes)?
            .parse()
            .map_err(|_| DecodeError::Malformed { oid, reason: "invalid uuid text".into() }),
    }
}

impl PgType for Uuid {
    const OID: Oid = OidType::Uuid.oid();
}

impl Encode for Uuid {
    fn encode(self) -> Param {
        Param::binary(Self::OID, self.0.to_vec())
    }
}

impl Decode<'_> for Uuid {
    fn decode(field: Field<'_>) -> Result<Self, DecodeError> {
        match field.value()? {
            Value::Uuid(v) => Ok(v),
            Value::Null => Err(DecodeError::Null),
            _ => Err(DecodeError::mismatch::<Self>(field.oid())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_display() {
        let text = "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11";
        let uuid: Uuid = text.parse().unwrap();
        assert_eq!(uuid.0[0], 0xa0);
        assert_eq!(uuid.to_string(), text);
        assert_eq!("{A0EEBC999C0B4EF8BB6D6BB9BD380A11}".parse::<Uuid>().unwrap(), uuid);
        assert!("a0eebc99".parse::<Uuid>().is_err());
        assert!(decode(2950, Format::Binary, &[0; 15]).is_err());
    }
}
