//! Postgres `numeric`.
//!
//! Binary layout: `ndigits`, `weight`, `sign`, `dscale` then `ndigits` base 10000 digits,
//! the first digit multiplied by `10000^weight`.
use bytes::{Buf, BufMut, BytesMut};
use std::{borrow::Cow, fmt, str::FromStr};

use crate::{
    Decode, DecodeError, Encode,
    encode::{EncodeError, Param},
    postgres::{Format, Oid, OidType, PgType},
    row::Field,
    value::Value,
};

const NBASE: u16 = 10000;
const DEC_DIGITS: usize = 4;

const SIGN_POS: u16 = 0x0000;
const SIGN_NEG: u16 = 0x4000;
const SIGN_NAN: u16 = 0xC000;
const SIGN_PINF: u16 = 0xD000;
const SIGN_NINF: u16 = 0xF000;

/// Arbitrary precision decimal number.
///
/// The finite value is kept in its canonical decimal text, e.g. `-12.3400`, with trailing
/// zeros preserving the display scale.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Numeric {
    NaN,
    Infinity,
    NegInfinity,
    Finite(String),
}

impl Numeric {
    /// Returns the value as lossy `f64`.
    pub fn to_f64(&self) -> f64 {
        match self {
            Numeric::NaN => f64::NAN,
            Numeric::Infinity => f64::INFINITY,
            Numeric::NegInfinity => f64::NEG_INFINITY,
            Numeric::Finite(text) => text.parse().unwrap_or(f64::NAN),
        }
    }

    /// Returns the number of digits after the decimal point.
    pub fn scale(&self) -> usize {
        match self {
            Numeric::Finite(text) => text.split_once('.').map_or(0, |(_, frac)| frac.len()),
            _ => 0,
        }
    }

    pub(crate) fn decode_binary(oid: Oid, mut bytes: &[u8]) -> Result<Numeric, DecodeError> {
        let malformed = |reason: &'static str| DecodeError::Malformed { oid, reason: Cow::Borrowed(reason) };
        if bytes.len() < 8 {
            return Err(malformed("numeric header too short"));
        }
        let ndigits = bytes.get_u16() as usize;
        let weight = bytes.get_i16() as isize;
        let sign = bytes.get_u16();
        let dscale = bytes.get_u16() as usize;

        match sign {
            SIGN_POS | SIGN_NEG => {},
            SIGN_NAN => return Ok(Numeric::NaN),
            SIGN_PINF => return Ok(Numeric::Infinity),
            SIGN_NINF => return Ok(Numeric::NegInfinity),
            _ => return Err(malformed("invalid numeric sign")),
        }
        if bytes.len() != ndigits * 2 {
            return Err(malformed("numeric digit count mismatch"));
        }

        let mut digits = Vec::with_capacity(ndigits);
        for _ in 0..ndigits {
            let digit = bytes.get_u16();
            if digit >= NBASE {
                return Err(malformed("numeric digit out of range"));
            }
            digits.push(digit);
        }
        let digit = |i: isize| match usize::try_from(i) {
            Ok(i) => digits.get(i).copied().unwrap_or(0),
            Err(_) => 0,
        };

        let mut text = String::with_capacity((weight.max(0) as usize + 1) * DEC_DIGITS + dscale + 2);
        if sign == SIGN_NEG {
            text.push('-');
        }

        if weight < 0 {
            text.push('0');
        } else {
            for i in 0..=weight {
                let d = digit(i);
                if i == 0 {
                    text.push_str(itoa::Buffer::new().format(d));
                } else {
                    push_padded(&mut text, d);
                }
            }
        }

        if dscale > 0 {
            text.push('.');
            let start = text.len();
            let mut i = weight + 1;
            while text.len() - start < dscale {
                push_padded(&mut text, digit(i));
                i += 1;
            }
            text.truncate(start + dscale);
        }

        Ok(Numeric::Finite(text))
    }

    pub(crate) fn encode_binary(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(8);
        let text = match self {
            Numeric::Finite(text) => text,
            special => {
                let sign = match special {
                    Numeric::NaN => SIGN_NAN,
                    Numeric::Infinity => SIGN_PINF,
                    _ => SIGN_NINF,
                };
                buf.put_u16(0);
                buf.put_i16(0);
                buf.put_u16(sign);
                buf.put_u16(0);
                return buf;
            },
        };

        let (negative, text) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text.as_str()),
        };
        let (int, frac) = text.split_once('.').unwrap_or((text, ""));
        let int = int.trim_start_matches('0');

        // align both parts to base 10000 groups
        let int_pad = (DEC_DIGITS - int.len() % DEC_DIGITS) % DEC_DIGITS;
        let frac_pad = (DEC_DIGITS - frac.len() % DEC_DIGITS) % DEC_DIGITS;
        let aligned = std::iter::repeat_n(b'0', int_pad)
            .chain(int.bytes())
            .chain(frac.bytes())
            .chain(std::iter::repeat_n(b'0', frac_pad))
            .collect::<Vec<u8>>();

        let mut digits = aligned
            .chunks(DEC_DIGITS)
            .map(|group| group.iter().fold(0u16, |acc, b| acc * 10 + (b - b'0') as u16))
            .collect::<Vec<u16>>();
        let mut weight = ((int_pad + int.len()) / DEC_DIGITS) as i16 - 1;

        let leading = digits.iter().take_while(|d| **d == 0).count();
        digits.drain(..leading);
        weight -= leading as i16;
        while digits.last() == Some(&0) {
            digits.pop();
        }
        if digits.is_empty() {
            weight = 0;
        }

        buf.reserve(digits.len() * 2);
        buf.put_u16(digits.len() as u16);
        buf.put_i16(weight);
        buf.put_u16(if negative && !digits.is_empty() { SIGN_NEG } else { SIGN_POS });
        buf.put_u16(frac.len() as u16);
        for digit in digits {
            buf.put_u16(digit);
        }
        buf
    }
}

fn push_padded(text: &mut String, digit: u16) {
    let mut buf = itoa::Buffer::new();
    let digit = buf.format(digit);
    for _ in digit.len()..DEC_DIGITS {
        text.push('0');
    }
    text.push_str(digit);
}

impl FromStr for Numeric {
    type Err = EncodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NaN" => return Ok(Numeric::NaN),
            "Infinity" | "+Infinity" => return Ok(Numeric::Infinity),
            "-Infinity" => return Ok(Numeric::NegInfinity),
            _ => {},
        }

        let (negative, unsigned) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };
        let (int, frac) = unsigned.split_once('.').unwrap_or((unsigned, ""));
        let is_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if int.is_empty() && frac.is_empty() || !is_digits(int) || !is_digits(frac) {
            return Err(EncodeError::new(format!("invalid numeric {s:?}")));
        }

        let int = match int.trim_start_matches('0') {
            "" => "0",
            int => int,
        };
        let zero = int == "0" && frac.bytes().all(|b| b == b'0');

        let mut text = String::with_capacity(s.len() + 1);
        if negative && !zero {
            text.push('-');
        }
        text.push_str(int);
        if !frac.is_empty() {
            text.push('.');
            text.push_str(frac);
        }
        Ok(Numeric::Finite(text))
    }
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Numeric::NaN => f.write_str("NaN"),
            Numeric::Infinity => f.write_str("Infinity"),
            Numeric::NegInfinity => f.write_str("-Infinity"),
            Numeric::Finite(text) => f.write_str(text),
        }
    }
}

impl fmt::Debug for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Numeric({self})")
    }
}

pub(crate) fn decode(oid: Oid, format: Format, bytes: &[u8]) -> Result<Numeric, DecodeError> {
    match format {
        Format::Binary => Numeric::decode_binary(oid, bytes),
        Format::Text => std::str::from_utf8(bytes)?
            .parse()
            .map_err(|_| DecodeError::Malformed { oid, reason: "invalid numeric text".into() }),
    }
}

impl PgType for Numeric {
    const OID: Oid = OidType::Numeric.oid();
}

impl Encode for Numeric {
    fn encode(self) -> Param {
        Param::binary(Self::OID, self.encode_binary())
    }
}

impl Decode<'_> for Numeric {
    fn decode(field: Field<'_>) -> Result<Self, DecodeError> {
        match field.value()? {
            Value::Numeric(n) => Ok(n),
            Value::Null => Err(DecodeError::Null),
            _ => Err(DecodeError::mismatch::<Self>(field.oid())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn binary(ndigits: u16, weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut buf = vec![];
        buf.put_u16(ndigits);
        buf.put_i16(weight);
        buf.put_u16(sign);
        buf.put_u16(dscale);
        for d in digits {
            buf.put_u16(*d);
        }
        buf
    }

    #[test]
    fn decode_binary() {
        // 12345.678
        let n = Numeric::decode_binary(1700, &binary(3, 1, SIGN_POS, 3, &[1, 2345, 6780])).unwrap();
        assert_eq!(n.to_string(), "12345.678");

        // -0.0012
        let n = Numeric::decode_binary(1700, &binary(1, -1, SIGN_NEG, 4, &[12])).unwrap();
        assert_eq!(n.to_string(), "-0.0012");

        // 20000, trailing zero group is omitted
        let n = Numeric::decode_binary(1700, &binary(1, 1, SIGN_POS, 0, &[2])).unwrap();
        assert_eq!(n.to_string(), "20000");

        let n = Numeric::decode_binary(1700, &binary(0, 0, SIGN_NAN, 0, &[])).unwrap();
        assert_eq!(n, Numeric::NaN);

        assert!(Numeric::decode_binary(1700, &binary(2, 0, SIGN_POS, 0, &[1])).is_err());
    }

    #[test]
    fn encode_binary() {
        let n: Numeric = "12345.678".parse().unwrap();
        assert_eq!(&n.encode_binary()[..], &binary(3, 1, SIGN_POS, 3, &[1, 2345, 6780])[..]);

        let n: Numeric = "-0.0012".parse().unwrap();
        assert_eq!(&n.encode_binary()[..], &binary(1, -1, SIGN_NEG, 4, &[12])[..]);

        let n: Numeric = "0".parse().unwrap();
        assert_eq!(&n.encode_binary()[..], &binary(0, 0, SIGN_POS, 0, &[])[..]);
    }

    #[test]
    fn parse_text() {
        assert_eq!("007.50".parse::<Numeric>().unwrap().to_string(), "7.50");
        assert_eq!("-0.00".parse::<Numeric>().unwrap().to_string(), "0.00");
        assert_eq!("-Infinity".parse::<Numeric>().unwrap(), Numeric::NegInfinity);
        assert_eq!(".5".parse::<Numeric>().unwrap().scale(), 1);
        assert!("1e5".parse::<Numeric>().is_err());
        assert!("-".parse::<Numeric>().is_err());
    }
}
