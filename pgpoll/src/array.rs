//! Postgres multi-dimensional array.
//!
//! - [`Array`]
//! - [`ArrayBuilder`]
//!
//! Binary layout:
//!
//! ```text
//! i32 ndim | i32 has_null | u32 element oid | (i32 size, i32 lower bound) * ndim
//! (i32 len or -1, bytes) * product(size)
//! ```
//!
//! Text layout follows the array literal grammar, e.g. `[0:1]={{1,NULL},{"a\"b",c}}`.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::{
    Decode, Error,
    encode::{EncodeError, Param},
    postgres::{Format, Oid, OidType},
    row::{AccessError, Cell, DecodeError, Field},
    value::Value,
};

/// Postgres `MAXDIM`.
const MAX_DIMENSION: usize = 6;

/// Array dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimension {
    /// Number of elements in this dimension.
    pub size: usize,
    /// Index of the first element, one unless specified otherwise.
    pub lower_bound: i32,
}

/// Decoded postgres array.
///
/// Elements are kept as slices of a shared buffer, addressed by zero based indices in
/// row major order.
#[derive(Clone)]
pub struct Array {
    oid: Oid,
    element: Oid,
    format: Format,
    dims: Vec<Dimension>,
    data: Bytes,
    elements: Vec<Cell>,
}

impl Array {
    /// Parse array value of type `oid`.
    pub fn parse(oid: Oid, format: Format, data: Bytes) -> Result<Array, DecodeError> {
        match format {
            Format::Binary => Self::decode_binary(oid, data),
            Format::Text => {
                let element = OidType::from_oid(oid)
                    .and_then(OidType::element)
                    .map_or(OidType::Text.oid(), OidType::oid);
                Self::decode_text(oid, element, &data)
            },
        }
    }

    fn decode_binary(oid: Oid, data: Bytes) -> Result<Array, DecodeError> {
        let malformed = |reason: &'static str| DecodeError::Malformed { oid, reason: reason.into() };
        let mut body = &data[..];

        if body.len() < 12 {
            return Err(malformed("array header too short"));
        }
        let ndim = usize::try_from(body.get_i32()).map_err(|_| malformed("negative array dimension"))?;
        let _has_null = body.get_i32();
        let element = body.get_u32();
        if ndim > MAX_DIMENSION {
            return Err(malformed("array has too many dimensions"));
        }
        if body.len() < ndim * 8 {
            return Err(malformed("array dimension header too short"));
        }

        let mut dims = Vec::with_capacity(ndim);
        let mut count = if ndim == 0 { 0usize } else { 1 };
        for _ in 0..ndim {
            let size = usize::try_from(body.get_i32()).map_err(|_| malformed("negative array size"))?;
            let lower_bound = body.get_i32();
            count = count.checked_mul(size).ok_or_else(|| malformed("array size overflow"))?;
            dims.push(Dimension { size, lower_bound });
        }

        let mut elements = Vec::with_capacity(count.min(body.len() / 4));
        for _ in 0..count {
            if body.len() < 4 {
                return Err(malformed("array element length missing"));
            }
            let offset = data.len() - body.len() + 4;
            match body.get_i32() {
                -1 => elements.push(Cell::NULL),
                len => {
                    let len = usize::try_from(len).map_err(|_| malformed("invalid array element length"))?;
                    if body.len() < len {
                        return Err(malformed("array element truncated"));
                    }
                    body.advance(len);
                    elements.push(Cell { offset, len, null: false });
                },
            }
        }
        if !body.is_empty() {
            return Err(malformed("trailing bytes after array elements"));
        }

        Ok(Array { oid, element, format: Format::Binary, dims, data, elements })
    }

    fn decode_text(oid: Oid, element: Oid, text: &[u8]) -> Result<Array, DecodeError> {
        let mut parser = TextParser {
            oid,
            text,
            pos: 0,
            out: BytesMut::with_capacity(text.len()),
            elements: vec![],
            sizes: vec![],
            leaf_depth: None,
        };
        let declared = parser.decoration()?;
        parser.skip_ws();
        parser.expect(b'{')?;
        parser.skip_ws();

        if parser.peek() == Some(b'}') {
            parser.pos += 1;
            parser.end()?;
            if declared.as_ref().is_some_and(|d| !d.is_empty()) {
                return Err(parser.malformed("dimension decoration on empty array"));
            }
            let data = parser.out.freeze();
            return Ok(Array { oid, element, format: Format::Text, dims: vec![], data, elements: vec![] });
        }

        parser.level(0)?;
        parser.end()?;

        let dims = match declared {
            Some(declared) => {
                if declared.len() != parser.sizes.len()
                    || declared.iter().zip(&parser.sizes).any(|(d, size)| Some(d.size) != *size)
                {
                    return Err(parser.malformed("array decoration does not match its content"));
                }
                declared
            },
            None => parser
                .sizes
                .iter()
                .map(|size| Dimension { size: size.unwrap_or(0), lower_bound: 1 })
                .collect(),
        };

        Ok(Array {
            oid,
            element,
            format: Format::Text,
            dims,
            data: parser.out.freeze(),
            elements: parser.elements,
        })
    }

    /// Returns the array type oid.
    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// Returns the element type oid.
    pub fn element_oid(&self) -> Oid {
        self.element
    }

    /// Returns the format elements are encoded in.
    pub fn format(&self) -> Format {
        self.format
    }

    /// Returns the number of dimensions, zero for an empty array.
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    /// Returns the total number of elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Returns `true` if any element is `NULL`.
    pub fn has_null(&self) -> bool {
        self.elements.iter().any(|cell| cell.null)
    }

    /// Returns the flat, row major, position of a multi-index.
    pub fn flat_index(&self, index: &[usize]) -> Result<usize, AccessError> {
        if index.len() != self.dims.len() {
            return Err(AccessError::Dimension { expected: self.dims.len(), found: index.len() });
        }
        // a zero dimension array has no element to address
        if self.dims.is_empty() {
            return Err(AccessError::OutOfRange { index: 0, len: 0 });
        }
        let mut flat = 0;
        let mut stride = 1;
        for (&i, dim) in index.iter().zip(&self.dims).rev() {
            if i >= dim.size {
                return Err(AccessError::OutOfRange { index: i, len: dim.size });
            }
            flat += i * stride;
            stride *= dim.size;
        }
        Ok(flat)
    }

    /// Returns element at flat position.
    pub fn field(&self, flat: usize) -> Result<Field<'_>, AccessError> {
        let cell = self
            .elements
            .get(flat)
            .ok_or(AccessError::OutOfRange { index: flat, len: self.elements.len() })?;
        Ok(Field::new("", self.element, self.format, cell.slice(&self.data), &self.data))
    }

    /// Returns `true` if the element at multi-index is `NULL`.
    pub fn is_null(&self, index: &[usize]) -> Result<bool, AccessError> {
        let flat = self.flat_index(index)?;
        self.elements
            .get(flat)
            .map(|cell| cell.null)
            .ok_or(AccessError::OutOfRange { index: flat, len: self.elements.len() })
    }

    /// Decode the element at multi-index.
    pub fn get<'a, T: Decode<'a>>(&'a self, index: &[usize]) -> Result<T, Error> {
        let flat = self.flat_index(index)?;
        Ok(self.field(flat)?.decode()?)
    }

    /// Decode the element at multi-index as [`Value`].
    pub fn value(&self, index: &[usize]) -> Result<Value<'_>, Error> {
        let flat = self.flat_index(index)?;
        Ok(self.field(flat)?.value()?)
    }

    /// Iterate over elements in row major order.
    pub fn iter(&self) -> impl Iterator<Item = Field<'_>> + '_ {
        self.elements.iter().map(|cell| {
            Field::new("", self.element, self.format, cell.slice(&self.data), &self.data)
        })
    }

    fn fmt_level(&self, f: &mut fmt::Formatter<'_>, depth: usize, flat: &mut usize) -> fmt::Result {
        f.write_str("{")?;
        for i in 0..self.dims[depth].size {
            if i != 0 {
                f.write_str(",")?;
            }
            if depth + 1 < self.dims.len() {
                self.fmt_level(f, depth + 1, flat)?;
                continue;
            }
            let field = self.field(*flat).map_err(|_| fmt::Error)?;
            *flat += 1;
            match field.value() {
                Ok(Value::Null) => f.write_str("NULL")?,
                Ok(Value::Text(text)) | Ok(Value::Json(text)) => write_quoted(f, &text)?,
                Ok(value) => write!(f, "{value}")?,
                Err(_) => write!(f, "{:?}", field)?,
            }
        }
        f.write_str("}")
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    let plain = !text.is_empty()
        && !text.eq_ignore_ascii_case("NULL")
        && !text.bytes().any(|b| matches!(b, b'{' | b'}' | b',' | b'"' | b'\\') || b.is_ascii_whitespace());
    if plain {
        return f.write_str(text);
    }
    f.write_str("\"")?;
    for c in text.chars() {
        if matches!(c, '"' | '\\') {
            f.write_str("\\")?;
        }
        write!(f, "{c}")?;
    }
    f.write_str("\"")
}

impl PartialEq for Array {
    fn eq(&self, other: &Self) -> bool {
        self.element == other.element
            && self.dims == other.dims
            && self.elements.len() == other.elements.len()
            && self
                .elements
                .iter()
                .zip(&other.elements)
                .all(|(a, b)| a.slice(&self.data) == b.slice(&other.data))
    }
}

/// Text representation, lower bounds other than one are written as decoration.
impl fmt::Display for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dims.is_empty() {
            return f.write_str("{}");
        }
        if self.dims.iter().any(|d| d.lower_bound != 1) {
            for d in &self.dims {
                write!(f, "[{}:{}]", d.lower_bound, d.lower_bound as i64 + d.size as i64 - 1)?;
            }
            f.write_str("=")?;
        }
        self.fmt_level(f, 0, &mut 0)
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Array({}, {self})", self.element)
    }
}

impl Decode<'_> for Array {
    fn decode(field: Field<'_>) -> Result<Self, DecodeError> {
        match field.value()? {
            Value::Array(array) => Ok(array),
            Value::Null => Err(DecodeError::Null),
            _ => Err(DecodeError::mismatch::<Self>(field.oid())),
        }
    }
}

/// Decode array elements in row major order, dimensions are flattened.
impl<T> Decode<'_> for Vec<T>
where
    T: for<'b> Decode<'b>,
{
    fn decode(field: Field<'_>) -> Result<Self, DecodeError> {
        let array = <Array as Decode>::decode(field)?;
        array.iter().map(|field| T::decode(field)).collect()
    }
}

struct TextParser<'a> {
    oid: Oid,
    text: &'a [u8],
    pos: usize,
    out: BytesMut,
    elements: Vec<Cell>,
    /// Element count per nesting depth.
    sizes: Vec<Option<usize>>,
    /// Depth at which elements appear.
    leaf_depth: Option<usize>,
}

impl TextParser<'_> {
    fn malformed(&self, reason: &'static str) -> DecodeError {
        DecodeError::Malformed { oid: self.oid, reason: reason.into() }
    }

    fn peek(&self) -> Option<u8> {
        self.text.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, b: u8) -> Result<(), DecodeError> {
        match self.peek() {
            Some(found) if found == b => {
                self.pos += 1;
                Ok(())
            },
            _ => Err(self.malformed("unexpected character in array literal")),
        }
    }

    fn end(&mut self) -> Result<(), DecodeError> {
        self.skip_ws();
        match self.pos == self.text.len() {
            true => Ok(()),
            false => Err(self.malformed("junk after closing brace")),
        }
    }

    fn int(&mut self) -> Result<i32, DecodeError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        std::str::from_utf8(&self.text[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.malformed("invalid array bound"))
    }

    /// `[lower:upper]...=` prefix.
    fn decoration(&mut self) -> Result<Option<Vec<Dimension>>, DecodeError> {
        self.skip_ws();
        if self.peek() != Some(b'[') {
            return Ok(None);
        }
        let mut dims = vec![];
        while self.peek() == Some(b'[') {
            self.pos += 1;
            let lower_bound = self.int()?;
            self.expect(b':')?;
            let upper = self.int()?;
            self.expect(b']')?;
            let size = usize::try_from(upper as i64 - lower_bound as i64 + 1)
                .map_err(|_| self.malformed("array upper bound below lower bound"))?;
            dims.push(Dimension { size, lower_bound });
        }
        self.expect(b'=')?;
        Ok(Some(dims))
    }

    /// Parse after an opening brace at `depth`, up to and including its closing brace.
    fn level(&mut self, depth: usize) -> Result<(), DecodeError> {
        if depth >= MAX_DIMENSION {
            return Err(self.malformed("array has too many dimensions"));
        }
        let mut count = 0;
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'{') => {
                    if self.leaf_depth.is_some_and(|leaf| leaf <= depth) {
                        return Err(self.malformed("array is not rectangular"));
                    }
                    self.pos += 1;
                    self.level(depth + 1)?;
                },
                Some(b'}') => return Err(self.malformed("empty sub-array or trailing comma")),
                Some(_) => {
                    match self.leaf_depth {
                        Some(leaf) if leaf != depth => return Err(self.malformed("array is not rectangular")),
                        _ => self.leaf_depth = Some(depth),
                    }
                    self.element()?;
                },
                None => return Err(self.malformed("unterminated array literal")),
            }
            count += 1;

            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    break;
                },
                _ => return Err(self.malformed("expected delimiter in array literal")),
            }
        }

        // inner levels complete first, sizes are kept by depth
        if self.sizes.len() <= depth {
            self.sizes.resize(depth + 1, None);
        }
        match self.sizes[depth] {
            Some(size) if size != count => Err(self.malformed("array is not rectangular")),
            Some(_) => Ok(()),
            None => {
                self.sizes[depth] = Some(count);
                Ok(())
            },
        }
    }

    fn element(&mut self) -> Result<(), DecodeError> {
        let start = self.out.len();
        let mut end = start;
        let mut in_quotes = false;
        let mut quoted = false;
        let mut escaped = false;

        loop {
            let Some(b) = self.peek() else {
                return Err(self.malformed("unterminated array literal"));
            };
            if in_quotes {
                match b {
                    b'"' => in_quotes = false,
                    b'\\' => {
                        self.pos += 1;
                        let Some(next) = self.peek() else {
                            return Err(self.malformed("unterminated array literal"));
                        };
                        self.out.put_u8(next);
                    },
                    _ => self.out.put_u8(b),
                }
                end = self.out.len();
            } else {
                match b {
                    b',' | b'}' => break,
                    b'{' => return Err(self.malformed("unexpected opening brace")),
                    b'"' => {
                        in_quotes = true;
                        quoted = true;
                    },
                    b'\\' => {
                        self.pos += 1;
                        let Some(next) = self.peek() else {
                            return Err(self.malformed("unterminated array literal"));
                        };
                        self.out.put_u8(next);
                        escaped = true;
                        end = self.out.len();
                    },
                    // leading whitespace is skipped, trailing is trimmed by `end`
                    b if b.is_ascii_whitespace() => if self.out.len() > start {
                        self.out.put_u8(b);
                    },
                    b => {
                        self.out.put_u8(b);
                        end = self.out.len();
                    },
                }
            }
            self.pos += 1;
        }
        self.out.truncate(end);

        let content = &self.out[start..];
        if !quoted && !escaped {
            if content.is_empty() {
                return Err(self.malformed("empty unquoted array element"));
            }
            if content.eq_ignore_ascii_case(b"NULL") {
                self.out.truncate(start);
                self.elements.push(Cell::NULL);
                return Ok(());
            }
        }
        self.elements.push(Cell { offset: start, len: end - start, null: false });
        Ok(())
    }
}

/// Binary array encoder.
///
/// Without explicit dimension, elements form a single dimension with lower bound of one.
///
/// ```
/// use pgpoll::{array::ArrayBuilder, Encode};
///
/// let mut builder = ArrayBuilder::new(23);
/// builder.dimension(2, 1).dimension(2, 0);
/// for v in [Some(1i32), None, Some(3), Some(4)] {
///     builder.push_param(v.encode()).unwrap();
/// }
/// let param = builder.into_param().unwrap();
/// assert_eq!(param.oid(), 1007);
/// ```
#[derive(Debug, Clone)]
pub struct ArrayBuilder {
    element: Oid,
    dims: Vec<Dimension>,
    count: usize,
    has_null: bool,
    body: BytesMut,
}

impl ArrayBuilder {
    /// Create builder for elements of type `element`.
    pub fn new(element: Oid) -> ArrayBuilder {
        ArrayBuilder { element, dims: vec![], count: 0, has_null: false, body: BytesMut::new() }
    }

    /// Declare the next dimension.
    pub fn dimension(&mut self, size: usize, lower_bound: i32) -> &mut Self {
        self.dims.push(Dimension { size, lower_bound });
        self
    }

    /// Append binary encoded element, [`None`] for `NULL`.
    pub fn push(&mut self, value: Option<&[u8]>) -> &mut Self {
        match value {
            Some(value) => {
                self.body.put_i32(value.len() as i32);
                self.body.put_slice(value);
            },
            None => {
                self.body.put_i32(-1);
                self.has_null = true;
            },
        }
        self.count += 1;
        self
    }

    /// Append encoded element.
    ///
    /// Element must be binary encoded with the builder element type.
    pub fn push_param(&mut self, param: Param) -> Result<&mut Self, EncodeError> {
        if param.format() != Format::Binary {
            return Err(EncodeError::new("array element must be binary encoded"));
        }
        if param.oid() != self.element {
            return Err(EncodeError::new(format!(
                "array element oid {} does not match {}",
                param.oid(),
                self.element,
            )));
        }
        Ok(self.push(param.value().map(|v| &v[..])))
    }

    /// Write the array, validating declared dimensions against the element count.
    pub fn finish(self) -> Result<Bytes, EncodeError> {
        if self.dims.len() > MAX_DIMENSION {
            return Err(EncodeError::new("array has too many dimensions"));
        }
        if !self.dims.is_empty() {
            let declared = self.dims.iter().try_fold(1usize, |acc, d| acc.checked_mul(d.size));
            if declared != Some(self.count) {
                return Err(EncodeError::new(format!(
                    "array dimensions declare {declared:?} elements, found {}",
                    self.count
                )));
            }
        }
        Ok(self.write())
    }

    /// Write as parameter of the array type of the element.
    pub fn into_param(self) -> Result<Param, EncodeError> {
        let oid = OidType::from_oid(self.element)
            .and_then(OidType::array)
            .ok_or_else(|| EncodeError::new(format!("no array type for element oid {}", self.element)))?;
        Ok(Param::binary(oid.oid(), self.finish()?))
    }

    pub(crate) fn write(self) -> Bytes {
        let dims = match (self.dims.is_empty(), self.count) {
            (true, 0) => vec![],
            (true, size) => vec![Dimension { size, lower_bound: 1 }],
            (false, _) => self.dims,
        };
        let mut buf = BytesMut::with_capacity(12 + dims.len() * 8 + self.body.len());
        buf.put_i32(dims.len() as i32);
        buf.put_i32(self.has_null as i32);
        buf.put_u32(self.element);
        for dim in &dims {
            buf.put_i32(dim.size as i32);
            buf.put_i32(dim.lower_bound);
        }
        buf.put_slice(&self.body);
        buf.freeze()
    }
}
