//! Query result access.
//!
//! - [`QueryResult`]
//! - [`Answer`]
//! - [`Row`]
//! - [`Field`]
//! - [`FromRow`]
//! - [`Decode`]
//!
//! - [`Index`]
//! - [`AccessError`]
//! - [`DecodeError`]
use bytes::{Buf, Bytes};
use std::{borrow::Cow, fmt, str::Utf8Error, string::FromUtf8Error, sync::Arc};

use crate::{
    Error,
    common::ByteStr,
    ext::{BytesExt, FmtExt},
    postgres::{
        Format, Kind, Oid, ProtocolError, ServerError,
        backend::{DataRow, RowDescription},
    },
    value::{self, Value},
};

/// Result status of a [`QueryResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// The string sent to the server was empty.
    EmptyQuery,
    /// Successful completion of a command returning no data.
    CommandOk,
    /// Successful completion of a command returning data.
    TuplesOk,
    /// One row of a query in single row mode.
    SingleTuple,
    /// The server reported an error.
    FatalError,
}

impl ResultStatus {
    /// Returns the conventional status name, e.g. `PGRES_TUPLES_OK`.
    pub fn status_string(self) -> &'static str {
        match self {
            ResultStatus::EmptyQuery => "PGRES_EMPTY_QUERY",
            ResultStatus::CommandOk => "PGRES_COMMAND_OK",
            ResultStatus::TuplesOk => "PGRES_TUPLES_OK",
            ResultStatus::SingleTuple => "PGRES_SINGLE_TUPLE",
            ResultStatus::FatalError => "PGRES_FATAL_ERROR",
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status_string())
    }
}

/// One result of a query.
///
/// A query string may produce several results, see
/// [`Connection::get_result`][crate::Connection::get_result].
#[derive(Clone)]
pub struct QueryResult {
    status: ResultStatus,
    error: Option<ServerError>,
    answer: Answer,
}

impl QueryResult {
    pub(crate) fn new(status: ResultStatus, answer: Answer) -> QueryResult {
        QueryResult { status, error: None, answer }
    }

    pub(crate) fn fatal(error: ServerError) -> QueryResult {
        QueryResult { status: ResultStatus::FatalError, error: Some(error), answer: Answer::default() }
    }

    pub fn status(&self) -> ResultStatus {
        self.status
    }

    /// Returns `true` unless the server reported an error.
    pub fn is_ok(&self) -> bool {
        self.status != ResultStatus::FatalError
    }

    /// Returns the server reported error.
    pub fn error(&self) -> Option<&ServerError> {
        self.error.as_ref()
    }

    /// Returns individual error field, see [`ServerError`] for the codes.
    pub fn error_field(&self, code: u8) -> Option<&str> {
        self.error.as_ref()?.field(code)
    }

    /// Returns the primary error message.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(ServerError::message)
    }

    /// Returns the rows, fails with [`ErrorKind::Database`][crate::ErrorKind::Database] if the
    /// server reported an error.
    pub fn answer(&self) -> Result<&Answer, Error> {
        match &self.error {
            Some(error) => Err(error.clone().into()),
            None => Ok(&self.answer),
        }
    }

    /// Consume self into the rows.
    pub fn into_answer(self) -> Result<Answer, Error> {
        match self.error {
            Some(error) => Err(error.into()),
            None => Ok(self.answer),
        }
    }

    /// Returns the command tag, e.g. `INSERT 0 1`.
    pub fn cmd_status(&self) -> &str {
        &self.answer.cmd_status
    }

    /// Returns the number of rows affected by the command.
    pub fn cmd_tuples(&self) -> u64 {
        self.answer.rows_affected
    }
}

/// Status, followed by the error, the rows, or the command tag.
impl fmt::Display for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status)?;
        if let Some(error) = &self.error {
            return write!(f, ": {error}");
        }
        match self.status {
            ResultStatus::TuplesOk | ResultStatus::SingleTuple => write!(f, "\n{}", self.answer),
            _ if self.answer.cmd_status.is_empty() => Ok(()),
            _ => write!(f, " {}", self.answer.cmd_status),
        }
    }
}

impl fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("QueryResult");
        dbg.field("status", &self.status);
        match &self.error {
            Some(error) => dbg.field("error", error),
            None => dbg.field("answer", &self.answer),
        };
        dbg.finish()
    }
}

/// Column descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    name: ByteStr,
    table_oid: Oid,
    column_id: i16,
    oid: Oid,
    type_size: i16,
    type_modifier: i32,
    format: Format,
}

impl Column {
    /// Parse `RowDescription` fields.
    pub(crate) fn parse(desc: RowDescription) -> Result<Arc<[Column]>, ProtocolError> {
        let mut body = desc.body;
        let mut columns = Vec::with_capacity(desc.field_len as usize);
        for _ in 0..desc.field_len {
            let name = body.get_nul_bytestr()?;
            body.need(18)?;
            columns.push(Column {
                name,
                table_oid: body.get_u32(),
                column_id: body.get_i16(),
                oid: body.get_u32(),
                type_size: body.get_i16(),
                type_modifier: body.get_i32(),
                format: Format::from_code(body.get_u16())?,
            });
        }
        Ok(columns.into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the oid of the source table, zero if not a table column.
    pub fn table_oid(&self) -> Oid {
        self.table_oid
    }

    /// Returns the attribute number in the source table, zero if not a table column.
    pub fn column_id(&self) -> i16 {
        self.column_id
    }

    /// Returns the data type oid.
    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// Returns the data type size, negative for variable width types.
    pub fn type_size(&self) -> i16 {
        self.type_size
    }

    pub fn type_modifier(&self) -> i32 {
        self.type_modifier
    }

    pub fn format(&self) -> Format {
        self.format
    }
}

/// Position of a value inside a shared buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cell {
    pub(crate) offset: usize,
    pub(crate) len: usize,
    pub(crate) null: bool,
}

impl Cell {
    pub(crate) const NULL: Cell = Cell { offset: 0, len: 0, null: true };

    pub(crate) fn slice(self, data: &[u8]) -> Option<&[u8]> {
        match self.null {
            true => None,
            false => Some(&data[self.offset..self.offset + self.len]),
        }
    }
}

/// Rows of a successful [`QueryResult`].
///
/// Every row holds one cell per column, located in one pass when the row is received.
#[derive(Clone, Default)]
pub struct Answer {
    columns: Arc<[Column]>,
    params: Arc<[Oid]>,
    rows: Vec<Bytes>,
    cells: Vec<Cell>,
    cmd_status: ByteStr,
    rows_affected: u64,
}

impl Answer {
    /// Returns the number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Returns column descriptor.
    pub fn column<I: Index>(&self, column: I) -> Result<&Column, AccessError> {
        let i = column.position(&self.columns)?;
        Ok(&self.columns[i])
    }

    pub fn column_name(&self, column: usize) -> Result<&str, AccessError> {
        Ok(self.column(column)?.name())
    }

    /// Returns the position of column by name.
    pub fn column_num(&self, name: &str) -> Result<usize, AccessError> {
        name.position(&self.columns)
    }

    pub fn column_exists(&self, name: &str) -> bool {
        self.column_num(name).is_ok()
    }

    pub fn column_format(&self, column: usize) -> Result<Format, AccessError> {
        Ok(self.column(column)?.format())
    }

    /// Returns the column data type oid.
    pub fn oid(&self, column: usize) -> Result<Oid, AccessError> {
        Ok(self.column(column)?.oid())
    }

    /// Returns `true` if the column is an array type.
    pub fn is_array(&self, column: usize) -> Result<bool, AccessError> {
        Ok(matches!(Kind::of(self.oid(column)?), Kind::Array(_)))
    }

    /// Returns the number of statement parameters, for a described statement.
    pub fn n_params(&self) -> usize {
        self.params.len()
    }

    /// Returns the statement parameter type, for a described statement.
    pub fn param_type(&self, param: usize) -> Result<Oid, AccessError> {
        self.params
            .get(param)
            .copied()
            .ok_or(AccessError::OutOfRange { index: param, len: self.params.len() })
    }

    /// Returns the command tag.
    pub fn cmd_status(&self) -> &str {
        &self.cmd_status
    }

    /// Returns the number of rows affected by the command.
    pub fn cmd_tuples(&self) -> u64 {
        self.rows_affected
    }

    /// Returns row at index.
    pub fn row(&self, row: usize) -> Result<Row<'_>, AccessError> {
        match row < self.rows.len() {
            true => Ok(Row { answer: self, index: row }),
            false => Err(AccessError::OutOfRange { index: row, len: self.rows.len() }),
        }
    }

    pub fn rows(&self) -> impl ExactSizeIterator<Item = Row<'_>> + '_ {
        (0..self.rows.len()).map(|index| Row { answer: self, index })
    }

    /// Returns `true` if the value at row and column is `NULL`.
    pub fn is_null(&self, row: usize, column: usize) -> Result<bool, AccessError> {
        self.row(row)?.is_null(column)
    }

    /// Decode the value at row and column.
    pub fn get<'a, T: Decode<'a>>(&'a self, row: usize, column: usize) -> Result<T, Error> {
        self.row(row)?.get(column)
    }

    fn cell(&self, row: usize, column: usize) -> Cell {
        self.cells[row * self.columns.len() + column]
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, column) in self.columns.iter().enumerate() {
            if i != 0 {
                f.write_str(" | ")?;
            }
            f.write_str(column.name())?;
        }
        f.write_str("\n")?;
        for row in self.rows() {
            writeln!(f, "{row}")?;
        }
        match self.rows.len() {
            1 => f.write_str("(1 row)"),
            n => write!(f, "({n} rows)"),
        }
    }
}

impl fmt::Debug for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Answer")
            .field("columns", &self.columns.iter().map(Column::name).collect::<Vec<_>>())
            .field("rows", &self.rows.len())
            .field("cmd_status", &self.cmd_status)
            .finish()
    }
}

/// Collects backend messages into an [`Answer`].
#[derive(Default)]
pub(crate) struct AnswerBuilder {
    columns: Arc<[Column]>,
    params: Arc<[Oid]>,
    rows: Vec<Bytes>,
    cells: Vec<Cell>,
    tuples: bool,
}

impl AnswerBuilder {
    pub(crate) fn set_columns(&mut self, columns: Arc<[Column]>) {
        self.columns = columns;
        self.tuples = true;
    }

    /// Whether `RowDescription` was received for current statement.
    pub(crate) fn returns_tuples(&self) -> bool {
        self.tuples
    }

    pub(crate) fn set_params(&mut self, params: Vec<Oid>) {
        self.params = params.into();
    }

    pub(crate) fn has_rows(&self) -> bool {
        !self.rows.is_empty()
    }

    /// Locate every cell of `DataRow`.
    pub(crate) fn push_row(&mut self, row: DataRow) -> Result<(), ProtocolError> {
        if row.column_len as usize != self.columns.len() {
            return Err(ProtocolError::malformed(format!(
                "DataRow has {} columns, RowDescription has {}",
                row.column_len,
                self.columns.len(),
            )));
        }
        let body = row.body;
        let mut rest = &body[..];
        let mut cells = Vec::with_capacity(self.columns.len());
        for _ in 0..row.column_len {
            if rest.len() < 4 {
                return Err(ProtocolError::malformed("DataRow value length missing"));
            }
            let len = rest.get_i32();
            if len < 0 {
                cells.push(Cell::NULL);
                continue;
            }
            let len = len as usize;
            if rest.len() < len {
                return Err(ProtocolError::malformed("DataRow value truncated"));
            }
            let offset = body.len() - rest.len();
            rest.advance(len);
            cells.push(Cell { offset, len, null: false });
        }
        // rejected rows leave the builder untouched
        self.cells.extend(cells);
        self.rows.push(body);
        Ok(())
    }

    /// Take collected rows, column and parameter descriptions are kept for the next
    /// single row result.
    pub(crate) fn take(&mut self, tag: Option<ByteStr>, rows_affected: u64) -> Answer {
        Answer {
            columns: self.columns.clone(),
            params: self.params.clone(),
            rows: std::mem::take(&mut self.rows),
            cells: std::mem::take(&mut self.cells),
            cmd_status: tag.unwrap_or_default(),
            rows_affected,
        }
    }

    /// Forget everything for the next statement.
    pub(crate) fn reset(&mut self) {
        *self = AnswerBuilder::default();
    }
}

/// Row of an [`Answer`].
#[derive(Clone, Copy)]
pub struct Row<'a> {
    answer: &'a Answer,
    index: usize,
}

impl<'a> Row<'a> {
    /// Returns the row index inside its [`Answer`].
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.answer.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answer.columns.is_empty()
    }

    pub fn column_name(&self, column: usize) -> Result<&'a str, AccessError> {
        self.answer.column_name(column)
    }

    pub fn column_num(&self, name: &str) -> Result<usize, AccessError> {
        self.answer.column_num(name)
    }

    /// Returns `true` if the value is `NULL`.
    pub fn is_null<I: Index>(&self, column: I) -> Result<bool, AccessError> {
        let column = column.position(&self.answer.columns)?;
        Ok(self.answer.cell(self.index, column).null)
    }

    /// Returns raw field.
    pub fn field<I: Index>(&self, column: I) -> Result<Field<'a>, AccessError> {
        let column = column.position(&self.answer.columns)?;
        Ok(self.field_at(column))
    }

    fn field_at(&self, column: usize) -> Field<'a> {
        let desc = &self.answer.columns[column];
        let data = &self.answer.rows[self.index];
        let value = self.answer.cell(self.index, column).slice(data);
        Field::new(desc.name(), desc.oid(), desc.format(), value, data)
    }

    /// Try get and decode column.
    pub fn get<I: Index, T: Decode<'a>>(&self, column: I) -> Result<T, Error> {
        let field = self.field(column)?;
        field
            .decode()
            .map_err(|e| Error::from(e).context(format!("column {:?}", field.name())))
    }

    /// Try decode type using [`FromRow`] implementation.
    pub fn decode<D: FromRow<'a>>(self) -> Result<D, Error> {
        D::from_row(self)
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = Field<'a>> + 'a {
        let row = *self;
        (0..self.len()).map(move |column| row.field_at(column))
    }
}

/// Values separated by ` | `.
impl fmt::Display for Row<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.iter().enumerate() {
            if i != 0 {
                f.write_str(" | ")?;
            }
            match field.value() {
                Ok(value) => write!(f, "{value}")?,
                Err(_) => write!(f, "{:?}", field)?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Row<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_map();
        for field in self.iter() {
            dbg.key(&field.name());
            match field.as_bytes() {
                None => dbg.value(&format_args!("NULL")),
                Some(value) => dbg.value(&value.lossy()),
            };
        }
        dbg.finish()
    }
}

/// Raw value with its type information.
#[derive(Clone, Copy)]
pub struct Field<'a> {
    name: &'a str,
    oid: Oid,
    format: Format,
    value: Option<&'a [u8]>,
    owner: &'a Bytes,
}

impl<'a> Field<'a> {
    /// `owner` is the buffer `value` is borrowed from.
    pub(crate) fn new(
        name: &'a str,
        oid: Oid,
        format: Format,
        value: Option<&'a [u8]>,
        owner: &'a Bytes,
    ) -> Field<'a> {
        Field { name, oid, format, value, owner }
    }

    /// Returns column name, empty for array elements.
    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Return `true` if value is NULL.
    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    /// Returns the raw bytes, [`None`] if value is `NULL`.
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        self.value
    }

    /// Returns the raw bytes sharing the row buffer, [`None`] if value is `NULL`.
    pub fn to_bytes(&self) -> Option<Bytes> {
        self.value.map(|value| self.owner.slice_ref(value))
    }

    /// Decode the value by its type.
    pub fn value(&self) -> Result<Value<'a>, DecodeError> {
        value::decode(self.oid, self.format, self.value, self.owner)
    }

    /// Try decode type using [`Decode`] implementation.
    pub fn decode<D: Decode<'a>>(self) -> Result<D, DecodeError> {
        D::decode(self)
    }
}

impl fmt::Debug for Field<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Field");
        dbg.field("name", &self.name);
        dbg.field("oid", &self.oid);
        dbg.field("format", &self.format);
        match self.value {
            Some(value) => dbg.field("value", &value.lossy()),
            None => dbg.field("value", &format_args!("NULL")),
        };
        dbg.finish()
    }
}

// ===== Traits =====

/// Type that can be constructed from a row.
pub trait FromRow<'a>: Sized {
    /// Construct self from row.
    fn from_row(row: Row<'a>) -> Result<Self, Error>;
}

impl<'a> FromRow<'a> for Row<'a> {
    fn from_row(row: Row<'a>) -> Result<Self, Error> {
        Ok(row)
    }
}

impl FromRow<'_> for () {
    fn from_row(_: Row<'_>) -> Result<Self, Error> {
        Ok(())
    }
}

macro_rules! from_row_tuple {
    ($($t:ident $i:literal),*) => {
        impl<'a, $($t),*> FromRow<'a> for ($($t),*,)
        where
            $($t: Decode<'a>),*
        {
            fn from_row(row: Row<'a>) -> Result<Self, Error> {
                Ok((
                    $(row.get($i)?),*,
                ))
            }
        }
    };
}

from_row_tuple!(T0 0);
from_row_tuple!(T0 0, T1 1);
from_row_tuple!(T0 0, T1 1, T2 2);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4, T5 5);

/// A type that can be constructed from [`Field`].
pub trait Decode<'a>: Sized {
    /// Try decode self from field.
    fn decode(field: Field<'a>) -> Result<Self, DecodeError>;
}

impl<'a> Decode<'a> for Field<'a> {
    fn decode(field: Field<'a>) -> Result<Self, DecodeError> {
        Ok(field)
    }
}

impl<'a> Decode<'a> for Value<'a> {
    fn decode(field: Field<'a>) -> Result<Self, DecodeError> {
        field.value()
    }
}

impl<'a, T: Decode<'a>> Decode<'a> for Option<T> {
    fn decode(field: Field<'a>) -> Result<Self, DecodeError> {
        match field.is_null() {
            true => Ok(None),
            false => field.decode().map(Some),
        }
    }
}

macro_rules! decode_value {
    ($ty:ty, $($variant:ident)|* => $v:ident $conv:expr) => {
        impl Decode<'_> for $ty {
            fn decode(field: Field<'_>) -> Result<Self, DecodeError> {
                match field.value()? {
                    $(Value::$variant($v) => Ok($conv),)*
                    Value::Null => Err(DecodeError::Null),
                    _ => Err(DecodeError::mismatch::<Self>(field.oid())),
                }
            }
        }
    };
}

decode_value!(bool, Bool => v v);
decode_value!(i16, Int2 => v v);
decode_value!(i32, Int2 | Int4 => v v.into());
decode_value!(i64, Int2 | Int4 | Int8 => v v.into());
decode_value!(u32, Oid => v v);
decode_value!(f32, Float4 => v v);
decode_value!(f64, Float4 | Float8 => v v.into());
decode_value!(String, Text | Json => v v.into_owned());
decode_value!(Vec<u8>, Bytes => v v.into_owned());

impl<'a> Decode<'a> for &'a str {
    fn decode(field: Field<'a>) -> Result<Self, DecodeError> {
        match field.value()? {
            Value::Text(Cow::Borrowed(v)) | Value::Json(Cow::Borrowed(v)) => Ok(v),
            Value::Null => Err(DecodeError::Null),
            _ => Err(DecodeError::mismatch::<Self>(field.oid())),
        }
    }
}

/// Borrows the raw bytes of a binary `bytea`.
impl<'a> Decode<'a> for &'a [u8] {
    fn decode(field: Field<'a>) -> Result<Self, DecodeError> {
        match field.value()? {
            Value::Bytes(Cow::Borrowed(v)) => Ok(v),
            Value::Bytes(Cow::Owned(_)) => Err(DecodeError::Unsupported { oid: field.oid(), format: field.format() }),
            Value::Null => Err(DecodeError::Null),
            _ => Err(DecodeError::mismatch::<Self>(field.oid())),
        }
    }
}

impl Decode<'_> for Bytes {
    fn decode(field: Field<'_>) -> Result<Self, DecodeError> {
        match field.value()? {
            Value::Bytes(Cow::Borrowed(v)) => Ok(field.owner.slice_ref(v)),
            Value::Bytes(Cow::Owned(v)) => Ok(v.into()),
            Value::Null => Err(DecodeError::Null),
            _ => Err(DecodeError::mismatch::<Self>(field.oid())),
        }
    }
}

/// Type that can be used for indexing column.
pub trait Index: Sized + sealed::Sealed {
    /// Returns the column position.
    fn position(self, columns: &[Column]) -> Result<usize, AccessError>;
}

impl Index for usize {
    fn position(self, columns: &[Column]) -> Result<usize, AccessError> {
        match self < columns.len() {
            true => Ok(self),
            false => Err(AccessError::OutOfRange { index: self, len: columns.len() }),
        }
    }
}

impl Index for &str {
    fn position(self, columns: &[Column]) -> Result<usize, AccessError> {
        columns
            .iter()
            .position(|column| column.name() == self)
            .ok_or_else(|| AccessError::ColumnNotFound(self.into()))
    }
}

mod sealed {
    pub trait Sealed { }
    impl Sealed for usize { }
    impl Sealed for &str { }
}

/// An error when accessing row, column, or array element.
pub enum AccessError {
    /// Index requested is out of bounds.
    OutOfRange { index: usize, len: usize },
    /// Column requested not found.
    ColumnNotFound(String),
    /// Array multi-index has the wrong number of dimensions.
    Dimension { expected: usize, found: usize },
}

impl std::error::Error for AccessError { }

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange { index, len } => write!(f, "index {index} out of range, length is {len}"),
            Self::ColumnNotFound(name) => write!(f, "column not found: {name:?}"),
            Self::Dimension { expected, found } => {
                write!(f, "array has {expected} dimensions, index has {found}")
            },
        }
    }
}

impl fmt::Debug for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for DecodeError {
            fn from($pat: $ty) -> Self {
                $body
            }
        }
    };
}

/// An error when decoding row value.
pub enum DecodeError {
    /// Value is `NULL`.
    Null,
    /// No decoder for the type and format.
    Unsupported { oid: Oid, format: Format },
    /// Requested type does not match the column type.
    Mismatch { oid: Oid, expected: &'static str },
    /// Value bytes violate the type encoding.
    Malformed { oid: Oid, reason: Cow<'static, str> },
    /// Postgres return non utf8 string.
    Utf8(Utf8Error),
    /// Failed to deserialize using `serde_json`.
    #[cfg(feature = "json")]
    Json(serde_json::error::Error),
}

impl DecodeError {
    pub(crate) fn mismatch<T>(oid: Oid) -> DecodeError {
        DecodeError::Mismatch { oid, expected: std::any::type_name::<T>() }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to decode value, ")?;
        match self {
            Self::Null => write!(f, "unexpected NULL value"),
            Self::Unsupported { oid, format } => write!(f, "unsupported {format} value of oid {oid}"),
            Self::Mismatch { oid, expected } => write!(f, "oid {oid} cannot be decoded as `{expected}`"),
            Self::Malformed { oid, reason } => write!(f, "malformed value of oid {oid}: {reason}"),
            Self::Utf8(e) => write!(f, "{e}"),
            #[cfg(feature = "json")]
            Self::Json(e) => write!(f, "{e}"),
        }
    }
}

from!(<Utf8Error>e => Self::Utf8(e));
from!(<FromUtf8Error>e => Self::Utf8(e.utf8_error()));
#[cfg(feature = "json")]
from!(<serde_json::error::Error>e => Self::Json(e));

impl std::error::Error for DecodeError { }

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::{ErrorKind, testing::backend};

    fn answer() -> Answer {
        let mut builder = AnswerBuilder::default();
        let desc = backend::row_description(&[("id", 23, Format::Binary), ("name", 25, Format::Text), ("note", 25, Format::Text)]);
        builder.set_columns(Column::parse(desc).unwrap());
        builder.push_row(backend::data_row(&[Some(&7i32.to_be_bytes()[..]), Some(b"alice"), None])).unwrap();
        builder.push_row(backend::data_row(&[Some(&8i32.to_be_bytes()[..]), Some(b"bob"), Some(b"hi")])).unwrap();
        builder.take(Some("SELECT 2".into()), 2)
    }

    #[test]
    fn cells_per_row() {
        let answer = answer();
        assert_eq!(answer.len(), 2);
        for row in answer.rows() {
            assert_eq!(row.len(), answer.column_count());
        }
        assert_eq!(answer.cmd_tuples(), 2);
        assert_eq!(answer.column_num("name").unwrap(), 1);
        assert!(answer.is_null(0, 2).unwrap());
        assert!(!answer.is_null(1, 2).unwrap());
    }

    #[test]
    fn typed_access() {
        let answer = answer();
        let row = answer.row(1).unwrap();
        assert_eq!(row.get::<_, i32>(0).unwrap(), 8);
        assert_eq!(row.get::<_, i64>("id").unwrap(), 8);
        assert_eq!(row.get::<_, &str>("name").unwrap(), "bob");
        let (id, name, note): (i32, String, Option<String>) = answer.row(0).unwrap().decode().unwrap();
        assert_eq!((id, name.as_str(), note), (7, "alice", None));
    }

    #[test]
    fn out_of_range_keeps_answer_usable() {
        let answer = answer();
        let row = answer.row(0).unwrap();
        let err = row.get::<_, i32>(5).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Access(AccessError::OutOfRange { index: 5, len: 3 })));
        assert_eq!(row.get::<_, i32>(0).unwrap(), 7);

        assert!(matches!(answer.row(2), Err(AccessError::OutOfRange { index: 2, len: 2 })));
        assert!(matches!(row.field("missing"), Err(AccessError::ColumnNotFound(_))));
    }

    #[test]
    fn decode_errors() {
        let answer = answer();
        let row = answer.row(0).unwrap();
        let err = row.get::<_, String>(2).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Decode(DecodeError::Null)));
        let err = row.get::<_, bool>(0).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Decode(DecodeError::Mismatch { oid: 23, .. })));
    }

    #[test]
    fn column_count_mismatch() {
        let mut builder = AnswerBuilder::default();
        builder.set_columns(Column::parse(backend::row_description(&[("a", 23, Format::Text)])).unwrap());
        assert!(builder.push_row(backend::data_row(&[Some(&b"1"[..]), Some(b"2")])).is_err());
    }

    #[test]
    fn fatal_result() {
        let result = QueryResult::fatal(ServerError::local("ERROR", "57014", "canceling statement"));
        assert_eq!(result.status(), ResultStatus::FatalError);
        assert_eq!(result.error_field(ServerError::CODE), Some("57014"));
        let err = result.answer().unwrap_err();
        assert_eq!(err.as_server_error().map(ServerError::code), Some("57014"));
    }

    #[test]
    fn display_table() {
        let text = answer().to_string();
        assert_eq!(text, "id | name | note\n7 | alice | NULL\n8 | bob | hi\n(2 rows)");
    }

    #[test]
    fn display_row_and_result() {
        let answer = answer();
        assert_eq!(answer.row(1).unwrap().to_string(), "8 | bob | hi");

        let result = QueryResult::new(ResultStatus::TuplesOk, answer);
        assert_eq!(result.to_string(), "PGRES_TUPLES_OK\nid | name | note\n7 | alice | NULL\n8 | bob | hi\n(2 rows)");

        let mut builder = AnswerBuilder::default();
        let result = QueryResult::new(ResultStatus::CommandOk, builder.take(Some("INSERT 0 1".into()), 1));
        assert_eq!(result.to_string(), "PGRES_COMMAND_OK INSERT 0 1");

        let result = QueryResult::fatal(ServerError::local("ERROR", "42P01", "relation \"nope\" does not exist"));
        assert_eq!(result.to_string(), "PGRES_FATAL_ERROR: ERROR: relation \"nope\" does not exist (42P01)");
    }

    #[test]
    fn truncated_row_leaves_builder() {
        let mut builder = AnswerBuilder::default();
        let desc = backend::row_description(&[("a", 25, Format::Text), ("b", 25, Format::Text)]);
        builder.set_columns(Column::parse(desc).unwrap());
        builder.push_row(backend::data_row(&[Some(&b"x"[..]), Some(b"y")])).unwrap();

        // first value intact, second claims more bytes than it carries
        let mut body = BytesMut::new();
        body.put_u16(2);
        body.put_i32(1);
        body.put_slice(b"z");
        body.put_i32(10);
        body.put_slice(b"ab");
        assert!(builder.push_row(DataRow::new(body.freeze()).unwrap()).is_err());

        let answer = builder.take(None, 0);
        assert_eq!(answer.len(), 1);
        assert_eq!(answer.row(0).unwrap().to_string(), "x | y");
    }
}
