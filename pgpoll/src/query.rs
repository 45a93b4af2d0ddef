//! Query submission.
//!
//! Every `send_*` operation queues its messages, enters [`Status::Busy`][crate::Status::Busy],
//! and leaves the results to [`get_result`][Connection::get_result]. The blocking variants
//! drain the results and return the last one.
use crate::{
    Connection, Result,
    common::verbose,
    connection::Request,
    encode::{EncodeError, Param},
    postgres::{
        Format, Oid, ProtocolError,
        frontend::{Bind, Describe, Execute, MAX_MESSAGE, Parse, Query, Sync},
    },
    row::{QueryResult, ResultStatus},
    transport::Transport,
};

/// Parameter count is a 16 bit integer in the protocol.
const MAX_PARAMS: usize = u16::MAX as usize;

impl<T: Transport> Connection<T> {
    /// Submit a simple query, it may contain multiple statements.
    pub fn send_query(&mut self, sql: &str) -> Result<()> {
        self.check_idle()?;
        check_nul(sql, "query")?;
        verbose!(sql, "send query");

        self.send(Query { sql });
        self.begin(Request::Query)
    }

    /// Submit a single statement with separate parameters, using the unnamed statement.
    ///
    /// Parameter types are taken from each [`Param`], zero lets the server infer it.
    pub fn send_query_params(&mut self, sql: &str, params: &[Param], result_format: Format) -> Result<()> {
        self.check_idle()?;
        check_nul(sql, "query")?;
        check_params(params)?;
        verbose!(sql, params = params.len(), "send query params");

        let oids = params.iter().map(Param::oid).collect::<Vec<_>>();
        self.send(Parse { name: "", sql, oids: &oids });
        self.write_execute("", params, result_format);
        self.begin(Request::Query)
    }

    /// Submit a request to create a prepared statement.
    ///
    /// The only result is [`ResultStatus::CommandOk`] on success.
    pub fn send_prepare(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> Result<()> {
        self.check_idle()?;
        check_nul(name, "statement name")?;
        check_nul(sql, "query")?;
        if param_types.len() > MAX_PARAMS {
            return Err(EncodeError::new("too many parameters, maximum is 65535").into());
        }
        verbose!(name, sql, "send prepare");

        self.send(Parse { name, sql, oids: param_types });
        self.send(Sync {});
        self.begin(Request::Prepare)
    }

    /// Execute a prepared statement.
    pub fn send_query_prepared(&mut self, name: &str, params: &[Param], result_format: Format) -> Result<()> {
        self.check_idle()?;
        check_nul(name, "statement name")?;
        check_params(params)?;
        verbose!(name, params = params.len(), "send query prepared");

        self.write_execute(name, params, result_format);
        self.begin(Request::Query)
    }

    /// Request parameter and column description of a prepared statement.
    ///
    /// The result carries no rows, see [`Answer::n_params`][crate::Answer::n_params] and
    /// [`Answer::columns`][crate::Answer::columns].
    pub fn send_describe_prepared(&mut self, name: &str) -> Result<()> {
        self.check_idle()?;
        check_nul(name, "statement name")?;
        verbose!(name, "send describe prepared");

        self.send(Describe { kind: Describe::STATEMENT, name });
        self.send(Sync {});
        self.begin(Request::Describe)
    }

    /// Bind the unnamed portal, then describe and execute it.
    fn write_execute(&mut self, statement: &str, params: &[Param], result_format: Format) {
        self.send(Bind { portal: "", statement, params, result_format });
        self.send(Describe { kind: Describe::PORTAL, name: "" });
        self.send(Execute { portal: "", max_rows: 0 });
        self.send(Sync {});
    }

    // ===== Blocking =====

    /// Run a simple query and wait for its results.
    ///
    /// With multiple statements, the last result is returned unless one failed, then the
    /// first failure is returned.
    pub fn exec(&mut self, sql: &str) -> Result<QueryResult> {
        self.send_query(sql)?;
        self.last_result()
    }

    /// Blocking [`send_query_params`][Self::send_query_params].
    pub fn exec_params(&mut self, sql: &str, params: &[Param], result_format: Format) -> Result<QueryResult> {
        self.send_query_params(sql, params, result_format)?;
        self.last_result()
    }

    /// Blocking [`send_prepare`][Self::send_prepare].
    pub fn prepare(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> Result<QueryResult> {
        self.send_prepare(name, sql, param_types)?;
        self.last_result()
    }

    /// Blocking [`send_query_prepared`][Self::send_query_prepared].
    pub fn exec_prepared(&mut self, name: &str, params: &[Param], result_format: Format) -> Result<QueryResult> {
        self.send_query_prepared(name, params, result_format)?;
        self.last_result()
    }

    /// Blocking [`send_describe_prepared`][Self::send_describe_prepared].
    pub fn describe_prepared(&mut self, name: &str) -> Result<QueryResult> {
        self.send_describe_prepared(name)?;
        self.last_result()
    }

    fn last_result(&mut self) -> Result<QueryResult> {
        let mut last: Option<QueryResult> = None;
        while let Some(result) = self.block_on_result()? {
            let failed = last.as_ref().is_some_and(|r| r.status() == ResultStatus::FatalError);
            if !failed {
                last = Some(result);
            }
        }
        last.ok_or_else(|| ProtocolError::malformed("request completed without result").into())
    }

    // ===== Escaping =====

    /// Quote a string for use as a literal in a SQL command.
    ///
    /// When `standard_conforming_strings` is off and the string contains a backslash, the
    /// escape string syntax is used.
    pub fn escape_literal(&self, value: &str) -> Result<String> {
        self.usable()?;
        check_nul(value, "literal")?;

        let escape = value.contains('\\') && self.parameter_status("standard_conforming_strings") != Some("on");
        let mut out = String::with_capacity(value.len() + 4);
        if escape {
            out.push_str(" E");
        }
        out.push('\'');
        for c in value.chars() {
            match c {
                '\'' => out.push_str("''"),
                '\\' if escape => out.push_str("\\\\"),
                c => out.push(c),
            }
        }
        out.push('\'');
        Ok(out)
    }

    /// Quote a string for use as an identifier in a SQL command.
    pub fn escape_identifier(&self, value: &str) -> Result<String> {
        self.usable()?;
        check_nul(value, "identifier")?;

        let mut out = String::with_capacity(value.len() + 2);
        out.push('"');
        for c in value.chars() {
            if c == '"' {
                out.push('"');
            }
            out.push(c);
        }
        out.push('"');
        Ok(out)
    }

    /// Set the client encoding, blocking.
    pub fn set_client_encoding(&mut self, encoding: &str) -> Result<()> {
        let sql = format!("SET client_encoding TO {}", self.escape_literal(encoding)?);
        let result = self.exec(&sql)?;
        match result.error() {
            Some(err) => Err(err.clone().into()),
            None => Ok(()),
        }
    }
}

fn check_nul(value: &str, what: &'static str) -> Result<(), EncodeError> {
    if value.len() > MAX_MESSAGE {
        return Err(EncodeError::new(format!("{what} exceeds the message size limit")));
    }
    match value.contains('\0') {
        true => Err(EncodeError::new(format!("{what} contains nul byte"))),
        false => Ok(()),
    }
}

fn check_params(params: &[Param]) -> Result<(), EncodeError> {
    if params.len() > MAX_PARAMS {
        return Err(EncodeError::new("too many parameters, maximum is 65535"));
    }
    let size = params.iter().fold(0usize, |acc, p| acc.saturating_add(p.value().map_or(0, |v| v.len())));
    match size > MAX_MESSAGE {
        true => Err(EncodeError::new("parameters exceed the message size limit")),
        false => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;

    use super::*;
    use crate::{
        Array, ErrorKind, Fetch, Status,
        encode::Encode,
        postgres::{OidType, frontend},
        row::AccessError,
        testing::{connected, frame},
    };

    #[test]
    fn query_params_messages() {
        let (mut conn, wire) = connected();
        let params = [7i32.encode()];
        conn.send_query_params("SELECT $1", &params, Format::Binary).unwrap();

        let mut expected = BytesMut::new();
        frontend::write(Parse { name: "", sql: "SELECT $1", oids: &[OidType::Int4.oid()] }, &mut expected);
        frontend::write(Bind { portal: "", statement: "", params: &params, result_format: Format::Binary }, &mut expected);
        frontend::write(Describe { kind: Describe::PORTAL, name: "" }, &mut expected);
        frontend::write(Execute { portal: "", max_rows: 0 }, &mut expected);
        frontend::write(Sync {}, &mut expected);
        assert_eq!(wire.borrow_mut().take_outbound(), expected);
    }

    #[test]
    fn binary_int_array() {
        let (mut conn, wire) = connected();
        let array = vec![Some(1i32), Some(2), None, Some(4)].encode();
        let payload = array.value().cloned().unwrap();

        wire.borrow_mut().push(frame::parse_complete());
        wire.borrow_mut().push(frame::bind_complete());
        wire.borrow_mut().push(frame::row_description(&[("int4", OidType::Int4Array.oid(), Format::Binary)]));
        wire.borrow_mut().push(frame::data_row(&[Some(&payload[..])]));
        wire.borrow_mut().push(frame::command_complete("SELECT 1"));
        wire.borrow_mut().push(frame::ready(b'I'));

        let result = conn.exec_params("SELECT $1::int[]", &[array], Format::Binary).unwrap();
        let answer = result.answer().unwrap();
        assert_eq!(answer.len(), 1);
        assert!(answer.is_array(0).unwrap());

        let array = answer.get::<Array>(0, 0).unwrap();
        assert_eq!(array.ndim(), 1);
        assert_eq!(array.len(), 4);
        assert!(array.has_null());
        assert!(array.is_null(&[2]).unwrap());
        assert_eq!(array.get::<i32>(&[0]).unwrap(), 1);
        assert_eq!(array.get::<i32>(&[1]).unwrap(), 2);
        assert_eq!(array.get::<i32>(&[3]).unwrap(), 4);
        assert!(array.get::<i32>(&[4]).is_err());
        assert_eq!(conn.status(), Status::Idle);
    }

    #[test]
    fn column_out_of_range() {
        let (mut conn, wire) = connected();
        wire.borrow_mut().push(frame::row_description(&[
            ("a", OidType::Int4.oid(), Format::Text),
            ("b", OidType::Text.oid(), Format::Text),
            ("c", OidType::Bool.oid(), Format::Text),
        ]));
        wire.borrow_mut().push(frame::data_row(&[Some(b"1"), Some(b"two"), Some(b"t")]));
        wire.borrow_mut().push(frame::command_complete("SELECT 1"));
        wire.borrow_mut().push(frame::ready(b'I'));

        let result = conn.exec("SELECT 1, 'two', true").unwrap();
        let answer = result.answer().unwrap();
        let row = answer.row(0).unwrap();
        assert_eq!(row.len(), answer.column_count());

        let err = row.get::<_, i32>(5usize).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Access(AccessError::OutOfRange { .. })));
        assert_eq!(row.get::<_, i32>(0usize).unwrap(), 1);
        assert_eq!(row.get::<_, &str>("b").unwrap(), "two");
        assert!(row.get::<_, bool>(2usize).unwrap());
    }

    #[test]
    fn exec_returns_first_failure() {
        let (mut conn, wire) = connected();
        wire.borrow_mut().push(frame::error("ERROR", "22012", "division by zero"));
        wire.borrow_mut().push(frame::ready(b'I'));

        let result = conn.exec("SELECT 1/0").unwrap();
        assert_eq!(result.status(), ResultStatus::FatalError);
        let err = result.answer().unwrap_err();
        let server = err.as_server_error().unwrap();
        assert_eq!(server.code(), "22012");
        assert_eq!(server.severity(), "ERROR");
        assert_eq!(conn.status(), Status::Idle);
    }

    #[test]
    fn prepare_and_describe() {
        let (mut conn, wire) = connected();
        wire.borrow_mut().push(frame::parse_complete());
        wire.borrow_mut().push(frame::ready(b'I'));
        let result = conn.prepare("by_id", "SELECT name FROM users WHERE id = $1", &[]).unwrap();
        assert_eq!(result.status(), ResultStatus::CommandOk);

        wire.borrow_mut().push(frame::parameter_description(&[OidType::Int8.oid()]));
        wire.borrow_mut().push(frame::row_description(&[("name", OidType::Text.oid(), Format::Text)]));
        wire.borrow_mut().push(frame::ready(b'I'));
        let result = conn.describe_prepared("by_id").unwrap();
        assert_eq!(result.status(), ResultStatus::CommandOk);
        let answer = result.answer().unwrap();
        assert_eq!(answer.n_params(), 1);
        assert_eq!(answer.param_type(0).unwrap(), OidType::Int8.oid());
        assert_eq!(answer.column_name(0).unwrap(), "name");
        assert!(answer.is_empty());

        wire.borrow_mut().push(frame::parameter_description(&[]));
        wire.borrow_mut().push(frame::no_data());
        wire.borrow_mut().push(frame::ready(b'I'));
        let result = conn.describe_prepared("by_id").unwrap();
        assert_eq!(result.answer().unwrap().column_count(), 0);
    }

    #[test]
    fn exec_prepared_messages() {
        let (mut conn, wire) = connected();
        conn.send_query_prepared("by_id", &[1i64.encode()], Format::Text).unwrap();
        let sent = wire.borrow_mut().take_outbound();
        assert_eq!(sent[0], b'B');
        assert!(sent.windows(6).any(|w| w == b"by_id\0"));
        assert!(matches!(conn.get_result().unwrap(), Fetch::WouldBlock));
    }

    #[test]
    fn rejects_nul_and_busy() {
        let (mut conn, _) = connected();
        let err = conn.send_query("SELECT '\0'").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Encode(_)));
        assert_eq!(conn.status(), Status::Idle);

        conn.send_prepare("s", "SELECT 1", &[]).unwrap();
        let err = conn.send_describe_prepared("s").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NotReady(_)));
    }

    #[test]
    fn escaping() {
        let (mut conn, wire) = connected();
        assert_eq!(conn.escape_literal("it's").unwrap(), "'it''s'");
        assert_eq!(conn.escape_literal(r"a\b").unwrap(), r"'a\b'");
        assert_eq!(conn.escape_identifier("my \"table\"").unwrap(), "\"my \"\"table\"\"\"");
        assert!(conn.escape_literal("a\0").is_err());

        wire.borrow_mut().push(frame::parameter_status("standard_conforming_strings", "off"));
        conn.consume_input().unwrap();
        assert_eq!(conn.escape_literal(r"a\b'").unwrap(), r" E'a\\b'''");

        conn.close();
        assert!(matches!(conn.escape_literal("x").unwrap_err().kind(), ErrorKind::ConnectionLost(_)));
    }

    #[test]
    fn client_encoding() {
        let (mut conn, wire) = connected();
        wire.borrow_mut().push(frame::parameter_status("client_encoding", "LATIN1"));
        wire.borrow_mut().push(frame::command_complete("SET"));
        wire.borrow_mut().push(frame::ready(b'I'));
        conn.set_client_encoding("LATIN1").unwrap();
        assert_eq!(conn.parameter_status("client_encoding"), Some("LATIN1"));

        let sent = wire.borrow_mut().take_outbound();
        assert!(sent.windows(32).any(|w| w == b"SET client_encoding TO 'LATIN1'\0"));
    }
}
