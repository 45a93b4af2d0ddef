//! Startup phase.
//!
//! <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-START-UP>
use md5::{Digest, Md5};
use std::{fmt, sync::Arc};

use super::{
    Config, Connection, Handshake, Status,
    scram::{self, Scram, ScramError},
};
use crate::{
    Result,
    cancel::BackendKey,
    common::{log_warn, verbose},
    postgres::{
        BackendMessage, ProtocolError,
        backend,
        frontend::{PasswordMessage, SaslInitialResponse, SaslResponse, Startup},
    },
    transport::Transport,
};

impl<T: Transport> Connection<T> {
    /// Queue the startup packet.
    pub(super) fn write_startup(&mut self) {
        let params = self.config.startup_params();
        Startup {
            user: self.config.user(),
            database: Some(self.config.dbname()),
            params: &params,
        }
        .write(&mut self.write_buf);
    }

    /// Handle a backend message before the connection is ready for query.
    pub(super) fn handshake(&mut self, message: BackendMessage) -> Result<()> {
        use BackendMessage::*;

        self.trace_recv(&message);

        let Status::Connecting(phase) = self.status else {
            return Err(ProtocolError::unexpected_phase(message.msgtype(), "startup").into());
        };

        match message {
            // fatal during startup, the server closes the connection afterwards
            ErrorResponse(err) => return Err(err.into()),
            NoticeResponse(notice) => self.notice(notice),
            NegotiateProtocolVersion { minor: _minor } => {
                // only minor version can be negotiated, protocol 3.0 is always accepted
                verbose!(minor = _minor, "server negotiated protocol version");
            },
            BackendMessage::Authentication(auth) if phase == Handshake::Authenticating => self.authenticate(auth)?,
            ParameterStatus { name, value } if phase == Handshake::AwaitingReady => {
                self.parameters.insert(name, value);
            },
            BackendKeyData { process_id, secret_key } if phase == Handshake::AwaitingReady => {
                self.key = Some(Arc::new(BackendKey { process_id, secret_key }));
            },
            ReadyForQuery { status } if phase == Handshake::AwaitingReady => {
                verbose!(pid = self.backend_pid(), "connection ready");
                self.transaction = status;
                self.status = Status::Idle;
            },
            message => return Err(ProtocolError::unexpected_phase(message.msgtype(), "startup").into()),
        }

        Ok(())
    }

    fn authenticate(&mut self, auth: backend::Authentication) -> Result<()> {
        use backend::Authentication as Auth;

        match auth {
            Auth::Ok => {
                if self.scram.is_some() {
                    return Err(AuthError::Scram(ScramError::incomplete()).into());
                }
                self.status = Status::Connecting(Handshake::AwaitingReady);
            },
            Auth::CleartextPassword => {
                let password = password(&self.config)?.to_owned();
                self.send(PasswordMessage { password: &password });
            },
            Auth::Md5Password { salt } => {
                let hash = md5_password(self.config.user(), password(&self.config)?, salt);
                self.send(PasswordMessage { password: &hash });
            },
            Auth::Sasl { mechanisms } => {
                let supported = Auth::sasl_mechanisms(&mechanisms)
                    .any(|m| m == scram::MECHANISM.as_bytes());
                if !supported {
                    return Err(AuthError::Unsupported("SASL mechanism other than SCRAM-SHA-256").into());
                }
                let scram = Scram::new(password(&self.config)?);
                self.send(SaslInitialResponse { mechanism: scram::MECHANISM, data: &scram.client_first() });
                self.scram = Some(scram);
            },
            Auth::SaslContinue { data } => {
                let Some(scram) = self.scram.as_mut() else {
                    return Err(ProtocolError::malformed("SASL continue without SASL exchange").into());
                };
                let response = scram.server_first(&data).map_err(AuthError::Scram)?;
                self.send(SaslResponse { data: &response });
            },
            Auth::SaslFinal { data } => {
                let Some(mut scram) = self.scram.take() else {
                    return Err(ProtocolError::malformed("SASL final without SASL exchange").into());
                };
                scram.server_final(&data).map_err(AuthError::Scram)?;
            },
            Auth::Unsupported(method) => return Err(AuthError::Unsupported(method).into()),
        }
        Ok(())
    }
}

fn password(config: &Config) -> Result<&str, AuthError> {
    match config.password() {
        Some(password) => Ok(password),
        None => {
            log_warn!("server requested password but none was configured");
            Err(AuthError::PasswordRequired)
        },
    }
}

/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`
fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut md5 = Md5::new();
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());
    let inner = md5.finalize_reset();

    md5.update(format!("{inner:x}").as_bytes());
    md5.update(salt);
    format!("md5{:x}", md5.finalize())
}

/// Authentication failure detected by the client.
pub enum AuthError {
    /// Server requested an authentication method that is not supported.
    Unsupported(&'static str),
    /// Server requested a password but none was configured.
    PasswordRequired,
    /// SCRAM exchange failed.
    Scram(ScramError),
}

impl std::error::Error for AuthError { }

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Unsupported(method) => write!(f, "unsupported authentication method: {method}"),
            AuthError::PasswordRequired => f.write_str("server requested a password, but none was supplied"),
            AuthError::Scram(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl fmt::Debug for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ErrorKind,
        connection::PollStatus,
        postgres::frontend,
        testing::{Script, frame, script},
    };

    #[test]
    fn md5_hash() {
        assert_eq!(
            md5_password("postgres", "secret", [1, 2, 3, 4]),
            "md5bb41a296aab6baccb36ff243a562abff",
        );
    }

    fn start(conninfo: &str) -> Connection<Script> {
        Connection::start_with::<Script>(conninfo).unwrap()
    }

    #[test]
    fn md5_exchange() {
        let wire = script();
        wire.borrow_mut().push(frame::auth(5, &[9, 9, 9, 9]));

        let mut conn = start("user=bob password=pw");
        assert_eq!(conn.poll().unwrap(), PollStatus::Reading);
        assert_eq!(conn.status(), Status::Connecting(Handshake::Authenticating));

        let sent = wire.borrow_mut().take_outbound();
        let mut expected = bytes::BytesMut::new();
        Startup { user: "bob", database: Some("bob"), params: &Config::default().startup_params() }.write(&mut expected);
        frontend::write(PasswordMessage { password: &md5_password("bob", "pw", [9, 9, 9, 9]) }, &mut expected);
        assert_eq!(sent, expected);

        wire.borrow_mut().push(frame::auth(0, &[]));
        wire.borrow_mut().push(frame::backend_key(7, 11));
        wire.borrow_mut().push(frame::parameter_status("server_version", "9.6.3"));
        wire.borrow_mut().push(frame::ready(b'I'));
        assert_eq!(conn.poll().unwrap(), PollStatus::Ready);
        assert_eq!(conn.status(), Status::Idle);
        assert_eq!(conn.backend_pid(), 7);
        assert_eq!(conn.server_version(), 90603);
    }

    #[test]
    fn password_required() {
        let wire = script();
        wire.borrow_mut().push(frame::auth(3, &[]));

        let mut conn = start("user=bob");
        let err = conn.poll().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Auth(AuthError::PasswordRequired)));
        assert_eq!(conn.status(), Status::Failed);
        assert_eq!(conn.poll().unwrap(), PollStatus::Failed);
        assert!(!conn.error_message().is_empty());
    }

    #[test]
    fn unsupported_method() {
        let wire = script();
        wire.borrow_mut().push(frame::auth(7, &[]));

        let mut conn = start("user=bob password=pw");
        let err = conn.poll().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Auth(AuthError::Unsupported("GSSAPI"))));
    }

    #[test]
    fn startup_error() {
        let wire = script();
        wire.borrow_mut().push(frame::error("FATAL", "3D000", "database \"nope\" does not exist"));
        wire.borrow_mut().close();

        let mut conn = start("dbname=nope");
        let err = conn.poll().unwrap_err();
        assert_eq!(err.as_server_error().map(|e| e.code()), Some("3D000"));
        assert!(conn.error_message().contains("does not exist"));

        let err = conn.get_result().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ConnectionLost(_)));
    }

    #[test]
    fn sasl_without_scram() {
        let wire = script();
        wire.borrow_mut().push(frame::auth(10, b"SCRAM-SHA-256-PLUS\0\0"));

        let mut conn = start("password=pw");
        let err = conn.poll().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Auth(AuthError::Unsupported(_))));
    }

    #[test]
    fn sasl_initial_response() {
        let wire = script();
        wire.borrow_mut().push(frame::auth(10, b"SCRAM-SHA-256\0\0"));

        let mut conn = start("password=pw");
        assert_eq!(conn.poll().unwrap(), PollStatus::Reading);
        let sent = wire.borrow_mut().take_outbound();
        assert!(sent.windows(13).any(|w| w == b"SCRAM-SHA-256"));
        assert!(sent.windows(7).any(|w| w == b"n,,n=,r"));

        // final before continue
        wire.borrow_mut().push(frame::auth(0, &[]));
        let err = conn.poll().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Auth(AuthError::Scram(_))));
    }
}
