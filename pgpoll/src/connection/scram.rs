//! SCRAM-SHA-256 authentication, RFC 5802 and RFC 7677.
//!
//! Channel binding is not used since the transport is never TLS.
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::{borrow::Cow, fmt};

type HmacSha256 = Hmac<Sha256>;

pub(crate) const MECHANISM: &str = "SCRAM-SHA-256";

/// `n,,` base64 encoded.
const GS2_HEADER: &str = "biws";

const NONCE_LEN: usize = 18;

/// Client side of the SCRAM exchange.
pub(crate) struct Scram {
    password: Vec<u8>,
    client_nonce: String,
    state: State,
}

enum State {
    Initial,
    Continue {
        salted_password: [u8; 32],
        auth_message: String,
    },
    Done,
}

impl Scram {
    pub(crate) fn new(password: &str) -> Scram {
        let nonce: [u8; NONCE_LEN] = rand::rng().random();
        Self::with_nonce(password, BASE64.encode(nonce))
    }

    fn with_nonce(password: &str, client_nonce: String) -> Scram {
        // passwords failing SASLprep are used as-is, as the server does
        let password = match stringprep::saslprep(password) {
            Ok(prepared) => prepared.into_owned().into_bytes(),
            Err(_) => password.as_bytes().to_vec(),
        };
        Scram { password, client_nonce, state: State::Initial }
    }

    /// `client-first-message`, the user name is taken from the startup packet.
    pub(crate) fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    fn client_first_bare(&self) -> String {
        format!("n=,r={}", self.client_nonce)
    }

    /// Process `server-first-message`, returns `client-final-message`.
    pub(crate) fn server_first(&mut self, message: &[u8]) -> Result<Vec<u8>, ScramError> {
        if !matches!(self.state, State::Initial) {
            return Err(ScramError::new("unexpected server-first-message"));
        }
        let message = std::str::from_utf8(message).map_err(|_| ScramError::new("server message is not utf8"))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in message.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| ScramError::new("invalid salt encoding"))?);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(value.parse::<u32>().map_err(|_| ScramError::new("invalid iteration count"))?);
            }
        }

        let nonce = nonce.ok_or(ScramError::new("missing nonce"))?;
        let salt = salt.ok_or(ScramError::new("missing salt"))?;
        let iterations = iterations.filter(|i| *i > 0).ok_or(ScramError::new("missing iteration count"))?;
        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(ScramError::new("server nonce does not extend client nonce"));
        }

        let salted_password = hi(&self.password, &salt, iterations);
        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let without_proof = format!("c={GS2_HEADER},r={nonce}");
        let auth_message = format!("{},{message},{without_proof}", self.client_first_bare());

        let signature = hmac(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(signature) {
            *p ^= s;
        }

        self.state = State::Continue { salted_password, auth_message };
        Ok(format!("{without_proof},p={}", BASE64.encode(proof)).into_bytes())
    }

    /// Verify `server-final-message`.
    pub(crate) fn server_final(&mut self, message: &[u8]) -> Result<(), ScramError> {
        let State::Continue { salted_password, auth_message } = std::mem::replace(&mut self.state, State::Done) else {
            return Err(ScramError::new("unexpected server-final-message"));
        };
        let message = std::str::from_utf8(message).map_err(|_| ScramError::new("server message is not utf8"))?;

        if let Some(err) = message.strip_prefix("e=") {
            return Err(ScramError::new(format!("server error: {err}")));
        }
        let verifier = message
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or(ScramError::new("missing server signature"))?;
        let verifier = BASE64.decode(verifier).map_err(|_| ScramError::new("invalid server signature encoding"))?;

        let server_key = hmac(&salted_password, b"Server Key");
        let mut mac = HmacSha256::new_from_slice(&server_key).map_err(|_| ScramError::new("invalid key length"))?;
        mac.update(auth_message.as_bytes());
        mac.verify_slice(&verifier).map_err(|_| ScramError::new("server signature mismatch"))
    }
}

/// `Hi()`, PBKDF2 with HMAC-SHA-256 and a single output block.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(password).unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut prev: [u8; 32] = mac.finalize().into_bytes().into();
    let mut result = prev;

    for _ in 1..iterations {
        prev = hmac(password, &prev);
        for (r, p) in result.iter_mut().zip(prev) {
            *r ^= p;
        }
    }
    result
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// SCRAM exchange failure.
pub struct ScramError {
    reason: Cow<'static, str>,
}

impl ScramError {
    fn new(reason: impl Into<Cow<'static, str>>) -> ScramError {
        ScramError { reason: reason.into() }
    }

    pub(super) fn incomplete() -> ScramError {
        ScramError::new("server accepted before the exchange completed")
    }
}

impl std::error::Error for ScramError { }

impl fmt::Display for ScramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SCRAM authentication failed, {}", self.reason)
    }
}

impl fmt::Debug for ScramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
