//! Asynchronous notification from `LISTEN` / `NOTIFY`.
use bytes::{Buf, Bytes};
use std::fmt;

use crate::{
    common::ByteStr,
    ext::BytesExt,
    postgres::ProtocolError,
};

/// A notification received on a listened channel.
#[derive(Clone)]
pub struct Notify {
    process_id: u32,
    channel: ByteStr,
    payload: ByteStr,
}

impl Notify {
    /// Decode `NotificationResponse` body.
    pub(crate) fn decode(mut body: Bytes) -> Result<Notify, ProtocolError> {
        body.need(4)?;
        let process_id = body.get_u32();
        let channel = body.get_nul_bytestr()?;
        let payload = body.get_nul_bytestr()?;
        Ok(Notify { process_id, channel, payload })
    }

    /// Returns the process id of the notifying backend.
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Returns the channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Returns the payload, empty when none was given.
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

impl fmt::Debug for Notify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notify")
            .field("process_id", &self.process_id)
            .field("channel", &self.channel)
            .field("payload", &self.payload)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode() {
        let body = Bytes::from_static(b"\0\0\0\x63jobs\0\0");
        let notify = Notify::decode(body).unwrap();
        assert_eq!(notify.process_id(), 99);
        assert_eq!(notify.channel(), "jobs");
        assert_eq!(notify.payload(), "");
    }

    #[test]
    fn decode_truncated() {
        assert!(Notify::decode(Bytes::from_static(b"\0\0")).is_err());
        assert!(Notify::decode(Bytes::from_static(b"\0\0\0\x63jobs")).is_err());
    }
}
