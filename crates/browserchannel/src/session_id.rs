use std::{fmt, str::FromStr};

use crate::Error;

const SESSION_ID_BYTES: usize = 16;

/// Opaque identifier for a single browser channel session.
///
/// The wire representation is 32 lowercase hex characters. An empty string
/// parses to the reserved null id, which never names a live session; any
/// other input that does not decode to exactly 16 bytes is rejected.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_BYTES]);

impl SessionId {
    /// The all-zero id produced by parsing an empty `SID` parameter.
    pub const NULL: SessionId = SessionId([0; SESSION_ID_BYTES]);

    /// Draws a fresh random session id.
    pub fn random() -> SessionId {
        SessionId(rand::random())
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_ID_BYTES] {
        &self.0
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(repr: &str) -> Result<SessionId, Error> {
        if repr.is_empty() {
            return Ok(SessionId::NULL);
        }
        let decoded = hex::decode(repr).map_err(|_| Error::InvalidSessionId)?;
        let bytes = decoded.try_into().map_err(|_| Error::InvalidSessionId)?;
        Ok(SessionId(bytes))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}
