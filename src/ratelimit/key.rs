//! Client key handling.

use std::borrow::Cow;
use std::net::IpAddr;

/// A key that identifies the client being throttled.
///
/// The key is an opaque byte sequence compared exactly. No normalization is
/// performed, so callers must canonicalize values (for example strip the port
/// from a socket address) before building a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(Box<[u8]>);

impl ClientKey {
    /// Create a key from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into().into_boxed_slice())
    }

    /// The raw bytes of this key.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lossy UTF-8 rendering, for logging.
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl From<&str> for ClientKey {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl From<String> for ClientKey {
    fn from(value: String) -> Self {
        Self::new(value.into_bytes())
    }
}

impl From<&[u8]> for ClientKey {
    fn from(value: &[u8]) -> Self {
        Self::new(value)
    }
}

impl From<Vec<u8>> for ClientKey {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

impl From<IpAddr> for ClientKey {
    fn from(value: IpAddr) -> Self {
        Self::from(value.to_string())
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_lossy())
    }
}
