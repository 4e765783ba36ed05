//! Connection options and the handshake document.
//!
//! Every connection starts with the client sending one JSON-encoded,
//! newline-terminated [`Options`] document. The server validates the
//! magic number, selects the codec by name, and only then switches to
//! codec-framed messages.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use wirecall::options::{Options, MAGIC_NUMBER};
//!
//! let opt = Options::default();
//! assert_eq!(opt.magic, MAGIC_NUMBER);
//! assert_eq!(opt.connect_timeout, Duration::from_secs(10));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::MSGPACK_CODEC;

/// Marks a connection as speaking this protocol.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Default connect timeout (dial + handshake).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection options, exchanged once at connection start.
///
/// A timeout of zero means unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    /// Magic number identifying the protocol.
    #[serde(rename = "MagicNumber")]
    pub magic: u32,

    /// Short name of the codec used for all subsequent frames.
    #[serde(rename = "CodeType")]
    pub codec: String,

    /// Maximum wall time for dial + handshake. Zero = unbounded.
    #[serde(rename = "ConnectTimeout", with = "duration_millis")]
    pub connect_timeout: Duration,

    /// Maximum wall time the server grants one method invocation.
    /// Zero = unbounded.
    #[serde(rename = "HandleTimeout", with = "duration_millis")]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic: MAGIC_NUMBER,
            codec: MSGPACK_CODEC.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    /// Options with a server-side handle timeout.
    pub fn with_handle_timeout(timeout: Duration) -> Self {
        Self {
            handle_timeout: timeout,
            ..Self::default()
        }
    }

    /// Options with a client-side connect timeout.
    pub fn with_connect_timeout(timeout: Duration) -> Self {
        Self {
            connect_timeout: timeout,
            ..Self::default()
        }
    }
}

/// Normalize caller-provided options.
///
/// The magic number is always forced to [`MAGIC_NUMBER`] (callers
/// cannot override it) and an empty codec name falls back to the
/// default codec.
pub(crate) fn parse_options(opts: Option<Options>) -> Options {
    let mut opt = opts.unwrap_or_default();
    opt.magic = MAGIC_NUMBER;
    if opt.codec.is_empty() {
        opt.codec = MSGPACK_CODEC.to_string();
    }
    opt
}

/// Durations travel as integer milliseconds in the handshake document.
mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opt = Options::default();
        assert_eq!(opt.magic, MAGIC_NUMBER);
        assert_eq!(opt.codec, MSGPACK_CODEC);
        assert_eq!(opt.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(opt.handle_timeout, Duration::ZERO);
    }

    #[test]
    fn test_options_json_roundtrip() {
        let opt = Options {
            magic: MAGIC_NUMBER,
            codec: MSGPACK_CODEC.to_string(),
            connect_timeout: Duration::from_secs(3),
            handle_timeout: Duration::from_millis(1500),
        };

        let json = serde_json::to_string(&opt).unwrap();
        assert!(json.contains("\"MagicNumber\""));
        assert!(json.contains("\"CodeType\""));
        assert!(json.contains("\"ConnectTimeout\":3000"));
        assert!(json.contains("\"HandleTimeout\":1500"));

        let back: Options = serde_json::from_str(&json).unwrap();
        assert_eq!(back, opt);
    }

    #[test]
    fn test_parse_options_forces_magic() {
        let opt = parse_options(Some(Options {
            magic: 0xdeadbeef,
            codec: String::new(),
            connect_timeout: Duration::ZERO,
            handle_timeout: Duration::from_secs(1),
        }));

        assert_eq!(opt.magic, MAGIC_NUMBER);
        assert_eq!(opt.codec, MSGPACK_CODEC);
        assert_eq!(opt.connect_timeout, Duration::ZERO);
        assert_eq!(opt.handle_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_parse_options_none_is_default() {
        assert_eq!(parse_options(None), Options::default());
    }
}
