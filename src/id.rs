use std::fmt;
use std::sync::OnceLock;

use data_encoding::Encoding;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const RAW_LEN: usize = 12;
const ENCODED_LEN: usize = 20;

/// Lowercase base32hex, the alphabet the rest of the stack expects in URLs
/// and TURN usernames.
fn encoding() -> &'static Encoding {
    static ENCODING: OnceLock<Encoding> = OnceLock::new();
    ENCODING.get_or_init(|| {
        let mut spec = data_encoding::Specification::new();
        spec.symbols.push_str("0123456789abcdefghijklmnopqrstuv");
        spec.encoding().expect("valid base32hex specification")
    })
}

/// Opaque identifier for clients and sessions.
///
/// 12 random bytes, rendered as 20 lowercase base32hex characters. The string
/// form is the wire form and doubles as the prefix of TURN usernames.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id([u8; RAW_LEN]);

impl Id {
    pub fn new() -> Self {
        let mut raw = [0u8; RAW_LEN];
        rand::fill(&mut raw);
        Id(raw)
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        if s.len() != ENCODED_LEN {
            return Err(format!("invalid id length {}", s.len()));
        }
        let raw = encoding()
            .decode(s.as_bytes())
            .map_err(|e| format!("invalid id {s}: {e}"))?;
        let raw: [u8; RAW_LEN] = raw
            .try_into()
            .map_err(|_| format!("invalid id {s}: bad decoded length"))?;
        Ok(Id(raw))
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encoding().encode(&self.0))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Id::parse(&s).map_err(serde::de::Error::custom)
    }
}
