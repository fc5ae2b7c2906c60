//! Runtime configuration for the signaling server and the embedded relay.

use std::fmt;
use std::str::FromStr;

use regex::Regex;

use crate::BoxError;

/// Policy gate on room creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Anyone may create rooms.
    None,
    /// Only authenticated users may create rooms.
    All,
    /// Authentication is required only for rooms with TURN connection mode.
    Turn,
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(AuthMode::None),
            "all" => Ok(AuthMode::All),
            "turn" => Ok(AuthMode::Turn),
            other => Err(format!("invalid auth mode {other}")),
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthMode::None => "none",
            AuthMode::All => "all",
            AuthMode::Turn => "turn",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WebSocket bind address, `:5050` style.
    pub server_address: String,
    /// TURN bind address, `:3478` style.
    pub turn_address: String,
    /// Port advertised in STUN/TURN URLs, derived from `turn_address`.
    pub turn_port: u16,
    /// Relay port range. `None` selects the unrestricted allocator.
    pub turn_port_range: Option<(u16, u16)>,
    pub turn_realm: String,
    pub auth_mode: AuthMode,
    /// Compiled allow-list matched against the lowercased Origin header.
    pub cors_allowed_origins: Vec<Regex>,
    pub close_room_when_owner_leaves: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_address: ":5050".to_string(),
            turn_address: ":3478".to_string(),
            turn_port: 3478,
            turn_port_range: None,
            turn_realm: "roomcast".to_string(),
            auth_mode: AuthMode::Turn,
            cors_allowed_origins: Vec::new(),
            close_room_when_owner_leaves: true,
        }
    }
}

impl Config {
    /// Whether `origin` may open a signaling connection. An absent or empty
    /// Origin header is allowed; otherwise the lowercased origin must match
    /// one of the configured patterns.
    pub fn check_origin(&self, origin: &str) -> bool {
        if origin.is_empty() {
            return true;
        }
        let origin = origin.to_lowercase();
        self.cors_allowed_origins.iter().any(|re| re.is_match(&origin))
    }

    /// Turns a `:5050` style address into one `TcpListener`/`UdpSocket` can
    /// bind.
    pub fn bind_address(address: &str) -> String {
        if let Some(port) = address.strip_prefix(':') {
            format!("0.0.0.0:{port}")
        } else {
            address.to_string()
        }
    }

    /// Extracts the port from a `host:port` or `:port` address.
    pub fn port_of(address: &str) -> Result<u16, BoxError> {
        let (_, port) = address
            .rsplit_once(':')
            .ok_or_else(|| format!("address {address} must include a port"))?;
        Ok(port.parse::<u16>().map_err(|e| format!("invalid port in {address}: {e}"))?)
    }

    /// Parses a `min:max` relay port range. The range must be non-empty,
    /// ordered, and span at least 40 ports.
    pub fn parse_port_range(range: &str) -> Result<(u16, u16), BoxError> {
        let (min, max) = range
            .split_once(':')
            .ok_or("port range must include one colon")?;
        let min: u16 = min.parse().map_err(|e| format!("invalid min port: {e}"))?;
        let max: u16 = max.parse().map_err(|e| format!("invalid max port: {e}"))?;
        if min == 0 || max == 0 || min > max {
            return Err("invalid port range".into());
        }
        if max - min < 40 {
            return Err("port range too small".into());
        }
        Ok((min, max))
    }

    pub fn compile_origins(patterns: &[String]) -> Result<Vec<Regex>, BoxError> {
        patterns
            .iter()
            .map(|p| Ok(Regex::new(p)?))
            .collect::<Result<Vec<_>, BoxError>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_accepts_wide_enough_span() {
        assert_eq!(Config::parse_port_range("40000:40050").unwrap(), (40000, 40050));
        assert_eq!(Config::parse_port_range("50000:65535").unwrap(), (50000, 65535));
    }

    #[test]
    fn port_range_rejects_bad_input() {
        assert!(Config::parse_port_range("40000").is_err());
        assert!(Config::parse_port_range("0:40050").is_err());
        assert!(Config::parse_port_range("40050:40000").is_err());
        assert!(Config::parse_port_range("40000:40039").is_err());
        assert!(Config::parse_port_range("x:40050").is_err());
    }

    #[test]
    fn port_range_minimum_span_is_inclusive() {
        assert!(Config::parse_port_range("40000:40040").is_ok());
    }

    #[test]
    fn bind_address_expands_bare_port() {
        assert_eq!(Config::bind_address(":5050"), "0.0.0.0:5050");
        assert_eq!(Config::bind_address("10.0.0.1:5050"), "10.0.0.1:5050");
    }

    #[test]
    fn port_of_parses_suffix() {
        assert_eq!(Config::port_of(":3478").unwrap(), 3478);
        assert_eq!(Config::port_of("turn.example.com:3478").unwrap(), 3478);
        assert!(Config::port_of("noport").is_err());
    }

    #[test]
    fn origin_check_matches_lowercased() {
        let config = Config {
            cors_allowed_origins: Config::compile_origins(&[
                "^https://app\\.example\\.com$".to_string(),
            ])
            .unwrap(),
            ..Config::default()
        };
        assert!(config.check_origin(""));
        assert!(config.check_origin("https://APP.example.com"));
        assert!(!config.check_origin("https://evil.example.com"));
    }

    #[test]
    fn auth_mode_from_str() {
        assert_eq!("turn".parse::<AuthMode>().unwrap(), AuthMode::Turn);
        assert_eq!("none".parse::<AuthMode>().unwrap(), AuthMode::None);
        assert!("cookie".parse::<AuthMode>().is_err());
    }
}
