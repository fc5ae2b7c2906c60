//! Authentication collaborator interface.
//!
//! The hub only ever sees `(username, authenticated)` resolved at upgrade
//! time. The bundled implementation validates an `Authorization: Basic`
//! header against a `user:password` file; anything fancier (cookie sessions,
//! an identity provider) just needs to implement [`AuthLookup`].

use std::collections::HashMap;
use std::path::Path;

use data_encoding::BASE64;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tracing::{debug, info};

use crate::BoxError;

pub const GUEST: &str = "guest";

/// Resolves the user behind an upgrade request.
pub trait AuthLookup: Send + Sync {
    /// Returns the authenticated username and `true`, or [`GUEST`] and
    /// `false`.
    fn current_user(&self, headers: &HeaderMap) -> (String, bool);
}

/// Username/password pairs loaded from a local file.
pub struct Users {
    lookup: HashMap<String, String>,
}

impl Users {
    /// Loads a users file: one `user:password` per line, `#` starts a
    /// comment, surrounding whitespace is ignored.
    pub fn load(path: &Path) -> Result<Self, BoxError> {
        let contents = std::fs::read_to_string(path)?;
        let mut lookup = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (user, password) = line.split_once(':').ok_or("malformed users file")?;
            lookup.insert(user.trim().to_string(), password.trim().to_string());
        }
        info!(users = lookup.len(), "loaded users file");
        Ok(Users { lookup })
    }

    /// No registered users; every connection is a guest.
    pub fn empty() -> Self {
        Users {
            lookup: HashMap::new(),
        }
    }

    fn validate(&self, user: &str, password: &str) -> bool {
        self.lookup.get(user).is_some_and(|stored| stored == password)
    }

    fn decode_basic(value: &str) -> Option<(String, String)> {
        let encoded = value.strip_prefix("Basic ")?;
        let decoded = BASE64.decode(encoded.trim().as_bytes()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        Some((user.to_string(), password.to_string()))
    }
}

impl AuthLookup for Users {
    fn current_user(&self, headers: &HeaderMap) -> (String, bool) {
        let credentials = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(Users::decode_basic);
        match credentials {
            Some((user, password)) if self.validate(&user, &password) => {
                debug!(%user, "authenticated");
                (user, true)
            }
            Some((user, _)) => {
                debug!(%user, "credential check failed");
                (GUEST.to_string(), false)
            }
            None => (GUEST.to_string(), false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    fn basic(user: &str, password: &str) -> HeaderMap {
        let encoded = BASE64.encode(format!("{user}:{password}").as_bytes());
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
        );
        headers
    }

    fn write_users(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("roomcast-users-{}", crate::id::Id::new()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn load_skips_comments_and_blank_lines() {
        let path = write_users("# staff\nada:lovelace\n\n  grace:hopper  \n");
        let users = Users::load(&path).unwrap();
        assert!(users.validate("ada", "lovelace"));
        assert!(users.validate("grace", "hopper"));
        assert!(!users.validate("ada", "wrong"));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn load_rejects_malformed_lines() {
        let path = write_users("ada\n");
        assert!(Users::load(&path).is_err());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn current_user_with_valid_basic_header() {
        let path = write_users("ada:lovelace\n");
        let users = Users::load(&path).unwrap();
        assert_eq!(users.current_user(&basic("ada", "lovelace")), ("ada".into(), true));
        assert_eq!(users.current_user(&basic("ada", "nope")), (GUEST.into(), false));
        assert_eq!(users.current_user(&HeaderMap::new()), (GUEST.into(), false));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn empty_lookup_treats_everyone_as_guest() {
        let users = Users::empty();
        assert_eq!(users.current_user(&basic("ada", "lovelace")), (GUEST.into(), false));
    }
}
