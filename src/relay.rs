//! Embedded TURN relay: ephemeral credentials and relay-address allocation.
//!
//! The hub issues one credential per session participant through
//! [`TurnAuth`]; the TURN library authenticates allocations against the same
//! store. Relay sockets come from a port-ranged allocator wrapped so the
//! advertised address is the configured external IP.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, info};
use turn::auth::{AuthHandler, generate_auth_key};
use turn::relay::RelayAddressGenerator;
use turn::server::Server;
use turn::server::config::{ConnConfig, ServerConfig};
use webrtc_util::conn::Conn;

use crate::BoxError;
use crate::config::Config;
use crate::ip::IpProvider;

const MAX_BIND_ATTEMPTS: usize = 10;

/// Credential management seen by the hub.
pub trait TurnAuth: Send + Sync {
    /// Registers a fresh credential for `id`, bound to the requesting peer's
    /// IP, and returns `(username, password)`.
    fn credentials(&self, id: &str, addr: IpAddr) -> (String, String);
    /// Revokes a credential.
    fn ban(&self, username: &str);
}

struct TurnUser {
    addr: IpAddr,
    password: String,
}

/// Concurrent credential store shared between the hub task and the TURN
/// library's listener tasks.
#[derive(Default)]
pub struct InternalServer {
    lookup: RwLock<HashMap<String, TurnUser>>,
}

impl InternalServer {
    /// Read-only lookup used as the TURN auth callback. The realm is not
    /// validated (single-realm deployment) and the peer address is recorded
    /// at issue time but not matched here.
    pub fn authenticate(&self, username: &str, _realm: &str, peer: SocketAddr) -> Option<String> {
        let lookup = self.lookup.read().unwrap();
        match lookup.get(username) {
            Some(user) => {
                debug!(%username, %peer, issued_to = %user.addr, "turn credential lookup");
                Some(user.password.clone())
            }
            None => {
                debug!(%username, %peer, "unauthorized turn request");
                None
            }
        }
    }
}

impl TurnAuth for InternalServer {
    fn credentials(&self, id: &str, addr: IpAddr) -> (String, String) {
        let password = random_password();
        self.lookup.write().unwrap().insert(
            id.to_string(),
            TurnUser {
                addr,
                password: password.clone(),
            },
        );
        (id.to_string(), password)
    }

    fn ban(&self, username: &str) {
        self.lookup.write().unwrap().remove(username);
    }
}

impl AuthHandler for InternalServer {
    fn auth_handle(
        &self,
        username: &str,
        realm: &str,
        src_addr: SocketAddr,
    ) -> Result<Vec<u8>, turn::Error> {
        match self.authenticate(username, realm, src_addr) {
            Some(password) => Ok(generate_auth_key(username, realm, &password)),
            None => Err(turn::Error::Other(format!("no such user {username}"))),
        }
    }
}

fn random_password() -> String {
    let mut raw = [0u8; 16];
    rand::fill(&mut raw);
    raw.iter().map(|b| format!("{b:02x}")).collect()
}

/// Relay allocator without port restrictions; the OS assigns ports unless a
/// specific one is requested.
pub struct EphemeralRelay;

#[async_trait]
impl RelayAddressGenerator for EphemeralRelay {
    fn validate(&self) -> Result<(), turn::Error> {
        Ok(())
    }

    async fn allocate_conn(
        &self,
        use_ipv4: bool,
        requested_port: u16,
    ) -> Result<(Arc<dyn Conn + Send + Sync>, SocketAddr), turn::Error> {
        let socket = UdpSocket::bind((bind_host(use_ipv4), requested_port))
            .await
            .map_err(|e| turn::Error::Other(e.to_string()))?;
        let addr = socket
            .local_addr()
            .map_err(|e| turn::Error::Other(e.to_string()))?;
        Ok((Arc::new(socket), addr))
    }
}

/// Relay allocator restricted to `[min_port, max_port]`: a requested port is
/// honoured, otherwise random ports from the range are tried a bounded
/// number of times.
pub struct PortRangeRelay {
    pub min_port: u16,
    pub max_port: u16,
}

#[async_trait]
impl RelayAddressGenerator for PortRangeRelay {
    fn validate(&self) -> Result<(), turn::Error> {
        if self.min_port == 0 || self.max_port < self.min_port {
            return Err(turn::Error::Other("invalid relay port range".to_string()));
        }
        Ok(())
    }

    async fn allocate_conn(
        &self,
        use_ipv4: bool,
        requested_port: u16,
    ) -> Result<(Arc<dyn Conn + Send + Sync>, SocketAddr), turn::Error> {
        let host = bind_host(use_ipv4);
        let socket = if requested_port != 0 {
            UdpSocket::bind((host, requested_port))
                .await
                .map_err(|e| turn::Error::Other(e.to_string()))?
        } else {
            bind_random(self.min_port, self.max_port, |port| {
                UdpSocket::bind((host, port))
            })
            .await?
        };
        let addr = socket
            .local_addr()
            .map_err(|e| turn::Error::Other(e.to_string()))?;
        Ok((Arc::new(socket), addr))
    }
}

fn bind_host(use_ipv4: bool) -> &'static str {
    if use_ipv4 { "0.0.0.0" } else { "::" }
}

/// Tries uniformly random ports in `[min_port, max_port]` until `bind`
/// succeeds, up to [`MAX_BIND_ATTEMPTS`] times.
async fn bind_random<T, F, Fut>(min_port: u16, max_port: u16, mut bind: F) -> Result<T, turn::Error>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    for _ in 0..MAX_BIND_ATTEMPTS {
        let port = rand::rng().random_range(min_port..=max_port);
        if let Ok(bound) = bind(port).await {
            return Ok(bound);
        }
    }
    Err(turn::Error::Other(
        "could not find free port: max retries exceeded".to_string(),
    ))
}

/// Wraps another allocator and substitutes the configured external IP into
/// the advertised relay address.
pub struct AdvertisedRelay {
    inner: Box<dyn RelayAddressGenerator + Send + Sync>,
    ips: Arc<dyn IpProvider>,
}

impl AdvertisedRelay {
    pub fn new(inner: Box<dyn RelayAddressGenerator + Send + Sync>, ips: Arc<dyn IpProvider>) -> Self {
        AdvertisedRelay { inner, ips }
    }
}

#[async_trait]
impl RelayAddressGenerator for AdvertisedRelay {
    fn validate(&self) -> Result<(), turn::Error> {
        self.inner.validate()
    }

    async fn allocate_conn(
        &self,
        use_ipv4: bool,
        requested_port: u16,
    ) -> Result<(Arc<dyn Conn + Send + Sync>, SocketAddr), turn::Error> {
        let (conn, addr) = self.inner.allocate_conn(use_ipv4, requested_port).await?;
        let (v4, v6) = self
            .ips
            .get()
            .map_err(|e| turn::Error::Other(e.to_string()))?;
        let advertised = SocketAddr::new(advertised_ip(addr.ip(), v4, v6), addr.port());
        debug!(bound = %addr, %advertised, "relay allocated");
        Ok((conn, advertised))
    }
}

/// An IPv4-bound relay advertises the external v4 when one is configured;
/// otherwise the external v6 when present; otherwise the bound address.
fn advertised_ip(bound: IpAddr, v4: Option<Ipv4Addr>, v6: Option<Ipv6Addr>) -> IpAddr {
    match (v4, v6) {
        (Some(v4), None) => IpAddr::V4(v4),
        (Some(v4), Some(_)) if bound.is_ipv4() => IpAddr::V4(v4),
        (_, Some(v6)) => IpAddr::V6(v6),
        (None, None) => bound,
    }
}

/// Binds the TURN listener and starts the library server with the credential
/// store as its auth handler. The returned store is shared with the hub.
pub async fn start(
    config: &Config,
    ips: Arc<dyn IpProvider>,
) -> Result<(Arc<InternalServer>, Server), BoxError> {
    let socket = UdpSocket::bind(Config::bind_address(&config.turn_address)).await?;
    let store = Arc::new(InternalServer::default());

    let inner: Box<dyn RelayAddressGenerator + Send + Sync> = match config.turn_port_range {
        Some((min_port, max_port)) => {
            debug!(min_port, max_port, "using port range relay allocator");
            Box::new(PortRangeRelay { min_port, max_port })
        }
        None => {
            debug!("using unrestricted relay allocator");
            Box::new(EphemeralRelay)
        }
    };

    let server = Server::new(ServerConfig {
        conn_configs: vec![ConnConfig {
            conn: Arc::new(socket),
            relay_addr_generator: Box::new(AdvertisedRelay::new(inner, ips)),
        }],
        realm: config.turn_realm.clone(),
        auth_handler: store.clone(),
        channel_bind_timeout: Duration::from_secs(0),
        alloc_close_notify: None,
    })
    .await?;

    info!(address = %config.turn_address, realm = %config.turn_realm, "turn server started");
    Ok((store, server))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io;

    fn localhost() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn credentials_register_and_ban_removes() {
        let store = InternalServer::default();
        let (username, password) = store.credentials("s1host", IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(username, "s1host");
        assert_eq!(
            store.authenticate("s1host", "roomcast", localhost()),
            Some(password)
        );
        store.ban("s1host");
        assert_eq!(store.authenticate("s1host", "roomcast", localhost()), None);
    }

    #[test]
    fn passwords_are_random_hex() {
        let store = InternalServer::default();
        let (_, first) = store.credentials("a", IpAddr::V4(Ipv4Addr::LOCALHOST));
        let (_, second) = store.credentials("b", IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }

    #[test]
    fn reissuing_replaces_the_password() {
        let store = InternalServer::default();
        let (_, first) = store.credentials("a", IpAddr::V4(Ipv4Addr::LOCALHOST));
        let (_, second) = store.credentials("a", IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(first, second);
        assert_eq!(store.authenticate("a", "roomcast", localhost()), Some(second));
    }

    #[tokio::test]
    async fn bind_random_retries_until_success() {
        let attempts = Cell::new(0u32);
        let bound = bind_random(40000, 40050, |port| {
            attempts.set(attempts.get() + 1);
            let attempt = attempts.get();
            std::future::ready(if attempt <= 9 {
                Err(io::Error::other("address in use"))
            } else {
                Ok(port)
            })
        })
        .await
        .unwrap();
        assert_eq!(attempts.get(), 10);
        assert!((40000..=40050).contains(&bound));
    }

    #[tokio::test]
    async fn bind_random_gives_up_after_max_attempts() {
        let attempts = Cell::new(0u32);
        let result: Result<u16, _> = bind_random(40000, 40050, |_port| {
            attempts.set(attempts.get() + 1);
            std::future::ready(Err(io::Error::other("address in use")))
        })
        .await;
        assert_eq!(attempts.get(), 10);
        assert!(result.unwrap_err().to_string().contains("could not find free port"));
    }

    #[test]
    fn advertised_ip_prefers_matching_family() {
        let v4: Ipv4Addr = "203.0.113.5".parse().unwrap();
        let v6: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let bound_v4: IpAddr = "10.0.0.8".parse().unwrap();
        let bound_v6: IpAddr = "fe80::1".parse().unwrap();

        assert_eq!(advertised_ip(bound_v4, Some(v4), Some(v6)), IpAddr::V4(v4));
        assert_eq!(advertised_ip(bound_v6, Some(v4), Some(v6)), IpAddr::V6(v6));
        assert_eq!(advertised_ip(bound_v6, Some(v4), None), IpAddr::V4(v4));
        assert_eq!(advertised_ip(bound_v4, None, Some(v6)), IpAddr::V6(v6));
        assert_eq!(advertised_ip(bound_v4, None, None), bound_v4);
    }
}
