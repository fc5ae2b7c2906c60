//! External IP discovery for STUN/TURN URLs and relay-address rewriting.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::info;

use crate::BoxError;

/// Supplies the externally reachable addresses advertised to peers.
pub trait IpProvider: Send + Sync {
    fn get(&self) -> Result<(Option<Ipv4Addr>, Option<Ipv6Addr>), BoxError>;
}

/// Fixed addresses from configuration, at most one per family.
#[derive(Debug, Clone, Default)]
pub struct StaticProvider {
    v4: Option<Ipv4Addr>,
    v6: Option<Ipv6Addr>,
}

impl StaticProvider {
    /// Parses up to two configured addresses, inferring families. Zero
    /// addresses, more than two, or two of the same family are errors.
    pub fn parse(ips: &[String]) -> Result<Self, BoxError> {
        if ips.is_empty() {
            return Err("must have at least one ip".into());
        }
        if ips.len() > 2 {
            return Err("too many ips supplied".into());
        }

        let mut provider = StaticProvider::default();
        for raw in ips {
            let addr: IpAddr = raw.parse().map_err(|e| format!("invalid ip {raw}: {e}"))?;
            match addr {
                IpAddr::V4(v4) => {
                    if provider.v4.replace(v4).is_some() {
                        return Err("invalid ips: the ips must be of different type ipv4/ipv6".into());
                    }
                }
                IpAddr::V6(v6) => {
                    if provider.v6.replace(v6).is_some() {
                        return Err("invalid ips: the ips must be of different type ipv4/ipv6".into());
                    }
                }
            }
        }
        Ok(provider)
    }
}

impl IpProvider for StaticProvider {
    fn get(&self) -> Result<(Option<Ipv4Addr>, Option<Ipv6Addr>), BoxError> {
        Ok((self.v4, self.v6))
    }
}

/// Picks a non-loopback, non-tunnel interface address, preferring IPv4. Used
/// by the binary when no external IP is configured.
pub fn detect_external_ip() -> Result<IpAddr, BoxError> {
    let interfaces = if_addrs::get_if_addrs()?;

    let mut v4_addrs = Vec::new();
    let mut v6_addrs = Vec::new();
    for iface in &interfaces {
        if iface.is_loopback() || is_tunnel_interface(&iface.name) {
            continue;
        }
        match iface.ip() {
            addr @ IpAddr::V4(_) => v4_addrs.push(addr),
            addr @ IpAddr::V6(_) => v6_addrs.push(addr),
        }
    }

    let detected = v4_addrs
        .first()
        .or_else(|| v6_addrs.first())
        .copied()
        .ok_or("no suitable (non-loopback, non-tunnel) ip address found")?;
    info!(%detected, "external ip detected from interfaces");
    Ok(detected)
}

fn is_tunnel_interface(name: &str) -> bool {
    let name = name.to_lowercase();
    ["vpn", "tun", "tap", "ppp", "wg", "tailscale", "utun"]
        .iter()
        .any(|p| name.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_v4() {
        let p = StaticProvider::parse(&["203.0.113.5".into()]).unwrap();
        let (v4, v6) = p.get().unwrap();
        assert_eq!(v4, Some("203.0.113.5".parse().unwrap()));
        assert_eq!(v6, None);
    }

    #[test]
    fn parse_both_families_any_order() {
        let p = StaticProvider::parse(&["2001:db8::1".into(), "203.0.113.5".into()]).unwrap();
        let (v4, v6) = p.get().unwrap();
        assert_eq!(v4, Some("203.0.113.5".parse().unwrap()));
        assert_eq!(v6, Some("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn parse_rejects_duplicates_of_a_family() {
        assert!(StaticProvider::parse(&["203.0.113.5".into(), "203.0.113.6".into()]).is_err());
        assert!(StaticProvider::parse(&["2001:db8::1".into(), "2001:db8::2".into()]).is_err());
    }

    #[test]
    fn parse_rejects_empty_and_excess() {
        assert!(StaticProvider::parse(&[]).is_err());
        assert!(
            StaticProvider::parse(&["203.0.113.5".into(), "2001:db8::1".into(), "203.0.113.6".into()])
                .is_err()
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(StaticProvider::parse(&["not-an-ip".into()]).is_err());
    }
}
