use anyhow::{Result, anyhow};
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};

/// Parses the original client IP from X-Forwarded-For header
/// Format: "client, proxy1, proxy2, ..." - returns the leftmost (original client) IP
#[must_use]
pub fn parse_original_client_ip(xff_header: &str) -> Option<IpAddr> {
    xff_header
        .split(',')
        .next()
        .map(str::trim)
        .and_then(|ip| ip.parse().ok())
}

/// Parses the `trusted_proxies` list. Each entry is a single address or a CIDR network.
pub fn parse_trusted_proxies(entries: &[String]) -> Result<Vec<IpNet>> {
    entries
        .iter()
        .map(|entry| {
            if let Ok(ip) = entry.parse::<IpAddr>() {
                Ok(IpNet::from(ip))
            } else {
                entry.parse::<IpNet>().map_err(|_| {
                    anyhow!("Invalid IP address or CIDR in trusted_proxies: {}", entry)
                })
            }
        })
        .collect()
}

/// Decides which address is reported to the backend dialer as the client's origin.
///
/// The X-Forwarded-For header is only believed when the directly connected peer
/// is one of the trusted proxies (typically a CDN edge).
#[must_use]
pub fn resolve_client_ip(peer_ip: IpAddr, xff_header: Option<&str>, trusted: &[IpNet]) -> IpAddr {
    if !trusted.iter().any(|net| net.contains(&peer_ip)) {
        return peer_ip;
    }
    xff_header
        .and_then(parse_original_client_ip)
        .unwrap_or(peer_ip)
}

/// Resolves the full client address handed to the backend.
///
/// A forwarded origin carries no port and is reported with port 0.
#[must_use]
pub fn resolve_client_addr(
    peer: SocketAddr,
    xff_header: Option<&str>,
    trusted: &[IpNet],
) -> SocketAddr {
    let ip = resolve_client_ip(peer.ip(), xff_header, trusted);
    if ip == peer.ip() {
        peer
    } else {
        SocketAddr::new(ip, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trusted(entries: &[&str]) -> Vec<IpNet> {
        let entries: Vec<String> = entries.iter().map(ToString::to_string).collect();
        parse_trusted_proxies(&entries).unwrap()
    }

    #[test]
    fn leftmost_forwarded_address_wins() {
        assert_eq!(
            parse_original_client_ip(" 198.51.100.4 , 10.0.0.1"),
            Some("198.51.100.4".parse().unwrap())
        );
        assert_eq!(parse_original_client_ip(""), None);
        assert_eq!(parse_original_client_ip("garbage, 10.0.0.1"), None);
    }

    #[test]
    fn accepts_addresses_and_networks() {
        let nets = trusted(&["192.0.2.1", "10.0.0.0/8", "2001:db8::/32"]);
        assert_eq!(nets.len(), 3);
        assert!(nets[0].contains(&"192.0.2.1".parse::<IpAddr>().unwrap()));
        assert!(!nets[0].contains(&"192.0.2.2".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn rejects_malformed_entry() {
        let err = parse_trusted_proxies(&["10.0.0.0/99".to_string()]).unwrap_err();
        assert!(err.to_string().contains("trusted_proxies"));
    }

    #[test]
    fn ignores_header_from_untrusted_peer() {
        let peer: IpAddr = "203.0.113.9".parse().unwrap();
        let nets = trusted(&["10.0.0.0/8"]);
        assert_eq!(resolve_client_ip(peer, Some("198.51.100.4"), &nets), peer);
        assert_eq!(resolve_client_ip(peer, Some("198.51.100.4"), &[]), peer);
    }

    #[test]
    fn honors_header_from_trusted_peer() {
        let peer: IpAddr = "10.1.2.3".parse().unwrap();
        let nets = trusted(&["10.0.0.0/8"]);
        assert_eq!(
            resolve_client_ip(peer, Some("198.51.100.4, 10.1.2.3"), &nets),
            "198.51.100.4".parse::<IpAddr>().unwrap()
        );
        assert_eq!(resolve_client_ip(peer, None, &nets), peer);
        assert_eq!(resolve_client_ip(peer, Some("unknown"), &nets), peer);
    }

    #[test]
    fn forwarded_address_drops_proxy_port() {
        let nets = trusted(&["10.0.0.0/8"]);
        let direct: SocketAddr = "203.0.113.9:51000".parse().unwrap();
        assert_eq!(resolve_client_addr(direct, Some("198.51.100.4"), &nets), direct);

        let proxied: SocketAddr = "10.1.2.3:443".parse().unwrap();
        assert_eq!(
            resolve_client_addr(proxied, Some("198.51.100.4"), &nets),
            "198.51.100.4:0".parse::<SocketAddr>().unwrap()
        );
    }
}
