//! Client IP resolution behind trusted reverse proxies.
//!
//! Forwarded headers are only honored when the socket peer falls inside a
//! configured trusted CIDR (or the published Cloudflare ranges when
//! enabled); otherwise the peer address wins.

use std::net::IpAddr;

use axum::http::HeaderMap;
use ipnet::IpNet;

/// Published Cloudflare edge ranges (IPv4 + IPv6).
const CLOUDFLARE_RANGES: &[&str] = &[
    "173.245.48.0/20",
    "103.21.244.0/22",
    "103.22.200.0/22",
    "103.31.4.0/22",
    "141.101.64.0/18",
    "108.162.192.0/18",
    "190.93.240.0/20",
    "188.114.96.0/20",
    "197.234.240.0/22",
    "198.41.128.0/17",
    "162.158.0.0/15",
    "104.16.0.0/13",
    "104.24.0.0/14",
    "172.64.0.0/13",
    "131.0.72.0/22",
    "2400:cb00::/32",
    "2606:4700::/32",
    "2803:f800::/32",
    "2405:b500::/32",
    "2405:8100::/32",
    "2a06:98c0::/29",
    "2c0f:f248::/32",
];

#[derive(Clone)]
pub struct ClientIpResolver {
    trusted: Vec<IpNet>,
}

impl ClientIpResolver {
    pub fn new(trusted_cidrs: &[String], trust_cloudflare: bool) -> Self {
        let mut trusted = Vec::new();
        for cidr in trusted_cidrs {
            match cidr.parse::<IpNet>() {
                Ok(net) => trusted.push(net),
                Err(e) => tracing::warn!(%cidr, "Ignoring unparsable trusted CIDR: {e}"),
            }
        }
        if trust_cloudflare {
            trusted.extend(
                CLOUDFLARE_RANGES
                    .iter()
                    .filter_map(|c| c.parse::<IpNet>().ok()),
            );
        }
        Self { trusted }
    }

    fn is_trusted_proxy(&self, peer: IpAddr) -> bool {
        self.trusted.iter().any(|net| net.contains(&peer))
    }

    /// Header precedence: `CF-Connecting-IP` → `True-Client-IP` →
    /// first entry of `X-Forwarded-For` → `X-Real-IP` → socket peer.
    pub fn resolve(&self, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
        if !self.is_trusted_proxy(peer) {
            return peer;
        }

        for name in ["cf-connecting-ip", "true-client-ip"] {
            if let Some(ip) = header_ip(headers, name) {
                return ip;
            }
        }

        if let Some(value) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse() {
                    return ip;
                }
            }
        }

        header_ip(headers, "x-real-ip").unwrap_or(peer)
    }
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn untrusted_peer_ignores_headers() {
        let resolver = ClientIpResolver::new(&["10.0.0.0/8".to_string()], false);
        let peer: IpAddr = "203.0.113.9".parse().unwrap();
        let got = resolver.resolve(peer, &headers(&[("x-forwarded-for", "198.51.100.1")]));
        assert_eq!(got, peer);
    }

    #[test]
    fn trusted_peer_follows_precedence() {
        let resolver = ClientIpResolver::new(&["10.0.0.0/8".to_string()], false);
        let peer: IpAddr = "10.1.2.3".parse().unwrap();

        let got = resolver.resolve(
            peer,
            &headers(&[
                ("x-forwarded-for", "198.51.100.1, 10.1.2.3"),
                ("cf-connecting-ip", "192.0.2.77"),
            ]),
        );
        assert_eq!(got, "192.0.2.77".parse::<IpAddr>().unwrap());

        let got = resolver.resolve(
            peer,
            &headers(&[("x-forwarded-for", "198.51.100.1, 10.1.2.3")]),
        );
        assert_eq!(got, "198.51.100.1".parse::<IpAddr>().unwrap());

        let got = resolver.resolve(peer, &headers(&[("x-real-ip", "198.51.100.7")]));
        assert_eq!(got, "198.51.100.7".parse::<IpAddr>().unwrap());

        // No headers at all → socket peer.
        assert_eq!(resolver.resolve(peer, &HeaderMap::new()), peer);
    }

    #[test]
    fn cloudflare_ranges_optional() {
        let off = ClientIpResolver::new(&[], false);
        let on = ClientIpResolver::new(&[], true);
        let cf_peer: IpAddr = "104.16.0.1".parse().unwrap();
        let hdrs = headers(&[("cf-connecting-ip", "192.0.2.1")]);

        assert_eq!(off.resolve(cf_peer, &hdrs), cf_peer);
        assert_eq!(on.resolve(cf_peer, &hdrs), "192.0.2.1".parse::<IpAddr>().unwrap());
    }
}
