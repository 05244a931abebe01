//! UDP endpoint parsing and rendering (§3 "Address").
//!
//! The original engine hand-rolls a `sockaddr`-sized byte buffer with
//! manual family/port accessors. `std::net::SocketAddr` already is that
//! type, safely: this module is a thin parse/render layer around it so
//! the rest of the crate never has to think about address families
//! directly (§9 "Data-source polymorphism" sibling note applies equally
//! here — prefer the native type over re-deriving a byte layout).

use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::{Result, TftpError};

const DEFAULT_PORT: u16 = 69;

/// Parses `v4[:port]`, `[v6]:port`, or bare `v6` (port defaults to 69).
pub fn parse_endpoint(s: &str) -> Result<SocketAddr> {
    let s = s.trim();

    // Already carries an explicit port in bracket-or-plain form.
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }

    // Bracketed IPv6 without a port: "[::1]"
    if let Some(inner) = s.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        if let Ok(ip) = inner.parse::<std::net::Ipv6Addr>() {
            return Ok(SocketAddr::new(ip.into(), DEFAULT_PORT));
        }
    }

    // Bare IPv6 without brackets or port: "::1"
    if let Ok(ip) = s.parse::<std::net::Ipv6Addr>() {
        return Ok(SocketAddr::new(ip.into(), DEFAULT_PORT));
    }

    // Bare IPv4 without a port: "192.0.2.1"
    if let Ok(ip) = s.parse::<std::net::Ipv4Addr>() {
        return Ok(SocketAddr::new(ip.into(), DEFAULT_PORT));
    }

    // Last resort: a resolvable host:port form via the system resolver.
    if let Ok(mut addrs) = format!("{s}:0").to_socket_addrs()
        && s.contains(':')
        && let Some(addr) = addrs.next()
    {
        return Ok(addr);
    }

    Err(TftpError::Tftp(format!(
        "could not parse endpoint address '{s}'"
    )))
}

/// Canonical string form, used for §8 property 8's round-trip test.
pub fn render_endpoint(addr: &SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => format!("{}:{}", v4.ip(), v4.port()),
        SocketAddr::V6(v6) => format!("[{}]:{}", v6.ip(), v6.port()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4_with_port() {
        let a = parse_endpoint("192.0.2.1:6969").unwrap();
        assert_eq!(a.port(), 6969);
        assert!(a.is_ipv4());
    }

    #[test]
    fn parses_v4_without_port_defaults_to_69() {
        let a = parse_endpoint("192.0.2.1").unwrap();
        assert_eq!(a.port(), 69);
    }

    #[test]
    fn parses_bracketed_v6_with_port() {
        let a = parse_endpoint("[fe80::1]:80").unwrap();
        assert_eq!(a.port(), 80);
        assert!(a.is_ipv6());
    }

    #[test]
    fn parses_bare_v6_without_port() {
        let a = parse_endpoint("fe80::1").unwrap();
        assert_eq!(a.port(), 69);
    }

    #[test]
    fn render_round_trips_v4() {
        let a = parse_endpoint("203.0.113.5:6969").unwrap();
        assert_eq!(render_endpoint(&a), "203.0.113.5:6969");
    }

    #[test]
    fn render_round_trips_v6() {
        let a = parse_endpoint("[2001:db8::1]:443").unwrap();
        assert_eq!(render_endpoint(&a), "[2001:db8::1]:443");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_endpoint("not an address").is_err());
    }
}
