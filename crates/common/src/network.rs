// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// Network utility functions

use std::net::{IpAddr, SocketAddr};

/// Check if a host address is a loopback address
/// Supports IPv4 (127.0.0.1, 127.x.x.x), IPv6 (::1), and hostname (localhost)
pub fn is_loopback_address(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }

    // Unparseable hosts are treated as non-loopback
    false
}

/// Resolve the client's source address: the first `X-Forwarded-For` entry
/// when present and parseable, else the socket peer.
pub fn client_ip(forwarded_for: Option<&str>, peer: SocketAddr) -> IpAddr {
    forwarded_for
        .and_then(|header| header.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok())
        .map(normalize_ip)
        .unwrap_or_else(|| normalize_ip(peer.ip()))
}

/// Map IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) to plain IPv4
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// `host:port`, bracketing IPv6 literals
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
