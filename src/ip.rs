//! Hardened client IP extraction.
//!
//! Order of trust: the socket peer address, then the first entry of
//! `X-Forwarded-For`, then `X-Real-IP`. Every candidate must parse as a real
//! IPv4/IPv6 address; IPv6 zone identifiers and over-long strings are
//! rejected so header garbage can never become a rate-limit key.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use tracing::debug;

// Longest textual IPv6 form is 39 chars; leave a little slack.
const MAX_IP_LEN: usize = 45;

pub fn client_ip(peer: Option<SocketAddr>, headers: &HeaderMap) -> Option<String> {
    if let Some(addr) = peer {
        if let Some(ip) = validate_ip(&addr.ip().to_string()) {
            return Some(ip);
        }
    }

    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            if let Some(ip) = validate_ip(first) {
                return Some(ip);
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if let Some(ip) = validate_ip(real_ip) {
            return Some(ip);
        }
    }

    debug!("unable to extract a valid client IP address");
    None
}

fn validate_ip(candidate: &str) -> Option<String> {
    let candidate = candidate.trim();
    if candidate.is_empty() || candidate.len() > MAX_IP_LEN || candidate.contains('%') {
        return None;
    }
    candidate.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}
