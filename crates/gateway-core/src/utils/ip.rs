//! Client IP extraction (spec.md §4.2 "IP-hash"): `X-Real-IP` →
//! first entry of `X-Forwarded-For` → transport peer address.

/// Extracts the client IP following the documented precedence. `headers`
/// is an HTTP request's header map as (name, value) pairs; `peer_addr`
/// is the transport-level address (may include a port, which is
/// stripped).
pub fn extract_client_ip<'a>(headers: &[(&str, &'a str)], peer_addr: Option<&'a str>) -> Option<String> {
    if let Some((_, v)) = headers.iter().find(|(n, _)| n.eq_ignore_ascii_case("x-real-ip")) {
        return Some(v.trim().to_string());
    }
    if let Some((_, v)) = headers.iter().find(|(n, _)| n.eq_ignore_ascii_case("x-forwarded-for")) {
        if let Some(first) = v.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    peer_addr.map(strip_port)
}

fn strip_port(addr: &str) -> String {
    if let Some(rest) = addr.strip_prefix('[') {
        // IPv6 literal: "[::1]:8080"
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => addr.to_string(),
    }
}
