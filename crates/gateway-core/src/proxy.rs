//! Reverse proxy stage (spec.md §4.6 point 6; §6 "Outbound").
//!
//! Rewrites the outbound URL to `scheme://target.host:target.port/path?query`,
//! strips hop-by-hop headers, appends `X-Forwarded-*`, streams the
//! upstream's response back verbatim and reports the outcome to the
//! passive health checker. Grounded in the header-filtering/forwarding
//! shape of the teacher's `RouteHandler::handle_request_internal`.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use reqwest::header::{HeaderMap as ReqwestHeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use thiserror::Error;

use crate::health::passive::{Outcome, PassiveHealthChecker};
use crate::models::upstream::Target;
use crate::utils::path::build_upstream_url;

const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "proxy-authenticate", "proxy-authorization", "te", "trailer", "transfer-encoding", "upgrade", "host"];

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("upstream request timed out")]
    Timeout,
    #[error("upstream request failed: {0}")]
    Connection(String),
}

/// The response the proxy received from the upstream, ready to be
/// written back to the client verbatim.
pub struct ProxiedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Stateless forwarder: one `Client` shared by every request. Reports
/// every outcome to a [`PassiveHealthChecker`] so target isolation
/// reacts to live traffic, not just the active prober.
pub struct ReverseProxy {
    client: Client,
    passive_checker: Arc<PassiveHealthChecker>,
    request_timeout: Duration,
}

impl ReverseProxy {
    pub fn new(client: Client, passive_checker: Arc<PassiveHealthChecker>, request_timeout: Duration) -> Self {
        Self { client, passive_checker, request_timeout }
    }

    /// Forwards one request to `target` and reports the outcome to the
    /// passive checker before returning.
    pub async fn forward(
        &self,
        upstream_id: &str,
        target: &Target,
        scheme: &str,
        method: &str,
        path: &str,
        query: &str,
        mut headers: Vec<(String, String)>,
        body: Vec<u8>,
        client_ip: Option<&str>,
        forwarded_proto: &str,
        forwarded_host: &str,
    ) -> Result<ProxiedResponse, ProxyError> {
        let url = build_upstream_url(scheme, &target.host, target.port, path, query);
        let reqwest_method = Method::from_bytes(method.as_bytes()).unwrap_or(Method::GET);

        append_forwarded_for(&mut headers, client_ip);
        set_or_append(&mut headers, "X-Forwarded-Proto", forwarded_proto);
        set_or_append(&mut headers, "X-Forwarded-Host", forwarded_host);

        let outbound_headers = build_outbound_headers(&headers);

        debug!("forwarding {method} {path} -> {url}");

        let send_result = tokio::time::timeout(
            self.request_timeout,
            self.client.request(reqwest_method, &url).headers(outbound_headers).body(body).send(),
        )
        .await;

        let target_key = target.key();

        match send_result {
            Err(_) => {
                self.passive_checker.report(upstream_id, &target_key, Outcome::timeout()).await;
                Err(ProxyError::Timeout)
            }
            Ok(Err(e)) => {
                warn!("upstream {url} connection error: {e}");
                self.passive_checker.report(upstream_id, &target_key, Outcome::connection_error()).await;
                Err(ProxyError::Connection(e.to_string()))
            }
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                self.passive_checker.report(upstream_id, &target_key, Outcome::success(status)).await;

                let response_headers = response
                    .headers()
                    .iter()
                    .filter(|(name, _)| !HOP_BY_HOP.iter().any(|h| name.as_str().eq_ignore_ascii_case(h)))
                    .map(|(name, value)| (name.to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
                    .collect();

                let body = response.bytes().await.map_err(|e| ProxyError::Connection(e.to_string()))?.to_vec();

                Ok(ProxiedResponse { status, headers: response_headers, body })
            }
        }
    }
}

fn append_forwarded_for(headers: &mut Vec<(String, String)>, client_ip: Option<&str>) {
    let Some(ip) = client_ip else { return };
    if let Some(existing) = headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case("x-forwarded-for")) {
        existing.1 = format!("{}, {}", existing.1, ip);
    } else {
        headers.push(("X-Forwarded-For".to_string(), ip.to_string()));
    }
}

fn set_or_append(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    if let Some(existing) = headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
        existing.1 = value.to_string();
    } else {
        headers.push((name.to_string(), value.to_string()));
    }
}

fn build_outbound_headers(headers: &[(String, String)]) -> ReqwestHeaderMap {
    let mut out = ReqwestHeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        let (Ok(header_name), Ok(header_value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) else {
            continue;
        };
        out.insert(header_name, header_value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_for_appends_to_existing_value() {
        let mut headers = vec![("X-Forwarded-For".to_string(), "1.1.1.1".to_string())];
        append_forwarded_for(&mut headers, Some("2.2.2.2"));
        assert_eq!(headers[0].1, "1.1.1.1, 2.2.2.2");
    }

    #[test]
    fn forwarded_for_creates_header_when_absent() {
        let mut headers = vec![];
        append_forwarded_for(&mut headers, Some("2.2.2.2"));
        assert_eq!(headers[0], ("X-Forwarded-For".to_string(), "2.2.2.2".to_string()));
    }

    #[test]
    fn outbound_headers_strip_hop_by_hop() {
        let headers = vec![
            ("Connection".to_string(), "keep-alive".to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];
        let built = build_outbound_headers(&headers);
        assert!(built.get("connection").is_none());
        assert!(built.get("content-type").is_some());
    }
}
