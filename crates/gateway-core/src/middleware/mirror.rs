//! Traffic mirror stage (spec.md §4.6 "Traffic mirror").
//!
//! After the main request completes, an asynchronous copy is dispatched
//! to each enabled, admitting mirror target. Mirror latency and failure
//! never affect the client-facing response — every dispatch runs on its
//! own detached task.

use chrono::Utc;
use log::{debug, warn};
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "proxy-authenticate", "proxy-authorization", "te", "trailer", "transfer-encoding", "upgrade", "host"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorTarget {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub url: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub path_prefix: Option<String>,
    /// Fraction in `[0.0, 1.0]` of admitted requests actually mirrored.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

fn default_enabled() -> bool {
    true
}
fn default_sample_rate() -> f64 {
    1.0
}

impl MirrorTarget {
    fn admits(&self, method: &str, path: &str) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.methods.is_empty() && !self.methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
            return false;
        }
        if let Some(prefix) = &self.path_prefix {
            if !path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }

    fn selected_by_sample(&self) -> bool {
        if self.sample_rate >= 1.0 {
            return true;
        }
        if self.sample_rate <= 0.0 {
            return false;
        }
        rand::thread_rng().gen_bool(self.sample_rate)
    }
}

/// Dispatches fire-and-forget copies of admitted requests to every
/// configured mirror target.
#[derive(Clone)]
pub struct MirrorDispatcher {
    client: Client,
    targets: Vec<MirrorTarget>,
    source: String,
}

impl MirrorDispatcher {
    pub fn new(client: Client, targets: Vec<MirrorTarget>, source: impl Into<String>) -> Self {
        Self { client, targets, source: source.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Spawns a detached task per admitting target; returns immediately.
    /// `body` must be a fresh, independent copy of the request body
    /// (spec.md §4.6 "a fresh body reader") since each dispatch reads it
    /// on its own task.
    pub fn mirror(&self, method: &str, path: &str, headers: Vec<(String, String)>, body: bytes::Bytes) {
        for target in &self.targets {
            if !target.admits(method, path) || !target.selected_by_sample() {
                continue;
            }

            let client = self.client.clone();
            let target = target.clone();
            let method = method.to_string();
            let path = path.to_string();
            let headers = headers.clone();
            let body = body.clone();
            let source = self.source.clone();

            tokio::spawn(async move {
                let reqwest_method = reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET);
                let mut builder = client.request(reqwest_method, format!("{}{}", target.url, path));

                for (name, value) in &headers {
                    if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                        continue;
                    }
                    builder = builder.header(name, value);
                }

                builder = builder
                    .header("X-Mirror-Source", source)
                    .header("X-Mirror-Target", target.id.clone())
                    .header("X-Mirror-Timestamp", Utc::now().to_rfc3339())
                    .body(body);

                match builder.send().await {
                    Ok(resp) => debug!("mirror {} -> {} status={}", target.id, target.url, resp.status()),
                    Err(e) => warn!("mirror {} -> {} failed: {e}", target.id, target.url),
                }
            });
        }
    }
}
