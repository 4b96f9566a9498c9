//! Mock responder stage (spec.md §4.6 "Mock responder").
//!
//! A priority-sorted list of rules; the first whose condition facets all
//! match the request short-circuits the chain with a canned response
//! instead of reaching the reverse proxy.

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::route::FieldMatchType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockPathMatchType {
    Exact,
    Prefix,
    Regex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockFieldCondition {
    pub name: String,
    pub match_type: FieldMatchType,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockCondition {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub path: Option<(MockPathMatchType, String)>,
    #[serde(default)]
    pub headers: Vec<MockFieldCondition>,
    #[serde(default)]
    pub query: Vec<MockFieldCondition>,
    /// Exact string match against the raw request body, if present
    /// (spec.md §9 Open Questions: string-equal only).
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockResponseSpec {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockRule {
    pub id: String,
    #[serde(default)]
    pub priority: i64,
    pub condition: MockCondition,
    pub response: MockResponseSpec,
}

/// A request view the mock responder evaluates against, mirroring
/// [`crate::matcher::MatchRequest`] plus the raw body the matcher never
/// needs.
pub struct MockRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub host: &'a str,
    pub query: Vec<(&'a str, &'a str)>,
    pub headers: Vec<(&'a str, &'a str)>,
    pub body: &'a [u8],
}

fn field_matches(condition: &MockFieldCondition, pairs: &[(&str, &str)]) -> bool {
    let value = pairs.iter().find(|(n, _)| n.eq_ignore_ascii_case(&condition.name)).map(|(_, v)| *v);
    match condition.match_type {
        FieldMatchType::Exists => value.is_some(),
        FieldMatchType::NotExists => value.is_none(),
        FieldMatchType::Value => value.is_some_and(|v| v == condition.value),
        FieldMatchType::Regex => value.is_some_and(|v| Regex::new(&condition.value).is_ok_and(|re| re.is_match(v))),
    }
}

impl MockCondition {
    fn matches(&self, req: &MockRequest<'_>) -> bool {
        if !self.methods.is_empty() && !self.methods.iter().any(|m| m.eq_ignore_ascii_case(req.method)) {
            return false;
        }

        if let Some((match_type, value)) = &self.path {
            let path_ok = match match_type {
                MockPathMatchType::Exact => req.path == value,
                MockPathMatchType::Prefix => req.path.starts_with(value.as_str()),
                MockPathMatchType::Regex => Regex::new(value).is_ok_and(|re| re.is_match(req.path)),
            };
            if !path_ok {
                return false;
            }
        }

        if !self.headers.iter().all(|c| field_matches(c, &req.headers)) {
            return false;
        }
        if !self.query.iter().all(|c| field_matches(c, &req.query)) {
            return false;
        }

        if let Some(expected) = &self.body {
            if req.body != expected.as_bytes() {
                return false;
            }
        }

        true
    }
}

/// A ready-to-send mock response, with placeholders already expanded.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub delay_ms: u64,
}

fn header_for<'a>(headers: &[(&'a str, &'a str)], name: &str) -> &'a str {
    headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| *v).unwrap_or("")
}

fn query_for<'a>(query: &[(&'a str, &'a str)], name: &str) -> &'a str {
    query.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| *v).unwrap_or("")
}

/// Expands `${timestamp}`, `${method}`, `${path}`, `${host}`, `${query}`,
/// `${header:NAME}`, `${query:NAME}` in a mock response body (spec.md
/// §4.6 "body placeholders ... are expanded").
fn expand_placeholders(template: &str, req: &MockRequest<'_>) -> String {
    let query_string = req.query.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&");
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let token = &after[..end];
        let replacement = if token == "timestamp" {
            Utc::now().to_rfc3339()
        } else if token == "method" {
            req.method.to_string()
        } else if token == "path" {
            req.path.to_string()
        } else if token == "host" {
            req.host.to_string()
        } else if token == "query" {
            query_string.clone()
        } else if let Some(name) = token.strip_prefix("header:") {
            header_for(&req.headers, name).to_string()
        } else if let Some(name) = token.strip_prefix("query:") {
            query_for(&req.query, name).to_string()
        } else {
            format!("${{{token}}}")
        };
        out.push_str(&replacement);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Priority-sorted rule set evaluated in order; the first match wins.
pub struct MockResponder {
    rules: Vec<MockRule>,
}

impl MockResponder {
    pub fn new(mut rules: Vec<MockRule>) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn respond(&self, req: &MockRequest<'_>) -> Option<MockResponse> {
        let rule = self.rules.iter().find(|r| r.condition.matches(req))?;
        Some(MockResponse {
            status: rule.response.status,
            headers: rule.response.headers.clone(),
            body: expand_placeholders(&rule.response.body, req),
            delay_ms: rule.response.delay_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, priority: i64, path: &str, status: u16, body: &str) -> MockRule {
        MockRule {
            id: id.to_string(),
            priority,
            condition: MockCondition {
                path: Some((MockPathMatchType::Prefix, path.to_string())),
                ..Default::default()
            },
            response: MockResponseSpec { status, headers: vec![], body: body.to_string(), delay_ms: 0 },
        }
    }

    #[test]
    fn higher_priority_rule_wins_when_both_match() {
        let responder = MockResponder::new(vec![rule("low", 1, "/api", 200, "low"), rule("high", 10, "/api", 201, "high")]);
        let req = MockRequest { method: "GET", path: "/api/x", host: "h", query: vec![], headers: vec![], body: b"" };
        let resp = responder.respond(&req).unwrap();
        assert_eq!(resp.status, 201);
        assert_eq!(resp.body, "high");
    }

    #[test]
    fn no_match_returns_none() {
        let responder = MockResponder::new(vec![rule("r1", 0, "/api", 200, "ok")]);
        let req = MockRequest { method: "GET", path: "/other", host: "h", query: vec![], headers: vec![], body: b"" };
        assert!(responder.respond(&req).is_none());
    }

    #[test]
    fn placeholders_are_expanded() {
        let mut r = rule("r1", 0, "/api", 200, "method=${method} path=${path} h=${header:X-Id}");
        r.response.body = "method=${method} path=${path} h=${header:X-Id}".to_string();
        let responder = MockResponder::new(vec![r]);
        let req = MockRequest {
            method: "POST",
            path: "/api/widgets",
            host: "h",
            query: vec![],
            headers: vec![("X-Id", "42")],
            body: b"",
        };
        let resp = responder.respond(&req).unwrap();
        assert_eq!(resp.body, "method=POST path=/api/widgets h=42");
    }

    #[test]
    fn body_exact_match_condition() {
        let mut r = rule("r1", 0, "/api", 200, "ok");
        r.condition.body = Some("hello".to_string());
        let responder = MockResponder::new(vec![r]);

        let matching = MockRequest { method: "GET", path: "/api", host: "h", query: vec![], headers: vec![], body: b"hello" };
        assert!(responder.respond(&matching).is_some());

        let not_matching = MockRequest { method: "GET", path: "/api", host: "h", query: vec![], headers: vec![], body: b"nope" };
        assert!(responder.respond(&not_matching).is_none());
    }
}
