//! Route matcher (spec.md §4.1).
//!
//! Evaluates an incoming request against a priority-ordered, pre-compiled
//! rule set and returns the winning route, or none. Generalizes the
//! teacher's path-only `RouteMatcher` (`utils::route_matcher`) to the
//! full host + path + method + header + query rule shape, while keeping
//! its two core design choices: regexes compiled once at snapshot-build
//! time and shared via `Arc`, and a deterministic, documented tie-break
//! order.

use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use crate::models::route::{FieldMatch, FieldMatchType, PathMatchType, Route};

/// Errors that can occur while compiling a rule set into a matcher.
/// Compilation failure for any one rule fails the whole install
/// (spec.md §4.1 "Compilation failure ... causes the whole install to
/// fail without disturbing the previous snapshot") — the caller is
/// expected to keep serving the old [`RouteMatcher`] on `Err`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouteMatchError {
    #[error("route {id}: invalid host pattern {pattern:?}")]
    InvalidHostPattern { id: String, pattern: String },

    #[error("regex compilation failed: {0}")]
    RegexError(String),
}

#[derive(Debug, Clone)]
enum CompiledHost {
    Exact(String),
    /// `*.suffix` — matches exactly one additional label, never the apex.
    WildcardSuffix(String),
}

impl CompiledHost {
    /// A pattern is invalid if it's empty, contains whitespace, or uses
    /// `*` anywhere other than as the single leading `*.` wildcard label
    /// (spec.md §4.1 "Compilation failure ... fails the whole install").
    fn compile(id: &str, pattern: &str) -> Result<Self, RouteMatchError> {
        let invalid = || RouteMatchError::InvalidHostPattern { id: id.to_string(), pattern: pattern.to_string() };

        if pattern.is_empty() || pattern.chars().any(char::is_whitespace) {
            return Err(invalid());
        }

        match pattern.strip_prefix("*.") {
            Some(suffix) => {
                if suffix.is_empty() || suffix.contains('*') {
                    return Err(invalid());
                }
                Ok(CompiledHost::WildcardSuffix(suffix.to_lowercase()))
            }
            None => {
                if pattern.contains('*') {
                    return Err(invalid());
                }
                Ok(CompiledHost::Exact(pattern.to_lowercase()))
            }
        }
    }

    fn matches(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        match self {
            CompiledHost::Exact(h) => *h == host,
            CompiledHost::WildcardSuffix(suffix) => {
                match host.strip_suffix(suffix.as_str()) {
                    Some(prefix) => {
                        // must consume exactly one label: "<label>." + suffix,
                        // and must not be the bare suffix (the apex).
                        prefix.ends_with('.')
                            && prefix.len() > 1
                            && !prefix[..prefix.len() - 1].contains('.')
                    }
                    None => false,
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
enum CompiledPath {
    Exact(String),
    Prefix(String),
    Regex(Arc<Regex>),
}

impl CompiledPath {
    /// Returns the matched path pattern's source string on success, for
    /// the `matchedPathPattern` field of the match contract.
    fn matches<'a>(&self, path: &'a str, source: &'a str) -> Option<&'a str> {
        let hit = match self {
            CompiledPath::Exact(p) => path == p,
            CompiledPath::Prefix(p) => path.starts_with(p.as_str()),
            CompiledPath::Regex(re) => re.is_match(path),
        };
        hit.then_some(source)
    }
}

#[derive(Debug, Clone)]
struct CompiledField {
    name: String,
    match_type: FieldMatchType,
    value: String,
    regex: Option<Arc<Regex>>,
}

impl CompiledField {
    fn compile(field: &FieldMatch) -> Result<Self, regex::Error> {
        let regex = if field.match_type == FieldMatchType::Regex {
            Some(Arc::new(Regex::new(&field.value)?))
        } else {
            None
        };
        Ok(Self {
            name: field.name.clone(),
            match_type: field.match_type,
            value: field.value.clone(),
            regex,
        })
    }

    /// `values` are every value present for this field's name (headers
    /// and query params may repeat).
    fn matches(&self, values: &[&str]) -> bool {
        match self.match_type {
            FieldMatchType::Exists => !values.is_empty(),
            FieldMatchType::NotExists => values.is_empty(),
            FieldMatchType::Value => values.iter().any(|v| *v == self.value),
            FieldMatchType::Regex => {
                let re = self.regex.as_ref().expect("regex field compiled without regex");
                values.iter().any(|v| re.is_match(v))
            }
        }
    }
}

/// A request-facing view the matcher evaluates against. Built by the
/// caller (the middleware chain's entry point) from the inbound HTTP
/// request so that the matcher itself stays free of any HTTP-framework
/// dependency.
#[derive(Debug, Default)]
pub struct MatchRequest<'a> {
    pub host: &'a str,
    pub path: &'a str,
    pub method: &'a str,
    /// (name, value) pairs; a name may repeat.
    pub headers: Vec<(&'a str, &'a str)>,
    pub query: Vec<(&'a str, &'a str)>,
}

impl<'a> MatchRequest<'a> {
    fn values_for(pairs: &[(&'a str, &'a str)], name: &str) -> Vec<&'a str> {
        pairs
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
            .collect()
    }
}

/// The outcome of a successful match (spec.md §4.1 contract).
#[derive(Debug, Clone)]
pub struct Matched {
    pub route: Arc<Route>,
    pub matched_path_pattern: String,
}

#[derive(Debug)]
struct CompiledRule {
    hosts: Vec<CompiledHost>,
    paths: Vec<CompiledPath>,
    path_sources: Vec<String>,
    methods: Vec<String>,
    headers: Vec<CompiledField>,
    query: Vec<CompiledField>,
}

#[derive(Debug)]
struct CompiledRoute {
    route: Arc<Route>,
    rule: CompiledRule,
}

impl CompiledRoute {
    fn compile(route: Route) -> Result<Self, RouteMatchError> {
        let id = route.id.clone();
        let hosts = route
            .rule
            .hosts
            .iter()
            .map(|h| CompiledHost::compile(&id, h))
            .collect::<Result<Vec<_>, _>>()?;

        let mut paths = Vec::with_capacity(route.rule.paths.len());
        let mut path_sources = Vec::with_capacity(route.rule.paths.len());
        for p in &route.rule.paths {
            let compiled = match p.match_type {
                PathMatchType::Exact => CompiledPath::Exact(p.value.clone()),
                PathMatchType::Prefix => CompiledPath::Prefix(p.value.clone()),
                PathMatchType::Regex => {
                    let re = Regex::new(&p.value).map_err(|e| RouteMatchError::RegexError(e.to_string()))?;
                    CompiledPath::Regex(Arc::new(re))
                }
            };
            paths.push(compiled);
            path_sources.push(p.value.clone());
        }

        let headers = route
            .rule
            .headers
            .iter()
            .map(CompiledField::compile)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RouteMatchError::RegexError(e.to_string()))?;
        let query = route
            .rule
            .query
            .iter()
            .map(CompiledField::compile)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RouteMatchError::RegexError(e.to_string()))?;

        let methods = route
            .rule
            .methods
            .iter()
            .map(|m| m.to_uppercase())
            .collect();

        Ok(CompiledRoute {
            route: Arc::new(route),
            rule: CompiledRule {
                hosts,
                paths,
                path_sources,
                methods,
                headers,
                query,
            },
        })
    }

    fn matches<'a>(&self, req: &MatchRequest<'a>) -> Option<String> {
        if !self.rule.hosts.is_empty() {
            let host = req.host.split(':').next().unwrap_or(req.host);
            if !self.rule.hosts.iter().any(|h| h.matches(host)) {
                return None;
            }
        }

        let matched_path = if self.rule.paths.is_empty() {
            req.path.to_string()
        } else {
            let mut hit = None;
            for (compiled, source) in self.rule.paths.iter().zip(self.rule.path_sources.iter()) {
                if let Some(m) = compiled.matches(req.path, source) {
                    hit = Some(m.to_string());
                    break;
                }
            }
            hit?
        };

        if !self.rule.methods.is_empty() && !self.rule.methods.iter().any(|m| m == req.method) {
            return None;
        }

        for field in &self.rule.headers {
            let values = MatchRequest::values_for(&req.headers, &field.name);
            if !field.matches(&values) {
                return None;
            }
        }
        for field in &self.rule.query {
            let values = MatchRequest::values_for(&req.query, &field.name);
            if !field.matches(&values) {
                return None;
            }
        }

        Some(matched_path)
    }
}

/// Priority-ordered, pre-compiled rule set (spec.md GLOSSARY "Snapshot").
///
/// Routes are sorted once at construction time by descending priority,
/// with ties broken by original (insertion) order — Rust's `sort_by` is
/// stable, so this requires no explicit index bookkeeping.
#[derive(Debug)]
pub struct RouteMatcher {
    routes: Vec<CompiledRoute>,
}

impl RouteMatcher {
    pub fn new(routes: Vec<Route>) -> Result<Self, RouteMatchError> {
        let mut compiled = routes
            .into_iter()
            .map(CompiledRoute::compile)
            .collect::<Result<Vec<_>, _>>()?;
        compiled.sort_by(|a, b| b.route.priority.cmp(&a.route.priority));
        Ok(Self { routes: compiled })
    }

    /// Evaluates `req` against every rule in priority order, returning
    /// the first match. Never fails (spec.md §4.1 "Match never fails; it
    /// either matches or does not").
    pub fn find_match(&self, req: &MatchRequest<'_>) -> Option<Matched> {
        for candidate in &self.routes {
            if let Some(matched_path_pattern) = candidate.matches(req) {
                return Some(Matched {
                    route: candidate.route.clone(),
                    matched_path_pattern,
                });
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::route::{FieldMatch, FieldMatchType, PathMatch, PathMatchType, Rule};
    use chrono::Utc;

    fn route(id: &str, priority: i64, rule: Rule) -> Route {
        Route {
            id: id.to_string(),
            name: id.to_string(),
            priority,
            upstream_id: format!("{id}-upstream"),
            metadata: Default::default(),
            rule,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn priority_wins_over_lower_priority_broader_match() {
        let r1 = route(
            "r1",
            100,
            Rule {
                paths: vec![PathMatch { match_type: PathMatchType::Prefix, value: "/api".into() }],
                ..Default::default()
            },
        );
        let r2 = route(
            "r2",
            50,
            Rule {
                paths: vec![PathMatch { match_type: PathMatchType::Prefix, value: "/".into() }],
                ..Default::default()
            },
        );
        let matcher = RouteMatcher::new(vec![r1, r2]).unwrap();

        let req = MatchRequest { host: "", path: "/api/v1/users", method: "GET", headers: vec![], query: vec![] };
        assert_eq!(matcher.find_match(&req).unwrap().route.id, "r1");

        let req = MatchRequest { host: "", path: "/status", method: "GET", headers: vec![], query: vec![] };
        assert_eq!(matcher.find_match(&req).unwrap().route.id, "r2");
    }

    #[test]
    fn ties_broken_by_insertion_order() {
        let a = route("a", 10, Rule { paths: vec![PathMatch { match_type: PathMatchType::Prefix, value: "/".into() }], ..Default::default() });
        let b = route("b", 10, Rule { paths: vec![PathMatch { match_type: PathMatchType::Prefix, value: "/".into() }], ..Default::default() });
        let matcher = RouteMatcher::new(vec![a, b]).unwrap();
        let req = MatchRequest { host: "", path: "/anything", method: "GET", headers: vec![], query: vec![] };
        assert_eq!(matcher.find_match(&req).unwrap().route.id, "a");
    }

    #[test]
    fn wildcard_host_matches_one_label_not_apex_or_two_labels() {
        let r = route(
            "wild",
            1,
            Rule { hosts: vec!["*.example.com".into()], ..Default::default() },
        );
        let matcher = RouteMatcher::new(vec![r]).unwrap();

        let hit = MatchRequest { host: "a.example.com", path: "/", method: "GET", headers: vec![], query: vec![] };
        assert!(matcher.find_match(&hit).is_some());

        let apex = MatchRequest { host: "example.com", path: "/", method: "GET", headers: vec![], query: vec![] };
        assert!(matcher.find_match(&apex).is_none());

        let two_labels = MatchRequest { host: "a.b.example.com", path: "/", method: "GET", headers: vec![], query: vec![] };
        assert!(matcher.find_match(&two_labels).is_none());
    }

    #[test]
    fn determinism_repeated_match_same_route() {
        let r = route("r", 1, Rule { paths: vec![PathMatch { match_type: PathMatchType::Exact, value: "/health".into() }], ..Default::default() });
        let matcher = RouteMatcher::new(vec![r]).unwrap();
        let req = MatchRequest { host: "", path: "/health", method: "GET", headers: vec![], query: vec![] };
        let first = matcher.find_match(&req).unwrap().route.id.clone();
        for _ in 0..20 {
            assert_eq!(matcher.find_match(&req).unwrap().route.id, first);
        }
    }

    #[test]
    fn empty_facets_match_anything() {
        let r = route("any", 1, Rule::default());
        let matcher = RouteMatcher::new(vec![r]).unwrap();
        let req = MatchRequest { host: "whatever.test", path: "/x/y/z", method: "DELETE", headers: vec![], query: vec![] };
        assert!(matcher.find_match(&req).is_some());
    }

    #[test]
    fn invalid_host_pattern_fails_compilation() {
        let r = route("bad-host", 1, Rule { hosts: vec!["a.*.example.com".into()], ..Default::default() });
        let err = RouteMatcher::new(vec![r]).unwrap_err();
        assert_eq!(err, RouteMatchError::InvalidHostPattern { id: "bad-host".into(), pattern: "a.*.example.com".into() });
    }

    #[test]
    fn header_exists_and_value_constraints() {
        let r = route(
            "h",
            1,
            Rule {
                headers: vec![FieldMatch { name: "x-api-key".into(), match_type: FieldMatchType::Exists, value: "".into() }],
                ..Default::default()
            },
        );
        let matcher = RouteMatcher::new(vec![r]).unwrap();
        let without = MatchRequest { host: "", path: "/", method: "GET", headers: vec![], query: vec![] };
        assert!(matcher.find_match(&without).is_none());
        let with = MatchRequest { host: "", path: "/", method: "GET", headers: vec![("x-api-key", "abc")], query: vec![] };
        assert!(matcher.find_match(&with).is_some());
    }
}
