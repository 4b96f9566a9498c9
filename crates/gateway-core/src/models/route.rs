//! Route and rule entities (spec.md §3 "Route").
//!
//! A route pairs a matching rule with the id of the upstream that should
//! serve matched requests. Rules are declared data; compiling them into
//! the regexes the matcher actually evaluates against happens in
//! [`crate::matcher`], not here — this module stays a pure data model so it
//! can round-trip through JSON/YAML without pulling in compiled state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::error::ModelError;

/// How a path constraint is evaluated against the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathMatchType {
    Exact,
    Prefix,
    Regex,
}

/// A single path constraint: `{type, value}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathMatch {
    #[serde(rename = "type")]
    pub match_type: PathMatchType,
    pub value: String,
}

/// How a header or query constraint is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldMatchType {
    Exists,
    NotExists,
    Value,
    Regex,
}

/// A header or query-parameter constraint: `{name, matchType, value}`.
/// `value` is ignored for `exists`/`not_exists`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMatch {
    pub name: String,
    #[serde(rename = "matchType")]
    pub match_type: FieldMatchType,
    #[serde(default)]
    pub value: String,
}

/// The matching rule attached to a route.
///
/// Every facet is independently optional in the sense that an empty
/// collection means "any" (spec.md §4.1, "An empty constraint set for a
/// facet means 'any'"). `hosts` entries of the shape `*.suffix` match
/// exactly one additional label and never the apex.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub paths: Vec<PathMatch>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub headers: Vec<FieldMatch>,
    #[serde(default)]
    pub query: Vec<FieldMatch>,
}

/// A route: identifier, priority, upstream pointer, rule and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub name: String,
    /// Higher priority wins; ties broken by insertion order (spec.md §4.1 "Ties").
    pub priority: i64,
    pub upstream_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub rule: Rule,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Route {
    /// Structural validation that does not require knowledge of the rest
    /// of the snapshot (no upstream-existence check — that is a
    /// whole-snapshot invariant, see [`crate::config::validation`]).
    pub fn validate(&self) -> Result<(), ModelError> {
        for path in &self.rule.paths {
            if path.match_type == PathMatchType::Regex {
                if let Err(e) = regex::Regex::new(&path.value) {
                    return Err(ModelError::InvalidPathPattern {
                        id: self.id.clone(),
                        pattern: path.value.clone(),
                        reason: e.to_string(),
                    });
                }
            } else if path.match_type == PathMatchType::Prefix || path.match_type == PathMatchType::Exact {
                if !path.value.starts_with('/') {
                    return Err(ModelError::InvalidPathPattern {
                        id: self.id.clone(),
                        pattern: path.value.clone(),
                        reason: "path patterns must start with '/'".to_string(),
                    });
                }
            }
        }

        for field in self.rule.headers.iter().chain(self.rule.query.iter()) {
            if field.match_type == FieldMatchType::Regex {
                if let Err(e) = regex::Regex::new(&field.value) {
                    return Err(ModelError::InvalidRegex {
                        id: self.id.clone(),
                        pattern: field.value.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// A route whose rule has no constraints at all matches every request;
    /// that is legal, but worth flagging to an operator (see
    /// [`crate::config::validation`]).
    pub fn is_unconstrained(&self) -> bool {
        self.rule.hosts.is_empty()
            && self.rule.paths.is_empty()
            && self.rule.methods.is_empty()
            && self.rule.headers.is_empty()
            && self.rule.query.is_empty()
    }
}
