//! Authentication stage (spec.md §4.6 "Authentication").
//!
//! A pluggable set of authenticators is probed in declared order;
//! the first whose required credential is present on the request
//! decides the outcome. On success a [`Principal`] is attached to the
//! request context and propagated upstream via `X-User-*`,
//! `X-Consumer-*`, `X-Auth-Method` headers (spec.md §6 "Request
//! attributes the proxy sets outbound"). On failure the chain returns
//! `401` with a `WWW-Authenticate` challenge.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use jsonwebtoken::{decode, Algorithm as JwtAlgorithm, DecodingKey, Validation};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The authenticated identity attached to a request context on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub claims: HashMap<String, String>,
    /// The scheme name carried in `X-Auth-Method`.
    pub method: String,
}

impl Principal {
    /// Headers the proxy stage must add to the outbound request
    /// (spec.md §6).
    pub fn propagation_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("X-User-Id".to_string(), self.id.clone()),
            ("X-Auth-Method".to_string(), self.method.clone()),
        ];
        if let Some(name) = &self.name {
            headers.push(("X-User-Name".to_string(), name.clone()));
        }
        if !self.roles.is_empty() {
            headers.push(("X-User-Roles".to_string(), self.roles.join(",")));
        }
        if !self.groups.is_empty() {
            headers.push(("X-Consumer-Groups".to_string(), self.groups.join(",")));
        }
        headers
    }
}

#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("no configured authenticator found applicable credentials on the request")]
    NoCredentials,
    #[error("credential rejected: {0}")]
    Rejected(String),
}

/// A single pluggable authentication scheme. Implementations examine the
/// request for their own kind of credential and either decline (no
/// credential present — the chain tries the next authenticator) or
/// attempt validation.
pub trait Authenticator: Send + Sync {
    /// Scheme name surfaced in `X-Auth-Method` and the `WWW-Authenticate`
    /// challenge on failure.
    fn scheme(&self) -> &str;

    /// Returns `None` when this authenticator found no credential of its
    /// kind on the request (probe continues to the next authenticator);
    /// `Some(Err(_))` when a credential was present but invalid.
    fn authenticate(&self, headers: &[(&str, &str)], query: &[(&str, &str)]) -> Option<Result<Principal, AuthError>>;
}

fn header_value<'a>(headers: &[(&'a str, &'a str)], name: &str) -> Option<&'a str> {
    headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| *v)
}

fn query_value<'a>(query: &[(&'a str, &'a str)], name: &str) -> Option<&'a str> {
    query.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| *v)
}

/// Matches an API key against a fixed set of `{key -> principal id}`
/// entries, read from either a request header or a query parameter.
pub struct ApiKeyAuthenticator {
    header_name: String,
    query_name: String,
    keys: HashMap<String, String>,
}

impl ApiKeyAuthenticator {
    pub fn new(header_name: impl Into<String>, query_name: impl Into<String>, keys: HashMap<String, String>) -> Self {
        Self { header_name: header_name.into(), query_name: query_name.into(), keys }
    }
}

impl Authenticator for ApiKeyAuthenticator {
    fn scheme(&self) -> &str {
        "api_key"
    }

    fn authenticate(&self, headers: &[(&str, &str)], query: &[(&str, &str)]) -> Option<Result<Principal, AuthError>> {
        let key = header_value(headers, &self.header_name).or_else(|| query_value(query, &self.query_name))?;

        match self.keys.get(key) {
            Some(principal_id) => Some(Ok(Principal {
                id: principal_id.clone(),
                name: None,
                roles: Vec::new(),
                groups: Vec::new(),
                claims: HashMap::new(),
                method: self.scheme().to_string(),
            })),
            None => Some(Err(AuthError::Rejected("unknown api key".to_string()))),
        }
    }
}

/// HTTP Basic authentication (RFC 7617): decodes the base64 `user:pass`
/// pair carried in the `Authorization: Basic <credentials>` header and
/// checks it against a fixed set of known passwords.
pub struct BasicAuthAuthenticator {
    credentials: HashMap<String, String>,
}

impl BasicAuthAuthenticator {
    pub fn new(credentials: HashMap<String, String>) -> Self {
        Self { credentials }
    }
}

impl Authenticator for BasicAuthAuthenticator {
    fn scheme(&self) -> &str {
        "basic"
    }

    fn authenticate(&self, headers: &[(&str, &str)], _query: &[(&str, &str)]) -> Option<Result<Principal, AuthError>> {
        let auth_header = header_value(headers, "authorization")?;
        let encoded = auth_header.strip_prefix("Basic ").or_else(|| auth_header.strip_prefix("basic "))?;

        let decoded = match BASE64_STANDARD.decode(encoded) {
            Ok(bytes) => bytes,
            Err(_) => return Some(Err(AuthError::Rejected("credentials are not valid base64".to_string()))),
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return Some(Err(AuthError::Rejected("credentials are not valid utf-8".to_string())));
        };
        let Some((username, password)) = decoded.split_once(':') else {
            return Some(Err(AuthError::Rejected("malformed basic credentials".to_string())));
        };

        match self.credentials.get(username) {
            Some(expected) if expected == password => Some(Ok(Principal {
                id: username.to_string(),
                name: None,
                roles: Vec::new(),
                groups: Vec::new(),
                claims: HashMap::new(),
                method: self.scheme().to_string(),
            })),
            _ => Some(Err(AuthError::Rejected("invalid username or password".to_string()))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(flatten)]
    extra: HashMap<String, serde_json::Value>,
}

/// Bearer JWT authenticator. Holds a static decoding key today; a JWKS
/// url in [`crate::models::settings::JwtSettings`] is resolved by the
/// collaborator that constructs this authenticator and refreshed on
/// `jwks_refresh_secs` (SPEC_FULL.md §B), not by this type itself.
pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    algorithm: JwtAlgorithm,
    issuer: Option<String>,
    audience: Option<String>,
}

impl JwtAuthenticator {
    pub fn new(secret: &str, issuer: Option<String>, audience: Option<String>) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            algorithm: JwtAlgorithm::HS256,
            issuer,
            audience,
        }
    }

    pub fn from_decoding_key(decoding_key: DecodingKey, algorithm: JwtAlgorithm, issuer: Option<String>, audience: Option<String>) -> Self {
        Self { decoding_key, algorithm, issuer, audience }
    }
}

impl Authenticator for JwtAuthenticator {
    fn scheme(&self) -> &str {
        "bearer"
    }

    fn authenticate(&self, headers: &[(&str, &str)], _query: &[(&str, &str)]) -> Option<Result<Principal, AuthError>> {
        let auth_header = header_value(headers, "authorization")?;
        let token = auth_header.strip_prefix("Bearer ").or_else(|| auth_header.strip_prefix("bearer "))?;

        let mut validation = Validation::new(self.algorithm);
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &self.audience {
            validation.set_audience(&[audience]);
        }

        match decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(data) => {
                debug!("jwt authenticated sub={}", data.claims.sub);
                Some(Ok(Principal {
                    id: data.claims.sub,
                    name: data.claims.name,
                    roles: data.claims.roles,
                    groups: data.claims.groups,
                    claims: data
                        .claims
                        .extra
                        .into_iter()
                        .map(|(k, v)| (k, v.to_string()))
                        .collect(),
                    method: self.scheme().to_string(),
                }))
            }
            Err(e) => {
                warn!("jwt rejected: {e}");
                Some(Err(AuthError::Rejected(e.to_string())))
            }
        }
    }
}

/// OAuth2 token introspection (RFC 7662): the bearer token is opaque to
/// the gateway and validated against a remote introspection endpoint by
/// a caller-supplied closure, so this type stays decoupled from any one
/// HTTP client or authorization-server vendor.
pub struct IntrospectionAuthenticator<F>
where
    F: Fn(&str) -> Option<Principal> + Send + Sync,
{
    introspect: F,
}

impl<F> IntrospectionAuthenticator<F>
where
    F: Fn(&str) -> Option<Principal> + Send + Sync,
{
    pub fn new(introspect: F) -> Self {
        Self { introspect }
    }
}

impl<F> Authenticator for IntrospectionAuthenticator<F>
where
    F: Fn(&str) -> Option<Principal> + Send + Sync,
{
    fn scheme(&self) -> &str {
        "oauth2"
    }

    fn authenticate(&self, headers: &[(&str, &str)], _query: &[(&str, &str)]) -> Option<Result<Principal, AuthError>> {
        let auth_header = header_value(headers, "authorization")?;
        let token = auth_header.strip_prefix("Bearer ").or_else(|| auth_header.strip_prefix("bearer "))?;

        match (self.introspect)(token) {
            Some(mut principal) => {
                principal.method = self.scheme().to_string();
                Some(Ok(principal))
            }
            None => Some(Err(AuthError::Rejected("token introspection denied the token".to_string()))),
        }
    }
}

/// Probes a declared list of authenticators in order, returning the
/// first applicable result.
pub struct AuthChain {
    authenticators: Vec<Arc<dyn Authenticator>>,
}

impl AuthChain {
    pub fn new(authenticators: Vec<Arc<dyn Authenticator>>) -> Self {
        Self { authenticators }
    }

    pub fn is_empty(&self) -> bool {
        self.authenticators.is_empty()
    }

    /// Returns `Ok(principal)`, `Err(AuthError::Rejected(_))` when a
    /// credential was present but invalid, or `Err(AuthError::NoCredentials)`
    /// when no authenticator found anything to check.
    pub fn authenticate(&self, headers: &[(&str, &str)], query: &[(&str, &str)]) -> Result<Principal, AuthError> {
        for authenticator in &self.authenticators {
            if let Some(result) = authenticator.authenticate(headers, query) {
                return result;
            }
        }
        Err(AuthError::NoCredentials)
    }

    /// The comma-separated scheme list for the `WWW-Authenticate`
    /// challenge on a 401 (spec.md §4.6 "a WWW-Authenticate challenge
    /// listing the supported schemes").
    pub fn challenge(&self) -> String {
        self.authenticators.iter().map(|a| a.scheme()).collect::<Vec<_>>().join(", ")
    }
}
