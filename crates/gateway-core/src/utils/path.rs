//! Outbound URL construction for the reverse proxy (spec.md §4.6.6
//! "Rewrite outbound URL to `scheme://target.host:target.port/path?query`").

/// Builds the outbound request URL for a selected target. `path` should
/// already include the leading `/`; `query` is the raw query string
/// (without a leading `?`), or empty.
pub fn build_upstream_url(scheme: &str, host: &str, port: u16, path: &str, query: &str) -> String {
    if query.is_empty() {
        format!("{scheme}://{host}:{port}{path}")
    } else {
        format!("{scheme}://{host}:{port}{path}?{query}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_url_without_query() {
        assert_eq!(build_upstream_url("http", "backend", 8080, "/v1/users/123", ""), "http://backend:8080/v1/users/123");
    }

    #[test]
    fn builds_url_with_query() {
        assert_eq!(
            build_upstream_url("http", "backend", 8080, "/search", "q=rust"),
            "http://backend:8080/search?q=rust"
        );
    }
}
