use std::sync::RwLock;

use moat_common::{Grant, Secret};

/// One MCP relay endpoint on the intercepting proxy's own mux.
///
/// Requests to `/mcp/<name>` have their stub header value replaced with
/// the bound credential and are reverse-proxied to the configured
/// upstream.
pub struct McpRelay {
    pub name: String,
    /// Upstream base URL, e.g. `https://mcp.linear.app/sse`.
    pub upstream: String,
    /// Lower-case header name the credential travels under.
    pub header: String,
    stub: String,
    token: RwLock<Secret<String>>,
}

impl McpRelay {
    pub fn new(name: &str, upstream: &str, header: &str, grant: &Grant, token: Secret<String>) -> Self {
        Self {
            name: name.to_string(),
            upstream: upstream.trim_end_matches('/').to_string(),
            header: header.to_ascii_lowercase(),
            stub: grant.stub_token(),
            token: RwLock::new(token),
        }
    }

    /// Relay path prefix on the proxy listener.
    pub fn path_prefix(&self) -> String {
        format!("/mcp/{}", self.name)
    }

    pub fn stub(&self) -> &str {
        &self.stub
    }

    /// The real header value for an incoming value that may embed the stub
    /// anywhere (`moat-stub-x`, `Bearer moat-stub-x`, ...). A missing
    /// header yields the bare credential.
    pub fn resolve_value(&self, incoming: Option<&str>) -> String {
        let token = self
            .token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .expose()
            .clone();
        match incoming {
            Some(value) if value.contains(&self.stub) => value.replace(&self.stub, &token),
            _ => token,
        }
    }

    /// Upstream URL for a relay request path + query.
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> String {
        let prefix = self.path_prefix();
        let suffix = path.strip_prefix(&prefix).unwrap_or("");
        let mut url = format!("{}{}", self.upstream, suffix);
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    pub fn replace_token(&self, token: Secret<String>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token;
    }
}
