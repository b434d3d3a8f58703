use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use moat_common::grant::{InjectionRule, ResponseTransform};
use moat_common::{Grant, Provider, Secret};
use moat_vault::Vault;

/// A credential bound to one proxy instance.
///
/// The token lives behind a lock so the refresh ticker can swap it without
/// interrupting in-flight requests.
pub struct Binding {
    pub provider: Provider,
    pub rule: InjectionRule,
    token: RwLock<Secret<String>>,
}

impl Binding {
    fn current_token(&self) -> String {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .expose()
            .clone()
    }

    fn replace_token(&self, token: Secret<String>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token;
    }
}

/// Request-time credential injection for the hosts bound to a run.
pub struct CredentialInjector {
    bindings: Vec<Arc<Binding>>,
    by_host: HashMap<String, Arc<Binding>>,
    registered_headers: Vec<String>,
}

impl CredentialInjector {
    /// Build from the grants of a run and their vault credentials. Grants
    /// without an injection rule (ssh, mcp) contribute nothing here.
    pub fn new(bound: Vec<(Grant, Secret<String>)>) -> Self {
        let mut bindings = Vec::new();
        let mut by_host = HashMap::new();
        let mut registered_headers = Vec::new();

        for (grant, token) in bound {
            let Some(rule) = grant.provider.injection_rule() else {
                continue;
            };
            if !registered_headers.iter().any(|h| h == rule.header) {
                registered_headers.push(rule.header.to_string());
            }
            let binding = Arc::new(Binding {
                provider: grant.provider.clone(),
                rule,
                token: RwLock::new(token),
            });
            for host in &binding.rule.hosts {
                by_host.insert(host.host.clone(), Arc::clone(&binding));
            }
            bindings.push(binding);
        }

        Self {
            bindings,
            by_host,
            registered_headers,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn binds_host(&self, host: &str) -> bool {
        self.by_host.contains_key(host)
    }

    /// Provider-registered header names, for the redaction set.
    pub fn registered_headers(&self) -> &[String] {
        &self.registered_headers
    }

    /// Set the provider's auth header for `host`, overwriting any stub
    /// placeholder (or anything else) the client put there.
    pub fn inject(&self, host: &str, headers: &mut HeaderMap) {
        let Some(binding) = self.by_host.get(host) else {
            return;
        };
        let token = binding.current_token();
        let Some(value) = binding.rule.value_for(host, &token) else {
            return;
        };
        let Ok(name) = HeaderName::try_from(binding.rule.header) else {
            return;
        };
        match HeaderValue::try_from(value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(err) => warn!(provider = %binding.provider, error = %err, "credential not header-safe"),
        }
    }

    /// The response transform for `host`, if its provider declares one.
    pub fn transform_for(&self, host: &str) -> Option<ResponseTransform> {
        self.by_host.get(host).and_then(|b| b.rule.transform)
    }

    /// Spawn one refresh ticker per binding that advertises an interval.
    ///
    /// On failure the re-read backs off exponentially, capped at the
    /// provider's interval; a fresh token replaces the old one in place.
    pub fn spawn_refresh(self: &Arc<Self>, vault: Arc<Vault>, cancel: CancellationToken) {
        for binding in &self.bindings {
            let Some(interval) = binding.rule.refresh_interval else {
                continue;
            };
            let binding = Arc::clone(binding);
            let vault = Arc::clone(&vault);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut backoff = Duration::from_secs(1);
                let mut delay = interval;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    match vault.get(&binding.provider) {
                        Ok(Some(credential)) => {
                            debug!(provider = %binding.provider, "refreshed credential");
                            binding.replace_token(credential.token);
                            backoff = Duration::from_secs(1);
                            delay = interval;
                        }
                        Ok(None) => {
                            // Grant was revoked; keep serving the last
                            // token until the proxy is torn down.
                            warn!(provider = %binding.provider, "credential disappeared from vault");
                            delay = interval;
                        }
                        Err(err) => {
                            warn!(provider = %binding.provider, error = %err, "credential refresh failed");
                            backoff = (backoff * 2).min(interval);
                            delay = backoff;
                        }
                    }
                }
            });
        }
    }
}
