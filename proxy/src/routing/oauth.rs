use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use http::StatusCode;
use hyper::{Body, Request, Response};
use rand::distributions::{Alphanumeric, DistString};
use ttl_cache::TtlCache;
use tracing::debug;

const STATE_TTL: Duration = Duration::from_secs(10 * 60);
const MAX_PENDING: usize = 64;
const STATE_LEN: usize = 32;

pub const DEFAULT_RELAY_HOSTNAME: &str = "oauthrelay.localhost";

/// A flow started via `/start`, waiting for its `/callback`.
#[derive(Clone, Debug, PartialEq, Eq)]
struct PendingFlow {
    agent: String,
    callback_path: String,
}

/// OAuth redirect relay claiming one hostname on the routing proxy.
///
/// `/start` redirects to the upstream authorize URL with a fresh state;
/// `/callback` validates the state (single use, ten-minute expiry) and
/// bounces the code to `web.<agent>.localhost:<proxy-port>/<path>`.
pub struct OAuthRelay {
    hostname: String,
    proxy_port: u16,
    pending: Mutex<TtlCache<String, PendingFlow>>,
}

impl std::fmt::Debug for OAuthRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthRelay")
            .field("hostname", &self.hostname)
            .field("proxy_port", &self.proxy_port)
            .finish_non_exhaustive()
    }
}

impl OAuthRelay {
    pub fn new(hostname: Option<String>, proxy_port: u16) -> Self {
        Self {
            hostname: hostname.unwrap_or_else(|| DEFAULT_RELAY_HOSTNAME.to_string()),
            proxy_port,
            pending: Mutex::new(TtlCache::new(MAX_PENDING)),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn handle(&self, req: &Request<Body>) -> Response<Body> {
        match req.uri().path() {
            "/start" => self.start(req),
            "/callback" => self.callback(req),
            _ => json_error(StatusCode::NOT_FOUND, "not found"),
        }
    }

    fn start(&self, req: &Request<Body>) -> Response<Body> {
        let params = query_params(req.uri().query());
        let (Some(agent), Some(callback_path), Some(upstream)) = (
            params.get("agent"),
            params.get("callback_path"),
            params.get("upstream"),
        ) else {
            return json_error(
                StatusCode::BAD_REQUEST,
                "start requires agent, callback_path and upstream",
            );
        };

        let state = Alphanumeric.sample_string(&mut rand::thread_rng(), STATE_LEN);
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(
            state.clone(),
            PendingFlow {
                agent: agent.clone(),
                callback_path: callback_path.clone(),
            },
            STATE_TTL,
        );

        let separator = if upstream.contains('?') { '&' } else { '?' };
        let location = format!("{upstream}{separator}state={state}");
        debug!(%agent, "starting oauth relay flow");
        redirect(&location)
    }

    fn callback(&self, req: &Request<Body>) -> Response<Body> {
        let params = query_params(req.uri().query());
        let Some(state) = params.get("state") else {
            return json_error(StatusCode::BAD_REQUEST, "callback requires state");
        };

        // remove(): states are single use.
        let Some(flow) = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(state)
        else {
            return json_error(StatusCode::BAD_REQUEST, "unknown or expired state");
        };

        let code = params.get("code").cloned().unwrap_or_default();
        let callback_path = flow.callback_path.trim_start_matches('/');
        let location = format!(
            "http://web.{}.localhost:{}/{}?code={}&state={}",
            flow.agent, self.proxy_port, callback_path, code, state
        );
        redirect(&location)
    }
}

fn redirect(location: &str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header(http::header::LOCATION, location)
        .body(Body::empty())
        .unwrap_or_default()
}

fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "error": message }).to_string(),
        ))
        .unwrap_or_default()
}

fn query_params(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let Some(query) = query else {
        return params;
    };
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(key.to_string(), percent_decode(value));
    }
    params
}

fn percent_decode(value: &str) -> String {
    let mut out = Vec::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                if let (Some(hi), Some(lo)) = (
                    bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                    bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
                ) {
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
