use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Placeholder written in place of any sensitive header value.
pub const REDACTED: &str = "[REDACTED]";

/// Largest request/response body slice a network record may carry.
pub const BODY_CAP: usize = 8 * 1024;

/// Headers whose values are always redacted, regardless of provider
/// registration. Matched case-insensitively.
pub const REDACTED_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "x-auth-token",
    "cookie",
    "set-cookie",
];

pub fn is_sensitive_header(name: &str, extra: &[String]) -> bool {
    let lower = name.to_ascii_lowercase();
    REDACTED_HEADERS.contains(&lower.as_str()) || extra.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Build a redacted header map from raw name/value pairs. `extra` carries
/// the provider-registered header names bound to the current run.
pub fn redact_headers<'a, I>(headers: I, extra: &[String]) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .map(|(name, value)| {
            let value = if is_sensitive_header(name, extra) {
                REDACTED.to_string()
            } else {
                value.to_string()
            };
            (name.to_ascii_lowercase(), value)
        })
        .collect()
}

/// Cap a body at [`BODY_CAP`] bytes. Returns the (lossily decoded) slice
/// and whether anything was cut off.
pub fn cap_body(body: &[u8]) -> (Option<String>, bool) {
    if body.is_empty() {
        return (None, false);
    }
    let truncated = body.len() > BODY_CAP;
    let slice = &body[..body.len().min(BODY_CAP)];
    (Some(String::from_utf8_lossy(slice).into_owned()), truncated)
}

/// OpenSSH-style key fingerprint: `SHA256:<unpadded base64 of sha256(blob)>`.
pub fn sha256_fingerprint(blob: &[u8]) -> String {
    let digest = Sha256::digest(blob);
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

/// Tamper-evident hash chain over an append-only file.
///
/// chain₀ = sha256(label); chainₙ = sha256(chainₙ₋₁ ‖ line). Any edit to a
/// sealed file invalidates every digest after the edit point.
#[derive(Clone, Debug)]
pub struct DigestChain {
    state: [u8; 32],
}

impl DigestChain {
    pub fn new(label: &str) -> Self {
        let state = Sha256::digest(label.as_bytes());
        Self {
            state: state.into(),
        }
    }

    pub fn append(&mut self, line: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.state);
        hasher.update(line);
        self.state = hasher.finalize().into();
    }

    pub fn hex(&self) -> String {
        self.state.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_headers_are_redacted_case_insensitively() {
        let map = redact_headers(
            [
                ("Authorization", "Bearer ghp_secret"),
                ("X-API-Key", "sk-ant"),
                ("Accept", "application/json"),
            ],
            &[],
        );
        assert_eq!(map["authorization"], REDACTED);
        assert_eq!(map["x-api-key"], REDACTED);
        assert_eq!(map["accept"], "application/json");
    }

    #[test]
    fn provider_registered_headers_are_redacted() {
        let extra = vec!["x-moat-upstream".to_string()];
        let map = redact_headers([("X-Moat-Upstream", "tok")], &extra);
        assert_eq!(map["x-moat-upstream"], REDACTED);
    }

    #[test]
    fn bodies_are_capped_at_8kib() {
        let (body, truncated) = cap_body(&vec![b'a'; BODY_CAP + 1]);
        assert!(truncated);
        assert_eq!(body.unwrap().len(), BODY_CAP);

        let (body, truncated) = cap_body(b"hello");
        assert!(!truncated);
        assert_eq!(body.unwrap(), "hello");

        assert_eq!(cap_body(b""), (None, false));
    }

    #[test]
    fn fingerprint_shape() {
        let fp = sha256_fingerprint(b"ssh-ed25519 key blob");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        // Deterministic for the same blob.
        assert_eq!(fp, sha256_fingerprint(b"ssh-ed25519 key blob"));
    }

    #[test]
    fn digest_chain_detects_reordering() {
        let mut a = DigestChain::new("logs.jsonl");
        a.append(b"one");
        a.append(b"two");

        let mut b = DigestChain::new("logs.jsonl");
        b.append(b"two");
        b.append(b"one");

        assert_ne!(a.hex(), b.hex());
    }
}
