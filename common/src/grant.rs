use std::fmt::Formatter;
use std::str::FromStr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, ErrorKind};

/// The closed set of credential providers a grant can name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Provider {
    Github,
    Anthropic,
    Aws,
    Mcp(String),
    Ssh,
}

impl Provider {
    /// Canonical name: the string the grant syntax uses and the credential
    /// file is stored under.
    pub fn name(&self) -> String {
        match self {
            Self::Github => "github".to_string(),
            Self::Anthropic => "anthropic".to_string(),
            Self::Aws => "aws".to_string(),
            Self::Mcp(name) => format!("mcp-{name}"),
            Self::Ssh => "ssh".to_string(),
        }
    }

    /// The static injection rule for this provider, if request-time header
    /// injection applies. SSH grants inject nothing over HTTP, and MCP
    /// credentials are injected on the relay path instead.
    pub fn injection_rule(&self) -> Option<InjectionRule> {
        match self {
            Self::Github => Some(InjectionRule {
                header: "authorization",
                hosts: vec![
                    HostRule::new("api.github.com", AuthScheme::Bearer),
                    HostRule::new("uploads.github.com", AuthScheme::Bearer),
                    HostRule::new("github.com", AuthScheme::GitBasic),
                    HostRule::new("codeload.github.com", AuthScheme::GitBasic),
                    HostRule::new("raw.githubusercontent.com", AuthScheme::Bearer),
                    HostRule::new("objects.githubusercontent.com", AuthScheme::Bearer),
                ],
                refresh_interval: Some(Duration::from_secs(45 * 60)),
                transform: None,
            }),
            Self::Anthropic => Some(InjectionRule {
                header: "x-api-key",
                hosts: vec![HostRule::new("api.anthropic.com", AuthScheme::Plain)],
                refresh_interval: None,
                transform: None,
            }),
            Self::Aws => Some(InjectionRule {
                header: "authorization",
                hosts: vec![HostRule::new("sts.amazonaws.com", AuthScheme::Bearer)],
                refresh_interval: Some(Duration::from_secs(15 * 60)),
                transform: Some(ResponseTransform::StripWwwAuthenticate),
            }),
            Self::Mcp(_) | Self::Ssh => None,
        }
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Self::Github),
            "anthropic" => Ok(Self::Anthropic),
            "aws" => Ok(Self::Aws),
            "ssh" => Ok(Self::Ssh),
            other => match other.strip_prefix("mcp-") {
                Some(name) if !name.is_empty() => Ok(Self::Mcp(name.to_string())),
                _ => Err(Error::from_kind(ErrorKind::UnknownProvider(
                    other.to_string(),
                ))),
            },
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.name().fmt(f)
    }
}

impl Serialize for Provider {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Provider {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// How a token turns into a header value on a given host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Bearer <token>`
    Bearer,
    /// `Basic base64("x-access-token:<token>")`, the shape git-over-HTTPS
    /// expects.
    GitBasic,
    /// The bare token, for headers like `x-api-key`.
    Plain,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostRule {
    pub host: String,
    pub scheme: AuthScheme,
}

impl HostRule {
    fn new(host: &str, scheme: AuthScheme) -> Self {
        Self {
            host: host.to_string(),
            scheme,
        }
    }
}

/// Rewrites applied to origin responses before they reach the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseTransform {
    /// Drop `Www-Authenticate` from error responses so AWS STS failures do
    /// not leak auth hints into the sandbox.
    StripWwwAuthenticate,
}

/// Per-provider header injection table consumed by the intercepting proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InjectionRule {
    /// Lower-case header name this provider sets.
    pub header: &'static str,
    pub hosts: Vec<HostRule>,
    pub refresh_interval: Option<Duration>,
    pub transform: Option<ResponseTransform>,
}

impl InjectionRule {
    pub fn binds_host(&self, host: &str) -> bool {
        self.hosts.iter().any(|rule| rule.host == host)
    }

    /// Header value for `host`, or `None` when the host is not bound.
    pub fn value_for(&self, host: &str, token: &str) -> Option<String> {
        let rule = self.hosts.iter().find(|rule| rule.host == host)?;
        Some(match rule.scheme {
            AuthScheme::Bearer => format!("Bearer {token}"),
            AuthScheme::GitBasic => {
                let encoded = STANDARD.encode(format!("x-access-token:{token}"));
                format!("Basic {encoded}")
            }
            AuthScheme::Plain => token.to_string(),
        })
    }
}

/// A named capability a run is permitted to exercise.
///
/// Syntax: `<provider>[:<comma-separated-scopes>]`, with `ssh:<host>`
/// carrying a host in place of scopes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grant {
    pub provider: Provider,
    pub scopes: Vec<String>,
    /// Only present for `ssh:<host>` grants.
    pub ssh_host: Option<String>,
}

impl Grant {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            scopes: Vec::new(),
            ssh_host: None,
        }
    }

    pub fn ssh(host: &str) -> Self {
        Self {
            provider: Provider::Ssh,
            scopes: Vec::new(),
            ssh_host: Some(host.to_string()),
        }
    }

    /// The sentinel value in-container tools place where a real credential
    /// would otherwise go; the proxy overwrites it at request time.
    pub fn stub_token(&self) -> String {
        format!("moat-stub-{}", self.provider.name())
    }
}

impl FromStr for Grant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, rest) = match s.split_once(':') {
            Some((name, rest)) => (name, Some(rest)),
            None => (s, None),
        };
        let provider: Provider = name.parse()?;

        match (&provider, rest) {
            (Provider::Ssh, Some(host)) if !host.is_empty() => Ok(Self {
                provider,
                scopes: Vec::new(),
                ssh_host: Some(host.to_string()),
            }),
            (Provider::Ssh, _) => Err(Error::custom(
                ErrorKind::UnknownProvider(s.to_string()),
                "ssh grants take the form `ssh:<host>`",
            )),
            (_, Some(scopes)) => Ok(Self {
                provider,
                scopes: scopes
                    .split(',')
                    .filter(|scope| !scope.is_empty())
                    .map(str::to_string)
                    .collect(),
                ssh_host: None,
            }),
            (_, None) => Ok(Self {
                provider,
                scopes: Vec::new(),
                ssh_host: None,
            }),
        }
    }
}

impl std::fmt::Display for Grant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.provider)?;
        if let Some(host) = &self.ssh_host {
            write!(f, ":{host}")?;
        } else if !self.scopes.is_empty() {
            write!(f, ":{}", self.scopes.join(","))?;
        }
        Ok(())
    }
}

impl Serialize for Grant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Grant {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_round_trips_through_display() {
        for raw in ["github", "github:repo,read:org", "ssh:github.com", "mcp-linear"] {
            let grant: Grant = raw.parse().unwrap();
            assert_eq!(grant.to_string(), raw);
        }
    }

    #[test]
    fn scopes_keep_their_order() {
        let grant: Grant = "github:repo,read:org,gist".parse().unwrap();
        assert_eq!(grant.scopes, vec!["repo", "read:org", "gist"]);
    }

    #[test]
    fn unknown_provider_is_a_validation_error() {
        let err = "gitlab".parse::<Grant>().unwrap_err();
        assert_eq!(
            err.kind(),
            ErrorKind::UnknownProvider("gitlab".to_string())
        );
    }

    #[test]
    fn ssh_grant_requires_a_host() {
        assert!("ssh".parse::<Grant>().is_err());
        assert!("ssh:".parse::<Grant>().is_err());
        let grant: Grant = "ssh:github.com".parse().unwrap();
        assert_eq!(grant.ssh_host.as_deref(), Some("github.com"));
    }

    #[test]
    fn stub_token_names_the_provider() {
        assert_eq!(
            "github".parse::<Grant>().unwrap().stub_token(),
            "moat-stub-github"
        );
        assert_eq!(
            "mcp-linear".parse::<Grant>().unwrap().stub_token(),
            "moat-stub-mcp-linear"
        );
    }

    #[test]
    fn github_rule_distinguishes_api_and_git_hosts() {
        let rule = Provider::Github.injection_rule().unwrap();
        assert_eq!(
            rule.value_for("api.github.com", "tok").unwrap(),
            "Bearer tok"
        );
        let git = rule.value_for("github.com", "tok").unwrap();
        assert!(git.starts_with("Basic "));
        assert!(rule.value_for("example.com", "tok").is_none());
    }

    #[test]
    fn anthropic_rule_uses_the_bare_key() {
        let rule = Provider::Anthropic.injection_rule().unwrap();
        assert_eq!(rule.header, "x-api-key");
        assert_eq!(
            rule.value_for("api.anthropic.com", "sk-ant").unwrap(),
            "sk-ant"
        );
    }
}
