use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use moat_common::Grant;

/// A container port exposed through the routing proxy under a service
/// name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePublish {
    pub name: String,
    pub container_port: u16,
}

/// An MCP server relayed through the intercepting proxy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerSpec {
    pub name: String,
    pub upstream: String,
    /// Header the credential travels under; defaults to `authorization`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
}

/// Everything a run is created from. The CLI builds one of these; an
/// `agent.yaml` (parsed elsewhere) can fill the gaps via
/// [`apply_config`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct Options {
    pub name: Option<String>,
    pub agent_label: Option<String>,
    pub workspace: PathBuf,
    pub grants: Vec<Grant>,
    pub cmd: Vec<String>,
    pub env: Vec<(String, String)>,
    pub image: Option<String>,
    pub interactive: bool,
    pub tty: bool,
    pub services: Vec<ServicePublish>,
    pub mcp_servers: Vec<McpServerSpec>,
    pub lang_servers: Vec<String>,
}

/// The overrides an `agent.yaml` may carry. Parsing the file is the CLI's
/// job; this is the merge target.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub grants: Vec<Grant>,
    #[serde(default)]
    pub services: Vec<ServicePublish>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerSpec>,
    #[serde(default)]
    pub lang_servers: Vec<String>,
}

/// Merge config values under the CLI's: anything the caller set on
/// `options` wins, config fills the rest. Grants and services are
/// unioned, config entries first.
pub fn apply_config(options: &mut Options, config: AgentConfig) {
    if options.image.is_none() {
        options.image = config.image;
    }

    let cli_env: Vec<(String, String)> = std::mem::take(&mut options.env);
    let mut merged: Vec<(String, String)> = config
        .env
        .into_iter()
        .filter(|(key, _)| !cli_env.iter().any(|(cli_key, _)| cli_key == key))
        .collect();
    merged.extend(cli_env);
    options.env = merged;

    let mut grants = config.grants;
    for grant in std::mem::take(&mut options.grants) {
        if !grants.contains(&grant) {
            grants.push(grant);
        }
    }
    options.grants = grants;

    let mut services = config.services;
    for service in std::mem::take(&mut options.services) {
        if let Some(existing) = services.iter_mut().find(|s| s.name == service.name) {
            *existing = service;
        } else {
            services.push(service);
        }
    }
    options.services = services;

    let mut mcp_servers = config.mcp_servers;
    for spec in std::mem::take(&mut options.mcp_servers) {
        if let Some(existing) = mcp_servers.iter_mut().find(|s| s.name == spec.name) {
            *existing = spec;
        } else {
            mcp_servers.push(spec);
        }
    }
    options.mcp_servers = mcp_servers;

    for name in config.lang_servers {
        if !options.lang_servers.contains(&name) {
            options.lang_servers.push(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_win_over_config() {
        let mut options = Options {
            image: Some("custom:latest".to_string()),
            env: vec![("RUST_LOG".to_string(), "debug".to_string())],
            ..Default::default()
        };
        let config = AgentConfig {
            image: Some("config:1".to_string()),
            env: BTreeMap::from([
                ("RUST_LOG".to_string(), "info".to_string()),
                ("EXTRA".to_string(), "1".to_string()),
            ]),
            ..Default::default()
        };
        apply_config(&mut options, config);

        assert_eq!(options.image.as_deref(), Some("custom:latest"));
        assert!(options
            .env
            .contains(&("RUST_LOG".to_string(), "debug".to_string())));
        assert!(options
            .env
            .contains(&("EXTRA".to_string(), "1".to_string())));
    }

    #[test]
    fn config_fills_missing_image_and_grants() {
        let mut options = Options {
            grants: vec!["github".parse().unwrap()],
            ..Default::default()
        };
        let config = AgentConfig {
            image: Some("config:1".to_string()),
            grants: vec!["github".parse().unwrap(), "anthropic".parse().unwrap()],
            ..Default::default()
        };
        apply_config(&mut options, config);

        assert_eq!(options.image.as_deref(), Some("config:1"));
        assert_eq!(options.grants.len(), 2);
    }

    #[test]
    fn services_merge_by_name_with_cli_override() {
        let mut options = Options {
            services: vec![ServicePublish {
                name: "web".to_string(),
                container_port: 9999,
            }],
            ..Default::default()
        };
        let config = AgentConfig {
            services: vec![
                ServicePublish {
                    name: "web".to_string(),
                    container_port: 8000,
                },
                ServicePublish {
                    name: "api".to_string(),
                    container_port: 8001,
                },
            ],
            ..Default::default()
        };
        apply_config(&mut options, config);

        assert_eq!(options.services.len(), 2);
        let web = options.services.iter().find(|s| s.name == "web").unwrap();
        assert_eq!(web.container_port, 9999);
    }
}
