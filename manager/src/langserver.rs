use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use moat_common::{Error, ErrorKind};

/// A language server exposed to the run as a stdio MCP server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpStdioConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Consumer view of the language-server registry: name → stdio MCP
/// config. The registry contents come from outside the core; this type
/// only resolves the names a run asks for.
#[derive(Clone, Debug, Default)]
pub struct LangServerRegistry {
    entries: BTreeMap<String, McpStdioConfig>,
}

impl LangServerRegistry {
    pub fn from_entries(entries: BTreeMap<String, McpStdioConfig>) -> Self {
        Self { entries }
    }

    pub fn resolve(&self, names: &[String]) -> Result<Vec<(String, McpStdioConfig)>, Error> {
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            let config = self.entries.get(name).ok_or_else(|| {
                Error::custom(
                    ErrorKind::UnknownProvider(name.clone()),
                    format!("no language server named `{name}` is registered"),
                )
            })?;
            resolved.push((name.clone(), config.clone()));
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> LangServerRegistry {
        LangServerRegistry::from_entries(BTreeMap::from([(
            "rust-analyzer".to_string(),
            McpStdioConfig {
                command: "rust-analyzer".to_string(),
                args: vec![],
                env: BTreeMap::new(),
            },
        )]))
    }

    #[test]
    fn known_names_resolve_in_request_order() {
        let resolved = registry()
            .resolve(&["rust-analyzer".to_string()])
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].1.command, "rust-analyzer");
    }

    #[test]
    fn unknown_names_are_a_validation_error() {
        let err = registry().resolve(&["gopls".to_string()]).unwrap_err();
        assert!(err.to_string().contains("gopls"));
    }
}
