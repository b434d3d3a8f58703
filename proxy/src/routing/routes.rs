use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use moat_common::Error;

pub const ROUTES_FILE: &str = "routes.json";

/// Per-agent service table: `agent → (service → "host:port")`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
struct Table {
    agents: BTreeMap<String, BTreeMap<String, String>>,
}

/// The shared `routes.json` under the proxy dir.
///
/// The file is rewritten whole on every change and removed once the last
/// agent is gone; cross-process write exclusivity comes from the proxy
/// lock file, so this type only guards in-process racers.
#[derive(Debug)]
pub struct RouteTable {
    path: PathBuf,
    table: Mutex<Table>,
}

impl RouteTable {
    pub fn load(dir: &Path) -> Result<Self, Error> {
        let path = dir.join(ROUTES_FILE);
        let table = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Table::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn add(&self, agent: &str, services: BTreeMap<String, String>) -> Result<(), Error> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.agents.insert(agent.to_string(), services);
        self.persist(&table)
    }

    pub fn remove(&self, agent: &str) -> Result<(), Error> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.agents.remove(agent);
        self.persist(&table)
    }

    /// Backend for `agent` + optional service. With no service the
    /// `default` entry wins, then a sole registered service.
    pub fn lookup(&self, agent: &str, service: Option<&str>) -> Option<String> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let services = table.agents.get(agent)?;
        match service {
            Some(service) => services.get(service).cloned(),
            None => services.get("default").cloned().or_else(|| {
                if services.len() == 1 {
                    services.values().next().cloned()
                } else {
                    None
                }
            }),
        }
    }

    pub fn agents(&self) -> Vec<String> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.agents.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.agents.is_empty()
    }

    /// Re-read the file; picks up writes from the registering process
    /// when this table belongs to an adopted proxy.
    pub fn reload(&self) -> Result<(), Error> {
        let fresh = match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Table::default(),
            Err(err) => return Err(err.into()),
        };
        *self.table.lock().unwrap_or_else(|e| e.into_inner()) = fresh;
        Ok(())
    }

    fn persist(&self, table: &Table) -> Result<(), Error> {
        if table.agents.is_empty() {
            match fs::remove_file(&self.path) {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let encoded = serde_json::to_vec_pretty(table)?;
        fs::write(&self.path, encoded)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn add_then_lookup_returns_the_backend() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = RouteTable::load(dir.path())?;
        table.add("tidy-otter", services(&[("web", "127.0.0.1:4001")]))?;
        assert_eq!(
            table.lookup("tidy-otter", Some("web")).as_deref(),
            Some("127.0.0.1:4001")
        );
        assert_eq!(table.lookup("tidy-otter", Some("api")), None);
        assert_eq!(table.lookup("ghost", Some("web")), None);
        Ok(())
    }

    #[test]
    fn persists_across_reload() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let table = RouteTable::load(dir.path())?;
            table.add("tidy-otter", services(&[("web", "127.0.0.1:4001")]))?;
        }
        let table = RouteTable::load(dir.path())?;
        assert_eq!(
            table.lookup("tidy-otter", Some("web")).as_deref(),
            Some("127.0.0.1:4001")
        );
        Ok(())
    }

    #[test]
    fn file_is_removed_when_no_agents_remain() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = RouteTable::load(dir.path())?;
        table.add("tidy-otter", services(&[("web", "127.0.0.1:4001")]))?;
        assert!(dir.path().join(ROUTES_FILE).exists());
        table.remove("tidy-otter")?;
        assert!(!dir.path().join(ROUTES_FILE).exists());
        assert!(table.is_empty());
        Ok(())
    }

    #[test]
    fn default_service_resolution() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = RouteTable::load(dir.path())?;

        table.add("one-svc", services(&[("web", "127.0.0.1:4001")]))?;
        assert_eq!(
            table.lookup("one-svc", None).as_deref(),
            Some("127.0.0.1:4001")
        );

        table.add(
            "multi",
            services(&[("web", "127.0.0.1:1"), ("api", "127.0.0.1:2")]),
        )?;
        assert_eq!(table.lookup("multi", None), None);

        table.add(
            "with-default",
            services(&[("default", "127.0.0.1:9"), ("api", "127.0.0.1:2")]),
        )?;
        assert_eq!(
            table.lookup("with-default", None).as_deref(),
            Some("127.0.0.1:9")
        );
        Ok(())
    }

    #[test]
    fn reload_picks_up_external_writes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let reader = RouteTable::load(dir.path())?;
        let writer = RouteTable::load(dir.path())?;
        writer.add("tidy-otter", services(&[("web", "127.0.0.1:4001")]))?;

        assert_eq!(reader.lookup("tidy-otter", Some("web")), None);
        reader.reload()?;
        assert_eq!(
            reader.lookup("tidy-otter", Some("web")).as_deref(),
            Some("127.0.0.1:4001")
        );
        Ok(())
    }
}
