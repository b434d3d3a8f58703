use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use moat_common::audit::DigestChain;
use moat_common::{Error, ErrorKind, ExecEvent, LogLine, Metadata, NetworkRecord, RunId, Span};

pub const METADATA_FILE: &str = "metadata.json";
pub const CONFIG_FILE: &str = "config.yaml";
pub const LOGS_FILE: &str = "logs.jsonl";
pub const NETWORK_FILE: &str = "network.jsonl";
pub const EXEC_FILE: &str = "exec.jsonl";
pub const SPANS_FILE: &str = "spans.jsonl";

const JSONL_FILES: [&str; 4] = [LOGS_FILE, NETWORK_FILE, EXEC_FILE, SPANS_FILE];

struct AppendFile {
    file: File,
    chain: DigestChain,
}

struct Inner {
    closed: bool,
    files: BTreeMap<&'static str, AppendFile>,
}

/// Append-only per-run store under `<base>/<run_id>/`.
///
/// One mutex serializes all writers, so each file's records are totally
/// ordered by write time; every append also advances that file's digest
/// chain. The directory outlives the run as its audit trail.
pub struct Store {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl Store {
    pub fn open(base: &Path, id: &RunId) -> Result<Self, Error> {
        let dir = base.join(id.as_str());
        fs::create_dir_all(&dir)?;

        let mut files = BTreeMap::new();
        for name in JSONL_FILES {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(name))?;
            files.insert(
                name,
                AppendFile {
                    file,
                    chain: DigestChain::new(name),
                },
            );
        }

        Ok(Self {
            dir,
            inner: Mutex::new(Inner {
                closed: false,
                files,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append_log(&self, line: &LogLine) -> Result<(), Error> {
        self.append(LOGS_FILE, line)
    }

    pub fn append_network(&self, record: &NetworkRecord) -> Result<(), Error> {
        self.append(NETWORK_FILE, record)
    }

    pub fn append_exec(&self, event: &ExecEvent) -> Result<(), Error> {
        self.append(EXEC_FILE, event)
    }

    pub fn append_span(&self, span: &Span) -> Result<(), Error> {
        self.append(SPANS_FILE, span)
    }

    fn append<T: Serialize>(&self, name: &'static str, record: &T) -> Result<(), Error> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return Err(Error::custom(ErrorKind::Internal, "store is closed"));
        }
        let entry = inner
            .files
            .get_mut(name)
            .ok_or_else(|| Error::custom(ErrorKind::Internal, "unknown store file"))?;
        entry.file.write_all(&line)?;
        entry.chain.append(&line);
        Ok(())
    }

    /// Rewrite `metadata.json` whole-file.
    pub fn write_metadata(&self, metadata: &Metadata) -> Result<(), Error> {
        let encoded = serde_json::to_vec_pretty(metadata)?;
        fs::write(self.dir.join(METADATA_FILE), encoded)?;
        Ok(())
    }

    pub fn read_metadata(&self) -> Result<Metadata, Error> {
        let bytes = fs::read(self.dir.join(METADATA_FILE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Snapshot the effective run configuration as `config.yaml`.
    pub fn write_config_snapshot<T: Serialize>(&self, config: &T) -> Result<(), Error> {
        let encoded = serde_yaml::to_string(config)
            .map_err(|err| Error::source(ErrorKind::Internal, err))?;
        fs::write(self.dir.join(CONFIG_FILE), encoded)?;
        Ok(())
    }

    pub fn read_logs(&self, offset: usize, limit: Option<usize>) -> Result<Vec<LogLine>, Error> {
        self.read_jsonl(LOGS_FILE, offset, limit)
    }

    pub fn read_network(
        &self,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<NetworkRecord>, Error> {
        self.read_jsonl(NETWORK_FILE, offset, limit)
    }

    pub fn read_exec(&self, offset: usize, limit: Option<usize>) -> Result<Vec<ExecEvent>, Error> {
        self.read_jsonl(EXEC_FILE, offset, limit)
    }

    pub fn read_spans(&self, offset: usize, limit: Option<usize>) -> Result<Vec<Span>, Error> {
        self.read_jsonl(SPANS_FILE, offset, limit)
    }

    fn read_jsonl<T: DeserializeOwned>(
        &self,
        name: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<T>, Error> {
        let file = match File::open(self.dir.join(name)) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let limit = limit.unwrap_or(usize::MAX);
        let mut records = Vec::new();
        for line in BufReader::new(file).lines().skip(offset).take(limit) {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    /// Current digest-chain heads, file name → hex digest.
    pub fn digests(&self) -> BTreeMap<String, String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .files
            .iter()
            .map(|(name, entry)| (name.to_string(), entry.chain.hex()))
            .collect()
    }

    /// Flush and drop the writers. Idempotent; later appends fail.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return;
        }
        for entry in inner.files.values_mut() {
            let _ = entry.file.flush();
        }
        inner.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use moat_common::LogStream;

    fn log_line(text: &str) -> LogLine {
        LogLine {
            timestamp: Utc::now(),
            stream: LogStream::Stdout,
            line: text.to_string(),
        }
    }

    #[test]
    fn appends_are_ordered_and_readable() -> anyhow::Result<()> {
        let base = tempfile::tempdir()?;
        let id = RunId::generate();
        let store = Store::open(base.path(), &id)?;

        for i in 0..5 {
            store.append_log(&log_line(&format!("line {i}")))?;
        }

        let all = store.read_logs(0, None)?;
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].line, "line 0");
        assert_eq!(all[4].line, "line 4");

        let window = store.read_logs(2, Some(2))?;
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].line, "line 2");
        Ok(())
    }

    #[test]
    fn concurrent_writers_produce_valid_jsonl() -> anyhow::Result<()> {
        let base = tempfile::tempdir()?;
        let id = RunId::generate();
        let store = std::sync::Arc::new(Store::open(base.path(), &id)?);

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store
                            .append_log(&log_line(&format!("w{worker}-{i}")))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.read_logs(0, None)?.len(), 400);
        Ok(())
    }

    #[test]
    fn close_is_idempotent_and_stops_appends() -> anyhow::Result<()> {
        let base = tempfile::tempdir()?;
        let id = RunId::generate();
        let store = Store::open(base.path(), &id)?;

        store.append_log(&log_line("before"))?;
        store.close();
        store.close();
        assert!(store.append_log(&log_line("after")).is_err());
        assert_eq!(store.read_logs(0, None)?.len(), 1);
        Ok(())
    }

    #[test]
    fn digest_chains_advance_per_file() -> anyhow::Result<()> {
        let base = tempfile::tempdir()?;
        let id = RunId::generate();
        let store = Store::open(base.path(), &id)?;

        let initial = store.digests();
        store.append_log(&log_line("x"))?;
        let after = store.digests();
        assert_ne!(initial[LOGS_FILE], after[LOGS_FILE]);
        assert_eq!(initial[NETWORK_FILE], after[NETWORK_FILE]);
        Ok(())
    }

    #[test]
    fn metadata_round_trips_through_the_store() -> anyhow::Result<()> {
        let base = tempfile::tempdir()?;
        let id = RunId::generate();
        let store = Store::open(base.path(), &id)?;

        let metadata = Metadata {
            id: id.clone(),
            name: "calm-vole".parse()?,
            agent_label: "calm-vole".parse()?,
            workspace: "/work".into(),
            grants: vec!["github".parse()?],
            state: moat_common::RunState::Created,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            container_id: None,
            error: None,
            digests: None,
        };
        store.write_metadata(&metadata)?;
        assert_eq!(store.read_metadata()?, metadata);
        Ok(())
    }
}
