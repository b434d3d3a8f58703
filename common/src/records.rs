use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::grant::Grant;
use crate::names::{AgentLabel, RunId, RunName};

/// Lifecycle states of a run.
///
/// Transitions are monotonic (`Created → Starting → Running → Stopping →
/// Stopped`, with `Failed` reachable from `Starting`/`Running`); the run
/// manager is the only writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RunState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Destroyed,
}

impl RunState {
    /// Terminal for cleanup purposes: the container is gone or never ran.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Destroyed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One line of container output, as appended to `logs.jsonl`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub line: String,
}

/// One proxied request, as appended to `network.jsonl`.
///
/// Header maps are redacted before the record is constructed; a credential
/// value never reaches this type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub request_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    pub body_truncated: bool,
    #[serde(default)]
    pub response_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One intercepted exec invocation, as appended to `exec.jsonl`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecEvent {
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// One lifecycle span, as appended to `spans.jsonl`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// The run's `metadata.json`, rewritten whole-file on every transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: RunId,
    pub name: RunName,
    pub agent_label: AgentLabel,
    pub workspace: PathBuf,
    pub grants: Vec<Grant>,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Final digest-chain values per log file, sealed on close.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digests: Option<BTreeMap<String, String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&RunState::Running).unwrap(), "\"running\"");
        assert_eq!(RunState::Stopping.to_string(), "stopping");
    }

    #[test]
    fn terminal_states() {
        assert!(RunState::Stopped.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(!RunState::Created.is_terminal());
    }

    #[test]
    fn metadata_round_trips() {
        let meta = Metadata {
            id: RunId::generate(),
            name: "quiet-heron".parse().unwrap(),
            agent_label: "claude".parse().unwrap(),
            workspace: PathBuf::from("/work"),
            grants: vec!["github".parse().unwrap(), "ssh:github.com".parse().unwrap()],
            state: RunState::Created,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            container_id: None,
            error: None,
            digests: None,
        };
        let encoded = serde_json::to_string(&meta).unwrap();
        let decoded: Metadata = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn network_record_omits_empty_optionals() {
        let record = NetworkRecord {
            timestamp: Utc::now(),
            method: "GET".to_string(),
            url: "https://api.github.com/zen".to_string(),
            status_code: None,
            duration_ms: None,
            request_headers: BTreeMap::new(),
            request_body: None,
            body_truncated: false,
            response_headers: BTreeMap::new(),
            response_body: None,
            error: None,
        };
        let encoded = serde_json::to_string(&record).unwrap();
        assert!(!encoded.contains("status_code"));
        assert!(!encoded.contains("error"));
    }
}
