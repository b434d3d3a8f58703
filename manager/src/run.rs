use std::path::PathBuf;

use chrono::{DateTime, Utc};

use moat_common::{
    AgentLabel, Error, ErrorKind, Grant, Metadata, RunId, RunName, RunState, Secret,
};

/// One sandboxed execution: a container plus its wired proxies and storage
/// directory.
///
/// Mutated only by the manager; state transitions are monotonic.
#[derive(Clone, Debug)]
pub struct Run {
    pub id: RunId,
    pub name: RunName,
    pub agent_label: AgentLabel,
    pub workspace: PathBuf,
    pub grants: Vec<Grant>,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Bound exactly once, at successful create.
    pub container_id: Option<String>,
    pub proxy_port: Option<u16>,
    pub proxy_auth_token: Option<Secret<String>>,
    pub ssh_socket_path: Option<PathBuf>,
}

impl Run {
    pub fn new(
        id: RunId,
        name: RunName,
        agent_label: AgentLabel,
        workspace: PathBuf,
        grants: Vec<Grant>,
    ) -> Self {
        Self {
            id,
            name,
            agent_label,
            workspace,
            grants,
            state: RunState::Created,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            error: None,
            container_id: None,
            proxy_port: None,
            proxy_auth_token: None,
            ssh_socket_path: None,
        }
    }

    fn allowed(from: RunState, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (from, to),
            (Created, Starting)
                // Partial-setup failures during create.
                | (Created, Failed)
                // Stopping a never-started run settles it immediately.
                | (Created, Stopped)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopped, Destroyed)
                | (Failed, Destroyed)
        )
    }

    /// Advance the state machine; violations surface as errors, never get
    /// ignored.
    pub fn advance(&mut self, next: RunState) -> Result<(), Error> {
        if !Self::allowed(self.state, next) {
            return Err(Error::custom(
                ErrorKind::InvalidOperation,
                format!("cannot move run from `{}` to `{next}`", self.state),
            ));
        }
        match next {
            RunState::Running => self.started_at = Some(Utc::now()),
            RunState::Stopped | RunState::Failed => {
                if self.stopped_at.is_none() {
                    self.stopped_at = Some(Utc::now());
                }
            }
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    pub fn metadata(&self) -> Metadata {
        Metadata {
            id: self.id.clone(),
            name: self.name.clone(),
            agent_label: self.agent_label.clone(),
            workspace: self.workspace.clone(),
            grants: self.grants.clone(),
            state: self.state,
            created_at: self.created_at,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            container_id: self.container_id.clone(),
            error: self.error.clone(),
            digests: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> Run {
        Run::new(
            RunId::generate(),
            "calm-vole".parse().unwrap(),
            "calm-vole".parse().unwrap(),
            "/work".into(),
            vec![],
        )
    }

    #[test]
    fn happy_path_is_monotonic_with_timestamps() -> anyhow::Result<()> {
        let mut run = run();
        run.advance(RunState::Starting)?;
        run.advance(RunState::Running)?;
        run.advance(RunState::Stopping)?;
        run.advance(RunState::Stopped)?;

        let started = run.started_at.unwrap();
        let stopped = run.stopped_at.unwrap();
        assert!(run.created_at <= started);
        assert!(started <= stopped);
        assert!(run.state.is_terminal());
        Ok(())
    }

    #[test]
    fn failure_is_reachable_from_starting_and_running() -> anyhow::Result<()> {
        let mut run1 = run();
        run1.advance(RunState::Starting)?;
        run1.advance(RunState::Failed)?;
        assert!(run1.stopped_at.is_some());

        let mut run2 = run();
        run2.advance(RunState::Starting)?;
        run2.advance(RunState::Running)?;
        run2.advance(RunState::Failed)?;
        Ok(())
    }

    #[test]
    fn backwards_and_skipping_transitions_are_rejected() {
        let mut run = run();
        assert!(run.advance(RunState::Running).is_err());
        run.advance(RunState::Starting).unwrap();
        run.advance(RunState::Running).unwrap();
        assert!(run.advance(RunState::Created).is_err());
        assert!(run.advance(RunState::Starting).is_err());
    }

    #[test]
    fn terminal_states_only_allow_destroy() {
        let mut run = run();
        run.advance(RunState::Starting).unwrap();
        run.advance(RunState::Failed).unwrap();
        assert!(run.advance(RunState::Running).is_err());
        assert!(run.advance(RunState::Destroyed).is_ok());
    }

    #[test]
    fn destroy_from_running_is_rejected() {
        let mut run = run();
        run.advance(RunState::Starting).unwrap();
        run.advance(RunState::Running).unwrap();
        assert!(run.advance(RunState::Destroyed).is_err());
    }

    #[test]
    fn created_runs_settle_through_stopped_before_destroy() {
        let mut run = run();
        // Destroy never fires outside {Stopped, Failed}.
        assert!(run.advance(RunState::Destroyed).is_err());
        run.advance(RunState::Stopped).unwrap();
        assert!(run.stopped_at.is_some());
        assert!(run.advance(RunState::Destroyed).is_ok());
    }
}
