use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use rand::distributions::{Alphanumeric, DistString};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use moat_common::{
    AgentLabel, Error, ErrorKind, ExecEvent, Grant, LogLine, LogStream, Provider, RunId, RunName,
    RunState, Secret, Span,
};
use moat_proxy::{
    CertificateAuthority, CredentialInjector, InterceptProxy, McpRelay, RoutingProxy,
    RoutingProxyConfig, SshAgentProxy, SshAuditEvent,
};
use moat_runtime::{ContainerConfig, Mount, PortPublish, Runtime, RuntimeType};
use moat_vault::Vault;

use crate::langserver::{LangServerRegistry, McpStdioConfig};
use crate::options::{Options, ServicePublish};
use crate::run::Run;
use crate::storage::Store;

const DEFAULT_IMAGE: &str = "ubuntu:24.04";
const RUNS_DIR: &str = "runs";
const PROXY_DIR: &str = "proxy";
const RUN_PROXY_DIR: &str = "proxy";
const RUN_SSH_DIR: &str = "ssh";
const CONTAINER_WORKSPACE: &str = "/workspace";
const CONTAINER_CA_PATH: &str = "/run/moat/ca.crt";
const CONTAINER_SSH_DIR: &str = "/run/moat/ssh";
const CONTAINER_SSH_SOCK: &str = "/run/moat/ssh/agent.sock";
const STOP_TIMEOUT_SECS: i64 = 10;
const STOP_FINALIZE_TIMEOUT: Duration = Duration::from_secs(15);
const NAME_GENERATION_ATTEMPTS: usize = 32;

struct RunEntry {
    run: Mutex<Run>,
    store: Arc<Store>,
    intercept: Option<InterceptProxy>,
    ssh: Option<SshAgentProxy>,
    run_cancel: CancellationToken,
    services: Vec<ServicePublish>,
    routes_registered: AtomicBool,
    started: AtomicBool,
    exit: watch::Sender<Option<i64>>,
}

impl RunEntry {
    fn snapshot(&self) -> Run {
        self.run.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn write_metadata(&self) {
        let metadata = self
            .run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .metadata();
        if let Err(err) = self.store.write_metadata(&metadata) {
            warn!(error = %err, "failed to persist run metadata");
        }
    }
}

/// Partially wired per-run resources; torn down in reverse order when a
/// later create step fails.
#[derive(Default)]
struct Wiring {
    run_cancel: Option<CancellationToken>,
    intercept: Option<InterceptProxy>,
    ssh: Option<SshAgentProxy>,
    routes_registered: bool,
    container_id: Option<String>,
    env: Vec<String>,
    mounts: Vec<Mount>,
    published_ports: Vec<PortPublish>,
}

/// Append handle for in-run exec activity; cloned into whatever observes
/// command execution inside the sandbox.
#[derive(Clone)]
pub struct ExecTap {
    store: Arc<Store>,
}

impl ExecTap {
    pub fn record(&self, command: &str, args: &[String], exit_code: Option<i32>) {
        let event = ExecEvent {
            timestamp: Utc::now(),
            command: command.to_string(),
            args: args.to_vec(),
            exit_code,
        };
        if let Err(err) = self.store.append_exec(&event) {
            warn!(error = %err, "failed to append exec event");
        }
    }
}

/// Owner of every run on this machine.
///
/// Holds the id → run map behind one mutex; background work (log
/// streaming, container wait, proxies) runs as tasks feeding the run's
/// store. Back-references are always lookups through this type, never
/// owning pointers.
pub struct RunManager {
    base_dir: PathBuf,
    runtime: Arc<dyn Runtime>,
    vault: Arc<Vault>,
    registry: LangServerRegistry,
    routing: Mutex<Option<Arc<RoutingProxy>>>,
    runs: Mutex<HashMap<RunId, Arc<RunEntry>>>,
    cancel: CancellationToken,
}

impl RunManager {
    pub fn new(base_dir: PathBuf, runtime: Arc<dyn Runtime>, vault: Arc<Vault>) -> Self {
        Self::with_registry(base_dir, runtime, vault, LangServerRegistry::default())
    }

    pub fn with_registry(
        base_dir: PathBuf,
        runtime: Arc<dyn Runtime>,
        vault: Arc<Vault>,
        registry: LangServerRegistry,
    ) -> Self {
        Self {
            base_dir,
            runtime,
            vault,
            registry,
            routing: Mutex::new(None),
            runs: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Root cancellation token; signal handlers cancel this and every
    /// per-run child token follows.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn runs_dir(&self) -> PathBuf {
        self.base_dir.join(RUNS_DIR)
    }

    fn entry(&self, id: &RunId) -> Result<Arc<RunEntry>, Error> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| Error::from_kind(ErrorKind::RunNotFound))
    }

    fn name_in_use(&self, name: &RunName) -> bool {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.values().any(|entry| {
            let run = entry.run.lock().unwrap_or_else(|e| e.into_inner());
            &run.name == name && !run.state.is_terminal()
        })
    }

    fn routing_handle(&self) -> Option<Arc<RoutingProxy>> {
        self.routing.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn ensure_routing(&self) -> Result<Arc<RoutingProxy>, Error> {
        if let Some(routing) = self.routing_handle() {
            return Ok(routing);
        }
        let proxy = RoutingProxy::start(RoutingProxyConfig {
            dir: self.base_dir.join(PROXY_DIR),
            port: 0,
            enable_tls: false,
            enable_oauth_relay: true,
            oauth_hostname: None,
        })
        .await?;
        let proxy = Arc::new(proxy);
        *self.routing.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&proxy));
        Ok(proxy)
    }

    /// Create a run: validate, resolve the image, stand up the per-run
    /// servers, create (but not start) the container, persist metadata.
    pub async fn create(&self, opts: Options) -> Result<Run, Error> {
        let create_started = Utc::now();
        let workspace = resolve_workspace(&opts.workspace)?;

        let name = self.resolve_name(opts.name.as_deref())?;
        let agent_label: AgentLabel = opts
            .agent_label
            .clone()
            .unwrap_or_else(|| name.to_string())
            .parse()?;

        // Grant validation comes first: a run with a bad grant never
        // creates a container.
        let bound = self.bind_credentials(&opts.grants)?;
        let ssh_setup = self.resolve_ssh(&opts.grants)?;
        let lang_servers = self.registry.resolve(&opts.lang_servers)?;
        let relays = self.bind_relays(&opts)?;

        self.runtime
            .ping()
            .await
            .map_err(|err| Error::source(ErrorKind::RuntimeUnavailable, err))?;
        let image = opts
            .image
            .clone()
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string());
        self.runtime
            .ensure_image(&image)
            .await
            .map_err(|err| Error::source(ErrorKind::ImageResolution, err))?;

        let id = RunId::generate();
        let store = Arc::new(Store::open(&self.runs_dir(), &id)?);
        let mut run = Run::new(
            id.clone(),
            name,
            agent_label,
            workspace,
            opts.grants.clone(),
        );

        let mut wiring = Wiring::default();
        if let Err(err) = self
            .wire(
                &mut run,
                &opts,
                &store,
                bound,
                ssh_setup,
                lang_servers,
                relays,
                &image,
                &mut wiring,
            )
            .await
        {
            self.unwire(&wiring, &run).await;
            let _ = run.advance(RunState::Failed);
            run.error = Some(err.to_string());
            let _ = store.write_metadata(&run.metadata());
            store.close();
            return Err(err);
        }

        let (exit_tx, _) = watch::channel(None);
        let entry = Arc::new(RunEntry {
            run: Mutex::new(run.clone()),
            store: Arc::clone(&store),
            intercept: wiring.intercept.take(),
            ssh: wiring.ssh.take(),
            run_cancel: wiring
                .run_cancel
                .take()
                .unwrap_or_else(|| self.cancel.child_token()),
            services: opts.services.clone(),
            routes_registered: AtomicBool::new(wiring.routes_registered),
            started: AtomicBool::new(false),
            exit: exit_tx,
        });

        entry.write_metadata();
        if let Err(err) = store.write_config_snapshot(&opts) {
            warn!(error = %err, "failed to write config snapshot");
        }
        record_span(&store, &id, "run.create", create_started);

        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), entry);
        info!(id = %id, name = %run.name, "run created");
        Ok(run)
    }

    #[allow(clippy::too_many_arguments)]
    async fn wire(
        &self,
        run: &mut Run,
        opts: &Options,
        store: &Arc<Store>,
        bound: Vec<(Grant, Secret<String>)>,
        ssh_setup: Option<(PathBuf, BTreeMap<String, BTreeSet<String>>)>,
        lang_servers: Vec<(String, McpStdioConfig)>,
        relays: Vec<RelaySpec>,
        image: &str,
        w: &mut Wiring,
    ) -> Result<(), Error> {
        let run_cancel = self.cancel.child_token();
        w.run_cancel = Some(run_cancel.clone());

        w.env = opts
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        w.mounts.push(Mount {
            source: run.workspace.clone(),
            target: CONTAINER_WORKSPACE.to_string(),
            read_only: false,
        });

        // Intercepting proxy, when any credential is bound or relayed.
        if !bound.is_empty() || !relays.is_empty() {
            let proxy_dir = store.dir().join(RUN_PROXY_DIR);
            // The cert hits disk here, before the container is created,
            // so the mount source always exists when the task starts.
            let ca = Arc::new(CertificateAuthority::load_or_generate(&proxy_dir)?);

            let injector = Arc::new(CredentialInjector::new(bound));
            let relay_names: Vec<String> = relays.iter().map(|r| r.name.clone()).collect();
            let mcp_relays: Vec<McpRelay> = relays
                .into_iter()
                .map(|spec| {
                    McpRelay::new(
                        &spec.name,
                        &spec.upstream,
                        &spec.header,
                        &spec.grant,
                        spec.token,
                    )
                })
                .collect();

            let log_store = Arc::clone(store);
            let logger: moat_proxy::NetworkLogger = Arc::new(move |record| {
                if let Err(err) = log_store.append_network(&record) {
                    warn!(error = %err, "failed to append network record");
                }
            });

            let bind_all = self.runtime.runtime_type() == RuntimeType::Apple;
            let proxy = InterceptProxy::start(
                bind_all,
                Secret::generate(32),
                Arc::clone(&injector),
                &ca,
                mcp_relays,
                logger,
            )
            .await?;
            injector.spawn_refresh(Arc::clone(&self.vault), run_cancel.child_token());

            let host_address = self.runtime.host_address();
            let proxy_url = proxy.proxy_url(&host_address);
            w.env.push(format!("HTTP_PROXY={proxy_url}"));
            w.env.push(format!("HTTPS_PROXY={proxy_url}"));
            w.env.push(format!("SSL_CERT_FILE={CONTAINER_CA_PATH}"));
            for name in relay_names {
                w.env.push(format!(
                    "MOAT_MCP_{}_URL=http://{host_address}:{}/mcp/{name}",
                    name.to_ascii_uppercase().replace('-', "_"),
                    proxy.port()
                ));
            }
            w.mounts.push(Mount {
                source: proxy_dir.join(moat_proxy::ca::CA_CERT_FILE),
                target: CONTAINER_CA_PATH.to_string(),
                read_only: true,
            });

            run.proxy_port = Some(proxy.port());
            run.proxy_auth_token = Some(proxy.auth_token().clone());
            w.intercept = Some(proxy);
        }

        // Per-run SSH agent.
        if let Some((upstream, allowed)) = ssh_setup {
            let ssh_dir = store.dir().join(RUN_SSH_DIR);
            let audit_store = Arc::clone(store);
            let audit: moat_proxy::SshAuditSink = Arc::new(move |event| {
                let (command, args) = describe_ssh_event(&event);
                let record = ExecEvent {
                    timestamp: Utc::now(),
                    command,
                    args,
                    exit_code: None,
                };
                if let Err(err) = audit_store.append_exec(&record) {
                    warn!(error = %err, "failed to append ssh audit event");
                }
            });
            let proxy = SshAgentProxy::start(&ssh_dir, upstream, allowed, audit).await?;
            w.env.push(format!("SSH_AUTH_SOCK={CONTAINER_SSH_SOCK}"));
            w.mounts.push(Mount {
                source: ssh_dir,
                target: CONTAINER_SSH_DIR.to_string(),
                read_only: false,
            });
            run.ssh_socket_path = Some(proxy.socket_path().to_path_buf());
            w.ssh = Some(proxy);
        }

        if !lang_servers.is_empty() {
            let map: BTreeMap<_, _> = lang_servers.into_iter().collect();
            w.env
                .push(format!("MOAT_MCP_SERVERS={}", serde_json::to_string(&map)?));
        }

        // Published services. Host ports are allocated here so routes can
        // be registered before the container starts; Apple containers are
        // addressed directly, so their registration waits for an IP.
        if !opts.services.is_empty() {
            let mut routes = BTreeMap::new();
            for service in &opts.services {
                let host_port = portpicker::pick_unused_port().ok_or_else(|| {
                    Error::custom(ErrorKind::ProxyBind, "no free host port for service")
                })?;
                w.published_ports.push(PortPublish {
                    container_port: service.container_port,
                    host_port: Some(host_port),
                });
                routes.insert(service.name.clone(), format!("127.0.0.1:{host_port}"));
            }
            if self.runtime.runtime_type() == RuntimeType::Docker {
                let routing = self.ensure_routing().await?;
                routing.register(run.agent_label.as_str(), routes)?;
                w.routes_registered = true;
            }
        }

        let host_aliases = match self.runtime.runtime_type() {
            RuntimeType::Docker => vec!["host.docker.internal:host-gateway".to_string()],
            RuntimeType::Apple => Vec::new(),
        };
        let config = ContainerConfig {
            name: format!("moat_{}", run.id),
            image: image.to_string(),
            cmd: opts.cmd.clone(),
            working_dir: Some(CONTAINER_WORKSPACE.to_string()),
            env: w.env.clone(),
            mounts: w.mounts.clone(),
            published_ports: w.published_ports.clone(),
            host_aliases,
            privileged: false,
            tty: opts.tty,
            stdin_open: opts.interactive,
        };
        let container_id = self.runtime.create_container(&config).await?;
        debug!(id = %run.id, container = %container_id, "container created");
        run.container_id = Some(container_id.clone());
        w.container_id = Some(container_id);
        Ok(())
    }

    /// Reverse teardown of a partially created run.
    async fn unwire(&self, w: &Wiring, run: &Run) {
        if let Some(container_id) = &w.container_id {
            if let Err(err) = self.runtime.remove_container(container_id).await {
                warn!(error = %err, "failed to remove container during rollback");
            }
        }
        if w.routes_registered {
            if let Some(routing) = self.routing_handle() {
                let _ = routing.unregister(run.agent_label.as_str());
            }
        }
        if let Some(proxy) = &w.ssh {
            proxy.stop();
        }
        if let Some(proxy) = &w.intercept {
            proxy.stop();
        }
        if let Some(cancel) = &w.run_cancel {
            cancel.cancel();
        }
    }

    fn resolve_name(&self, requested: Option<&str>) -> Result<RunName, Error> {
        match requested {
            Some(raw) => {
                let name: RunName = raw.parse()?;
                if self.name_in_use(&name) {
                    return Err(Error::from_kind(ErrorKind::NameInUse(name.to_string())));
                }
                Ok(name)
            }
            None => {
                for _ in 0..NAME_GENERATION_ATTEMPTS {
                    let name = RunName::generate();
                    if !self.name_in_use(&name) {
                        return Ok(name);
                    }
                }
                Err(Error::custom(
                    ErrorKind::Internal,
                    "could not generate a unique run name",
                ))
            }
        }
    }

    fn bind_credentials(&self, grants: &[Grant]) -> Result<Vec<(Grant, Secret<String>)>, Error> {
        let mut bound = Vec::new();
        for grant in grants {
            match &grant.provider {
                Provider::Ssh => {}
                provider => {
                    let credential =
                        self.vault.get(provider).map_err(Error::from)?.ok_or_else(|| {
                            Error::from_kind(ErrorKind::MissingCredential(grant.to_string()))
                        })?;
                    bound.push((grant.clone(), credential.token));
                }
            }
        }
        Ok(bound)
    }

    fn resolve_ssh(
        &self,
        grants: &[Grant],
    ) -> Result<Option<(PathBuf, BTreeMap<String, BTreeSet<String>>)>, Error> {
        let hosts: Vec<String> = grants
            .iter()
            .filter_map(|grant| grant.ssh_host.clone())
            .collect();
        if hosts.is_empty() {
            return Ok(None);
        }

        let upstream = std::env::var("SSH_AUTH_SOCK").map_err(|_| {
            Error::custom(
                ErrorKind::MissingCredential("ssh".to_string()),
                "SSH_AUTH_SOCK is not set; start an ssh-agent before granting ssh access",
            )
        })?;
        let allowed = self
            .vault
            .ssh_mappings_for_hosts(&hosts)
            .map_err(Error::from)?;
        if allowed.is_empty() {
            return Err(Error::from_kind(ErrorKind::MissingSshMapping(
                hosts[0].clone(),
            )));
        }
        Ok(Some((PathBuf::from(upstream), allowed)))
    }

    fn bind_relays(&self, opts: &Options) -> Result<Vec<RelaySpec>, Error> {
        let mut relays = Vec::new();
        for spec in &opts.mcp_servers {
            let provider = Provider::Mcp(spec.name.clone());
            let credential = self
                .vault
                .get(&provider)
                .map_err(Error::from)?
                .ok_or_else(|| Error::from_kind(ErrorKind::MissingCredential(provider.name())))?;
            relays.push(RelaySpec {
                name: spec.name.clone(),
                upstream: spec.upstream.clone(),
                header: spec
                    .header
                    .clone()
                    .unwrap_or_else(|| "authorization".to_string()),
                grant: Grant::new(provider),
                token: credential.token,
            });
        }
        Ok(relays)
    }

    /// Start the run's container and attach the background tasks.
    pub async fn start(&self, id: &RunId, stream_logs: bool) -> Result<(), Error> {
        let entry = self.entry(id)?;
        let start_time = Utc::now();
        let container_id = self.begin_start(&entry)?;

        if let Err(err) = self.runtime.start_container(&container_id).await {
            self.fail_start(&entry, &err.to_string());
            return Err(err.into());
        }
        self.finish_start(&entry, id, &container_id, start_time)
            .await?;

        if stream_logs {
            self.spawn_log_streamer(&entry, &container_id);
        }
        self.spawn_wait_watcher(&entry, &container_id);
        Ok(())
    }

    /// Interactive start: the container's TTY is multiplexed through the
    /// caller's streams while output still lands in the run's log file.
    pub async fn start_attached<I, O, E>(
        &self,
        id: &RunId,
        stdin: I,
        stdout: O,
        stderr: E,
    ) -> Result<(), Error>
    where
        I: AsyncRead + Send + Unpin + 'static,
        O: AsyncWrite + Send + Unpin + 'static,
        E: AsyncWrite + Send + Unpin + 'static,
    {
        let entry = self.entry(id)?;
        let start_time = Utc::now();
        let container_id = self.begin_start(&entry)?;

        // Attach before start so no output is lost.
        let streams = match self.runtime.attach_container(&container_id).await {
            Ok(streams) => streams,
            Err(err) => {
                self.fail_start(&entry, &err.to_string());
                return Err(err.into());
            }
        };
        if let Err(err) = self.runtime.start_container(&container_id).await {
            self.fail_start(&entry, &err.to_string());
            return Err(err.into());
        }
        self.finish_start(&entry, id, &container_id, start_time)
            .await?;

        // Input pump.
        let cancel = entry.run_cancel.clone();
        let mut input = streams.input;
        let mut stdin = stdin;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = tokio::io::copy(&mut stdin, &mut input) => {
                    if let Err(err) = result {
                        debug!(error = %err, "stdin pump ended");
                    }
                }
            }
        });

        // Output pump: tee chunks to the caller and to logs.jsonl.
        let store = Arc::clone(&entry.store);
        let cancel = entry.run_cancel.clone();
        let mut output = streams.output;
        let mut stdout = stdout;
        let mut stderr = stderr;
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut buffers = LineBuffers::default();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = output.next() => chunk,
                };
                match chunk {
                    Some(Ok(chunk)) => {
                        let writer: &mut (dyn tokio::io::AsyncWrite + Send + Unpin) =
                            match chunk.stream {
                                LogStream::Stdout => &mut stdout,
                                LogStream::Stderr => &mut stderr,
                            };
                        if writer.write_all(&chunk.bytes).await.is_err() {
                            break;
                        }
                        let _ = writer.flush().await;
                        buffers.push(&store, chunk.stream, &chunk.bytes);
                    }
                    Some(Err(err)) => {
                        debug!(error = %err, "attached output ended");
                        break;
                    }
                    None => break,
                }
            }
            buffers.flush(&store);
        });

        self.spawn_wait_watcher(&entry, &container_id);
        Ok(())
    }

    fn begin_start(&self, entry: &Arc<RunEntry>) -> Result<String, Error> {
        let mut run = entry.run.lock().unwrap_or_else(|e| e.into_inner());
        run.advance(RunState::Starting)?;
        run.container_id
            .clone()
            .ok_or_else(|| Error::custom(ErrorKind::Internal, "run has no bound container"))
    }

    fn fail_start(&self, entry: &Arc<RunEntry>, message: &str) {
        {
            let mut run = entry.run.lock().unwrap_or_else(|e| e.into_inner());
            let _ = run.advance(RunState::Failed);
            run.error = Some(message.to_string());
        }
        entry.write_metadata();
        let _ = entry.exit.send(Some(-1));
    }

    async fn finish_start(
        &self,
        entry: &Arc<RunEntry>,
        id: &RunId,
        container_id: &str,
        start_time: DateTime<Utc>,
    ) -> Result<(), Error> {
        {
            let mut run = entry.run.lock().unwrap_or_else(|e| e.into_inner());
            run.advance(RunState::Running)?;
        }
        entry.started.store(true, Ordering::SeqCst);
        entry.write_metadata();
        record_span(&entry.store, id, "run.start", start_time);

        // Apple containers are addressed directly; their routes resolve
        // only once the task has an IP.
        if !entry.services.is_empty()
            && !entry.routes_registered.load(Ordering::SeqCst)
            && self.runtime.runtime_type() == RuntimeType::Apple
        {
            let mappings = self.runtime.published_ports(container_id).await?;
            let agent_label = {
                let run = entry.run.lock().unwrap_or_else(|e| e.into_inner());
                run.agent_label.clone()
            };
            let mut routes = BTreeMap::new();
            for service in &entry.services {
                if let Some(mapping) = mappings
                    .iter()
                    .find(|m| m.container_port == service.container_port)
                {
                    routes.insert(service.name.clone(), mapping.host_addr.clone());
                }
            }
            if !routes.is_empty() {
                let routing = self.ensure_routing().await?;
                routing.register(agent_label.as_str(), routes)?;
                entry.routes_registered.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn spawn_log_streamer(&self, entry: &Arc<RunEntry>, container_id: &str) {
        let runtime = Arc::clone(&self.runtime);
        let store = Arc::clone(&entry.store);
        let cancel = entry.run_cancel.clone();
        let container_id = container_id.to_string();
        tokio::spawn(async move {
            let mut stream = match runtime.container_logs(&container_id).await {
                Ok(stream) => stream,
                Err(err) => {
                    // A dead log streamer never kills the run.
                    warn!(error = %err, "could not open log stream");
                    return;
                }
            };
            let mut buffers = LineBuffers::default();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = stream.next() => chunk,
                };
                match chunk {
                    Some(Ok(chunk)) => buffers.push(&store, chunk.stream, &chunk.bytes),
                    Some(Err(err)) => {
                        debug!(error = %err, "log stream ended");
                        break;
                    }
                    None => break,
                }
            }
            buffers.flush(&store);
        });
    }

    fn spawn_wait_watcher(&self, entry: &Arc<RunEntry>, container_id: &str) {
        let runtime = Arc::clone(&self.runtime);
        let entry = Arc::clone(entry);
        let container_id = container_id.to_string();
        tokio::spawn(async move {
            match runtime.wait_container(&container_id).await {
                Ok(code) => finalize(&entry, code, None),
                Err(err) => finalize(&entry, -1, Some(err.to_string())),
            }
        });
    }

    /// Block until the container exits; returns its exit code. Cancelling
    /// the manager's root token attempts a best-effort stop.
    pub async fn wait(&self, id: &RunId) -> Result<i64, Error> {
        let entry = self.entry(id)?;
        let mut rx = entry.exit.subscribe();
        loop {
            if let Some(code) = *rx.borrow_and_update() {
                return Ok(code);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = self.stop(id).await;
                    return Err(Error::custom(ErrorKind::Internal, "wait cancelled"));
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::custom(ErrorKind::Internal, "run entry dropped"));
                    }
                }
            }
        }
    }

    /// Idempotent, best-effort stop.
    pub async fn stop(&self, id: &RunId) -> Result<(), Error> {
        let entry = self.entry(id)?;
        let container_id = {
            let mut run = entry.run.lock().unwrap_or_else(|e| e.into_inner());
            match run.state {
                RunState::Stopped | RunState::Failed | RunState::Destroyed => return Ok(()),
                // Nothing is running yet; settle immediately so destroy
                // can fire from Stopped.
                RunState::Created => {
                    run.advance(RunState::Stopped)?;
                    drop(run);
                    entry.write_metadata();
                    let _ = entry.exit.send(Some(0));
                    return Ok(());
                }
                RunState::Running => {
                    run.advance(RunState::Stopping)?;
                }
                RunState::Starting | RunState::Stopping => {}
            }
            run.container_id.clone()
        };
        entry.write_metadata();

        if let Some(container_id) = container_id {
            if let Err(err) = self.runtime.stop_container(&container_id, STOP_TIMEOUT_SECS).await {
                warn!(error = %err, "container stop failed");
            }
        }

        if entry.started.load(Ordering::SeqCst) {
            // The wait watcher records the real exit code; give it a
            // bounded window before settling the state ourselves.
            let mut rx = entry.exit.subscribe();
            let settled = tokio::time::timeout(STOP_FINALIZE_TIMEOUT, async {
                loop {
                    if rx.borrow_and_update().is_some() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        return;
                    }
                }
            })
            .await;
            if settled.is_err() {
                finalize(&entry, 0, None);
            }
        } else {
            finalize(&entry, 0, None);
        }
        Ok(())
    }

    /// Remove the container and per-run servers. Only fires from the
    /// Stopped and Failed states; stop the run first. The storage
    /// directory is preserved as the audit trail unless `purge` is set.
    pub async fn destroy(&self, id: &RunId, purge: bool) -> Result<(), Error> {
        let entry = self.entry(id)?;
        {
            let run = entry.run.lock().unwrap_or_else(|e| e.into_inner());
            if !matches!(run.state, RunState::Stopped | RunState::Failed) {
                return Err(Error::custom(
                    ErrorKind::InvalidOperation,
                    format!("cannot destroy a run in the `{}` state; stop it first", run.state),
                ));
            }
        }
        let destroy_started = Utc::now();

        let (container_id, agent_label) = {
            let run = entry.run.lock().unwrap_or_else(|e| e.into_inner());
            (run.container_id.clone(), run.agent_label.clone())
        };
        if let Some(container_id) = container_id {
            if let Err(err) = self.runtime.remove_container(&container_id).await {
                debug!(error = %err, "container removal failed (may already be gone)");
            }
        }
        if entry.routes_registered.swap(false, Ordering::SeqCst) {
            if let Some(routing) = self.routing_handle() {
                let _ = routing.unregister(agent_label.as_str());
            }
        }
        if let Some(proxy) = &entry.ssh {
            proxy.stop();
        }
        if let Some(proxy) = &entry.intercept {
            proxy.stop();
        }
        entry.run_cancel.cancel();

        {
            let mut run = entry.run.lock().unwrap_or_else(|e| e.into_inner());
            run.advance(RunState::Destroyed)?;
        }
        record_span(&entry.store, id, "run.destroy", destroy_started);

        // Seal the audit trail: final digests land in the metadata.
        let mut metadata = entry
            .run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .metadata();
        metadata.digests = Some(entry.store.digests());
        let _ = entry.store.write_metadata(&metadata);
        entry.store.close();

        if purge {
            if let Err(err) = std::fs::remove_dir_all(entry.store.dir()) {
                warn!(error = %err, "failed to purge run storage");
            }
        }

        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        info!(id = %id, "run destroyed");
        Ok(())
    }

    pub fn get(&self, id: &RunId) -> Option<Run> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|entry| entry.snapshot())
    }

    pub fn list(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|entry| entry.snapshot())
            .collect();
        runs.sort_by_key(|run| run.created_at);
        runs
    }

    pub fn exec_tap(&self, id: &RunId) -> Result<ExecTap, Error> {
        let entry = self.entry(id)?;
        Ok(ExecTap {
            store: Arc::clone(&entry.store),
        })
    }

    /// Storage handle for snapshot reads (logs, network, spans).
    pub fn store(&self, id: &RunId) -> Result<Arc<Store>, Error> {
        Ok(Arc::clone(&self.entry(id)?.store))
    }

    /// Set the SSH target host for subsequent sign requests of a run.
    pub fn set_ssh_target(&self, id: &RunId, host: Option<String>) -> Result<(), Error> {
        let entry = self.entry(id)?;
        match &entry.ssh {
            Some(proxy) => {
                proxy.set_current_host(host);
                Ok(())
            }
            None => Err(Error::custom(
                ErrorKind::InvalidOperation,
                "run has no ssh agent proxy",
            )),
        }
    }

    /// Cancel everything and stop all runs, best-effort.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let ids: Vec<RunId> = self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        for id in ids {
            let _ = self.stop(&id).await;
        }
        if let Some(routing) = self.routing_handle() {
            routing.stop();
        }
        if let Err(err) = self.runtime.close().await {
            debug!(error = %err, "runtime close failed");
        }
    }
}

/// `$HOME/.moat`, the stable on-disk root for runs, credentials, and the
/// shared proxy state.
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".moat")
}

struct RelaySpec {
    name: String,
    upstream: String,
    header: String,
    grant: Grant,
    token: Secret<String>,
}

/// Settle the run into its terminal state exactly once.
fn finalize(entry: &Arc<RunEntry>, exit_code: i64, error: Option<String>) {
    {
        let mut run = entry.run.lock().unwrap_or_else(|e| e.into_inner());
        if run.state.is_terminal() {
            return;
        }
        let next = if error.is_some() {
            RunState::Failed
        } else {
            RunState::Stopped
        };
        if run.advance(next).is_err() {
            // Stopping only settles as Stopped, Starting only as Failed;
            // keep the error text either way.
            if run.advance(RunState::Stopped).is_err() {
                let _ = run.advance(RunState::Failed);
            }
        }
        if let Some(message) = error {
            run.error = Some(message);
        }
    }
    entry.write_metadata();
    let _ = entry.exit.send(Some(exit_code));
}

fn describe_ssh_event(event: &SshAuditEvent) -> (String, Vec<String>) {
    match event {
        SshAuditEvent::List { returned } => ("ssh-agent-list".to_string(), returned.clone()),
        SshAuditEvent::SignAllowed { fingerprint, host } => (
            "ssh-agent-sign".to_string(),
            vec![fingerprint.clone(), host.clone()],
        ),
        SshAuditEvent::SignDenied {
            fingerprint,
            reason,
        } => (
            "ssh-agent-deny".to_string(),
            vec![fingerprint.clone(), reason.clone()],
        ),
    }
}

/// Per-stream line assembly for container output chunks.
#[derive(Default)]
struct LineBuffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl LineBuffers {
    fn push(&mut self, store: &Store, stream: LogStream, bytes: &[u8]) {
        let buffer = match stream {
            LogStream::Stdout => &mut self.stdout,
            LogStream::Stderr => &mut self.stderr,
        };
        buffer.extend_from_slice(bytes);
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1])
                .trim_end_matches('\r')
                .to_string();
            let record = LogLine {
                timestamp: Utc::now(),
                stream,
                line: text,
            };
            if let Err(err) = store.append_log(&record) {
                warn!(error = %err, "failed to append log line");
                return;
            }
        }
    }

    fn flush(&mut self, store: &Store) {
        for (stream, buffer) in [
            (LogStream::Stdout, &mut self.stdout),
            (LogStream::Stderr, &mut self.stderr),
        ] {
            if buffer.is_empty() {
                continue;
            }
            let record = LogLine {
                timestamp: Utc::now(),
                stream,
                line: String::from_utf8_lossy(buffer).to_string(),
            };
            let _ = store.append_log(&record);
            buffer.clear();
        }
    }
}

fn resolve_workspace(path: &Path) -> Result<PathBuf, Error> {
    let resolved = path
        .canonicalize()
        .map_err(|err| Error::source(ErrorKind::InvalidWorkspace, err))?;
    if !resolved.is_dir() {
        return Err(Error::custom(
            ErrorKind::InvalidWorkspace,
            resolved.display().to_string(),
        ));
    }
    Ok(resolved)
}

fn record_span(store: &Store, run_id: &RunId, name: &str, start: DateTime<Utc>) {
    let span = Span {
        trace_id: run_id.as_str().trim_start_matches("run_").to_string(),
        span_id: Alphanumeric.sample_string(&mut rand::thread_rng(), 16),
        parent_id: None,
        name: name.to_string(),
        start_time: start,
        end_time: Utc::now(),
        attributes: BTreeMap::new(),
    };
    if let Err(err) = store.append_span(&span) {
        warn!(error = %err, "failed to append span");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffers_split_and_flush() {
        let dir = tempfile::tempdir().unwrap();
        let id = RunId::generate();
        let store = Store::open(dir.path(), &id).unwrap();

        let mut buffers = LineBuffers::default();
        buffers.push(&store, LogStream::Stdout, b"hello ");
        buffers.push(&store, LogStream::Stdout, b"world\npartial");
        buffers.push(&store, LogStream::Stderr, b"err line\r\n");

        let logs = store.read_logs(0, None).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].line, "hello world");
        assert_eq!(logs[1].line, "err line");

        buffers.flush(&store);
        let logs = store.read_logs(0, None).unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[2].line, "partial");
    }

    #[test]
    fn workspace_must_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();

        assert!(resolve_workspace(dir.path()).is_ok());
        assert!(resolve_workspace(&file).is_err());
        assert!(resolve_workspace(Path::new("/definitely/not/here")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn workspace_symlinks_resolve_to_the_real_path() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let resolved = resolve_workspace(&link).unwrap();
        assert_eq!(resolved, real.canonicalize().unwrap());
    }
}
