use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use moat_common::audit::sha256_fingerprint;
use moat_common::{Error, ErrorKind};

pub const AGENT_SOCKET_NAME: &str = "agent.sock";

/// OpenSSH agent protocol message numbers. Only RequestIdentities and
/// SignRequest are honored; everything that mutates agent state is
/// rejected.
mod msg {
    pub const FAILURE: u8 = 5;
    pub const SUCCESS: u8 = 6;
    pub const REQUEST_IDENTITIES: u8 = 11;
    pub const IDENTITIES_ANSWER: u8 = 12;
    pub const SIGN_REQUEST: u8 = 13;
    pub const SIGN_RESPONSE: u8 = 14;
    pub const EXTENSION: u8 = 27;
}

/// Wire codec for the agent protocol: u32 length-prefixed frames carrying
/// `string`-encoded fields.
pub mod wire {
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    use super::SshIdentity;

    const MAX_FRAME: u32 = 1024 * 1024;

    pub async fn read_frame<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> std::io::Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        }
        let len = u32::from_be_bytes(len_buf);
        if len == 0 || len > MAX_FRAME {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "agent frame length out of range",
            ));
        }
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }

    pub async fn write_frame<W: AsyncWrite + Unpin>(
        writer: &mut W,
        payload: &[u8],
    ) -> std::io::Result<()> {
        writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
        writer.write_all(payload).await?;
        writer.flush().await
    }

    pub struct Reader<'a> {
        buf: &'a [u8],
        pos: usize,
    }

    impl<'a> Reader<'a> {
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, pos: 0 }
        }

        pub fn u8(&mut self) -> Option<u8> {
            let byte = *self.buf.get(self.pos)?;
            self.pos += 1;
            Some(byte)
        }

        pub fn u32(&mut self) -> Option<u32> {
            let bytes = self.buf.get(self.pos..self.pos + 4)?;
            self.pos += 4;
            Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }

        pub fn string(&mut self) -> Option<&'a [u8]> {
            let len = self.u32()? as usize;
            let bytes = self.buf.get(self.pos..self.pos + len)?;
            self.pos += len;
            Some(bytes)
        }
    }

    pub fn put_string(out: &mut Vec<u8>, bytes: &[u8]) {
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(bytes);
    }

    pub fn encode_identities_answer(identities: &[SshIdentity]) -> Vec<u8> {
        let mut payload = vec![super::msg::IDENTITIES_ANSWER];
        payload.extend_from_slice(&(identities.len() as u32).to_be_bytes());
        for identity in identities {
            put_string(&mut payload, &identity.blob);
            put_string(&mut payload, identity.comment.as_bytes());
        }
        payload
    }

    pub fn parse_identities_answer(payload: &[u8]) -> Option<Vec<SshIdentity>> {
        let mut reader = Reader::new(payload);
        if reader.u8()? != super::msg::IDENTITIES_ANSWER {
            return None;
        }
        let count = reader.u32()?;
        let mut identities = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let blob = reader.string()?.to_vec();
            let comment = String::from_utf8_lossy(reader.string()?).into_owned();
            identities.push(SshIdentity { blob, comment });
        }
        Some(identities)
    }

    /// Key blob of a sign request. The data and flags stay opaque; the
    /// proxy forwards the original frame once the policy passes.
    pub fn parse_sign_request_blob(payload: &[u8]) -> Option<Vec<u8>> {
        let mut reader = Reader::new(payload);
        if reader.u8()? != super::msg::SIGN_REQUEST {
            return None;
        }
        Some(reader.string()?.to_vec())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn identities_round_trip() {
            let identities = vec![
                SshIdentity {
                    blob: vec![1, 2, 3],
                    comment: "work".to_string(),
                },
                SshIdentity {
                    blob: vec![9, 9],
                    comment: "".to_string(),
                },
            ];
            let payload = encode_identities_answer(&identities);
            let parsed = parse_identities_answer(&payload).unwrap();
            assert_eq!(parsed.len(), 2);
            assert_eq!(parsed[0].blob, vec![1, 2, 3]);
            assert_eq!(parsed[0].comment, "work");
        }

        #[test]
        fn sign_request_blob_is_extracted() {
            let mut payload = vec![super::super::msg::SIGN_REQUEST];
            put_string(&mut payload, b"keyblob");
            put_string(&mut payload, b"data-to-sign");
            payload.extend_from_slice(&0u32.to_be_bytes());
            assert_eq!(parse_sign_request_blob(&payload).unwrap(), b"keyblob");
        }

        #[test]
        fn truncated_payloads_parse_to_none() {
            assert!(parse_identities_answer(&[super::super::msg::IDENTITIES_ANSWER, 0, 0]).is_none());
            assert!(parse_sign_request_blob(&[super::super::msg::SIGN_REQUEST, 0]).is_none());
        }
    }
}

/// A public key offered by the upstream agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshIdentity {
    /// SSH wire-format key blob.
    pub blob: Vec<u8>,
    pub comment: String,
}

impl SshIdentity {
    pub fn fingerprint(&self) -> String {
        sha256_fingerprint(&self.blob)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SshAuditEvent {
    List { returned: Vec<String> },
    SignAllowed { fingerprint: String, host: String },
    SignDenied { fingerprint: String, reason: String },
}

pub type SshAuditSink = Arc<dyn Fn(SshAuditEvent) + Send + Sync>;

struct AgentContext {
    upstream: PathBuf,
    /// fingerprint → hosts the key may sign for.
    allowed: BTreeMap<String, BTreeSet<String>>,
    current_host: RwLock<Option<String>>,
    audit: SshAuditSink,
}

/// Filtering agent proxy on a per-run unix socket.
///
/// `List` returns only allow-listed identities; `Sign` enforces the
/// per-host policy before the request ever reaches the user's agent.
pub struct SshAgentProxy {
    socket_path: PathBuf,
    ctx: Arc<AgentContext>,
    cancel: CancellationToken,
}

impl SshAgentProxy {
    /// Bind `agent.sock` inside `socket_dir` (created 0700; the socket
    /// itself is 0666 so the container user can reach it) and start
    /// serving.
    pub async fn start(
        socket_dir: &Path,
        upstream: PathBuf,
        allowed: BTreeMap<String, BTreeSet<String>>,
        audit: SshAuditSink,
    ) -> Result<Self, Error> {
        std::fs::create_dir_all(socket_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let socket_path = socket_dir.join(AGENT_SOCKET_NAME);
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)
            .map_err(|err| Error::source(ErrorKind::ProxyBind, err))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o666))?;
        }

        let ctx = Arc::new(AgentContext {
            upstream,
            allowed,
            current_host: RwLock::new(None),
            audit,
        });

        let cancel = CancellationToken::new();
        let accept_cancel = cancel.clone();
        let accept_ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(err) => {
                            warn!(error = %err, "ssh agent accept failed");
                            continue;
                        }
                    },
                };
                let ctx = Arc::clone(&accept_ctx);
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(ctx, stream).await {
                        debug!(error = %err, "ssh agent connection ended");
                    }
                });
            }
        });

        Ok(Self {
            socket_path,
            ctx,
            cancel,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Set the host the next sign requests are on behalf of. With no
    /// current host, keys allowed for exactly one host fall back to it.
    pub fn set_current_host(&self, host: Option<String>) {
        *self
            .ctx
            .current_host
            .write()
            .unwrap_or_else(|e| e.into_inner()) = host;
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SshAgentProxy {
    fn drop(&mut self) {
        self.cancel.cancel();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn serve_connection(ctx: Arc<AgentContext>, mut stream: UnixStream) -> std::io::Result<()> {
    while let Some(payload) = wire::read_frame(&mut stream).await? {
        let response = match payload.first().copied() {
            Some(msg::REQUEST_IDENTITIES) => handle_list(&ctx).await,
            Some(msg::SIGN_REQUEST) => handle_sign(&ctx, &payload).await,
            // session-bind@openssh.com and friends: acknowledged, not
            // bound.
            Some(msg::EXTENSION) => vec![msg::SUCCESS],
            // Add, Remove, Lock, Unlock and anything else.
            _ => vec![msg::FAILURE],
        };
        wire::write_frame(&mut stream, &response).await?;
    }
    Ok(())
}

async fn upstream_roundtrip(upstream: &Path, request: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut stream = UnixStream::connect(upstream).await?;
    wire::write_frame(&mut stream, request).await?;
    wire::read_frame(&mut stream)
        .await?
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "agent closed"))
}

async fn handle_list(ctx: &AgentContext) -> Vec<u8> {
    let answer = match upstream_roundtrip(&ctx.upstream, &[msg::REQUEST_IDENTITIES]).await {
        Ok(answer) => answer,
        Err(err) => {
            warn!(error = %err, "upstream agent unreachable");
            return vec![msg::FAILURE];
        }
    };
    let Some(identities) = wire::parse_identities_answer(&answer) else {
        return vec![msg::FAILURE];
    };

    let filtered: Vec<SshIdentity> = identities
        .into_iter()
        .filter(|identity| ctx.allowed.contains_key(&identity.fingerprint()))
        .collect();
    (ctx.audit)(SshAuditEvent::List {
        returned: filtered.iter().map(SshIdentity::fingerprint).collect(),
    });
    wire::encode_identities_answer(&filtered)
}

async fn handle_sign(ctx: &AgentContext, payload: &[u8]) -> Vec<u8> {
    let Some(blob) = wire::parse_sign_request_blob(payload) else {
        return vec![msg::FAILURE];
    };
    let fingerprint = sha256_fingerprint(&blob);

    let Some(hosts) = ctx.allowed.get(&fingerprint) else {
        (ctx.audit)(SshAuditEvent::SignDenied {
            fingerprint,
            reason: "key not in allow list".to_string(),
        });
        return vec![msg::FAILURE];
    };

    let current = ctx
        .current_host
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    let host = match current {
        Some(host) if hosts.contains(&host) => host,
        Some(host) => {
            (ctx.audit)(SshAuditEvent::SignDenied {
                fingerprint,
                reason: format!("key not allowed for host `{host}`"),
            });
            return vec![msg::FAILURE];
        }
        // Non-git SSH has no host signal; a key scoped to exactly one
        // host may still sign.
        None if hosts.len() == 1 => hosts.iter().next().cloned().unwrap_or_default(),
        None => {
            (ctx.audit)(SshAuditEvent::SignDenied {
                fingerprint,
                reason: "no current host and key allowed for multiple hosts".to_string(),
            });
            return vec![msg::FAILURE];
        }
    };

    match upstream_roundtrip(&ctx.upstream, payload).await {
        Ok(response) => {
            (ctx.audit)(SshAuditEvent::SignAllowed { fingerprint, host });
            response
        }
        Err(err) => {
            warn!(error = %err, "upstream agent unreachable");
            vec![msg::FAILURE]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn identity(blob: &[u8], comment: &str) -> SshIdentity {
        SshIdentity {
            blob: blob.to_vec(),
            comment: comment.to_string(),
        }
    }

    /// A fake upstream agent holding two identities. Signs anything with
    /// a fixed marker signature.
    async fn spawn_upstream(dir: &Path) -> PathBuf {
        let path = dir.join("upstream.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    while let Ok(Some(payload)) = wire::read_frame(&mut stream).await {
                        let response = match payload.first().copied() {
                            Some(msg::REQUEST_IDENTITIES) => wire::encode_identities_answer(&[
                                identity(b"key-one", "one"),
                                identity(b"key-two", "two"),
                            ]),
                            Some(msg::SIGN_REQUEST) => {
                                let mut out = vec![msg::SIGN_RESPONSE];
                                wire::put_string(&mut out, b"signature-bytes");
                                out
                            }
                            _ => vec![msg::FAILURE],
                        };
                        if wire::write_frame(&mut stream, &response).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        path
    }

    async fn request(socket: &Path, payload: &[u8]) -> Vec<u8> {
        let mut stream = UnixStream::connect(socket).await.unwrap();
        wire::write_frame(&mut stream, payload).await.unwrap();
        wire::read_frame(&mut stream).await.unwrap().unwrap()
    }

    fn sign_request(blob: &[u8]) -> Vec<u8> {
        let mut payload = vec![msg::SIGN_REQUEST];
        wire::put_string(&mut payload, blob);
        wire::put_string(&mut payload, b"data");
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload
    }

    struct Harness {
        proxy: SshAgentProxy,
        events: Arc<Mutex<Vec<SshAuditEvent>>>,
        _dir: tempfile::TempDir,
    }

    async fn harness(allowed_hosts: &[(&[u8], &[&str])]) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let upstream = spawn_upstream(dir.path()).await;

        let mut allowed = BTreeMap::new();
        for (blob, hosts) in allowed_hosts {
            allowed.insert(
                sha256_fingerprint(blob),
                hosts.iter().map(|h| h.to_string()).collect::<BTreeSet<_>>(),
            );
        }

        let events: Arc<Mutex<Vec<SshAuditEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let proxy = SshAgentProxy::start(
            &dir.path().join("run"),
            upstream,
            allowed,
            Arc::new(move |event| sink.lock().unwrap().push(event)),
        )
        .await
        .unwrap();

        Harness {
            proxy,
            events,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn list_is_filtered_to_the_allow_list() {
        let h = harness(&[(b"key-one", &["github.com"])]).await;
        let answer = request(h.proxy.socket_path(), &[msg::REQUEST_IDENTITIES]).await;
        let identities = wire::parse_identities_answer(&answer).unwrap();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].comment, "one");

        let events = h.events.lock().unwrap();
        assert!(matches!(&events[0], SshAuditEvent::List { returned } if returned.len() == 1));
    }

    #[tokio::test]
    async fn sign_with_matching_host_is_forwarded() {
        let h = harness(&[(b"key-one", &["github.com", "gitlab.com"])]).await;
        h.proxy.set_current_host(Some("github.com".to_string()));

        let response = request(h.proxy.socket_path(), &sign_request(b"key-one")).await;
        assert_ne!(response[0], msg::FAILURE);

        let events = h.events.lock().unwrap();
        assert!(matches!(
            &events[0],
            SshAuditEvent::SignAllowed { host, .. } if host == "github.com"
        ));
    }

    #[tokio::test]
    async fn sign_for_unknown_key_is_denied() {
        let h = harness(&[(b"key-one", &["github.com"])]).await;
        let response = request(h.proxy.socket_path(), &sign_request(b"key-two")).await;
        assert_eq!(response, vec![msg::FAILURE]);

        let events = h.events.lock().unwrap();
        assert!(matches!(&events[0], SshAuditEvent::SignDenied { .. }));
    }

    #[tokio::test]
    async fn single_host_key_signs_without_a_current_host() {
        let h = harness(&[(b"key-one", &["github.com"])]).await;
        let response = request(h.proxy.socket_path(), &sign_request(b"key-one")).await;
        assert_ne!(response[0], msg::FAILURE);
    }

    #[tokio::test]
    async fn multi_host_key_without_current_host_is_denied() {
        let h = harness(&[(b"key-one", &["github.com", "gitlab.com"])]).await;
        let response = request(h.proxy.socket_path(), &sign_request(b"key-one")).await;
        assert_eq!(response, vec![msg::FAILURE]);
    }

    #[tokio::test]
    async fn mutating_messages_are_rejected() {
        let h = harness(&[]).await;
        for msg_type in [17u8, 18, 19, 22, 23] {
            let response = request(h.proxy.socket_path(), &[msg_type]).await;
            assert_eq!(response, vec![msg::FAILURE], "message {msg_type}");
        }
    }

    #[tokio::test]
    async fn extensions_are_acknowledged() {
        let h = harness(&[]).await;
        let mut payload = vec![msg::EXTENSION];
        wire::put_string(&mut payload, b"session-bind@openssh.com");
        let response = request(h.proxy.socket_path(), &payload).await;
        assert_eq!(response, vec![msg::SUCCESS]);
    }

    #[tokio::test]
    async fn raw_stream_framing_survives_partial_reads() {
        // Write the frame byte-by-byte; the proxy must still parse it.
        let h = harness(&[(b"key-one", &["github.com"])]).await;
        let mut stream = UnixStream::connect(h.proxy.socket_path()).await.unwrap();
        let mut framed = Vec::new();
        framed.extend_from_slice(&1u32.to_be_bytes());
        framed.push(msg::REQUEST_IDENTITIES);
        for byte in framed {
            stream.write_all(&[byte]).await.unwrap();
            tokio::task::yield_now().await;
        }
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(payload[0], msg::IDENTITIES_ANSWER);
    }
}
