use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use http::header::HOST;
use http::{StatusCode, Uri};
use hyper::client::HttpConnector;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Client, Request, Response};
use once_cell::sync::Lazy;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use moat_common::{Error, ErrorKind};

use crate::ca::CertificateAuthority;

pub mod lock;
pub mod oauth;
pub mod routes;

pub use lock::{Election, LockInfo, ProxyLock};
pub use oauth::OAuthRelay;
pub use routes::RouteTable;

static BACKEND_CLIENT: Lazy<Client<HttpConnector>> = Lazy::new(Client::new);

const LOCALHOST_SUFFIX: &str = ".localhost";
const DAEMON_LOG: &str = "daemon.log";

/// Owner-side activity log in the shared proxy dir.
fn log_daemon_line(dir: &std::path::Path, message: &str) {
    use std::io::Write;
    let line = format!("{} {message}\n", chrono::Utc::now().to_rfc3339());
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(DAEMON_LOG))
    {
        let _ = file.write_all(line.as_bytes());
    }
}

#[derive(Clone, Debug)]
pub struct RoutingProxyConfig {
    /// The shared proxy dir (`~/.moat/proxy`): lock file, route table, CA.
    pub dir: PathBuf,
    /// 0 lets the OS choose.
    pub port: u16,
    pub enable_tls: bool,
    pub enable_oauth_relay: bool,
    pub oauth_hostname: Option<String>,
}

struct RouterContext {
    routes: Arc<RouteTable>,
    oauth: Option<OAuthRelay>,
}

/// The shared hostname-routing reverse proxy.
///
/// One instance per machine owns the port and the lock file; later
/// starters adopt it. `[service.]agent.localhost[:port]` maps through the
/// route table; TLS and plain HTTP are told apart by the first byte.
#[derive(Debug)]
pub struct RoutingProxy {
    port: u16,
    owned: bool,
    dir: PathBuf,
    routes: Arc<RouteTable>,
    lock: ProxyLock,
    cancel: CancellationToken,
}

impl RoutingProxy {
    pub async fn start(config: RoutingProxyConfig) -> Result<Self, Error> {
        std::fs::create_dir_all(&config.dir)?;
        let lock = ProxyLock::new(&config.dir);
        let routes = Arc::new(RouteTable::load(&config.dir)?);

        // The guard spans probe and bind so two starters cannot both
        // conclude they own the port.
        let guard = lock.guard()?;
        match lock.elect_locked(&guard, config.port)? {
            Election::Adopt(port) => {
                drop(guard);
                Ok(Self {
                    port,
                    owned: false,
                    dir: config.dir.clone(),
                    routes,
                    lock,
                    cancel: CancellationToken::new(),
                })
            }
            Election::Bind => {
                let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, config.port))
                    .await
                    .map_err(|err| Error::source(ErrorKind::ProxyBind, err))?;
                let port = listener
                    .local_addr()
                    .map_err(|err| Error::source(ErrorKind::ProxyBind, err))?
                    .port();
                lock.write_locked(&guard, port)?;
                drop(guard);

                let tls = if config.enable_tls {
                    let ca = Arc::new(CertificateAuthority::load_or_generate(&config.dir)?);
                    Some(TlsAcceptor::from(ca.server_config()))
                } else {
                    None
                };
                let ctx = Arc::new(RouterContext {
                    routes: Arc::clone(&routes),
                    oauth: config
                        .enable_oauth_relay
                        .then(|| OAuthRelay::new(config.oauth_hostname.clone(), port)),
                });

                let cancel = CancellationToken::new();
                let accept_cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let stream = tokio::select! {
                            _ = accept_cancel.cancelled() => break,
                            accepted = listener.accept() => match accepted {
                                Ok((stream, _)) => stream,
                                Err(err) => {
                                    warn!(error = %err, "routing accept failed");
                                    continue;
                                }
                            },
                        };
                        let ctx = Arc::clone(&ctx);
                        let tls = tls.clone();
                        tokio::spawn(async move {
                            if let Err(err) = serve_peeked(ctx, tls, stream).await {
                                debug!(error = %err, "routing connection ended");
                            }
                        });
                    }
                });

                log_daemon_line(&config.dir, &format!("listening on port {port}"));
                Ok(Self {
                    port,
                    owned: true,
                    dir: config.dir,
                    routes,
                    lock,
                    cancel,
                })
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_owner(&self) -> bool {
        self.owned
    }

    /// Register an agent's services: service name → `host:port` backend.
    pub fn register(&self, agent: &str, services: BTreeMap<String, String>) -> Result<(), Error> {
        self.routes.add(agent, services)
    }

    pub fn unregister(&self, agent: &str) -> Result<(), Error> {
        self.routes.remove(agent)
    }

    /// Stop is a no-op unless this instance owns the lock.
    pub fn stop(&self) {
        if self.owned && !self.cancel.is_cancelled() {
            self.cancel.cancel();
            self.lock.release();
            log_daemon_line(&self.dir, "stopped");
        }
    }
}

impl Drop for RoutingProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Peek one byte: 0x16 is a TLS ClientHello, anything else is HTTP.
async fn serve_peeked(
    ctx: Arc<RouterContext>,
    tls: Option<TlsAcceptor>,
    stream: TcpStream,
) -> std::io::Result<()> {
    let mut first = [0u8; 1];
    let n = stream.peek(&mut first).await?;

    let is_tls = n == 1 && first[0] == 0x16;
    match (is_tls, tls) {
        (true, Some(acceptor)) => {
            let tls_stream = acceptor.accept(stream).await?;
            let service = service_fn(move |req| {
                let ctx = Arc::clone(&ctx);
                async move { Ok::<_, std::convert::Infallible>(route(ctx, req, true).await) }
            });
            Http::new()
                .serve_connection(tls_stream, service)
                .await
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
        }
        _ => {
            let service = service_fn(move |req| {
                let ctx = Arc::clone(&ctx);
                async move { Ok::<_, std::convert::Infallible>(route(ctx, req, false).await) }
            });
            Http::new()
                .serve_connection(stream, service)
                .await
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
        }
    }
}

fn host_of(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
}

fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "error": message }).to_string(),
        ))
        .unwrap_or_default()
}

async fn route(ctx: Arc<RouterContext>, req: Request<Body>, https: bool) -> Response<Body> {
    let Some(host) = host_of(&req) else {
        return json_error(StatusCode::BAD_REQUEST, "request has no host");
    };
    let hostname = host.split(':').next().unwrap_or(&host);

    if let Some(oauth) = &ctx.oauth {
        if hostname == oauth.hostname() {
            return oauth.handle(&req);
        }
    }

    let Some(prefix) = hostname.strip_suffix(LOCALHOST_SUFFIX) else {
        return json_error(StatusCode::NOT_FOUND, "unknown host");
    };
    let (service, agent) = match prefix.split_once('.') {
        Some((service, agent)) => (Some(service), agent),
        None => (None, prefix),
    };

    let backend = match ctx.routes.lookup(agent, service) {
        Some(backend) => Some(backend),
        None => {
            // Another process may have registered since we loaded.
            let _ = ctx.routes.reload();
            ctx.routes.lookup(agent, service)
        }
    };
    let Some(backend) = backend else {
        return json_error(StatusCode::NOT_FOUND, "unknown agent");
    };

    forward_to_backend(req, &backend, https).await
}

async fn forward_to_backend(req: Request<Body>, backend: &str, https: bool) -> Response<Body> {
    let (mut parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = match format!("http://{backend}{path_and_query}").parse() {
        Ok(uri) => uri,
        Err(_) => return json_error(StatusCode::BAD_GATEWAY, "invalid backend address"),
    };
    parts.uri = uri;
    parts.version = http::Version::HTTP_11;
    parts.headers.insert(
        "x-forwarded-proto",
        if https {
            http::HeaderValue::from_static("https")
        } else {
            http::HeaderValue::from_static("http")
        },
    );

    match BACKEND_CLIENT.request(Request::from_parts(parts, body)).await {
        Ok(response) => response,
        Err(err) => {
            debug!(error = %err, backend, "backend unreachable");
            json_error(StatusCode::BAD_GATEWAY, "backend unreachable")
        }
    }
}
