use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tracing::debug;

use moat_common::LogStream;

use crate::{
    AttachStreams, ContainerConfig, ContainerSummary, ImageSummary, LogChunk, LogChunkStream,
    PortMapping, Runtime, RuntimeError, RuntimeType,
};

/// Default gateway address of the `container` vmnet network; containers
/// reach the host through it because the CLI provides no host-internal DNS
/// alias.
const DEFAULT_GATEWAY_IP: &str = "192.168.64.1";

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Apple `container` CLI. Tasks are driven by shelling out; containers get
/// their own routable IP, so published ports resolve to the container
/// address rather than a host NAT binding.
pub struct AppleRuntime {
    binary: String,
    gateway_ip: String,
    // container id → ports requested at create; the CLI has no publish
    // concept to ask back.
    published: Mutex<HashMap<String, Vec<u16>>>,
}

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    networks: Vec<NetworkAttachment>,
}

#[derive(Debug, Deserialize)]
struct NetworkAttachment {
    #[serde(default)]
    address: Option<String>,
}

impl AppleRuntime {
    pub fn new() -> Self {
        Self::with_gateway(DEFAULT_GATEWAY_IP)
    }

    pub fn with_gateway(gateway_ip: &str) -> Self {
        Self {
            binary: "container".to_string(),
            gateway_ip: gateway_ip.to_string(),
            published: Mutex::new(HashMap::new()),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, RuntimeError> {
        debug!(binary = %self.binary, ?args, "invoking container cli");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| RuntimeError::Unavailable(err.to_string()))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("not found") || stderr.contains("no such") {
                Err(RuntimeError::NotFound(stderr))
            } else {
                Err(RuntimeError::Api(stderr))
            }
        }
    }

    async fn inspect(&self, id: &str) -> Result<InspectEntry, RuntimeError> {
        let raw = self.run(&["inspect", id]).await?;
        let mut entries: Vec<InspectEntry> =
            serde_json::from_str(&raw).map_err(|err| RuntimeError::Api(err.to_string()))?;
        let first = entries
            .drain(..)
            .next()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()));
        first
    }

    fn container_ip(entry: &InspectEntry) -> Option<String> {
        entry
            .networks
            .first()
            .and_then(|network| network.address.as_ref())
            .map(|address| {
                address
                    .split_once('/')
                    .map(|(ip, _)| ip.to_string())
                    .unwrap_or_else(|| address.clone())
            })
    }
}

impl Default for AppleRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn child_output_stream(child: &mut tokio::process::Child) -> LogChunkStream {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_stream = stdout
        .map(|out| {
            ReaderStream::new(out)
                .map(|item| {
                    item.map(|bytes| LogChunk {
                        stream: LogStream::Stdout,
                        bytes: bytes.to_vec(),
                    })
                    .map_err(RuntimeError::from)
                })
                .boxed()
        })
        .unwrap_or_else(|| futures::stream::empty().boxed());
    let stderr_stream = stderr
        .map(|err| {
            ReaderStream::new(err)
                .map(|item| {
                    item.map(|bytes| LogChunk {
                        stream: LogStream::Stderr,
                        bytes: bytes.to_vec(),
                    })
                    .map_err(RuntimeError::from)
                })
                .boxed()
        })
        .unwrap_or_else(|| futures::stream::empty().boxed());

    Box::pin(futures::stream::select(stdout_stream, stderr_stream))
}

#[async_trait::async_trait]
impl Runtime for AppleRuntime {
    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::Apple
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        // `container system start` is idempotent.
        self.run(&["system", "start"]).await.map(|_| ())
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String, RuntimeError> {
        let mut args: Vec<String> = vec!["create".to_string()];
        args.push("--name".to_string());
        args.push(config.name.clone());
        for mount in &config.mounts {
            let mut volume = format!("{}:{}", mount.source.display(), mount.target);
            if mount.read_only {
                volume.push_str(":ro");
            }
            args.push("--volume".to_string());
            args.push(volume);
        }
        for env in &config.env {
            args.push("--env".to_string());
            args.push(env.clone());
        }
        if let Some(workdir) = &config.working_dir {
            args.push("--workdir".to_string());
            args.push(workdir.clone());
        }
        if config.tty {
            args.push("--tty".to_string());
        }
        if config.stdin_open {
            args.push("--interactive".to_string());
        }
        args.push(config.image.clone());
        args.extend(config.cmd.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.run(&arg_refs).await?;
        let id = if id.is_empty() {
            config.name.clone()
        } else {
            id
        };

        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id.clone(),
                config
                    .published_ports
                    .iter()
                    .map(|publish| publish.container_port)
                    .collect(),
            );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        match self.run(&["start", id]).await {
            Ok(_) => Ok(()),
            Err(RuntimeError::Api(message)) if message.contains("already running") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<(), RuntimeError> {
        let timeout = timeout_secs.to_string();
        match self.run(&["stop", "--time", &timeout, id]).await {
            Ok(_) => Ok(()),
            Err(RuntimeError::Api(message)) if message.contains("not running") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(&["delete", "--force", id]).await?;
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        // The CLI has no blocking wait and does not report exit codes;
        // poll until the task leaves the running state.
        loop {
            let entry = self.inspect(id).await?;
            match entry.status.as_deref() {
                Some("running") | Some("created") | Some("starting") => {
                    tokio::time::sleep(WAIT_POLL_INTERVAL).await;
                }
                _ => return Ok(0),
            }
        }
    }

    async fn container_logs(&self, id: &str) -> Result<LogChunkStream, RuntimeError> {
        let mut child = Command::new(&self.binary)
            .args(["logs", "--follow", id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| RuntimeError::Unavailable(err.to_string()))?;
        Ok(child_output_stream(&mut child))
    }

    async fn attach_container(&self, id: &str) -> Result<AttachStreams, RuntimeError> {
        // start --attach both starts the task and wires its TTY; the
        // manager's follow-up start call is absorbed as already-running.
        let mut child = Command::new(&self.binary)
            .args(["start", "--attach", "--interactive", id])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| RuntimeError::Unavailable(err.to_string()))?;

        let input = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::Api("attach stdin unavailable".to_string()))?;
        let output = child_output_stream(&mut child);
        Ok(AttachStreams {
            output,
            input: Box::pin(input),
        })
    }

    async fn published_ports(&self, id: &str) -> Result<Vec<PortMapping>, RuntimeError> {
        let ports = self
            .published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .unwrap_or_default();
        if ports.is_empty() {
            return Ok(Vec::new());
        }

        let entry = self.inspect(id).await?;
        let Some(ip) = Self::container_ip(&entry) else {
            return Ok(Vec::new());
        };
        Ok(ports
            .into_iter()
            .map(|container_port| PortMapping {
                container_port,
                host_addr: format!("{ip}:{container_port}"),
            })
            .collect())
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, RuntimeError> {
        let raw = self.run(&["image", "list", "--format", "json"]).await?;
        let entries: Vec<serde_json::Value> =
            serde_json::from_str(&raw).unwrap_or_default();
        Ok(entries
            .into_iter()
            .map(|entry| {
                let reference = entry
                    .get("reference")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                ImageSummary {
                    id: entry
                        .get("digest")
                        .and_then(|v| v.as_str())
                        .unwrap_or(&reference)
                        .to_string(),
                    tags: vec![reference],
                }
            })
            .collect())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let raw = self.run(&["list", "--all", "--format", "json"]).await?;
        let entries: Vec<serde_json::Value> =
            serde_json::from_str(&raw).unwrap_or_default();
        Ok(entries
            .into_iter()
            .map(|entry| ContainerSummary {
                id: entry
                    .get("configuration")
                    .and_then(|c| c.get("id"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                names: Vec::new(),
                image: entry
                    .get("configuration")
                    .and_then(|c| c.get("image"))
                    .and_then(|i| i.get("reference"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                state: entry
                    .get("status")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect())
    }

    async fn remove_image(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(&["image", "delete", name]).await.map(|_| ())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        let present = self
            .list_images()
            .await?
            .iter()
            .any(|summary| summary.tags.iter().any(|tag| tag == image));
        if present {
            return Ok(());
        }
        self.run(&["image", "pull", image]).await.map(|_| ())
    }

    fn host_address(&self) -> String {
        self.gateway_ip.clone()
    }

    fn supports_host_network(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_ip_strips_the_prefix_length() {
        let entry = InspectEntry {
            status: Some("running".to_string()),
            networks: vec![NetworkAttachment {
                address: Some("192.168.64.7/24".to_string()),
            }],
        };
        assert_eq!(
            AppleRuntime::container_ip(&entry).as_deref(),
            Some("192.168.64.7")
        );
    }

    #[test]
    fn host_address_is_the_gateway() {
        let runtime = AppleRuntime::with_gateway("192.168.65.1");
        assert_eq!(runtime.host_address(), "192.168.65.1");
        assert!(!runtime.supports_host_network());
    }
}
