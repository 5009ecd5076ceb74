//! Fixture containers
//!
//! A [`ContainerInstance`] owns one running container. The SSH port is
//! published on an ephemeral host port and the instance removes its
//! container when dropped, unless [`ContainerInstance::keep`] hands it off.

use crate::builder::BuiltImage;
use crate::error::{FixtureError, Result};
use command_executor::backends::local::LocalLauncher;
use command_executor::{Command, Launcher, Target};
use futures::AsyncReadExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Label put on every fixture container
pub const FIXTURE_LABEL: &str = "ssh-fixtures.fixture";

const BANNER_TIMEOUT: Duration = Duration::from_secs(2);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Where a container's SSH port can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host address
    pub host: String,
    /// Published port
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How to start a fixture container
#[derive(Debug, Clone)]
pub struct ContainerOptions {
    /// Container name
    pub name: String,
    /// Host address the SSH port is published on
    pub bind_address: String,
    /// Port sshd listens on inside the container
    pub container_port: u16,
    /// Fixture name, stored as a label
    pub fixture: String,
}

/// A running fixture container
#[derive(Debug)]
pub struct ContainerInstance {
    id: String,
    name: String,
    image: String,
    endpoint: Endpoint,
    removed: bool,
}

impl ContainerInstance {
    /// Start a container from `image` with the SSH port published
    pub async fn start(image: &BuiltImage, options: &ContainerOptions) -> Result<Self> {
        // Leftover from an interrupted run
        let _ = docker(["rm", "-f", options.name.as_str()]).await;

        let publish = format!("{}::{}", options.bind_address, options.container_port);
        let label = format!("{}={}", FIXTURE_LABEL, options.fixture);
        let result = docker([
            "run",
            "-d",
            "--name",
            options.name.as_str(),
            "--label",
            label.as_str(),
            "-p",
            publish.as_str(),
            image.tag.as_str(),
        ])
        .await?;

        if !result.success() {
            return Err(FixtureError::container(format!(
                "docker run {} failed: {}",
                image.tag,
                result.output.trim()
            )));
        }

        let id = result
            .output
            .lines()
            .last()
            .unwrap_or_default()
            .trim()
            .to_string();
        info!(container = %options.name, image = %image.tag, "Started container {}", short_id(&id));

        // From here on Drop removes the container on any early return
        let mut instance = ContainerInstance {
            id,
            name: options.name.clone(),
            image: image.tag.clone(),
            endpoint: Endpoint {
                host: connect_host(&options.bind_address),
                port: 0,
            },
            removed: false,
        };

        let port_spec = format!("{}/tcp", options.container_port);
        let result = docker(["port", instance.id.as_str(), port_spec.as_str()]).await?;
        let port = result
            .success()
            .then(|| parse_published_port(&result.output))
            .flatten()
            .ok_or_else(|| {
                FixtureError::container(format!(
                    "Container {} does not publish port {}: {}",
                    instance.name,
                    options.container_port,
                    result.output.trim()
                ))
            })?;
        instance.endpoint.port = port;
        debug!(container = %instance.name, endpoint = %instance.endpoint, "Published SSH port");

        Ok(instance)
    }

    /// Wait until the endpoint answers with an SSH banner
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            match read_banner(&self.endpoint).await {
                Ok(banner) if banner.starts_with("SSH-") => {
                    info!(container = %self.name, endpoint = %self.endpoint, banner = %banner.trim(), "SSH server ready");
                    return Ok(());
                }
                Ok(banner) => debug!(container = %self.name, "Unexpected banner {:?}", banner),
                Err(e) => debug!(container = %self.name, "SSH not ready yet: {}", e),
            }

            if !self.is_running().await? {
                return Err(FixtureError::container(format!(
                    "Container {} exited before sshd became ready:\n{}",
                    self.name,
                    self.logs_tail(20).await
                )));
            }
            if Instant::now() >= deadline {
                return Err(FixtureError::container(format!(
                    "sshd in {} did not answer on {} within {}s",
                    self.name,
                    self.endpoint,
                    timeout.as_secs()
                )));
            }

            smol::Timer::after(READY_POLL_INTERVAL).await;
        }
    }

    /// Container id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Container name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Image the container runs
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Published SSH endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn is_running(&self) -> Result<bool> {
        let result = docker(["inspect", "-f", "{{.State.Running}}", self.id.as_str()]).await?;
        Ok(result.success() && result.output.trim() == "true")
    }

    async fn logs_tail(&self, lines: usize) -> String {
        let lines = lines.to_string();
        match docker(["logs", "--tail", lines.as_str(), self.id.as_str()]).await {
            Ok(result) => result.output,
            Err(e) => format!("(no logs: {})", e),
        }
    }

    /// Stop and remove the container
    pub async fn remove(mut self) -> Result<()> {
        self.removed = true;
        let result = docker(["rm", "-f", self.id.as_str()]).await?;
        if result.success() {
            info!(container = %self.name, "Removed container");
        } else {
            warn!(container = %self.name, "Failed to remove container: {}", result.output.trim());
        }
        Ok(())
    }

    /// Leave the container running after this instance is dropped
    pub fn keep(mut self) -> String {
        self.removed = true;
        std::mem::take(&mut self.name)
    }
}

impl Drop for ContainerInstance {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        debug!(container = %self.name, "Removing container on drop");
        // Synchronous, there is no executor to run on here
        std::process::Command::new("docker")
            .args(["rm", "-f", &self.id])
            .output()
            .ok();
    }
}

/// Remove a container by name; `false` if there was nothing to remove
pub async fn remove_container(name: &str) -> Result<bool> {
    let result = docker(["rm", "-f", name]).await?;
    if !result.success() {
        warn!(container = %name, "Failed to remove container: {}", result.output.trim());
    }
    Ok(result.success())
}

async fn docker<const N: usize>(args: [&str; N]) -> Result<command_executor::ExitResult> {
    let cmd = Command::builder("docker").args(args).build();
    Ok(LocalLauncher.execute(&Target::Command, cmd).await?)
}

async fn read_banner(endpoint: &Endpoint) -> std::io::Result<String> {
    let attempt = async {
        let mut stream =
            async_net::TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await?;
        Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
    };
    let timeout = async {
        smol::Timer::after(BANNER_TIMEOUT).await;
        Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "no banner received",
        ))
    };
    smol::future::or(attempt, timeout).await
}

/// Address to connect to for a bind address
fn connect_host(bind_address: &str) -> String {
    match bind_address {
        "0.0.0.0" | "" => "127.0.0.1".to_string(),
        "::" => "::1".to_string(),
        other => other.to_string(),
    }
}

/// Host port from `docker port` output such as `127.0.0.1:49153`
fn parse_published_port(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.parse().ok())
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_published_port() {
        assert_eq!(parse_published_port("127.0.0.1:49153\n"), Some(49153));
        assert_eq!(
            parse_published_port("0.0.0.0:32768\n[::]:32768\n"),
            Some(32768)
        );
        assert_eq!(parse_published_port(""), None);
        assert_eq!(
            parse_published_port("Error: No public port '22/tcp' published"),
            None
        );
    }

    #[test]
    fn test_connect_host() {
        assert_eq!(connect_host("127.0.0.1"), "127.0.0.1");
        assert_eq!(connect_host("0.0.0.0"), "127.0.0.1");
    }

    #[test]
    fn test_endpoint_display() {
        let endpoint = Endpoint {
            host: "127.0.0.1".to_string(),
            port: 2222,
        };
        assert_eq!(endpoint.to_string(), "127.0.0.1:2222");
    }

    #[smol_potat::test]
    async fn test_banner_read_fails_without_server() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint {
            host: "127.0.0.1".to_string(),
            port,
        };
        assert!(read_banner(&endpoint).await.is_err());
    }
}
