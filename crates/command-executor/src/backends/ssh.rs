//! SSH remote execution backend using the `ssh` CLI

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;

use crate::command::{Command, shell_escape};
use crate::error::{Error, Result};
use crate::launcher::Launcher;

/// Environment variable an askpass helper reads the password from
pub const ASKPASS_PASSWORD_ENV: &str = "FIXTURE_SSH_PASSWORD";

/// How the `ssh` client authenticates
#[derive(Clone, Default)]
pub enum SshAuth {
    /// Whatever the local ssh configuration and agent provide
    #[default]
    Default,
    /// A private key file, and nothing else
    IdentityFile(PathBuf),
    /// A password, answered by an askpass helper that echoes
    /// [`ASKPASS_PASSWORD_ENV`]
    Password {
        /// Executable used as `SSH_ASKPASS`
        askpass: PathBuf,
        /// The password handed to the helper through the environment
        password: String,
    },
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::Default => write!(f, "Default"),
            SshAuth::IdentityFile(path) => f.debug_tuple("IdentityFile").field(path).finish(),
            SshAuth::Password { askpass, .. } => f
                .debug_struct("Password")
                .field("askpass", askpass)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// SSH connection configuration
#[derive(Debug, Clone)]
pub struct SshConfig {
    host: String,
    user: Option<String>,
    port: Option<u16>,
    auth: SshAuth,
    extra_args: Vec<String>,
}

impl SshConfig {
    /// Create a new SSH configuration for the given host
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            auth: SshAuth::Default,
            extra_args: Vec::new(),
        }
    }

    /// Set the SSH user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the authentication method
    pub fn with_auth(mut self, auth: SshAuth) -> Self {
        self.auth = auth;
        self
    }

    /// Add a `-o Key=Value` option
    pub fn with_option(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.extra_args.push("-o".to_string());
        self.extra_args.push(format!("{}={}", key, value));
        self
    }

    /// Options for throwaway hosts whose host keys change on every start
    pub fn ephemeral_host(self, connect_timeout_secs: u64) -> Self {
        self.with_option("StrictHostKeyChecking", "no")
            .with_option("UserKnownHostsFile", "/dev/null")
            .with_option("LogLevel", "ERROR")
            .with_option("ConnectTimeout", connect_timeout_secs)
    }

    /// `user@host`, or just `host` without a user
    fn host_string(&self) -> String {
        if let Some(user) = &self.user {
            format!("{}@{}", user, self.host)
        } else {
            self.host.clone()
        }
    }

    /// Build the `ssh` invocation that runs `command` on the remote host
    pub fn wrap(&self, command: &Command) -> Result<Command> {
        let mut ssh_cmd = Command::new("ssh");

        if let Some(port) = self.port {
            ssh_cmd.arg("-p").arg(port.to_string());
        }

        match &self.auth {
            SshAuth::Default => {}
            SshAuth::IdentityFile(path) => {
                if !path.exists() {
                    return Err(Error::SshKeyNotFound {
                        path: path.display().to_string(),
                    });
                }
                ssh_cmd.arg("-i").arg(path);
                ssh_cmd.args(["-o", "IdentitiesOnly=yes", "-o", "BatchMode=yes"]);
                ssh_cmd.args(["-o", "PasswordAuthentication=no"]);
            }
            SshAuth::Password { askpass, password } => {
                ssh_cmd.args(["-o", "PreferredAuthentications=password,keyboard-interactive"]);
                ssh_cmd.args(["-o", "PubkeyAuthentication=no"]);
                ssh_cmd.args(["-o", "NumberOfPasswordPrompts=1"]);
                ssh_cmd
                    .env("SSH_ASKPASS", askpass)
                    .env("SSH_ASKPASS_REQUIRE", "force")
                    .env("DISPLAY", ":0")
                    .env(ASKPASS_PASSWORD_ENV, password);
            }
        }

        ssh_cmd.args(&self.extra_args);
        ssh_cmd.arg(self.host_string());
        ssh_cmd.arg(format_remote_command(command));

        // Local environment of the wrapped command is carried over to the
        // ssh process itself (askpass, agent sockets)
        ssh_cmd.envs(command.get_envs().clone());
        Ok(ssh_cmd)
    }
}

/// SSH launcher that wraps another launcher for remote execution
#[derive(Debug, Clone)]
pub struct SshLauncher<L> {
    inner: L,
    config: SshConfig,
}

impl<L> SshLauncher<L> {
    /// Create a new SSH launcher wrapping the given inner launcher
    pub fn new(inner: L, config: SshConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl<L> Launcher for SshLauncher<L>
where
    L: Launcher,
{
    type Target = L::Target;
    type EventStream = L::EventStream;
    type Handle = L::Handle;

    async fn launch(
        &self,
        target: &Self::Target,
        command: Command,
    ) -> Result<(Self::EventStream, Self::Handle)> {
        let ssh_cmd = self.config.wrap(&command)?;
        self.inner
            .launch(target, ssh_cmd)
            .await
            .map_err(|e| e.with_layer_context("ssh"))
    }
}

/// Format a command for remote execution via SSH
fn format_remote_command(cmd: &Command) -> String {
    let program = shell_escape(&cmd.get_program().to_string_lossy());
    let args: Vec<String> = cmd
        .get_args()
        .iter()
        .map(|arg| shell_escape(&arg.to_string_lossy()))
        .collect();

    if args.is_empty() {
        program
    } else {
        format!("{} {}", program, args.join(" "))
    }
}
