//! Checks run against a fixture over SSH
//!
//! Login goes through the real `ssh` client with exactly the credential the
//! image authorizes. Password logins use an askpass helper that echoes the
//! password from the environment, so it never lands on disk or argv.

use crate::container::Endpoint;
use crate::credentials::Credential;
use crate::error::{FixtureError, Result};
use crate::spec::OsFamily;
use command_executor::backends::ssh::{SshAuth, SshConfig, SshLauncher};
use command_executor::backends::local::LocalLauncher;
use command_executor::{Command, ExitResult, Launcher, Target};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use tempfile::TempPath;
use tracing::debug;

const ASKPASS_SCRIPT: &str = "#!/bin/sh\nprintf '%s\\n' \"$FIXTURE_SSH_PASSWORD\"\n";

/// Seconds ssh waits for the TCP connection
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Fields of `/etc/os-release`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsRelease {
    /// `ID`, e.g. `centos`
    pub id: String,
    /// `VERSION_ID`, e.g. `7`
    pub version_id: Option<String>,
    /// `PRETTY_NAME`
    pub pretty_name: Option<String>,
    /// `ID_LIKE`, split on whitespace
    pub id_like: Vec<String>,
}

impl OsRelease {
    /// Parse `KEY=value` lines, with optional quotes around values
    pub fn parse(text: &str) -> Self {
        let mut release = OsRelease::default();
        for line in text.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'').to_string();
            match key {
                "ID" => release.id = value,
                "VERSION_ID" => release.version_id = Some(value),
                "PRETTY_NAME" => release.pretty_name = Some(value),
                "ID_LIKE" => release.id_like = value.split_whitespace().map(String::from).collect(),
                _ => {}
            }
        }
        release
    }

    /// OS family, if known
    pub fn family(&self) -> Option<OsFamily> {
        OsFamily::from_os_release(&self.id, &self.id_like)
    }
}

/// Runs commands on a fixture through `ssh`
pub struct SshProbe<L = LocalLauncher> {
    launcher: SshLauncher<L>,
    // Keeps the askpass helper alive for password logins
    _askpass: Option<TempPath>,
}

impl SshProbe<LocalLauncher> {
    /// Probe `endpoint` as `user` with `credential`
    pub fn new(endpoint: &Endpoint, user: &str, credential: &Credential) -> Result<Self> {
        Self::with_launcher(LocalLauncher, endpoint, user, credential)
    }
}

impl<L> SshProbe<L>
where
    L: Launcher<Target = Target>,
{
    /// Probe that starts `ssh` through `launcher`
    pub fn with_launcher(
        launcher: L,
        endpoint: &Endpoint,
        user: &str,
        credential: &Credential,
    ) -> Result<Self> {
        let (auth, askpass) = match credential {
            Credential::Key {
                private_key: Some(path),
                ..
            } => (SshAuth::IdentityFile(path.clone()), None),
            Credential::Key {
                private_key: None, ..
            } => {
                return Err(FixtureError::probe(
                    "no private key is available for the configured public key",
                ));
            }
            Credential::Password(password) => {
                let askpass = write_askpass()?;
                let auth = SshAuth::Password {
                    askpass: askpass.to_path_buf(),
                    password: password.expose().to_string(),
                };
                (auth, Some(askpass))
            }
        };

        let config = SshConfig::new(endpoint.host.clone())
            .with_port(endpoint.port)
            .with_user(user)
            .with_auth(auth)
            .ephemeral_host(CONNECT_TIMEOUT_SECS);

        Ok(Self {
            launcher: SshLauncher::new(launcher, config),
            _askpass: askpass,
        })
    }

    /// Run `command` on the fixture
    pub async fn run(&self, command: Command) -> Result<ExitResult> {
        Ok(self.launcher.execute(&Target::Command, command).await?)
    }

    /// True if the credential is accepted
    pub async fn login_succeeds(&self) -> Result<bool> {
        let result = self.run(Command::new("true")).await?;
        if !result.success() {
            debug!("Login rejected ({}): {}", result.status, result.output.trim());
        }
        Ok(result.success())
    }

    /// Contents of `/etc/os-release`
    pub async fn os_release(&self) -> Result<OsRelease> {
        let result = self
            .run(Command::builder("cat").arg("/etc/os-release").build())
            .await?;
        if !result.success() {
            return Err(FixtureError::probe(format!(
                "Failed to read /etc/os-release: {}",
                result.output.trim()
            )));
        }
        Ok(OsRelease::parse(&result.output))
    }

    /// Names of all installed packages
    pub async fn installed_packages(&self, family: OsFamily) -> Result<BTreeSet<String>> {
        let result = self
            .run(Command::shell(family.list_packages_command()))
            .await?;
        if !result.success() {
            return Err(FixtureError::probe(format!(
                "Failed to list {} packages: {}",
                family,
                result.output.trim()
            )));
        }
        Ok(parse_package_list(family, &result.output))
    }

    /// Packages from `expected` that are not installed
    pub async fn missing_packages(
        &self,
        family: OsFamily,
        expected: &[String],
    ) -> Result<Vec<String>> {
        let installed = self.installed_packages(family).await?;
        Ok(expected
            .iter()
            .filter(|p| !installed.contains(p.as_str()))
            .cloned()
            .collect())
    }
}

/// One package name per line. `apk info` may print `name-version-rN`.
fn parse_package_list(family: OsFamily, output: &str) -> BTreeSet<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| match family {
            OsFamily::Alpine => strip_apk_version(l).to_string(),
            OsFamily::Debian | OsFamily::RedHat => l.to_string(),
        })
        .collect()
}

fn strip_apk_version(entry: &str) -> &str {
    // name-1.2.3-r0: the version starts at the second-to-last dash
    let mut dashes = entry.rmatch_indices('-').map(|(i, _)| i);
    match (dashes.next(), dashes.next()) {
        (Some(release), Some(version))
            if entry[release + 1..].starts_with('r')
                && entry[version + 1..].starts_with(|c: char| c.is_ascii_digit()) =>
        {
            &entry[..version]
        }
        _ => entry,
    }
}

fn write_askpass() -> Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("fixtures-askpass-")
        .suffix(".sh")
        .tempfile()?;
    file.write_all(ASKPASS_SCRIPT.as_bytes())?;
    file.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o700))?;
    // Closed before use, executing a file open for writing fails with ETXTBSY
    Ok(file.into_temp_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Secret;
    use crate::test_support::ScriptedLauncher;

    const CENTOS_7: &str = r#"NAME="CentOS Linux"
VERSION="7 (Core)"
ID="centos"
ID_LIKE="rhel fedora"
VERSION_ID="7"
PRETTY_NAME="CentOS Linux 7 (Core)"
"#;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "127.0.0.1".to_string(),
            port: 32768,
        }
    }

    #[test]
    fn test_parse_os_release() {
        let release = OsRelease::parse(CENTOS_7);
        assert_eq!(release.id, "centos");
        assert_eq!(release.version_id.as_deref(), Some("7"));
        assert_eq!(release.pretty_name.as_deref(), Some("CentOS Linux 7 (Core)"));
        assert_eq!(release.id_like, vec!["rhel", "fedora"]);
        assert_eq!(release.family(), Some(OsFamily::RedHat));

        let ubuntu = OsRelease::parse("ID=ubuntu\nVERSION_ID=\"20.04\"\n");
        assert_eq!(ubuntu.family(), Some(OsFamily::Debian));
    }

    #[test]
    fn test_parse_package_lists() {
        let rpm = parse_package_list(OsFamily::RedHat, "openssh-server\nbash\n\n");
        assert!(rpm.contains("openssh-server"));

        let apk = parse_package_list(OsFamily::Alpine, "openssh\nmusl-1.2.4-r2\nca-certificates-bundle-20240226-r0\n");
        assert!(apk.contains("openssh"));
        assert!(apk.contains("musl"));
        assert!(apk.contains("ca-certificates-bundle"));
    }

    #[test]
    fn test_askpass_script_is_executable() {
        let path = write_askpass().unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        let script = std::fs::read_to_string(&path).unwrap();
        assert!(script.contains("$FIXTURE_SSH_PASSWORD"));
    }

    #[test]
    fn test_key_without_private_half_is_rejected() {
        let credential = Credential::Key {
            public_key: crate::credentials::PublicKey::parse(
                "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFtIGPgcclbmhrouBTcljIUsb1w+ZG6E+WJfh0Tt5qj4",
            )
            .unwrap(),
            private_key: None,
        };
        assert!(SshProbe::new(&endpoint(), "sshuser", &credential).is_err());
    }

    #[smol_potat::test]
    async fn test_probe_commands_go_through_ssh() {
        let launcher = ScriptedLauncher::new()
            .on("/etc/os-release", 0, CENTOS_7)
            .on("rpm -qa", 0, "openssh-server\nbash\n");
        let probe = SshProbe::with_launcher(
            launcher.clone(),
            &endpoint(),
            "root",
            &Credential::Password(Secret::new("pass")),
        )
        .unwrap();

        assert!(probe.login_succeeds().await.unwrap());
        assert_eq!(probe.os_release().await.unwrap().id, "centos");

        let expected = vec!["openssh-server".to_string(), "python3".to_string()];
        let missing = probe.missing_packages(OsFamily::RedHat, &expected).await.unwrap();
        assert_eq!(missing, vec!["python3"]);

        let calls = launcher.calls();
        assert!(calls.iter().all(|c| c.starts_with("ssh -p 32768")));
        assert!(calls.iter().all(|c| c.contains("root@127.0.0.1")));
        assert!(calls.iter().all(|c| !c.contains("pass ")));
    }
}
