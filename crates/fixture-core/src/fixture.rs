//! A provisioned fixture: credential, image and running container together

use crate::builder::{BuiltImage, ImageBuilder};
use crate::container::{ContainerInstance, ContainerOptions, Endpoint};
use crate::credentials::Credential;
use crate::error::Result;
use crate::probe::SshProbe;
use crate::spec::ImageSpec;
use command_executor::{Launcher, Target};
use fixture_config::Settings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// A running, reachable fixture
#[derive(Debug)]
pub struct Fixture {
    /// Image definition
    pub spec: ImageSpec,
    /// Credential the image authorizes
    pub credential: Credential,
    /// Image the container runs
    pub image: BuiltImage,
    /// The container
    pub container: ContainerInstance,
}

/// Summary of a provisioned fixture, as recorded in run reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureInfo {
    /// Fixture name
    pub name: String,
    /// Image tag
    pub image: String,
    /// True if the image was reused
    pub reused: bool,
    /// Container name
    pub container: String,
    /// Published SSH endpoint
    pub endpoint: Endpoint,
    /// Login user
    pub user: String,
    /// `key` or `password`
    pub auth: String,
}

impl Fixture {
    /// Resolve the credential, build or reuse the image, start a container
    /// named `container_name` and wait for sshd. Generated keys go to
    /// `key_dir`.
    pub async fn provision<L>(
        spec: ImageSpec,
        builder: &ImageBuilder<L>,
        settings: &Settings,
        key_dir: &Path,
        container_name: &str,
    ) -> Result<Self>
    where
        L: Launcher<Target = Target>,
    {
        let credential = Credential::resolve(&spec.auth, key_dir, container_name).await?;
        let image = builder.ensure(&spec, &credential).await?;

        let options = ContainerOptions {
            name: container_name.to_string(),
            bind_address: settings.bind_address.clone(),
            container_port: spec.port,
            fixture: spec.name.clone(),
        };
        let container = ContainerInstance::start(&image, &options).await?;
        container
            .wait_ready(Duration::from_secs(settings.ready_timeout))
            .await?;

        info!(
            fixture = %spec.name,
            endpoint = %container.endpoint(),
            user = %spec.user,
            auth = credential.kind(),
            "Fixture ready"
        );
        Ok(Self {
            spec,
            credential,
            image,
            container,
        })
    }

    /// Report entry for this fixture
    pub fn info(&self) -> FixtureInfo {
        FixtureInfo {
            name: self.spec.name.clone(),
            image: self.image.tag.clone(),
            reused: self.image.reused,
            container: self.container.name().to_string(),
            endpoint: self.container.endpoint().clone(),
            user: self.spec.user.clone(),
            auth: self.credential.kind().to_string(),
        }
    }

    /// Connection details for the test suite
    pub fn env_vars(&self) -> BTreeMap<String, String> {
        connection_env(
            &self.spec.name,
            self.container.endpoint(),
            &self.spec.user,
            &self.credential,
        )
    }

    /// Probe logging in with the fixture's own credential
    pub fn probe(&self) -> Result<SshProbe> {
        SshProbe::new(self.container.endpoint(), &self.spec.user, &self.credential)
    }

    /// Remove the container
    pub async fn teardown(self) -> Result<()> {
        self.container.remove().await
    }
}

/// `FIXTURE_<NAME>_{HOST,PORT,USER,KEY,PASSWORD}` for one fixture
pub fn connection_env(
    name: &str,
    endpoint: &Endpoint,
    user: &str,
    credential: &Credential,
) -> BTreeMap<String, String> {
    let prefix = env_prefix(name);
    let mut env = BTreeMap::new();
    env.insert(format!("{}_HOST", prefix), endpoint.host.clone());
    env.insert(format!("{}_PORT", prefix), endpoint.port.to_string());
    env.insert(format!("{}_USER", prefix), user.to_string());
    match credential {
        Credential::Key {
            private_key: Some(path),
            ..
        } => {
            env.insert(format!("{}_KEY", prefix), path.display().to_string());
        }
        Credential::Key { .. } => {}
        Credential::Password(password) => {
            env.insert(format!("{}_PASSWORD", prefix), password.expose().to_string());
        }
    }
    env
}

fn env_prefix(name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("FIXTURE_{}", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{PublicKey, Secret};
    use std::path::PathBuf;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "127.0.0.1".to_string(),
            port: 49153,
        }
    }

    #[test]
    fn test_password_fixture_env() {
        let env = connection_env(
            "ubuntu-root",
            &endpoint(),
            "root",
            &Credential::Password(Secret::new("pass")),
        );
        assert_eq!(env["FIXTURE_UBUNTU_ROOT_HOST"], "127.0.0.1");
        assert_eq!(env["FIXTURE_UBUNTU_ROOT_PORT"], "49153");
        assert_eq!(env["FIXTURE_UBUNTU_ROOT_USER"], "root");
        assert_eq!(env["FIXTURE_UBUNTU_ROOT_PASSWORD"], "pass");
        assert!(!env.contains_key("FIXTURE_UBUNTU_ROOT_KEY"));
    }

    #[test]
    fn test_key_fixture_env() {
        let credential = Credential::Key {
            public_key: PublicKey::parse(
                "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFtIGPgcclbmhrouBTcljIUsb1w+ZG6E+WJfh0Tt5qj4",
            )
            .unwrap(),
            private_key: Some(PathBuf::from("/tmp/keys/id_ed25519")),
        };
        let env = connection_env("centos_ssh", &endpoint(), "sshuser", &credential);
        assert_eq!(env["FIXTURE_CENTOS_SSH_KEY"], "/tmp/keys/id_ed25519");
        assert!(!env.contains_key("FIXTURE_CENTOS_SSH_PASSWORD"));
        assert_eq!(env.len(), 4);
    }
}
