//! Image specifications
//!
//! An [`ImageSpec`] is the validated form of one `images:` entry: a parsed
//! base image reference, the OS family that decides which package manager
//! runs, and exactly one authentication method for exactly one user.

use crate::credentials::Secret;
use crate::error::BuildError;
use fixture_config::{AuthConfig, ImageConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

static PATH_COMPONENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*$").expect("valid regex")
});
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("valid regex"));
static DIGEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[+._-][a-z0-9]+)*:[a-fA-F0-9]{32,}$").expect("valid regex")
});
static REGISTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9.-]*[A-Za-z0-9])?(?::[0-9]+)?$").expect("valid regex")
});

/// A docker image reference: `[registry/]repository[:tag][@digest]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef {
    registry: Option<String>,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageRef {
    /// Registry host, if the reference names one
    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    /// Repository path, e.g. `library/centos` or `centos`
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Tag, if any
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Digest, if any
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Last repository path component, e.g. `ubuntu` for `docker.io/library/ubuntu`
    pub fn short_name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }
}

impl FromStr for ImageRef {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| BuildError::InvalidBaseImage {
            reference: s.to_string(),
            reason: reason.to_string(),
        };

        if s.is_empty() {
            return Err(invalid("reference is empty"));
        }
        if s.len() > 255 {
            return Err(invalid("reference is longer than 255 characters"));
        }

        let (rest, digest) = match s.split_once('@') {
            Some((rest, digest)) => {
                if !DIGEST_RE.is_match(digest) {
                    return Err(invalid("digest must look like 'sha256:<hex>'"));
                }
                (rest, Some(digest.to_string()))
            }
            None => (s, None),
        };

        let last_slash = rest.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                let tag = &rest[split + 1..];
                if !TAG_RE.is_match(tag) {
                    return Err(invalid("tag has invalid characters"));
                }
                (&rest[..split], Some(tag.to_string()))
            }
            None => (rest, None),
        };

        let mut components: Vec<&str> = name.split('/').collect();
        let registry = if components.len() > 1
            && (components[0].contains('.')
                || components[0].contains(':')
                || components[0] == "localhost")
        {
            let registry = components.remove(0);
            if !REGISTRY_RE.is_match(registry) {
                return Err(invalid("registry host is invalid"));
            }
            Some(registry.to_string())
        } else {
            None
        };

        if let Some(bad) = components.iter().find(|c| !PATH_COMPONENT_RE.is_match(c)) {
            return Err(invalid(&format!(
                "repository component '{}' must be lowercase alphanumerics and separators",
                bad
            )));
        }

        Ok(ImageRef {
            registry,
            repository: components.join("/"),
            tag,
            digest,
        })
    }
}

impl TryFrom<String> for ImageRef {
    type Error = BuildError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImageRef> for String {
    fn from(value: ImageRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{}/", registry)?;
        }
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Linux distribution family of a base image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    /// apt / dpkg
    Debian,
    /// yum / rpm
    RedHat,
    /// apk
    Alpine,
}

impl OsFamily {
    /// Guess the family from an image name such as `centos` or `ubuntu`
    pub fn from_image_name(name: &str) -> Option<Self> {
        match name {
            "ubuntu" | "debian" => Some(OsFamily::Debian),
            "centos" | "fedora" | "rockylinux" | "almalinux" | "oraclelinux" | "amazonlinux"
            | "rhel" => Some(OsFamily::RedHat),
            "alpine" => Some(OsFamily::Alpine),
            n if n.starts_with("ubi") => Some(OsFamily::RedHat),
            _ => None,
        }
    }

    /// Family from the `ID` / `ID_LIKE` fields of `/etc/os-release`
    pub fn from_os_release(id: &str, id_like: &[String]) -> Option<Self> {
        std::iter::once(id)
            .chain(id_like.iter().map(String::as_str))
            .find_map(Self::from_image_name)
    }

    /// Package providing the SSH server
    pub fn ssh_server_package(&self) -> &'static str {
        match self {
            OsFamily::Debian | OsFamily::RedHat => "openssh-server",
            OsFamily::Alpine => "openssh",
        }
    }

    /// Shell line installing `packages`
    pub fn install_command(&self, packages: &[String]) -> String {
        let packages = packages.join(" ");
        match self {
            OsFamily::Debian => format!(
                "apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends {} && rm -rf /var/lib/apt/lists/*",
                packages
            ),
            OsFamily::RedHat => format!("yum install -y {} && yum clean all", packages),
            OsFamily::Alpine => format!("apk add --no-cache {}", packages),
        }
    }

    /// Text identifying the install step in engine output
    pub fn install_marker(&self) -> &'static str {
        match self {
            OsFamily::Debian => "apt-get install",
            OsFamily::RedHat => "yum install",
            OsFamily::Alpine => "apk add",
        }
    }

    /// Command printing one installed package name per line
    pub fn list_packages_command(&self) -> &'static str {
        match self {
            OsFamily::Debian => "dpkg-query -W -f='${Package}\\n'",
            OsFamily::RedHat => "rpm -qa --qf '%{NAME}\\n'",
            OsFamily::Alpine => "apk info",
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsFamily::Debian => write!(f, "debian"),
            OsFamily::RedHat => write!(f, "redhat"),
            OsFamily::Alpine => write!(f, "alpine"),
        }
    }
}

/// How the single image user authenticates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Public key; generated per run when no key file is given
    PublicKey {
        /// OpenSSH public key file
        public_key: Option<PathBuf>,
    },
    /// Password; generated per run when none is given
    Password {
        /// Fixed password
        password: Option<Secret>,
    },
}

impl AuthMethod {
    /// `"key"` or `"password"`
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::PublicKey { .. } => "key",
            AuthMethod::Password { .. } => "password",
        }
    }
}

impl From<&AuthConfig> for AuthMethod {
    fn from(auth: &AuthConfig) -> Self {
        match auth {
            AuthConfig::Key { public_key } => AuthMethod::PublicKey {
                public_key: public_key.as_ref().map(PathBuf::from),
            },
            AuthConfig::Password { password } => AuthMethod::Password {
                password: password.clone().map(Secret::new),
            },
        }
    }
}

/// A validated image definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    /// Fixture name from the configuration
    pub name: String,
    /// Base image
    pub base: ImageRef,
    /// OS family of the base image
    pub family: OsFamily,
    /// Requested packages, without the SSH server
    pub packages: Vec<String>,
    /// The user allowed to log in
    pub user: String,
    /// The one authentication method of that user
    pub auth: AuthMethod,
    /// Port sshd listens on inside the container
    pub port: u16,
    /// Tag of the built image
    pub tag: String,
}

impl ImageSpec {
    /// Validate an `images:` entry. `project` prefixes the default tag.
    pub fn from_config(
        name: &str,
        config: &ImageConfig,
        project: Option<&str>,
    ) -> Result<Self, BuildError> {
        let base: ImageRef = config.base.trim().parse()?;
        let family = OsFamily::from_image_name(base.short_name())
            .ok_or_else(|| BuildError::UnsupportedBase(base.to_string()))?;

        let tag = match &config.tag {
            Some(tag) => tag.clone(),
            None => format!("{}-{}:latest", project.unwrap_or("fixtures"), name),
        };
        validate_tag(&tag)?;

        Ok(ImageSpec {
            name: name.to_string(),
            base,
            family,
            packages: config.packages.clone(),
            user: config.user.clone(),
            auth: AuthMethod::from(&config.auth),
            port: config.port,
            tag,
        })
    }

    /// Packages installed into the image, SSH server first
    pub fn all_packages(&self) -> Vec<String> {
        let server = self.family.ssh_server_package().to_string();
        let mut packages = vec![server.clone()];
        packages.extend(self.packages.iter().filter(|p| **p != server).cloned());
        packages
    }

    /// True when the image user is root
    pub fn is_root(&self) -> bool {
        self.user == "root"
    }
}

/// A build tag is an image reference without a digest
fn validate_tag(tag: &str) -> Result<(), BuildError> {
    let parsed: ImageRef = tag.parse().map_err(|e| match e {
        BuildError::InvalidBaseImage { reason, .. } => BuildError::InvalidTag {
            tag: tag.to_string(),
            reason,
        },
        other => other,
    })?;
    if parsed.digest().is_some() {
        return Err(BuildError::InvalidTag {
            tag: tag.to_string(),
            reason: "a build tag cannot carry a digest".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_refs() {
        let r: ImageRef = "centos:7".parse().unwrap();
        assert_eq!(r.repository(), "centos");
        assert_eq!(r.tag(), Some("7"));
        assert_eq!(r.registry(), None);

        let r: ImageRef = "localhost:5000/team/ubuntu:20.04".parse().unwrap();
        assert_eq!(r.registry(), Some("localhost:5000"));
        assert_eq!(r.repository(), "team/ubuntu");
        assert_eq!(r.short_name(), "ubuntu");
        assert_eq!(r.to_string(), "localhost:5000/team/ubuntu:20.04");

        let digest = format!("alpine@sha256:{}", "a".repeat(64));
        let r: ImageRef = digest.parse().unwrap();
        assert_eq!(r.tag(), None);
        assert!(r.digest().unwrap().starts_with("sha256:"));
    }

    #[test]
    fn test_reject_invalid_refs() {
        for bad in ["", "Ubuntu:20.04", "ubuntu:", "ubuntu::1", "ubuntu@sha256:xyz", "a b"] {
            let err = bad.parse::<ImageRef>().unwrap_err();
            assert!(
                matches!(err, BuildError::InvalidBaseImage { .. }),
                "{bad:?} gave {err}"
            );
        }
    }

    #[test]
    fn test_os_family_detection() {
        assert_eq!(OsFamily::from_image_name("centos"), Some(OsFamily::RedHat));
        assert_eq!(OsFamily::from_image_name("ubi8"), Some(OsFamily::RedHat));
        assert_eq!(OsFamily::from_image_name("ubuntu"), Some(OsFamily::Debian));
        assert_eq!(OsFamily::from_image_name("busybox"), None);

        let like = vec!["debian".to_string()];
        assert_eq!(OsFamily::from_os_release("linuxmint", &like), Some(OsFamily::Debian));
    }

    #[test]
    fn test_spec_from_config() {
        let config = ImageConfig {
            base: "ubuntu:20.04".to_string(),
            packages: vec!["openssh-server".to_string(), "python3".to_string()],
            user: "root".to_string(),
            auth: AuthConfig::Password {
                password: Some("pass".to_string()),
            },
            port: 22,
            tag: None,
        };

        let spec = ImageSpec::from_config("ubuntu-root", &config, Some("analyzer")).unwrap();
        assert_eq!(spec.family, OsFamily::Debian);
        assert_eq!(spec.tag, "analyzer-ubuntu-root:latest");
        assert_eq!(spec.all_packages(), vec!["openssh-server", "python3"]);
        assert!(spec.is_root());
        assert_eq!(spec.auth.kind(), "password");
    }

    #[test]
    fn test_unsupported_base() {
        let config = ImageConfig {
            base: "busybox:1.36".to_string(),
            packages: vec![],
            user: "sshuser".to_string(),
            auth: AuthConfig::default(),
            port: 22,
            tag: None,
        };
        let err = ImageSpec::from_config("tiny", &config, None).unwrap_err();
        assert!(matches!(err, BuildError::UnsupportedBase(_)));
    }

    #[test]
    fn test_invalid_tags_rejected_before_build() {
        let mut config = ImageConfig {
            base: "alpine:3.19".to_string(),
            packages: vec![],
            user: "sshuser".to_string(),
            auth: AuthConfig::default(),
            port: 22,
            tag: None,
        };

        let err = ImageSpec::from_config("alpine-ssh", &config, Some("My Project")).unwrap_err();
        assert!(matches!(err, BuildError::InvalidTag { ref tag, .. } if tag == "My Project-alpine-ssh:latest"));

        for bad in ["Fixtures/Alpine", "fixtures/alpine:bad tag", "alpine@sha256:0123456789abcdef0123456789abcdef"] {
            config.tag = Some(bad.to_string());
            let err = ImageSpec::from_config("alpine-ssh", &config, None).unwrap_err();
            assert!(matches!(err, BuildError::InvalidTag { .. }), "{bad}");
        }

        config.tag = Some("localhost:5000/fixtures/alpine-ssh:v1".to_string());
        let spec = ImageSpec::from_config("alpine-ssh", &config, Some("My Project")).unwrap();
        assert_eq!(spec.tag, "localhost:5000/fixtures/alpine-ssh:v1");
    }
}
