//! Dockerfile rendering
//!
//! One template for every OS family. Only the package install line differs;
//! user creation, credential setup and the sshd command line are shared, and
//! sshd settings are passed as `-o` flags so distribution defaults in
//! `sshd_config` cannot override them.

use crate::credentials::Credential;
use crate::spec::{AuthMethod, ImageSpec};
use std::fmt::Write as _;

/// Build context file holding the authorized public key
pub const AUTHORIZED_KEYS_FILE: &str = "authorized_keys";

/// Build context file holding the `user:password` line for chpasswd
pub const CHPASSWD_FILE: &str = "chpasswd";

/// Image label carrying [`crate::builder::ImageBuilder::fingerprint`]
pub const FINGERPRINT_LABEL: &str = "ssh-fixtures.fingerprint";

/// Render the Dockerfile for `spec`. Secrets are not part of it; they are
/// copied from the build context written by [`context_files`].
pub fn render_dockerfile(spec: &ImageSpec) -> String {
    let user = &spec.user;
    let home = if spec.is_root() {
        "/root".to_string()
    } else {
        format!("/home/{}", user)
    };

    let mut out = String::new();
    let _ = writeln!(out, "FROM {}", spec.base);
    out.push('\n');
    let _ = writeln!(
        out,
        "RUN {}",
        spec.family.install_command(&spec.all_packages())
    );
    let _ = writeln!(out, "RUN mkdir -p /run/sshd /var/run/sshd && ssh-keygen -A");

    if !spec.is_root() {
        let _ = writeln!(
            out,
            "RUN (useradd -m -s /bin/sh {user} || adduser -D -s /bin/sh {user}) \\\n    && sed -i 's/^{user}:!*:/{user}:*:/' /etc/shadow"
        );
    }
    out.push('\n');

    let sshd_options: Vec<(&str, &str)> = match &spec.auth {
        AuthMethod::PublicKey { .. } => {
            let _ = writeln!(out, "COPY {} {}/.ssh/authorized_keys", AUTHORIZED_KEYS_FILE, home);
            let _ = writeln!(
                out,
                "RUN chown -R {user}:{user} {home}/.ssh \\\n    && chmod 700 {home}/.ssh \\\n    && chmod 600 {home}/.ssh/authorized_keys"
            );
            vec![
                ("PubkeyAuthentication", "yes"),
                ("PasswordAuthentication", "no"),
                (
                    "PermitRootLogin",
                    if spec.is_root() { "prohibit-password" } else { "no" },
                ),
            ]
        }
        AuthMethod::Password { .. } => {
            let _ = writeln!(out, "COPY {} /tmp/{}", CHPASSWD_FILE, CHPASSWD_FILE);
            let _ = writeln!(
                out,
                "RUN chpasswd < /tmp/{f} && rm -f /tmp/{f}",
                f = CHPASSWD_FILE
            );
            vec![
                ("PubkeyAuthentication", "no"),
                ("PasswordAuthentication", "yes"),
                ("PermitRootLogin", if spec.is_root() { "yes" } else { "no" }),
            ]
        }
    };

    out.push('\n');
    let _ = writeln!(out, "EXPOSE {}", spec.port);

    let port = spec.port.to_string();
    let mut cmd = vec!["/usr/sbin/sshd", "-D", "-e", "-p", port.as_str()];
    let options: Vec<String> = sshd_options
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    for option in &options {
        cmd.push("-o");
        cmd.push(option);
    }
    let cmd = cmd
        .iter()
        .map(|arg| format!("\"{}\"", arg))
        .collect::<Vec<_>>()
        .join(", ");
    let _ = writeln!(out, "CMD [{}]", cmd);

    out
}

/// Files to place next to the Dockerfile, as `(name, contents)`
pub fn context_files(spec: &ImageSpec, credential: &Credential) -> Vec<(&'static str, String)> {
    match credential {
        Credential::Key { public_key, .. } => {
            vec![(AUTHORIZED_KEYS_FILE, format!("{}\n", public_key.authorized_keys_line()))]
        }
        Credential::Password(password) => {
            vec![(CHPASSWD_FILE, format!("{}:{}\n", spec.user, password.expose()))]
        }
    }
}
