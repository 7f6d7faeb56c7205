use std::path::Path;

use facet_value::{VArray, Value, value};

use crate::config::SshMode;
use crate::error::MkvmError;
use crate::host::HostCommand;

/// Password set for the default user in password mode.
pub const DEFAULT_PASSWORD: &str = "ubuntu";

/// Package every VM installs on first boot.
pub const GUEST_AGENT_PACKAGE: &str = "qemu-guest-agent";

/// Inputs for the cloud-init NoCloud seed.
pub struct SeedConfig<'a> {
    pub hostname: &'a str,
    pub ssh_mode: SshMode,
    /// Public key content; only used in [`SshMode::SshKey`].
    pub ssh_key: Option<&'a str>,
}

pub fn build_meta_data(hostname: &str) -> String {
    format!("instance-id: {hostname}\nlocal-hostname: {hostname}\n")
}

pub fn build_user_data(config: &SeedConfig) -> Result<String, MkvmError> {
    let mut doc = match config.ssh_mode {
        SshMode::Password => value!({
            "password": (DEFAULT_PASSWORD),
            "chpasswd": { "expire": false },
            "ssh_pwauth": true,
        }),
        SshMode::SshKey => {
            let key = config.ssh_key.ok_or_else(|| MkvmError::MissingPrerequisite {
                message: "SSH-key mode selected but no public key was loaded".into(),
                hint: "generate one with `ssh-keygen`".into(),
            })?;
            let keys = VArray::from_iter([Value::from(key.trim())]);
            let mut user = value!({
                "name": "ubuntu",
                "sudo": "ALL=(ALL) NOPASSWD:ALL",
                "shell": "/bin/bash",
                "groups": "sudo",
            });
            if let Some(obj) = user.as_object_mut() {
                obj.insert("ssh_authorized_keys", Value::from(keys));
            }
            value!({
                "users": ["default", user],
                "ssh_pwauth": false,
                "disable_root": true,
            })
        }
    };

    if let Some(obj) = doc.as_object_mut() {
        obj.insert("hostname", Value::from(config.hostname));
        obj.insert(
            "packages",
            Value::from(VArray::from_iter([Value::from(GUEST_AGENT_PACKAGE)])),
        );
        obj.insert(
            "runcmd",
            value!([["systemctl", "enable", "--now", "qemu-guest-agent"]]),
        );
    }

    let yaml = facet_yaml::to_string(&doc)
        .map_err(|e| MkvmError::provisioning("user-data generation", e.to_string()))?;
    // cloud-init expects #cloud-config as the first line, not a document separator.
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    Ok(format!("#cloud-config\n{yaml}"))
}

/// `cloud-localds <seed> <user-data> <meta-data>`
pub fn seed_command(seed_path: &Path, user_data: &Path, meta_data: &Path) -> HostCommand {
    HostCommand::new("cloud-localds")
        .arg(seed_path)
        .arg(user_data)
        .arg(meta_data)
}
