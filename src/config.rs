use std::path::{Path, PathBuf};

use facet::Facet;

use crate::cli::Cli;
use crate::error::MkvmError;
use crate::{paths, util};

pub const DEFAULT_IMAGE_URL: &str =
    "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img";
pub const DEFAULT_RAM_MB: u64 = 4096;
pub const DEFAULT_VCPUS: u32 = 4;
pub const DEFAULT_DISK_SIZE: &str = "32G";
pub const DEFAULT_NETWORK: &str = "default";
pub const DEFAULT_OS_VARIANT: &str = "ubuntu24.04";
pub const DEFAULT_LIBVIRT_URI: &str = "qemu:///system";

/// Optional defaults read from a TOML file. Every key may be omitted.
///
/// ```toml
/// vm_base_dir = "/srv/vms"
/// ram_mb = 8192
/// ssh_keys = true
/// os_variant = "ubuntu22.04"
/// ```
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct FileConfig {
    pub vm_base_dir: Option<String>,
    pub image_url: Option<String>,
    pub base_image: Option<String>,
    pub ram_mb: Option<u64>,
    pub vcpus: Option<u32>,
    pub disk_size: Option<String>,
    pub network: Option<String>,
    pub ssh_keys: Option<bool>,
    pub dry_run: Option<bool>,
    pub os_variant: Option<String>,
    pub libvirt_uri: Option<String>,
    pub ssh_public_key: Option<String>,
    pub log_file: Option<String>,
}

impl FileConfig {
    /// Log file every run appends to.
    pub fn log_file(&self) -> PathBuf {
        self.log_file
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(paths::default_log_file)
    }
}

/// Which cloud-init user-data template the VM gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshMode {
    /// Password login as `ubuntu`/`ubuntu`, SSH password auth enabled.
    Password,
    /// Key-only login with the local public key, SSH password auth disabled.
    SshKey,
}

impl std::fmt::Display for SshMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshMode::Password => f.write_str("password"),
            SshMode::SshKey => f.write_str("ssh-key"),
        }
    }
}

/// A fully resolved provisioning request. Built once per run, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub vm_name: String,
    pub ram_mb: u64,
    pub vcpus: u32,
    pub disk_size: String,
    pub network: String,
    pub image_url: String,
    pub base_image: PathBuf,
    pub ssh_mode: SshMode,
    pub dry_run: bool,
    pub vm_base_dir: PathBuf,
    pub os_variant: String,
    pub libvirt_uri: String,
    pub ssh_public_key: PathBuf,
}

impl Request {
    pub fn vm_dir(&self) -> PathBuf {
        paths::vm_dir(&self.vm_base_dir, &self.vm_name)
    }

    pub fn disk_path(&self) -> PathBuf {
        paths::disk_path(&self.vm_base_dir, &self.vm_name)
    }

    pub fn seed_path(&self) -> PathBuf {
        paths::seed_path(&self.vm_base_dir, &self.vm_name)
    }

    pub fn meta_data_path(&self) -> PathBuf {
        paths::meta_data_path(&self.vm_base_dir, &self.vm_name)
    }

    pub fn user_data_path(&self) -> PathBuf {
        paths::user_data_path(&self.vm_base_dir, &self.vm_name)
    }
}

// ── validation ────────────────────────────────────────────

/// VM names must match `[a-z0-9][a-z0-9._-]*`.
pub fn validate_name(name: &str) -> Result<(), MkvmError> {
    let lower_alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let valid = name.chars().next().is_some_and(lower_alnum)
        && name
            .chars()
            .all(|c| lower_alnum(c) || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(MkvmError::InvalidArgument {
            message: format!("VM name must match [a-z0-9][a-z0-9._-]* (got '{name}')"),
        });
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

/// Load the config file named by `--config`, or the default one if it exists.
pub fn load_file_config(explicit: Option<&Path>) -> Result<FileConfig, MkvmError> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => match paths::default_config_file() {
            Some(p) if p.exists() => p,
            _ => return Ok(FileConfig::default()),
        },
    };

    let contents = std::fs::read_to_string(&path).map_err(|source| MkvmError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config: FileConfig = facet_toml::from_str(&contents).map_err(|e| MkvmError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    tracing::debug!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Merge CLI flags (clap already folded in environment variables), the config
/// file and built-in defaults into a validated [`Request`].
pub fn resolve(cli: &Cli, file: &FileConfig) -> Result<Request, MkvmError> {
    let vm_name = cli.name.clone().unwrap_or_default();
    if vm_name.is_empty() {
        return Err(MkvmError::InvalidArgument {
            message: "a VM name is required".into(),
        });
    }
    validate_name(&vm_name)?;

    if !cli.extra.is_empty() {
        tracing::warn!(ignored = ?cli.extra, "extra positional arguments ignored");
    }

    let disk_size = cli
        .size
        .clone()
        .or_else(|| file.disk_size.clone())
        .unwrap_or_else(|| DEFAULT_DISK_SIZE.into());
    util::validate_disk_size(&disk_size)?;

    let vm_base_dir = cli
        .base_dir
        .clone()
        .or_else(|| file.vm_base_dir.as_deref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(paths::DEFAULT_VM_BASE_DIR));

    let image_url = cli
        .url
        .clone()
        .or_else(|| file.image_url.clone())
        .unwrap_or_else(|| DEFAULT_IMAGE_URL.into());

    let base_image = cli
        .base
        .clone()
        .or_else(|| file.base_image.as_deref().map(PathBuf::from))
        .unwrap_or_else(|| paths::default_base_image(&vm_base_dir, &image_url));

    let ssh_mode = if cli.ssh_keys || file.ssh_keys.unwrap_or(false) {
        SshMode::SshKey
    } else {
        SshMode::Password
    };

    Ok(Request {
        vm_name,
        ram_mb: cli.ram.or(file.ram_mb).unwrap_or(DEFAULT_RAM_MB),
        vcpus: cli.cpu.or(file.vcpus).unwrap_or(DEFAULT_VCPUS),
        disk_size,
        network: cli
            .network
            .clone()
            .or_else(|| file.network.clone())
            .unwrap_or_else(|| DEFAULT_NETWORK.into()),
        image_url,
        base_image,
        ssh_mode,
        dry_run: cli.dry_run || file.dry_run.unwrap_or(false),
        vm_base_dir,
        os_variant: file
            .os_variant
            .clone()
            .unwrap_or_else(|| DEFAULT_OS_VARIANT.into()),
        libvirt_uri: file
            .libvirt_uri
            .clone()
            .unwrap_or_else(|| DEFAULT_LIBVIRT_URI.into()),
        ssh_public_key: file
            .ssh_public_key
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(paths::default_ssh_public_key),
    })
}
