use clap::Parser;
use clap::builder::FalseyValueParser;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(
    name = "mkvm",
    version,
    about = "Create a cloud-init KVM virtual machine via libvirt"
)]
pub struct Cli {
    /// Name of the VM to create ([a-z0-9][a-z0-9._-]*)
    pub name: Option<String>,

    /// Ignored extra positional arguments
    #[arg(hide = true)]
    pub extra: Vec<String>,

    /// Memory in MB [default: 4096]
    #[arg(short, long, value_name = "MB", env = "RAM")]
    pub ram: Option<u64>,

    /// Number of virtual CPUs [default: 4]
    #[arg(short, long, value_name = "CORES", env = "VCPUS")]
    pub cpu: Option<u32>,

    /// Disk size, e.g. 32G [default: 32G]
    #[arg(short, long, value_name = "SIZE", env = "DISK_SIZE")]
    pub size: Option<String>,

    /// libvirt network to attach [default: default]
    #[arg(short, long, value_name = "NAME", env = "NETWORK")]
    pub network: Option<String>,

    /// Use SSH key authentication instead of a password
    #[arg(
        short = 'k',
        long = "ssh-keys",
        env = "ENABLE_SSH_KEYS",
        value_parser = FalseyValueParser::new()
    )]
    pub ssh_keys: bool,

    /// Base image download URL
    #[arg(short, long, value_name = "URL", env = "IMG_URL")]
    pub url: Option<String>,

    /// Local path of the shared base image
    #[arg(short, long, value_name = "PATH", env = "BASE_IMG")]
    pub base: Option<PathBuf>,

    /// Log actions without executing them
    #[arg(short, long, env = "DRY_RUN", value_parser = FalseyValueParser::new())]
    pub dry_run: bool,

    /// Directory holding per-VM directories [default: /var/lib/libvirt/images]
    #[arg(long, value_name = "DIR", env = "VM_BASE_DIR")]
    pub base_dir: Option<PathBuf>,

    /// Path to config file [default: ~/.config/mkvm/config.toml if present]
    #[arg(long, value_name = "PATH", env = "MKVM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}
