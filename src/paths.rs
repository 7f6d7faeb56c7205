use std::path::{Path, PathBuf};

/// Default parent of all per-VM directories.
pub const DEFAULT_VM_BASE_DIR: &str = "/var/lib/libvirt/images";

/// Per-VM directory: `<base_dir>/<name>/`
pub fn vm_dir(base_dir: &Path, name: &str) -> PathBuf {
    base_dir.join(name)
}

/// Path to the qcow2 overlay for a VM.
pub fn disk_path(base_dir: &Path, name: &str) -> PathBuf {
    vm_dir(base_dir, name).join(format!("{name}.qcow2"))
}

/// Path to the cloud-init seed ISO for a VM.
pub fn seed_path(base_dir: &Path, name: &str) -> PathBuf {
    vm_dir(base_dir, name).join(format!("{name}-seed.iso"))
}

pub fn meta_data_path(base_dir: &Path, name: &str) -> PathBuf {
    vm_dir(base_dir, name).join("meta-data")
}

pub fn user_data_path(base_dir: &Path, name: &str) -> PathBuf {
    vm_dir(base_dir, name).join("user-data")
}

/// Default location of the shared base image: the URL's file name inside the base dir.
pub fn default_base_image(base_dir: &Path, url: &str) -> PathBuf {
    let filename = url.rsplit('/').next().filter(|f| !f.is_empty()).unwrap_or("base.img");
    base_dir.join(filename)
}

/// Config file looked up when `--config` is not given: `~/.config/mkvm/config.toml`
pub fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("mkvm").join("config.toml"))
}

/// Log file all runs append to: `~/.local/share/mkvm/mkvm.log`
pub fn default_log_file() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("mkvm")
        .join("mkvm.log")
}

/// Public key injected in SSH-key mode: `~/.ssh/id_rsa.pub`
pub fn default_ssh_public_key() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".ssh")
        .join("id_rsa.pub")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_vm_layout() {
        let base = Path::new("/srv/vms");
        assert_eq!(vm_dir(base, "vm1"), PathBuf::from("/srv/vms/vm1"));
        assert_eq!(disk_path(base, "vm1"), PathBuf::from("/srv/vms/vm1/vm1.qcow2"));
        assert_eq!(seed_path(base, "vm1"), PathBuf::from("/srv/vms/vm1/vm1-seed.iso"));
        assert_eq!(meta_data_path(base, "vm1"), PathBuf::from("/srv/vms/vm1/meta-data"));
        assert_eq!(user_data_path(base, "vm1"), PathBuf::from("/srv/vms/vm1/user-data"));
    }

    #[test]
    fn base_image_named_after_url() {
        let base = Path::new("/srv/vms");
        assert_eq!(
            default_base_image(base, "https://example.com/images/noble.img"),
            PathBuf::from("/srv/vms/noble.img")
        );
        assert_eq!(
            default_base_image(base, "https://example.com/"),
            PathBuf::from("/srv/vms/base.img")
        );
    }
}
