use crate::config::Request;
use crate::host::HostCommand;

/// `virt-install` invocation that defines and starts the domain.
///
/// Boots straight from the overlay (`--import`), attaches the seed ISO as a
/// read-only cdrom, runs headless, and returns without attaching a console.
pub fn install_command(req: &Request) -> HostCommand {
    let mut disk = std::ffi::OsString::from("path=");
    disk.push(req.disk_path());
    disk.push(",format=qcow2,bus=virtio");

    let mut seed = std::ffi::OsString::from("path=");
    seed.push(req.seed_path());
    seed.push(",device=cdrom");

    HostCommand::new("virt-install")
        .args(["--connect", req.libvirt_uri.as_str()])
        .args(["--name", req.vm_name.as_str()])
        .args(["--memory".to_string(), req.ram_mb.to_string()])
        .args(["--vcpus".to_string(), req.vcpus.to_string()])
        .arg("--disk")
        .arg(disk)
        .arg("--disk")
        .arg(seed)
        .args(["--os-variant", req.os_variant.as_str()])
        .arg("--network")
        .arg(format!("network={},model=virtio", req.network))
        .args(["--graphics", "none"])
        .arg("--import")
        .arg("--noautoconsole")
}
