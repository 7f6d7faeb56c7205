use std::path::Path;

use crate::host::HostCommand;

/// `qemu-img create` for a qcow2 overlay backed by the given base image.
///
/// The backing format is passed explicitly so qemu-img never probes it.
pub fn create_overlay_command(base_image: &Path, overlay_path: &Path) -> HostCommand {
    HostCommand::new("qemu-img")
        .args(["create", "-f", "qcow2", "-F", "qcow2", "-b"])
        .arg(base_image)
        .arg(overlay_path)
}
