use virt::connect::Connect;
use virt::domain::Domain;
use virt::error as virt_error;

use crate::error::MkvmError;

/// The hypervisor's domain registry.
pub trait Hypervisor {
    /// Check that the hypervisor can be reached at all.
    fn probe(&self) -> Result<(), MkvmError>;

    fn domain_exists(&self, name: &str) -> Result<bool, MkvmError>;

    /// Stop (if running) and undefine a domain, including its NVRAM.
    fn unregister(&self, name: &str) -> Result<(), MkvmError>;
}

struct ConnGuard(Connect);

impl std::ops::Deref for ConnGuard {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.0
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.close().ok();
    }
}

/// libvirt through the `virt` bindings.
pub struct LibvirtHypervisor {
    uri: String,
}

impl LibvirtHypervisor {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    fn connect(&self) -> Result<ConnGuard, MkvmError> {
        // Suppress libvirt's default error handler that prints to stderr;
        // errors surface through Result only.
        virt_error::clear_error_callback();

        Connect::open(Some(self.uri.as_str()))
            .map(ConnGuard)
            .map_err(|e| MkvmError::Libvirt {
                message: format!("failed to connect to libvirt: {e}"),
                hint: format!(
                    "ensure libvirtd is running and you have access to {}",
                    self.uri
                ),
            })
    }
}

impl Hypervisor for LibvirtHypervisor {
    fn probe(&self) -> Result<(), MkvmError> {
        self.connect().map(drop)
    }

    fn domain_exists(&self, name: &str) -> Result<bool, MkvmError> {
        let conn = self.connect()?;
        match Domain::lookup_by_name(&conn, name) {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.code(), virt_error::ErrorNumber::NoDomain) => Ok(false),
            Err(e) => Err(MkvmError::Libvirt {
                message: format!("domain lookup failed: {e}"),
                hint: "check libvirt permissions".into(),
            }),
        }
    }

    fn unregister(&self, name: &str) -> Result<(), MkvmError> {
        let conn = self.connect()?;
        let dom = Domain::lookup_by_name(&conn, name).map_err(|e| MkvmError::Libvirt {
            message: format!("domain lookup failed: {e}"),
            hint: "the domain may already be gone".into(),
        })?;

        if dom.is_active().unwrap_or(false) {
            tracing::info!(name, "stopping domain before undefine");
            let _ = dom.destroy();
        }

        dom.undefine_flags(virt::sys::VIR_DOMAIN_UNDEFINE_NVRAM)
            .map_err(|e| MkvmError::Libvirt {
                message: format!("failed to undefine domain: {e}"),
                hint: "check libvirt permissions".into(),
            })?;
        tracing::info!(name, "domain undefined");
        Ok(())
    }
}
