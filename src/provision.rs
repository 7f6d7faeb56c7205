//! The VM-creation workflow.
//!
//! One run walks the stages in order and stops at the first failure:
//!
//! ```text
//! Init → Validating → ProvisioningImage → BuildingDisk → BuildingSeed → CreatingDomain → Done
//!   └──────────────┴───────────────────┴──────────────┴──────────────┴────────────────→ Failed
//! ```
//!
//! Nothing before `CreatingDomain` touches the hypervisor registry. From that
//! stage on a [`RegistrationGuard`] is armed; if the run leaves without
//! disarming it (error return, or the future being dropped on SIGINT or
//! SIGTERM) the guard unregisters whatever domain of that name now exists.
//! Files under the VM directory are never rolled back.

use std::path::{Path, PathBuf};

use crate::cloudinit::{self, SeedConfig};
use crate::config::{Request, SshMode};
use crate::error::MkvmError;
use crate::host::{Host, HostCommand};
use crate::hypervisor::Hypervisor;
use crate::{domain, image, overlay};

/// External tools that must be on `PATH`.
pub const REQUIRED_TOOLS: &[&str] = &["qemu-img", "cloud-localds", "virt-install"];

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Validating,
    ProvisioningImage,
    BuildingDisk,
    BuildingSeed,
    CreatingDomain,
    Done,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::Validating => "validating",
            Stage::ProvisioningImage => "provisioning base image",
            Stage::BuildingDisk => "building disk",
            Stage::BuildingSeed => "building cloud-init seed",
            Stage::CreatingDomain => "creating domain",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub vm_dir: PathBuf,
    pub disk_path: PathBuf,
    pub seed_path: PathBuf,
    pub dry_run: bool,
}

// ── cleanup guard ────────────────────────────────────────

/// Best-effort rollback of the domain registration.
///
/// Armed when domain creation starts; unless [`disarm`](Self::disarm)ed, drop
/// checks for a domain named `name` and unregisters it. Every failure here is
/// logged and swallowed.
pub struct RegistrationGuard<'a, V: Hypervisor> {
    hypervisor: &'a V,
    name: &'a str,
    dry_run: bool,
    armed: bool,
}

impl<'a, V: Hypervisor> RegistrationGuard<'a, V> {
    pub fn arm(hypervisor: &'a V, name: &'a str, dry_run: bool) -> Self {
        Self {
            hypervisor,
            name,
            dry_run,
            armed: true,
        }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

// Blocking libvirt calls on the current thread; the run is the only task on
// the runtime.
impl<V: Hypervisor> Drop for RegistrationGuard<'_, V> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let name = self.name;
        if self.dry_run {
            tracing::info!(name, "[dry-run] would unregister domain if it was defined");
            return;
        }
        match self.hypervisor.domain_exists(name) {
            Ok(true) => {
                tracing::warn!(name, "cleaning up partially created domain");
                if let Err(e) = self.hypervisor.unregister(name) {
                    tracing::warn!(name, error = %e, "cleanup failed");
                }
            }
            Ok(false) => tracing::debug!(name, "no domain to clean up"),
            Err(e) => tracing::warn!(name, error = %e, "cleanup lookup failed"),
        }
    }
}

// ── workflow ─────────────────────────────────────────────

pub struct Provisioner<'a, H: Host, V: Hypervisor> {
    req: &'a Request,
    host: &'a H,
    hypervisor: &'a V,
    stage: Stage,
}

impl<'a, H: Host, V: Hypervisor> Provisioner<'a, H, V> {
    pub fn new(req: &'a Request, host: &'a H, hypervisor: &'a V) -> Self {
        Self {
            req,
            host,
            hypervisor,
            stage: Stage::Init,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn enter(&mut self, stage: Stage) {
        tracing::debug!(from = %self.stage, to = %stage, "stage transition");
        self.stage = stage;
    }

    /// Run every stage. On error the stage is left at [`Stage::Failed`].
    pub async fn run(&mut self) -> Result<Provisioned, MkvmError> {
        let result = self.run_stages().await;
        match &result {
            Ok(_) => self.enter(Stage::Done),
            Err(e) => {
                tracing::debug!(stage = %self.stage, error = %e, "run failed");
                self.enter(Stage::Failed);
            }
        }
        debug_assert!(self.stage.is_terminal());
        result
    }

    async fn run_stages(&mut self) -> Result<Provisioned, MkvmError> {
        let req = self.req;
        if req.dry_run {
            tracing::info!("dry-run: no changes will be made");
        }

        self.enter(Stage::Validating);
        let ssh_key = self.validate()?;

        self.enter(Stage::ProvisioningImage);
        self.ensure_base_image().await?;

        self.enter(Stage::BuildingDisk);
        tracing::info!(path = %req.disk_path().display(), "creating overlay disk");
        self.exec(&overlay::create_overlay_command(&req.base_image, &req.disk_path()))
            .await
            .map_err(|m| MkvmError::provisioning("disk creation", m))?;

        self.enter(Stage::BuildingSeed);
        self.build_seed(ssh_key.as_deref()).await?;

        self.enter(Stage::CreatingDomain);
        let guard = RegistrationGuard::arm(self.hypervisor, &req.vm_name, req.dry_run);
        tracing::info!(name = %req.vm_name, "creating domain");
        self.exec(&domain::install_command(req))
            .await
            .map_err(|message| MkvmError::DomainCreationFailed {
                name: req.vm_name.clone(),
                message,
            })?;
        guard.disarm();

        Ok(Provisioned {
            vm_dir: req.vm_dir(),
            disk_path: req.disk_path(),
            seed_path: req.seed_path(),
            dry_run: req.dry_run,
        })
    }

    /// Run a mutating external command, or only log it under dry-run.
    /// The error is the command's stderr (or spawn error).
    async fn exec(&self, cmd: &HostCommand) -> Result<(), String> {
        if self.req.dry_run {
            tracing::info!("[dry-run] {cmd}");
            return Ok(());
        }
        let output = self
            .host
            .run(cmd)
            .await
            .map_err(|e| format!("could not run {}: {e}", cmd.program))?;
        if !output.success {
            let stderr = if output.stderr.is_empty() {
                format!("{} exited with an error", cmd.program)
            } else {
                output.stderr
            };
            return Err(stderr);
        }
        Ok(())
    }

    // ── Validating ───────────────────────────────────────

    /// Checks everything that can be checked before the first mutation.
    /// Returns the public key content in SSH-key mode.
    fn validate(&self) -> Result<Option<String>, MkvmError> {
        let req = self.req;

        self.check_dependencies()?;

        if self.hypervisor.domain_exists(&req.vm_name)? {
            return Err(MkvmError::AlreadyExists {
                name: req.vm_name.clone(),
            });
        }

        match self.host.available_memory_mb() {
            Some(available) if available < req.ram_mb => tracing::warn!(
                requested_mb = req.ram_mb,
                available_mb = available,
                "requested memory exceeds available memory"
            ),
            _ => {}
        }

        if !self.host.is_root() && req.libvirt_uri.ends_with("/system") {
            tracing::warn!(
                uri = %req.libvirt_uri,
                "not running as root; libvirt will likely prompt for authentication"
            );
        }

        let ssh_key = match req.ssh_mode {
            SshMode::SshKey => Some(read_public_key(&req.ssh_public_key)?),
            SshMode::Password => None,
        };

        if req.dry_run {
            tracing::info!(path = %req.vm_dir().display(), "[dry-run] skipping directory check");
        } else {
            ensure_writable_dir(&req.vm_dir())?;
        }

        Ok(ssh_key)
    }

    fn check_dependencies(&self) -> Result<(), MkvmError> {
        let mut missing: Vec<String> = REQUIRED_TOOLS
            .iter()
            .filter(|tool| !self.host.has_tool(tool))
            .map(|tool| tool.to_string())
            .collect();

        if let Err(e) = self.hypervisor.probe() {
            tracing::debug!(error = %e, "libvirt probe failed");
            missing.push(format!("libvirt ({})", self.req.libvirt_uri));
        }

        if !missing.is_empty() {
            return Err(MkvmError::MissingDependency { missing });
        }
        Ok(())
    }

    // ── ProvisioningImage ────────────────────────────────

    async fn ensure_base_image(&self) -> Result<(), MkvmError> {
        let req = self.req;
        let base = &req.base_image;

        if base.exists() {
            tracing::info!(path = %base.display(), "using existing base image");
            return Ok(());
        }

        if req.dry_run {
            tracing::info!(
                "[dry-run] download {} -> {}",
                req.image_url,
                base.display()
            );
            tracing::info!("[dry-run] {}", image::resize_command(base, &req.disk_size));
            return Ok(());
        }

        if let Some(parent) = base.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                MkvmError::provisioning(
                    "base image download",
                    format!("creating {}: {e}", parent.display()),
                )
            })?;
        }

        if let Err(e) = self.host.download(&req.image_url, base).await {
            let _ = tokio::fs::remove_file(base).await;
            return Err(e);
        }

        tracing::info!(size = %req.disk_size, "resizing base image");
        // A failed resize leaves the downloaded image in place.
        self.exec(&image::resize_command(base, &req.disk_size))
            .await
            .map_err(|m| MkvmError::provisioning("base image resize", m))
    }

    // ── BuildingSeed ─────────────────────────────────────

    async fn build_seed(&self, ssh_key: Option<&str>) -> Result<(), MkvmError> {
        let req = self.req;
        let meta_data = cloudinit::build_meta_data(&req.vm_name);
        let user_data = cloudinit::build_user_data(&SeedConfig {
            hostname: &req.vm_name,
            ssh_mode: req.ssh_mode,
            ssh_key,
        })?;

        let meta_path = req.meta_data_path();
        let user_path = req.user_data_path();

        if req.dry_run {
            tracing::info!(path = %meta_path.display(), "[dry-run] write meta-data");
            tracing::info!(path = %user_path.display(), mode = %req.ssh_mode, "[dry-run] write user-data");
        } else {
            write_file(&meta_path, &meta_data).await?;
            write_file(&user_path, &user_data).await?;
        }

        tracing::info!(path = %req.seed_path().display(), "creating cloud-init seed");
        self.exec(&cloudinit::seed_command(&req.seed_path(), &user_path, &meta_path))
            .await
            .map_err(|m| MkvmError::provisioning("seed creation", m))
    }
}

async fn write_file(path: &Path, contents: &str) -> Result<(), MkvmError> {
    tokio::fs::write(path, contents).await.map_err(|e| {
        MkvmError::provisioning("seed creation", format!("writing {}: {e}", path.display()))
    })
}

/// Read and sanity-check the public key injected in SSH-key mode.
fn read_public_key(path: &Path) -> Result<String, MkvmError> {
    let content = std::fs::read_to_string(path).map_err(|e| MkvmError::MissingPrerequisite {
        message: format!("SSH public key {} not readable: {e}", path.display()),
        hint: "generate one with `ssh-keygen`, or set ssh_public_key in the config file".into(),
    })?;

    ssh_key::PublicKey::from_openssh(content.trim()).map_err(|e| {
        MkvmError::MissingPrerequisite {
            message: format!("{} is not an OpenSSH public key: {e}", path.display()),
            hint: "point ssh_public_key at a .pub file".into(),
        }
    })?;

    Ok(content)
}

/// Create `dir` if needed and prove it is writable with a throwaway file.
fn ensure_writable_dir(dir: &Path) -> Result<(), MkvmError> {
    let denied = |source| MkvmError::PermissionDenied {
        path: dir.display().to_string(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(denied)?;
    let probe = dir.join(".mkvm-write-test");
    std::fs::write(&probe, b"").map_err(denied)?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_request;
    use crate::host::CommandOutput;
    use std::cell::RefCell;
    use std::collections::BTreeSet;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl ops@example";

    /// Simulated host plus domain registry. Commands are recorded; the ones
    /// that produce files create them so later stages see them.
    #[derive(Default)]
    struct FakePlatform {
        commands: RefCell<Vec<HostCommand>>,
        downloads: RefCell<Vec<String>>,
        domains: RefCell<BTreeSet<String>>,
        missing_tools: Vec<&'static str>,
        libvirt_down: bool,
        fail_program: Option<&'static str>,
        fail_download: bool,
        /// virt-install registers the domain before failing.
        register_then_fail: bool,
        fail_unregister: bool,
        unregister_calls: RefCell<Vec<String>>,
        memory_mb: Option<u64>,
    }

    impl FakePlatform {
        fn programs(&self) -> Vec<&'static str> {
            self.commands.borrow().iter().map(|c| c.program).collect()
        }
    }

    impl Host for FakePlatform {
        fn has_tool(&self, tool: &str) -> bool {
            !self.missing_tools.contains(&tool)
        }

        fn available_memory_mb(&self) -> Option<u64> {
            self.memory_mb
        }

        fn is_root(&self) -> bool {
            true
        }

        async fn run(&self, cmd: &HostCommand) -> std::io::Result<CommandOutput> {
            self.commands.borrow_mut().push(cmd.clone());
            let args = cmd.arg_strings();

            if cmd.program == "virt-install" && self.register_then_fail {
                self.domains.borrow_mut().insert(args[3].clone());
                return Ok(CommandOutput {
                    success: false,
                    stderr: "ERROR    internal error: process exited while connecting to monitor".into(),
                });
            }
            if self.fail_program == Some(cmd.program) {
                return Ok(CommandOutput {
                    success: false,
                    stderr: format!("{} blew up", cmd.program),
                });
            }

            match cmd.program {
                "qemu-img" if args[0] == "create" => {
                    std::fs::write(args.last().unwrap(), b"qcow2 overlay")?;
                }
                "cloud-localds" => std::fs::write(&args[0], b"seed")?,
                "virt-install" => {
                    self.domains.borrow_mut().insert(args[3].clone());
                }
                _ => {}
            }
            Ok(CommandOutput {
                success: true,
                stderr: String::new(),
            })
        }

        async fn download(&self, url: &str, dest: &Path) -> Result<(), MkvmError> {
            self.downloads.borrow_mut().push(url.to_string());
            if self.fail_download {
                std::fs::write(dest, b"partial").unwrap();
                return Err(MkvmError::provisioning("base image download", "connection reset"));
            }
            std::fs::write(dest, b"base image").unwrap();
            Ok(())
        }
    }

    impl Hypervisor for FakePlatform {
        fn probe(&self) -> Result<(), MkvmError> {
            if self.libvirt_down {
                return Err(MkvmError::Libvirt {
                    message: "failed to connect".into(),
                    hint: String::new(),
                });
            }
            Ok(())
        }

        fn domain_exists(&self, name: &str) -> Result<bool, MkvmError> {
            Ok(self.domains.borrow().contains(name))
        }

        fn unregister(&self, name: &str) -> Result<(), MkvmError> {
            self.unregister_calls.borrow_mut().push(name.to_string());
            if self.fail_unregister {
                return Err(MkvmError::Libvirt {
                    message: "undefine failed".into(),
                    hint: String::new(),
                });
            }
            self.domains.borrow_mut().remove(name);
            Ok(())
        }
    }

    fn with_base_image(dir: &Path, req: &Request) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(&req.base_image, b"base image").unwrap();
    }

    async fn run(req: &Request, platform: &FakePlatform) -> Result<Provisioned, MkvmError> {
        Provisioner::new(req, platform, platform).run().await
    }

    #[tokio::test]
    async fn scenario_a_defaults_with_existing_base_image() {
        let dir = tempfile::tempdir().unwrap();
        let req = test_request("vm1", dir.path());
        with_base_image(dir.path(), &req);
        let platform = FakePlatform::default();

        let out = run(&req, &platform).await.unwrap();

        assert_eq!(req.ram_mb, 4096);
        assert_eq!(req.vcpus, 4);
        assert_eq!(req.disk_size, "32G");
        assert_eq!(req.network, "default");
        assert_eq!(req.ssh_mode, SshMode::Password);

        let vm_dir = dir.path().join("vm1");
        assert_eq!(out.vm_dir, vm_dir);
        for f in ["meta-data", "user-data", "vm1.qcow2", "vm1-seed.iso"] {
            assert!(vm_dir.join(f).exists(), "{f} missing");
        }
        assert!(!vm_dir.join(".mkvm-write-test").exists());
        assert!(platform.domains.borrow().contains("vm1"));
        assert!(platform.downloads.borrow().is_empty());
        assert_eq!(
            platform.programs(),
            ["qemu-img", "cloud-localds", "virt-install"]
        );

        let user_data = std::fs::read_to_string(vm_dir.join("user-data")).unwrap();
        assert!(user_data.contains("password: ubuntu"));
        let meta_data = std::fs::read_to_string(vm_dir.join("meta-data")).unwrap();
        assert_eq!(meta_data, "instance-id: vm1\nlocal-hostname: vm1\n");
    }

    #[tokio::test]
    async fn scenario_b_ssh_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = test_request("vm2", dir.path());
        req.ram_mb = 8192;
        req.vcpus = 8;
        req.disk_size = "64G".into();
        req.ssh_mode = SshMode::SshKey;
        with_base_image(dir.path(), &req);
        std::fs::write(&req.ssh_public_key, format!("{KEY}\n")).unwrap();
        let platform = FakePlatform::default();

        run(&req, &platform).await.unwrap();

        let user_data = std::fs::read_to_string(dir.path().join("vm2/user-data")).unwrap();
        assert!(user_data.contains(KEY));
        assert!(user_data.contains("ssh_pwauth: false"));
        assert!(!user_data.contains("password"));

        let install = platform.commands.borrow().last().unwrap().arg_strings();
        assert!(install.windows(2).any(|w| w == ["--memory", "8192"]));
        assert!(install.windows(2).any(|w| w == ["--vcpus", "8"]));
    }

    #[tokio::test]
    async fn scenario_c_second_run_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let req = test_request("vm1", dir.path());
        with_base_image(dir.path(), &req);
        let platform = FakePlatform::default();

        run(&req, &platform).await.unwrap();
        let disk_before = std::fs::read(req.disk_path()).unwrap();
        let commands_before = platform.commands.borrow().len();

        let mut provisioner = Provisioner::new(&req, &platform, &platform);
        let err = provisioner.run().await.unwrap_err();

        assert!(matches!(err, MkvmError::AlreadyExists { ref name } if name == "vm1"));
        assert_eq!(provisioner.stage(), Stage::Failed);
        assert_eq!(platform.commands.borrow().len(), commands_before);
        assert!(platform.unregister_calls.borrow().is_empty());
        assert!(platform.domains.borrow().contains("vm1"));
        assert_eq!(std::fs::read(req.disk_path()).unwrap(), disk_before);
    }

    #[tokio::test]
    async fn existing_domain_causes_no_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let req = test_request("taken", dir.path());
        let platform = FakePlatform::default();
        platform.domains.borrow_mut().insert("taken".into());

        let err = run(&req, &platform).await.unwrap_err();

        assert!(matches!(err, MkvmError::AlreadyExists { .. }));
        assert!(!req.vm_dir().exists());
        assert!(platform.commands.borrow().is_empty());
        assert!(platform.downloads.borrow().is_empty());
        assert!(platform.unregister_calls.borrow().is_empty());
    }

    #[tokio::test]
    async fn scenario_d_failed_install_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let req = test_request("vm1", dir.path());
        with_base_image(dir.path(), &req);
        let platform = FakePlatform {
            register_then_fail: true,
            ..Default::default()
        };

        let err = run(&req, &platform).await.unwrap_err();

        assert!(matches!(err, MkvmError::DomainCreationFailed { .. }));
        assert_eq!(*platform.unregister_calls.borrow(), ["vm1"]);
        assert!(platform.domains.borrow().is_empty());
        assert!(req.disk_path().exists());
        assert!(req.seed_path().exists());
    }

    #[tokio::test]
    async fn failed_cleanup_does_not_change_the_error() {
        let dir = tempfile::tempdir().unwrap();
        let req = test_request("vm1", dir.path());
        with_base_image(dir.path(), &req);
        let platform = FakePlatform {
            register_then_fail: true,
            fail_unregister: true,
            ..Default::default()
        };

        let err = run(&req, &platform).await.unwrap_err();

        assert!(matches!(err, MkvmError::DomainCreationFailed { .. }));
        assert_eq!(platform.unregister_calls.borrow().len(), 1);
    }

    #[tokio::test]
    async fn install_failure_without_registration_skips_unregister() {
        let dir = tempfile::tempdir().unwrap();
        let req = test_request("vm1", dir.path());
        with_base_image(dir.path(), &req);
        let platform = FakePlatform {
            fail_program: Some("virt-install"),
            ..Default::default()
        };

        let err = run(&req, &platform).await.unwrap_err();

        assert!(matches!(err, MkvmError::DomainCreationFailed { .. }));
        assert!(platform.unregister_calls.borrow().is_empty());
    }

    #[tokio::test]
    async fn dry_run_executes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = test_request("vm1", dir.path());
        req.dry_run = true;
        let platform = FakePlatform::default();

        let out = run(&req, &platform).await.unwrap();

        assert!(out.dry_run);
        assert!(platform.commands.borrow().is_empty());
        assert!(platform.downloads.borrow().is_empty());
        assert!(platform.domains.borrow().is_empty());
        assert!(!req.base_image.exists());
        assert!(!req.vm_dir().exists());
    }

    /// Formatted log output, shared with the subscriber installed for a test.
    #[derive(Clone, Default)]
    struct LogCapture(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogCapture {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test]
    async fn dry_run_logs_every_skipped_step() {
        let capture = LogCapture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let dir = tempfile::tempdir().unwrap();
        let mut req = test_request("vm1", dir.path());
        req.dry_run = true;
        let platform = FakePlatform::default();

        run(&req, &platform).await.unwrap();

        let logs = capture.contents();
        for line in [
            format!("[dry-run] download {} -> {}", req.image_url, req.base_image.display()),
            format!("[dry-run] qemu-img resize {} 32G", req.base_image.display()),
            format!(
                "[dry-run] qemu-img create -f qcow2 -F qcow2 -b {} {}",
                req.base_image.display(),
                req.disk_path().display()
            ),
            "[dry-run] write meta-data".to_string(),
            "[dry-run] write user-data".to_string(),
            format!(
                "[dry-run] cloud-localds {} {} {}",
                req.seed_path().display(),
                req.user_data_path().display(),
                req.meta_data_path().display()
            ),
            "[dry-run] virt-install --connect qemu:///system --name vm1".to_string(),
        ] {
            assert!(logs.contains(&line), "missing {line:?} in:\n{logs}");
        }
        assert!(platform.commands.borrow().is_empty());
    }

    #[tokio::test]
    async fn dry_run_still_rejects_existing_domain() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = test_request("vm1", dir.path());
        req.dry_run = true;
        let platform = FakePlatform::default();
        platform.domains.borrow_mut().insert("vm1".into());

        let err = run(&req, &platform).await.unwrap_err();
        assert!(matches!(err, MkvmError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn ssh_key_mode_without_key_fails_before_any_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = test_request("vm1", dir.path());
        req.ssh_mode = SshMode::SshKey;
        with_base_image(dir.path(), &req);
        let platform = FakePlatform::default();

        let err = run(&req, &platform).await.unwrap_err();

        assert!(matches!(err, MkvmError::MissingPrerequisite { .. }));
        assert!(!req.disk_path().exists());
        assert!(!req.seed_path().exists());
        assert!(platform.commands.borrow().is_empty());
    }

    #[tokio::test]
    async fn ssh_key_mode_rejects_garbage_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = test_request("vm1", dir.path());
        req.ssh_mode = SshMode::SshKey;
        with_base_image(dir.path(), &req);
        std::fs::write(&req.ssh_public_key, "not a key\n").unwrap();
        let platform = FakePlatform::default();

        let err = run(&req, &platform).await.unwrap_err();
        assert!(matches!(err, MkvmError::MissingPrerequisite { .. }));
    }

    #[tokio::test]
    async fn all_missing_dependencies_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let req = test_request("vm1", dir.path());
        let platform = FakePlatform {
            missing_tools: vec!["qemu-img", "virt-install"],
            libvirt_down: true,
            ..Default::default()
        };

        let err = run(&req, &platform).await.unwrap_err();

        match err {
            MkvmError::MissingDependency { missing } => assert_eq!(
                missing,
                ["qemu-img", "virt-install", "libvirt (qemu:///system)"]
            ),
            other => panic!("expected MissingDependency, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn low_memory_only_warns() {
        let dir = tempfile::tempdir().unwrap();
        let req = test_request("vm1", dir.path());
        with_base_image(dir.path(), &req);
        let platform = FakePlatform {
            memory_mb: Some(512),
            ..Default::default()
        };

        run(&req, &platform).await.unwrap();
    }

    #[tokio::test]
    async fn unwritable_base_dir_is_permission_denied() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the VM directory's parent should be.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let mut req = test_request("vm1", &blocker);
        req.base_image = dir.path().join("base.img");
        std::fs::write(&req.base_image, b"base image").unwrap();
        let platform = FakePlatform::default();

        let err = run(&req, &platform).await.unwrap_err();

        assert!(matches!(err, MkvmError::PermissionDenied { .. }));
        assert!(platform.commands.borrow().is_empty());
    }

    #[tokio::test]
    async fn missing_base_image_is_downloaded_and_resized() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = test_request("vm1", dir.path());
        req.disk_size = "64G".into();
        let platform = FakePlatform::default();

        run(&req, &platform).await.unwrap();

        assert_eq!(*platform.downloads.borrow(), [req.image_url.clone()]);
        let commands = platform.commands.borrow();
        assert_eq!(commands[0].program, "qemu-img");
        let base = req.base_image.display().to_string();
        assert_eq!(commands[0].arg_strings(), ["resize", base.as_str(), "64G"]);
        assert!(req.base_image.exists());
    }

    #[tokio::test]
    async fn failed_download_removes_partial_file_and_skips_resize() {
        let dir = tempfile::tempdir().unwrap();
        let req = test_request("vm1", dir.path());
        let platform = FakePlatform {
            fail_download: true,
            ..Default::default()
        };

        let err = run(&req, &platform).await.unwrap_err();

        assert!(matches!(err, MkvmError::ProvisioningFailed { .. }));
        assert!(!req.base_image.exists());
        assert!(platform.commands.borrow().is_empty());
    }

    #[tokio::test]
    async fn failed_resize_keeps_downloaded_image() {
        let dir = tempfile::tempdir().unwrap();
        let req = test_request("vm1", dir.path());
        let platform = FakePlatform {
            fail_program: Some("qemu-img"),
            ..Default::default()
        };

        let err = run(&req, &platform).await.unwrap_err();

        match err {
            MkvmError::ProvisioningFailed { step, message } => {
                assert_eq!(step, "base image resize");
                assert_eq!(message, "qemu-img blew up");
            }
            other => panic!("expected ProvisioningFailed, got {other:?}"),
        }
        assert!(req.base_image.exists());
        assert!(!req.disk_path().exists());
    }

    #[tokio::test]
    async fn failed_seed_keeps_disk_and_skips_install() {
        let dir = tempfile::tempdir().unwrap();
        let req = test_request("vm1", dir.path());
        with_base_image(dir.path(), &req);
        let platform = FakePlatform {
            fail_program: Some("cloud-localds"),
            ..Default::default()
        };

        let err = run(&req, &platform).await.unwrap_err();

        assert!(matches!(err, MkvmError::ProvisioningFailed { .. }));
        assert!(req.disk_path().exists());
        assert!(req.user_data_path().exists());
        assert!(!platform.programs().contains(&"virt-install"));
        assert!(platform.unregister_calls.borrow().is_empty());
    }

    #[test]
    fn dropped_guard_unregisters_existing_domain() {
        let platform = FakePlatform::default();
        platform.domains.borrow_mut().insert("vm1".into());

        drop(RegistrationGuard::arm(&platform, "vm1", false));

        assert_eq!(*platform.unregister_calls.borrow(), ["vm1"]);
    }

    #[test]
    fn disarmed_guard_leaves_domain_alone() {
        let platform = FakePlatform::default();
        platform.domains.borrow_mut().insert("vm1".into());

        RegistrationGuard::arm(&platform, "vm1", false).disarm();

        assert!(platform.unregister_calls.borrow().is_empty());
        assert!(platform.domains.borrow().contains("vm1"));
    }

    #[test]
    fn dry_run_guard_never_unregisters() {
        let platform = FakePlatform::default();
        platform.domains.borrow_mut().insert("vm1".into());

        drop(RegistrationGuard::arm(&platform, "vm1", true));

        assert!(platform.unregister_calls.borrow().is_empty());
    }

    #[test]
    fn terminal_stages() {
        assert!(Stage::Done.is_terminal());
        assert!(Stage::Failed.is_terminal());
        assert!(!Stage::CreatingDomain.is_terminal());
    }
}
