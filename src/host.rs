//! Everything that touches the host outside of libvirt: running the external
//! image/seed/install tools, looking them up on `PATH`, reading available
//! memory, and downloading the base image.

use std::ffi::OsString;
use std::fmt;
use std::path::Path;

use crate::error::MkvmError;
use crate::{image, util};

/// An external program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: &'static str,
    pub args: Vec<OsString>,
}

impl HostCommand {
    pub fn new(program: &'static str) -> Self {
        Self {
            program,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Arguments as lossy strings, for assertions and logs.
    pub fn arg_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = std::iter::once(self.program.to_string()).chain(self.arg_strings());
        f.write_str(&util::shell_words(words))
    }
}

/// Result of a finished external command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stderr: String,
}

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Host {
    /// Whether `tool` resolves on `PATH`.
    fn has_tool(&self, tool: &str) -> bool;

    /// Currently available memory in MB, if it can be determined.
    fn available_memory_mb(&self) -> Option<u64>;

    fn is_root(&self) -> bool;

    /// Run a command to completion. `Err` means it could not be spawned at all.
    async fn run(&self, cmd: &HostCommand) -> std::io::Result<CommandOutput>;

    /// Download `url` to `dest`.
    async fn download(&self, url: &str, dest: &Path) -> Result<(), MkvmError>;
}

/// The real host.
pub struct SystemHost;

impl Host for SystemHost {
    fn has_tool(&self, tool: &str) -> bool {
        which::which(tool).is_ok()
    }

    fn available_memory_mb(&self) -> Option<u64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        util::parse_mem_available_mb(&meminfo)
    }

    fn is_root(&self) -> bool {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }

    async fn run(&self, cmd: &HostCommand) -> std::io::Result<CommandOutput> {
        tracing::debug!(command = %cmd, "running");
        // A dropped run kills its child, so virt-install cannot define the
        // domain after cleanup has looked for it.
        let output = tokio::process::Command::new(cmd.program)
            .args(&cmd.args)
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(CommandOutput {
            success: output.status.success(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), MkvmError> {
        image::download(url, dest).await
    }
}
