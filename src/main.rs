use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use miette::Diagnostic;

use mkvm::cli::Cli;
use mkvm::config::{self, Request, SshMode};
use mkvm::error::MkvmError;
use mkvm::host::SystemHost;
use mkvm::hypervisor::LibvirtHypervisor;
use mkvm::provision::{Provisioned, Provisioner};
use mkvm::shutdown::Shutdown;
use mkvm::{logging, paths};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version come through here too.
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let file_handle = logging::init(cli.verbose);

    match run(&cli, &file_handle).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, file_handle: &logging::DeferredFileHandle) -> Result<(), MkvmError> {
    let file_config = match config::load_file_config(cli.config.as_deref()) {
        Ok(file_config) => file_config,
        Err(e) => {
            // Still record the failure in the default log.
            activate_log_file(file_handle, &paths::default_log_file());
            return Err(e);
        }
    };
    activate_log_file(file_handle, &file_config.log_file());

    let req = config::resolve(cli, &file_config)?;
    tracing::info!(
        name = %req.vm_name,
        ram_mb = req.ram_mb,
        vcpus = req.vcpus,
        disk = %req.disk_size,
        network = %req.network,
        auth = %req.ssh_mode,
        "creating VM"
    );

    let host = SystemHost;
    let hypervisor = LibvirtHypervisor::new(req.libvirt_uri.clone());
    let mut shutdown = Shutdown::install()?;
    let mut provisioner = Provisioner::new(&req, &host, &hypervisor);

    // Dropping the run future on a signal fires the registration guard.
    let finished = tokio::select! {
        result = provisioner.run() => Ok(result),
        signal = shutdown.recv() => Err(signal),
    };
    let outcome = match finished {
        Ok(result) => result?,
        Err(signal) => {
            tracing::warn!(signal, stage = %provisioner.stage(), "interrupted");
            return Err(MkvmError::Interrupted { signal });
        }
    };

    print_summary(&req, &outcome);
    Ok(())
}

fn activate_log_file(file_handle: &logging::DeferredFileHandle, path: &Path) {
    if let Err(e) = file_handle.set_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "log file unavailable");
    }
}

fn report(e: &MkvmError) {
    tracing::error!("{e}");
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        tracing::error!("  caused by: {cause}");
        source = cause.source();
    }
    if let Some(help) = e.help() {
        tracing::error!("  help: {help}");
    }
}

fn print_summary(req: &Request, outcome: &Provisioned) {
    if outcome.dry_run {
        tracing::info!(name = %req.vm_name, "[dry-run] complete, nothing was changed");
        return;
    }

    tracing::info!(name = %req.vm_name, dir = %outcome.vm_dir.display(), "VM created");
    tracing::info!(disk = %outcome.disk_path.display(), seed = %outcome.seed_path.display(), "files");
    tracing::info!(
        "console: virsh --connect {} console {}",
        req.libvirt_uri,
        req.vm_name
    );
    tracing::info!(
        "address: virsh --connect {} domifaddr {}",
        req.libvirt_uri,
        req.vm_name
    );
    match req.ssh_mode {
        SshMode::Password => tracing::info!(
            "login: ubuntu / {} (password)",
            mkvm::cloudinit::DEFAULT_PASSWORD
        ),
        SshMode::SshKey => tracing::info!("login: ubuntu (SSH key only)"),
    }
}
