use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum MkvmError {
    #[error("invalid argument: {message}")]
    #[diagnostic(code(mkvm::invalid_argument), help("run `mkvm --help` for usage"))]
    InvalidArgument { message: String },

    #[error("failed to load config from {path}")]
    #[diagnostic(code(mkvm::config))]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    #[diagnostic(code(mkvm::config))]
    ConfigParse { path: String, message: String },

    #[error("missing required dependencies: {}", .missing.join(", "))]
    #[diagnostic(
        code(mkvm::missing_dependency),
        help("install qemu-utils, cloud-image-utils and virtinst, and make sure libvirtd is running")
    )]
    MissingDependency { missing: Vec<String> },

    #[error("a domain named '{name}' already exists")]
    #[diagnostic(
        code(mkvm::already_exists),
        help("pick another name or remove the existing domain with `virsh undefine --nvram`")
    )]
    AlreadyExists { name: String },

    #[error("cannot write to {path}")]
    #[diagnostic(code(mkvm::permission_denied), help("run as root or choose another --base-dir"))]
    PermissionDenied {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{step} failed: {message}")]
    #[diagnostic(code(mkvm::provisioning_failed))]
    ProvisioningFailed { step: String, message: String },

    #[error("{message}")]
    #[diagnostic(code(mkvm::missing_prerequisite))]
    MissingPrerequisite {
        message: String,
        #[help]
        hint: String,
    },

    #[error("failed to create domain '{name}': {message}")]
    #[diagnostic(code(mkvm::domain_creation_failed))]
    DomainCreationFailed { name: String, message: String },

    #[error("libvirt error: {message}")]
    #[diagnostic(code(mkvm::libvirt))]
    Libvirt {
        message: String,
        #[help]
        hint: String,
    },

    #[error("failed to install {signal} handler")]
    #[diagnostic(code(mkvm::signal))]
    SignalHandler {
        signal: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("interrupted by {signal}")]
    #[diagnostic(code(mkvm::interrupted))]
    Interrupted { signal: &'static str },
}

impl MkvmError {
    pub(crate) fn provisioning(step: &str, message: impl Into<String>) -> Self {
        MkvmError::ProvisioningFailed {
            step: step.to_string(),
            message: message.into(),
        }
    }
}
