/// UnikontainerError is the root error type for the library. Lower modules
/// keep their own error enums and are folded in here through `#[from]`.
#[derive(Debug, thiserror::Error)]
pub enum UnikontainerError {
    #[error("failed to perform operation due to incorrect container status")]
    IncorrectStatus,
    #[error("container already exists")]
    Exist,
    #[error("container state directory does not exist")]
    NoDirectory,
    #[error("invalid input")]
    InvalidInput(String),
    #[error("container {0} is still running")]
    StillRunning(String),
    #[error("bundle is not a unikernel")]
    NotUnikernel,
    #[error("bundle is a knative queue-proxy")]
    QueueProxy,

    // Invalid inputs
    #[error(transparent)]
    InvalidID(#[from] ErrInvalidID),
    #[error(transparent)]
    MissingSpec(#[from] MissingSpecError),
    #[error(transparent)]
    InvalidSpec(#[from] ErrInvalidSpec),

    // Errors from submodules and other errors
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Ipc(#[from] crate::ipc::IpcError),
    #[error(transparent)]
    State(#[from] crate::container::state::StateError),
    #[error(transparent)]
    Syscall(#[from] crate::syscall::SyscallError),
    #[error(transparent)]
    Rootfs(#[from] crate::rootfs::RootfsError),
    #[error(transparent)]
    Block(#[from] crate::rootfs::block::BlockError),
    #[error(transparent)]
    Network(#[from] crate::network::NetworkError),
    #[error(transparent)]
    Vmm(#[from] crate::vmm::VmmError),
    #[error(transparent)]
    Unikernel(#[from] crate::unikernel::UnikernelError),
    #[error(transparent)]
    Hook(#[from] crate::hooks::HookError),
    #[error(transparent)]
    Tty(#[from] crate::tty::TTYError),
    #[error(transparent)]
    Namespace(#[from] crate::namespaces::NamespaceError),
    #[error(transparent)]
    Workload(#[from] crate::workload::WorkloadError),
    #[error(transparent)]
    Signal(#[from] crate::signal::SignalError<String>),
    #[error(transparent)]
    OciSpec(#[from] oci_spec::OciSpecError),
    #[error(transparent)]
    Procfs(#[from] procfs::ProcError),
    #[error(transparent)]
    OtherIO(#[from] std::io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error("{0}")]
    Other(String),
}

impl UnikontainerError {
    /// Whether the bundle belongs to runc rather than to this runtime.
    pub fn is_for_runc(&self) -> bool {
        matches!(self, Self::NotUnikernel | Self::QueueProxy)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ErrInvalidID {
    #[error("container id can't be empty")]
    Empty,
    #[error("container id contains invalid characters: {0}")]
    InvalidChars(char),
    #[error("container id can't be used to represent a file name (such as . or ..)")]
    FileName,
}

#[derive(Debug, thiserror::Error)]
pub enum MissingSpecError {
    #[error("missing process in spec")]
    Process,
    #[error("missing linux in spec")]
    Linux,
    #[error("missing args in the process spec")]
    Args,
    #[error("missing root in the OCI spec")]
    Root,
}

#[derive(Debug, thiserror::Error)]
pub enum ErrInvalidSpec {
    #[error("runtime spec has incompatible version. Only 1.X.Y is supported")]
    UnsupportedVersion,
}
