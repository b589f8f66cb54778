use std::path::PathBuf;

use super::init_builder::InitContainerBuilder;
use crate::error::{ErrInvalidID, UnikontainerError};
use crate::syscall::syscall::SyscallType;
use crate::utils::PathBufExt;

/// Program the engine re-invokes to run the container side of the handshake.
pub const SELF_EXE: &str = "/proc/self/exe";

pub struct ContainerBuilder {
    /// Id of the container
    pub(super) container_id: String,
    /// Root directory for container state
    pub(super) root_path: PathBuf,
    /// Interface to operating system primitives
    pub(super) syscall: SyscallType,
    /// File which will be used to communicate the pid of the
    /// container process to the higher level runtime
    pub(super) pid_file: Option<PathBuf>,
    /// Socket to communicate the file descriptor of the ptty
    pub(super) console_socket: Option<PathBuf>,
    /// Arguments handed to [`SELF_EXE`] when spawning the reexec'd process
    pub(super) reexec_args: Vec<String>,
}

/// Builder for the configuration every new unikernel container shares.
///
/// # Example
///
/// ```no_run
/// use libunikontainer::container::builder::ContainerBuilder;
/// use libunikontainer::context::RuntimeContext;
/// use libunikontainer::syscall::syscall::SyscallType;
///
/// let ctx = RuntimeContext::new("/run/urunc");
/// ContainerBuilder::new("74f1a4cb3801".to_owned(), SyscallType::default())
///     .with_root_path("/run/urunc").expect("invalid root path")
///     .with_pid_file(Some("/var/run/uk.pid")).expect("invalid pid file")
///     .with_console_socket(Some("/var/run/uk/sock.tty"))
///     .with_reexec_args(vec!["create".to_owned(), "--reexec".to_owned()])
///     .as_init("/var/run/uk/bundle")
///     .build(&ctx);
/// ```
impl ContainerBuilder {
    pub fn new(container_id: String, syscall: SyscallType) -> Self {
        let root_path = PathBuf::from("/run/urunc");
        Self {
            container_id,
            root_path,
            syscall,
            pid_file: None,
            console_socket: None,
            reexec_args: vec![],
        }
    }

    /// validate_id checks if the supplied container ID is valid, returning
    /// the ErrInvalidID in case it is not.
    ///
    /// A valid ID is a non-empty string made of Latin letters, digits,
    /// underscore, plus sign, minus sign and period. IDs that can't be used
    /// to represent a file name (such as . or ..) are rejected.
    pub fn validate_id(self) -> Result<Self, UnikontainerError> {
        let container_id = self.container_id.clone();
        if container_id.is_empty() {
            Err(ErrInvalidID::Empty)?;
        }

        if container_id == "." || container_id == ".." {
            Err(ErrInvalidID::FileName)?;
        }

        for c in container_id.chars() {
            match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '+' | '-' | '.' => (),
                _ => Err(ErrInvalidID::InvalidChars(c))?,
            }
        }
        Ok(self)
    }

    /// Transforms this builder into an init builder for the bundle at `bundle`
    #[allow(clippy::wrong_self_convention)]
    pub fn as_init<P: Into<PathBuf>>(self, bundle: P) -> InitContainerBuilder {
        InitContainerBuilder::new(self, bundle.into())
    }

    /// Sets the root path which will be used to store the container state
    pub fn with_root_path<P: Into<PathBuf>>(mut self, path: P) -> Result<Self, UnikontainerError> {
        let path = path.into();
        self.root_path = path.canonicalize_safely().map_err(|err| {
            tracing::error!(?path, ?err, "failed to canonicalize root path");
            UnikontainerError::InvalidInput(format!("invalid root path {path:?}: {err:?}"))
        })?;

        Ok(self)
    }

    /// Sets the pid file which will be used to write the pid of the container
    /// process
    pub fn with_pid_file<P: Into<PathBuf>>(
        mut self,
        path: Option<P>,
    ) -> Result<Self, UnikontainerError> {
        self.pid_file = match path.map(|p| p.into()) {
            Some(path) => Some(path.canonicalize_safely().map_err(|err| {
                tracing::error!(?path, ?err, "failed to canonicalize pid file");
                UnikontainerError::InvalidInput(format!("invalid pid file path {path:?}: {err:?}"))
            })?),
            None => None,
        };

        Ok(self)
    }

    /// Sets the console socket, which will be used to send the file descriptor
    /// of the pseudoterminal
    pub fn with_console_socket<P: Into<PathBuf>>(mut self, path: Option<P>) -> Self {
        self.console_socket = path.map(|p| p.into());
        self
    }

    /// Sets the arguments the reexec'd process is started with. They must
    /// route the new process back into the container side of the handshake.
    pub fn with_reexec_args(mut self, args: Vec<String>) -> Self {
        self.reexec_args = args;
        self
    }
}
