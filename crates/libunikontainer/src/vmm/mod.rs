//! Monitors that run the guest.
//!
//! A [`Vmm`] renders the execution parameters and the unikernel specific
//! options into the argv of its binary and replaces the current process with
//! it.

mod firecracker;
mod hedge;
mod qemu;
mod solo5;

use std::convert::Infallible;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use firecracker::{Firecracker, FC_CONFIG_FILE};
pub use hedge::Hedge;
pub use qemu::Qemu;
pub use solo5::{Hvt, Spt};

use crate::unikernel::Unikernel;

/// Memory given to the guest when the OCI spec sets no limit, in MiB.
pub const DEFAULT_MEMORY_MB: u64 = 256;

#[derive(Debug, thiserror::Error)]
pub enum VmmError {
    #[error("vmm {0:?} is not supported")]
    UnsupportedVmm(String),
    #[error("{binary} was not found in PATH")]
    VmmNotInstalled {
        binary: String,
        source: which::Error,
    },
    #[error("{0} is not implemented yet")]
    NotImplemented(&'static str),
    #[error("argument contains a nul byte: {0:?}")]
    InvalidArgument(String),
    #[error("failed to write {path:?}")]
    WriteConfig {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode the monitor configuration")]
    Encode(#[from] serde_json::Error),
    #[error("failed to set no_new_privs")]
    NoNewPrivs(#[source] nix::Error),
    #[error("failed to exec {path:?}")]
    Exec { path: PathBuf, source: nix::Error },
}

type Result<T> = std::result::Result<T, VmmError>;

/// Everything the monitor needs to boot the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecArgs {
    pub container_id: String,
    /// Path of the guest kernel inside the monitor rootfs
    pub unikernel_path: PathBuf,
    pub tap_device: Option<String>,
    pub block_device: Option<String>,
    pub initrd_path: Option<PathBuf>,
    /// Guest command line, as rendered by the unikernel
    pub command: String,
    pub guest_mac: Option<String>,
    pub seccomp: bool,
    pub mem_size_b: u64,
    pub environment: Vec<String>,
}

impl ExecArgs {
    pub fn mem_size_mb(&self) -> u64 {
        match self.mem_size_b / (1024 * 1024) {
            0 => DEFAULT_MEMORY_MB,
            mb => mb,
        }
    }
}

/// What an external VM registry reports for a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Running,
    Unknown,
    /// The registry could not be queried.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmKind {
    Spt,
    Hvt,
    Qemu,
    Firecracker,
    Hedge,
}

impl VmmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmmKind::Spt => "spt",
            VmmKind::Hvt => "hvt",
            VmmKind::Qemu => "qemu",
            VmmKind::Firecracker => "firecracker",
            VmmKind::Hedge => "hedge",
        }
    }

    /// Whether the monitor needs /dev/kvm.
    pub fn uses_kvm(&self) -> bool {
        !matches!(self, VmmKind::Spt)
    }

    /// Whether guests outlive the monitor process in a registry of their own.
    pub fn has_registry(&self) -> bool {
        matches!(self, VmmKind::Hedge)
    }
}

impl FromStr for VmmKind {
    type Err = VmmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "spt" => Ok(VmmKind::Spt),
            "hvt" => Ok(VmmKind::Hvt),
            "qemu" => Ok(VmmKind::Qemu),
            "firecracker" => Ok(VmmKind::Firecracker),
            "hedge" => Ok(VmmKind::Hedge),
            other => Err(VmmError::UnsupportedVmm(other.to_string())),
        }
    }
}

pub trait Vmm {
    fn kind(&self) -> VmmKind;
    /// Absolute path of the monitor binary.
    fn path(&self) -> &Path;
    fn healthcheck(&self) -> Result<()>;
    /// Tears down monitor state for `container_id`. Process backed monitors
    /// die with their process and have nothing to do.
    fn stop(&self, _container_id: &str) -> Result<()> {
        Ok(())
    }
    /// State of the guest named `name` in the monitor's registry. Process
    /// backed monitors keep none.
    fn vm_state(&self, _name: &str) -> VmState {
        VmState::Unknown
    }
    /// Renders the full argv, program name first.
    fn build_args(&self, args: &ExecArgs, unikernel: &dyn Unikernel) -> Result<Vec<String>>;
    /// Runs right before the exec, after every privilege has been dropped.
    fn prepare(&self, _args: &ExecArgs) -> Result<()> {
        Ok(())
    }

    /// Replaces the current process with the monitor. Only returns on
    /// failure.
    fn execve(&self, args: &ExecArgs, unikernel: &dyn Unikernel) -> Result<Infallible> {
        let argv = self.build_args(args, unikernel)?;
        self.prepare(args)?;
        tracing::info!(vmm = self.kind().as_str(), ?argv, "ready to execve the monitor");
        exec(self.path(), &argv, &args.environment)
    }
}

fn to_cstrings(values: &[String]) -> Result<Vec<CString>> {
    values
        .iter()
        .map(|v| CString::new(v.as_bytes()).map_err(|_| VmmError::InvalidArgument(v.clone())))
        .collect()
}

fn exec(path: &Path, argv: &[String], env: &[String]) -> Result<Infallible> {
    let program = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| VmmError::InvalidArgument(path.display().to_string()))?;
    let argv = to_cstrings(argv)?;
    let env = to_cstrings(env)?;
    nix::unistd::execve(&program, &argv, &env).map_err(|err| VmmError::Exec {
        path: path.to_path_buf(),
        source: err,
    })
}

fn find_binary(binary: &str) -> Result<PathBuf> {
    which::which(binary).map_err(|err| VmmError::VmmNotInstalled {
        binary: binary.to_string(),
        source: err,
    })
}

/// Splits `cli` into arguments after appending `value` to it, so options
/// that end in `=` take the value in place.
fn cli_with_value(cli: &str, value: &str) -> Vec<String> {
    format!("{cli}{value}")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Builds the monitor registered for `hypervisor`.
pub fn new_vmm(hypervisor: &str) -> Result<Box<dyn Vmm>> {
    let kind: VmmKind = hypervisor.parse().map_err(|err| {
        tracing::error!(hypervisor, "unsupported vmm");
        err
    })?;
    let vmm: Box<dyn Vmm> = match kind {
        VmmKind::Spt => Box::new(Spt::new()?),
        VmmKind::Hvt => Box::new(Hvt::new()?),
        VmmKind::Qemu => Box::new(Qemu::new()?),
        VmmKind::Firecracker => Box::new(Firecracker::new()?),
        VmmKind::Hedge => Box::new(Hedge),
    };
    Ok(vmm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vmm_kind() {
        assert_eq!("hvt".parse::<VmmKind>().unwrap(), VmmKind::Hvt);
        assert_eq!(VmmKind::Firecracker.as_str(), "firecracker");
        assert!(!VmmKind::Spt.uses_kvm());
        assert!(VmmKind::Qemu.uses_kvm());
        assert!(VmmKind::Hedge.has_registry());
        assert!(!VmmKind::Hvt.has_registry());
        assert!(matches!(
            new_vmm("xen"),
            Err(VmmError::UnsupportedVmm(name)) if name == "xen"
        ));
    }

    #[test]
    fn test_mem_size() {
        let mut args = ExecArgs::default();
        assert_eq!(args.mem_size_mb(), DEFAULT_MEMORY_MB);
        args.mem_size_b = 512 * 1024;
        assert_eq!(args.mem_size_mb(), DEFAULT_MEMORY_MB);
        args.mem_size_b = 1024 * 1024 * 1024;
        assert_eq!(args.mem_size_mb(), 1024);
    }

    #[test]
    fn test_cli_with_value() {
        assert_eq!(cli_with_value("--net:tap=", "tap0_urunc"), vec!["--net:tap=tap0_urunc"]);
        assert_eq!(
            cli_with_value("-net nic,model=virtio -net tap,ifname=", "tap0"),
            vec!["-net", "nic,model=virtio", "-net", "tap,ifname=tap0"]
        );
    }

    #[test]
    fn test_execve_argument_with_nul() {
        let err = to_cstrings(&["ok".to_string(), "bad\0arg".to_string()]).unwrap_err();
        assert!(matches!(err, VmmError::InvalidArgument(_)));
    }
}
