//! Confinement of the hypervisor process: the bundle rootfs is turned into
//! the root of the monitor, populated with the monitor binary, its libraries
//! and the device nodes the guest needs.

use std::path::PathBuf;

#[allow(clippy::module_inception)]
pub(crate) mod rootfs;
pub use rootfs::{MonitorRequirements, RootFS};

pub mod block;
pub mod device;
pub use device::Device;

pub mod mount;
pub mod utils;

#[derive(Debug, thiserror::Error)]
pub enum RootfsError {
    #[error("unknown rootfs_propagation: {0}")]
    UnknownRootfsPropagation(String),
    #[error("qemu data directory not found")]
    MissingQemuData,
    #[error("invalid mount destination {0:?}")]
    InvalidMountDestination(PathBuf),
    #[error("failed to access {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to change directory to {path:?}")]
    Chdir { path: PathBuf, source: nix::Error },
    #[error("failed syscall")]
    Syscall(#[from] crate::syscall::SyscallError),
    #[error("failed to prepare mount")]
    Mount(#[from] mount::MountError),
    #[error("failed to create device")]
    Device(#[from] device::DeviceError),
    #[error("failed to prepare block rootfs")]
    Block(#[from] block::BlockError),
}

type Result<T> = std::result::Result<T, RootfsError>;
