//! Contains a wrapper of syscalls for unit tests
//! This provides a uniform interface for rest of the runtime
//! to call syscalls required for preparing the hypervisor environment

pub mod linux;
#[allow(clippy::module_inception)]
pub mod syscall;

pub use syscall::Syscall;

#[derive(Debug, thiserror::Error)]
pub enum SyscallError {
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("failed to pivot root to {path:?}: {msg}")]
    PivotRootFailed {
        path: std::path::PathBuf,
        msg: String,
        errno: nix::errno::Errno,
    },
    #[error("failed to setns: {0}")]
    SetNamespaceFailed(nix::errno::Errno),
    #[error("failed to set real gid to {gid}: {errno}")]
    SetRealGidFailed {
        errno: nix::errno::Errno,
        gid: nix::unistd::Gid,
    },
    #[error("failed to set real uid to {uid}: {errno}")]
    SetRealUidFailed {
        errno: nix::errno::Errno,
        uid: nix::unistd::Uid,
    },
    #[error("failed to unshare: {0}")]
    UnshareFailed(nix::errno::Errno),
    #[error("failed to chroot to {path:?}: {errno}")]
    ChrootFailed {
        path: std::path::PathBuf,
        errno: nix::errno::Errno,
    },
    #[error("mount of {mount_source:?} on {mount_target:?} failed: {errno}")]
    MountFailed {
        mount_source: Option<std::path::PathBuf>,
        mount_target: std::path::PathBuf,
        fstype: Option<String>,
        flags: nix::mount::MsFlags,
        data: Option<String>,
        errno: nix::errno::Errno,
    },
    #[error("umount of {target:?} failed: {errno}")]
    UmountFailed {
        target: std::path::PathBuf,
        errno: nix::errno::Errno,
    },
    #[error("mknod of {path:?} failed: {errno}")]
    MknodFailed {
        path: std::path::PathBuf,
        kind: nix::sys::stat::SFlag,
        perm: nix::sys::stat::Mode,
        dev: nix::sys::stat::dev_t,
        errno: nix::errno::Errno,
    },
    #[error("chown of {path:?} failed: {errno}")]
    ChownFailed {
        path: std::path::PathBuf,
        owner: Option<nix::unistd::Uid>,
        group: Option<nix::unistd::Gid>,
        errno: nix::errno::Errno,
    },
    #[error("chmod of {path:?} to {mode:o} failed")]
    ChmodFailed {
        path: std::path::PathBuf,
        mode: u32,
        source: std::io::Error,
    },
    #[error("setgroups failed: {errno}")]
    SetGroupsFailed {
        groups: Vec<nix::unistd::Gid>,
        errno: nix::errno::Errno,
    },
}

type Result<T> = std::result::Result<T, SyscallError>;
