use std::fs;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::stat::{lstat, stat, FileStat, Mode, SFlag};
use nix::unistd::{Gid, Uid};

use crate::syscall::syscall::create_syscall;
use crate::syscall::Syscall;
use crate::utils::PathBufExt;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to stat device {path:?}")]
    Stat { path: PathBuf, source: nix::Error },
    #[error("{0:?} is not a device node")]
    NotADevice(PathBuf),
    #[error("{0:?} is not a valid device path")]
    InvalidDevicePath(PathBuf),
    #[error("failed to create directory {path:?}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to remove stale node {path:?}")]
    RemoveStale {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed syscall to create device")]
    Syscall(#[from] crate::syscall::SyscallError),
}

type Result<T> = std::result::Result<T, DeviceError>;

/// Replicates host device nodes inside the monitor rootfs.
pub struct Device {
    syscall: Box<dyn Syscall>,
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

impl Device {
    pub fn new() -> Device {
        Device {
            syscall: create_syscall(),
        }
    }

    pub fn new_with_syscall(syscall: Box<dyn Syscall>) -> Device {
        Device { syscall }
    }

    /// Creates `dev_path` under `mon_rootfs` with the same type and numbers
    /// as on the host. Read and write for others is added to the host mode
    /// so a monitor running as an unprivileged user can open it. Ownership
    /// follows the host node. A matching node left by an earlier run is
    /// reused, anything else at that path is replaced.
    pub fn setup_dev(&self, mon_rootfs: &Path, dev_path: &Path) -> Result<()> {
        let host = stat(dev_path).map_err(|err| DeviceError::Stat {
            path: dev_path.to_path_buf(),
            source: err,
        })?;

        let kind = SFlag::from_bits_truncate(host.st_mode & SFlag::S_IFMT.bits());
        if kind != SFlag::S_IFCHR && kind != SFlag::S_IFBLK {
            tracing::error!(?dev_path, "not a device node");
            return Err(DeviceError::NotADevice(dev_path.to_path_buf()));
        }

        let dst = create_container_dev_path(mon_rootfs, dev_path)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|err| DeviceError::CreateDir {
                path: parent.to_path_buf(),
                source: err,
            })?;
        }

        let perm = (host.st_mode & 0o777) | 0o006;
        if self.needs_mknod(&dst, kind, host.st_rdev)? {
            self.syscall
                .mknod(&dst, kind, Mode::from_bits_truncate(perm), host.st_rdev)
                .map_err(|err| {
                    tracing::error!(?err, path = ?dst, rdev = host.st_rdev, "failed to mknod device");
                    err
                })?;
        }
        // mknod is subject to the umask, so set the mode explicitly
        self.syscall.chmod(&dst, perm)?;
        self.syscall.chown(
            &dst,
            Some(Uid::from_raw(host.st_uid)),
            Some(Gid::from_raw(host.st_gid)),
        )?;

        tracing::debug!(?dev_path, path = ?dst, "created device node");
        Ok(())
    }

    /// Whether `dst` has to be created. A node of another type or with other
    /// numbers is removed first.
    fn needs_mknod(&self, dst: &Path, kind: SFlag, rdev: u64) -> Result<bool> {
        let existing = match lstat(dst) {
            Ok(existing) => existing,
            Err(Errno::ENOENT) => return Ok(true),
            Err(err) => {
                return Err(DeviceError::Stat {
                    path: dst.to_path_buf(),
                    source: err,
                })
            }
        };
        if is_same_node(&existing, kind, rdev) {
            tracing::debug!(path = ?dst, "device node already present");
            return Ok(false);
        }

        tracing::debug!(path = ?dst, "replacing stale node");
        fs::remove_file(dst).map_err(|err| DeviceError::RemoveStale {
            path: dst.to_path_buf(),
            source: err,
        })?;
        Ok(true)
    }
}

fn is_same_node(existing: &FileStat, kind: SFlag, rdev: u64) -> bool {
    SFlag::from_bits_truncate(existing.st_mode & SFlag::S_IFMT.bits()) == kind
        && existing.st_rdev == rdev
}

fn create_container_dev_path(mon_rootfs: &Path, dev_path: &Path) -> Result<PathBuf> {
    let relative = dev_path
        .as_relative()
        .map_err(|_| DeviceError::InvalidDevicePath(dev_path.to_path_buf()))?;
    Ok(mon_rootfs.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::linux::LinuxSyscall;
    use crate::syscall::test::{MknodArgs, TestHelperSyscall};
    use anyhow::Result;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn test_setup_dev() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let device = Device::new();
        device.setup_dev(tmp.path(), Path::new("/dev/null"))?;

        let host = fs::metadata("/dev/null")?;
        let perm = (host.mode() & 0o777) | 0o006;
        let syscall: &TestHelperSyscall = device.syscall.as_any().downcast_ref().unwrap();
        assert_eq!(
            syscall.get_mknod_args(),
            vec![MknodArgs {
                path: tmp.path().join("dev/null"),
                kind: SFlag::S_IFCHR,
                perm: Mode::from_bits_truncate(perm),
                dev: host.rdev(),
            }]
        );
        assert_eq!(
            syscall.get_chmod_args(),
            vec![(tmp.path().join("dev/null"), perm)]
        );
        assert_eq!(syscall.get_chown_args().len(), 1);
        Ok(())
    }

    #[test]
    fn test_setup_dev_replaces_stale_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        fs::create_dir(tmp.path().join("dev"))?;
        fs::write(tmp.path().join("dev/null"), b"stale")?;

        let device = Device::new();
        device.setup_dev(tmp.path(), Path::new("/dev/null"))?;

        assert!(!tmp.path().join("dev/null").exists());
        let syscall: &TestHelperSyscall = device.syscall.as_any().downcast_ref().unwrap();
        assert_eq!(syscall.get_mknod_args().len(), 1);
        Ok(())
    }

    #[test]
    fn test_setup_dev_twice() -> Result<()> {
        // mknod of a character device needs CAP_MKNOD
        if !nix::unistd::geteuid().is_root() {
            return Ok(());
        }
        let tmp = tempfile::tempdir()?;
        let device = Device::new_with_syscall(Box::new(LinuxSyscall));
        device.setup_dev(tmp.path(), Path::new("/dev/null"))?;
        device.setup_dev(tmp.path(), Path::new("/dev/null"))?;

        let host = fs::metadata("/dev/null")?;
        let created = fs::metadata(tmp.path().join("dev/null"))?;
        assert_eq!(created.rdev(), host.rdev());
        assert_eq!(created.mode() & 0o006, 0o006);
        Ok(())
    }

    #[test]
    fn test_setup_nested_dev_creates_parent() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let device = Device::new();
        // /dev/net/tun may be missing in minimal build environments
        if Path::new("/dev/net/tun").exists() {
            device.setup_dev(tmp.path(), Path::new("/dev/net/tun"))?;
            assert!(tmp.path().join("dev/net").is_dir());
        }
        Ok(())
    }

    #[test]
    fn test_setup_dev_rejects_regular_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("regular");
        fs::write(&file, b"")?;
        let device = Device::new();
        let err = device.setup_dev(tmp.path(), &file).unwrap_err();
        assert!(matches!(err, DeviceError::NotADevice(_)));
        Ok(())
    }

    #[test]
    fn test_setup_dev_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let device = Device::new();
        let err = device
            .setup_dev(tmp.path(), Path::new("/dev/does-not-exist"))
            .unwrap_err();
        assert!(matches!(err, DeviceError::Stat { .. }));
    }
}
