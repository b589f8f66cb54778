//! Implements Syscall trait for Linux systems
use std::any::Any;
use std::fs;
use std::os::fd::BorrowedFd;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::stat::{mknod, Mode, SFlag};
use nix::unistd::{chdir, chown, chroot, mkdir, pivot_root, Gid, Uid};

use super::{Result, Syscall, SyscallError};

/// Name of the directory the previous root is moved to during pivot_root.
const OLD_ROOT: &str = "old_root";

/// Empty structure to implement Syscall trait for
#[derive(Clone)]
pub struct LinuxSyscall;

impl Syscall for LinuxSyscall {
    /// To enable dynamic typing,
    /// see <https://doc.rust-lang.org/std/any/index.html> for more information
    fn as_any(&self) -> &dyn Any {
        self
    }

    /// Makes `path` the root of the calling process's mount namespace. The
    /// previous root is detached and its mount point removed.
    fn pivot_rootfs(&self, path: &Path) -> Result<()> {
        let old_root = path.join(OLD_ROOT);
        if !old_root.exists() {
            mkdir(&old_root, Mode::S_IRWXU).map_err(|errno| SyscallError::PivotRootFailed {
                path: path.to_path_buf(),
                msg: "failed to create old root directory".into(),
                errno,
            })?;
        }

        pivot_root(path, &old_root).map_err(|errno| {
            tracing::error!(?errno, ?path, "failed to pivot root");
            SyscallError::PivotRootFailed {
                path: path.to_path_buf(),
                msg: "pivot_root".into(),
                errno,
            }
        })?;

        chdir("/").map_err(|errno| SyscallError::PivotRootFailed {
            path: path.to_path_buf(),
            msg: "failed to change directory to new root".into(),
            errno,
        })?;

        let old_root = Path::new("/").join(OLD_ROOT);
        // Make the old root rslave so unmounting it does not propagate
        // to the host mount namespace.
        mount(
            None::<&str>,
            &old_root,
            None::<&str>,
            MsFlags::MS_SLAVE | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|errno| {
            tracing::error!(?errno, "failed to make old root rslave");
            SyscallError::PivotRootFailed {
                path: path.to_path_buf(),
                msg: "failed to make old root rslave".into(),
                errno,
            }
        })?;

        umount2(&old_root, MntFlags::MNT_DETACH).map_err(|errno| {
            tracing::error!(?errno, "failed to unmount old root");
            SyscallError::PivotRootFailed {
                path: path.to_path_buf(),
                msg: "failed to unmount old root".into(),
                errno,
            }
        })?;

        fs::remove_dir(&old_root).map_err(|err| {
            tracing::error!(?err, ?old_root, "failed to remove old root");
            err
        })?;

        Ok(())
    }

    fn chroot(&self, path: &Path) -> Result<()> {
        chroot(path).map_err(|errno| SyscallError::ChrootFailed {
            path: path.to_path_buf(),
            errno,
        })?;

        Ok(())
    }

    /// Set namespace for process
    fn set_ns(&self, rawfd: i32, nstype: CloneFlags) -> Result<()> {
        let fd = unsafe { BorrowedFd::borrow_raw(rawfd) };
        nix::sched::setns(fd, nstype).map_err(SyscallError::SetNamespaceFailed)?;
        Ok(())
    }

    /// set uid and gid for process
    fn set_id(&self, uid: Uid, gid: Gid) -> Result<()> {
        // args : real *id, effective *id, saved set *id respectively

        // This is safe because at this point we have only
        // one thread in the process
        if unsafe { libc::syscall(libc::SYS_setresgid, gid, gid, gid) } == -1 {
            let errno = nix::errno::Errno::last();
            tracing::error!(?errno, ?gid, "failed to set real, effective and saved set gid");
            return Err(SyscallError::SetRealGidFailed { errno, gid });
        }

        if unsafe { libc::syscall(libc::SYS_setresuid, uid, uid, uid) } == -1 {
            let errno = nix::errno::Errno::last();
            tracing::error!(?errno, ?uid, "failed to set real, effective and saved set uid");
            return Err(SyscallError::SetRealUidFailed { errno, uid });
        }

        Ok(())
    }

    /// Disassociate parts of execution context
    // see https://man7.org/linux/man-pages/man2/unshare.2.html for more information
    fn unshare(&self, flags: CloneFlags) -> Result<()> {
        unshare(flags).map_err(SyscallError::UnshareFailed)?;

        Ok(())
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        mount(source, target, fstype, flags, data).map_err(|errno| {
            tracing::error!(?errno, ?source, ?target, ?flags, "mount failed");
            SyscallError::MountFailed {
                mount_source: source.map(|p| p.to_path_buf()),
                mount_target: target.to_path_buf(),
                fstype: fstype.map(|s| s.to_string()),
                flags,
                data: data.map(|s| s.to_string()),
                errno,
            }
        })?;
        Ok(())
    }

    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<()> {
        umount2(target, flags).map_err(|errno| SyscallError::UmountFailed {
            target: target.to_path_buf(),
            errno,
        })?;
        Ok(())
    }

    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, dev: u64) -> Result<()> {
        mknod(path, kind, perm, dev).map_err(|errno| SyscallError::MknodFailed {
            path: path.to_path_buf(),
            kind,
            perm,
            dev,
            errno,
        })?;

        Ok(())
    }

    fn chown(&self, path: &Path, owner: Option<Uid>, group: Option<Gid>) -> Result<()> {
        chown(path, owner, group).map_err(|errno| SyscallError::ChownFailed {
            path: path.to_path_buf(),
            owner,
            group,
            errno,
        })?;

        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|err| {
            SyscallError::ChmodFailed {
                path: path.to_path_buf(),
                mode,
                source: err,
            }
        })?;

        Ok(())
    }

    fn set_groups(&self, groups: &[Gid]) -> Result<()> {
        let n_groups = groups.len() as libc::size_t;
        let groups_ptr = groups.as_ptr() as *const libc::gid_t;

        // This is safe because at this point we have only
        // one thread in the process
        if unsafe { libc::syscall(libc::SYS_setgroups, n_groups, groups_ptr) } == -1 {
            let errno = nix::errno::Errno::last();
            tracing::error!(?errno, ?groups, "failed to set groups");
            return Err(SyscallError::SetGroupsFailed {
                groups: groups.to_vec(),
                errno,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use anyhow::Result;

    use super::LinuxSyscall;
    use crate::syscall::Syscall;

    #[test]
    fn test_chmod() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("fc.json");
        std::fs::write(&file, b"{}")?;
        LinuxSyscall.chmod(&file, 0o666)?;
        assert_eq!(file.metadata()?.permissions().mode() & 0o777, 0o666);
        Ok(())
    }

    #[test]
    fn test_chown_to_self() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("owned");
        std::fs::write(&file, b"")?;
        LinuxSyscall.chown(
            &file,
            Some(nix::unistd::getuid()),
            Some(nix::unistd::getgid()),
        )?;
        Ok(())
    }
}
