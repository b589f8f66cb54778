use std::fs::{self, OpenOptions};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::MsFlags;
use nix::unistd::{Gid, Uid};

use crate::syscall::syscall::create_syscall;
use crate::syscall::{Syscall, SyscallError};
use crate::utils::PathBufExt;

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("failed to stat {path:?}")]
    Stat {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid mount target {0:?}")]
    InvalidTarget(PathBuf),
    #[error("failed to prepare {path:?}")]
    Prepare {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to copy {src:?} to {dst:?}")]
    Copy {
        src: PathBuf,
        dst: PathBuf,
        source: std::io::Error,
    },
    #[error("could not remount the parent mount of {0:?} as private")]
    ParentMountPrivate(PathBuf),
    #[error("failed syscall")]
    Syscall(#[from] SyscallError),
}

type Result<T> = std::result::Result<T, MountError>;

/// Size of every tmpfs created for the monitor.
const TMPFS_SIZE: &str = "65536k";

pub struct Mount {
    syscall: Box<dyn Syscall>,
}

impl Default for Mount {
    fn default() -> Self {
        Self::new()
    }
}

impl Mount {
    pub fn new() -> Mount {
        Mount {
            syscall: create_syscall(),
        }
    }

    pub fn new_with_syscall(syscall: Box<dyn Syscall>) -> Mount {
        Mount { syscall }
    }

    /// Mirrors `host_path` inside `mon_rootfs`, at `target` when given or at
    /// the same path otherwise. Regular files are copied when `with_copy` is
    /// set and bind mounted otherwise; directories are always bind mounted.
    /// The host mode and ownership are kept.
    pub fn file_from_host(
        &self,
        mon_rootfs: &Path,
        host_path: &Path,
        target: Option<&Path>,
        with_copy: bool,
    ) -> Result<()> {
        tracing::debug!(?host_path, ?target, ?mon_rootfs, with_copy, "preparing file from host");
        let metadata = fs::metadata(host_path).map_err(|err| MountError::Stat {
            path: host_path.to_path_buf(),
            source: err,
        })?;
        let dst = mon_rootfs
            .join_safely(target.unwrap_or(host_path))
            .map_err(|_| MountError::InvalidTarget(host_path.to_path_buf()))?;

        if metadata.is_dir() {
            fs::create_dir_all(&dst).map_err(|err| MountError::Prepare {
                path: dst.clone(),
                source: err,
            })?;
            self.bind_private(host_path, &dst)?;
        } else {
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).map_err(|err| MountError::Prepare {
                    path: parent.to_path_buf(),
                    source: err,
                })?;
            }
            if with_copy {
                fs::copy(host_path, &dst).map_err(|err| MountError::Copy {
                    src: host_path.to_path_buf(),
                    dst: dst.clone(),
                    source: err,
                })?;
            } else {
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .mode(metadata.mode() & 0o7777)
                    .open(&dst)
                    .map_err(|err| MountError::Prepare {
                        path: dst.clone(),
                        source: err,
                    })?;
                self.bind_private(host_path, &dst)?;
            }
        }

        self.syscall.chmod(&dst, metadata.mode() & 0o7777)?;
        self.syscall.chown(
            &dst,
            Some(Uid::from_raw(metadata.uid())),
            Some(Gid::from_raw(metadata.gid())),
        )?;
        Ok(())
    }

    fn bind_private(&self, src: &Path, dst: &Path) -> Result<()> {
        self.syscall
            .mount(Some(src), dst, None, MsFlags::MS_BIND, None)
            .map_err(|err| {
                tracing::error!(?src, ?dst, ?err, "failed to bind mount");
                err
            })?;
        self.syscall
            .mount(None, dst, None, MsFlags::MS_PRIVATE, None)?;
        Ok(())
    }

    /// Mounts a private tmpfs with the given octal `mode` at `path` inside
    /// `mon_rootfs`.
    pub fn create_tmpfs(
        &self,
        mon_rootfs: &Path,
        path: &Path,
        flags: MsFlags,
        mode: &str,
    ) -> Result<()> {
        let dst = mon_rootfs
            .join_safely(path)
            .map_err(|_| MountError::InvalidTarget(path.to_path_buf()))?;
        fs::create_dir_all(&dst).map_err(|err| MountError::Prepare {
            path: dst.clone(),
            source: err,
        })?;

        let data = format!("mode={mode},size={TMPFS_SIZE}");
        self.syscall
            .mount(
                Some(Path::new("tmpfs")),
                &dst,
                Some("tmpfs"),
                flags,
                Some(&data),
            )
            .map_err(|err| {
                tracing::error!(?dst, ?err, "failed to mount tmpfs");
                err
            })?;
        self.syscall
            .mount(None, &dst, None, MsFlags::MS_PRIVATE, None)?;

        if let Ok(bits) = u32::from_str_radix(mode, 8) {
            if bits & 0o1000 != 0 {
                self.syscall.chmod(&dst, bits)?;
            }
        }
        Ok(())
    }

    /// Walks up from `path` until a mount point is found and makes it
    /// private. Needed before pivot_root, which fails on a shared parent,
    /// and so the rootfs bind mount does not leak to the host.
    pub fn make_parent_mount_private(&self, path: &Path) -> Result<()> {
        let mut current = path.to_path_buf();
        loop {
            match self
                .syscall
                .mount(None, &current, None, MsFlags::MS_PRIVATE, None)
            {
                Ok(()) => return Ok(()),
                Err(SyscallError::MountFailed {
                    errno: Errno::EINVAL,
                    ..
                }) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) => {
                    tracing::error!(?current, ?err, "failed to make mount private");
                    break;
                }
            }
        }
        Err(MountError::ParentMountPrivate(path.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::{ArgName, MountArgs, TestHelperSyscall};
    use anyhow::Result;

    fn einval() -> std::result::Result<(), SyscallError> {
        Err(SyscallError::MountFailed {
            mount_source: None,
            mount_target: PathBuf::new(),
            fstype: None,
            flags: MsFlags::MS_PRIVATE,
            data: None,
            errno: Errno::EINVAL,
        })
    }

    fn private(target: &Path) -> MountArgs {
        MountArgs {
            source: None,
            target: target.to_path_buf(),
            fstype: None,
            flags: MsFlags::MS_PRIVATE,
            data: None,
        }
    }

    #[test]
    fn test_file_from_host_bind() -> Result<()> {
        let host = tempfile::tempdir()?;
        let mon_rootfs = tempfile::tempdir()?;
        let binary = host.path().join("solo5-hvt");
        fs::write(&binary, b"#!")?;

        let mounter = Mount::new();
        mounter.file_from_host(mon_rootfs.path(), &binary, None, false)?;

        let dst = mon_rootfs.path().join_safely(&binary)?;
        assert!(dst.is_file());
        let syscall: &TestHelperSyscall = mounter.syscall.as_any().downcast_ref().unwrap();
        assert_eq!(
            syscall.get_mount_args(),
            vec![
                MountArgs {
                    source: Some(binary.clone()),
                    target: dst.clone(),
                    fstype: None,
                    flags: MsFlags::MS_BIND,
                    data: None,
                },
                private(&dst),
            ]
        );
        let mode = fs::metadata(&binary)?.mode() & 0o7777;
        assert_eq!(syscall.get_chmod_args(), vec![(dst.clone(), mode)]);
        assert_eq!(syscall.get_chown_args().len(), 1);
        Ok(())
    }

    #[test]
    fn test_file_from_host_copy_with_target() -> Result<()> {
        let host = tempfile::tempdir()?;
        let mon_rootfs = tempfile::tempdir()?;
        let file = host.path().join("hosts");
        fs::write(&file, b"127.0.0.1 localhost")?;

        let mounter = Mount::new();
        mounter.file_from_host(
            mon_rootfs.path(),
            &file,
            Some(Path::new("/etc/hosts")),
            true,
        )?;

        let dst = mon_rootfs.path().join("etc/hosts");
        assert_eq!(fs::read(&dst)?, b"127.0.0.1 localhost");
        let syscall: &TestHelperSyscall = mounter.syscall.as_any().downcast_ref().unwrap();
        assert!(syscall.get_mount_args().is_empty());
        Ok(())
    }

    #[test]
    fn test_file_from_host_directory() -> Result<()> {
        let host = tempfile::tempdir()?;
        let mon_rootfs = tempfile::tempdir()?;
        let mounter = Mount::new();
        mounter.file_from_host(
            mon_rootfs.path(),
            host.path(),
            Some(Path::new("/usr/share/qemu")),
            false,
        )?;

        let dst = mon_rootfs.path().join("usr/share/qemu");
        assert!(dst.is_dir());
        let syscall: &TestHelperSyscall = mounter.syscall.as_any().downcast_ref().unwrap();
        assert_eq!(syscall.get_mount_args()[0].target, dst);
        assert_eq!(syscall.get_mount_args()[0].flags, MsFlags::MS_BIND);
        Ok(())
    }

    #[test]
    fn test_file_from_host_missing() {
        let mon_rootfs = tempfile::tempdir().unwrap();
        let err = Mount::new()
            .file_from_host(mon_rootfs.path(), Path::new("/no/such/file"), None, false)
            .unwrap_err();
        assert!(matches!(err, MountError::Stat { .. }));
    }

    #[test]
    fn test_create_tmpfs() -> Result<()> {
        let mon_rootfs = tempfile::tempdir()?;
        let mounter = Mount::new();
        let flags = MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_STRICTATIME;
        mounter.create_tmpfs(mon_rootfs.path(), Path::new("/tmp"), flags, "1777")?;

        let dst = mon_rootfs.path().join("tmp");
        assert!(dst.is_dir());
        let syscall: &TestHelperSyscall = mounter.syscall.as_any().downcast_ref().unwrap();
        assert_eq!(
            syscall.get_mount_args(),
            vec![
                MountArgs {
                    source: Some(PathBuf::from("tmpfs")),
                    target: dst.clone(),
                    fstype: Some("tmpfs".to_string()),
                    flags,
                    data: Some("mode=1777,size=65536k".to_string()),
                },
                private(&dst),
            ]
        );
        assert_eq!(syscall.get_chmod_args(), vec![(dst, 0o1777)]);
        Ok(())
    }

    #[test]
    fn test_make_parent_mount_private() -> Result<()> {
        let mounter = Mount::new();
        let syscall: &TestHelperSyscall = mounter.syscall.as_any().downcast_ref().unwrap();
        syscall.set_ret_err(ArgName::Mount, einval);
        syscall.set_ret_err_times(ArgName::Mount, 2);

        mounter.make_parent_mount_private(Path::new("/run/bundle/rootfs"))?;
        // the first two attempts hit non mount points
        assert_eq!(syscall.get_mount_args(), vec![private(Path::new("/run"))]);
        Ok(())
    }

    #[test]
    fn test_make_parent_mount_private_gives_up_at_root() {
        let mounter = Mount::new();
        let syscall: &TestHelperSyscall = mounter.syscall.as_any().downcast_ref().unwrap();
        syscall.set_ret_err(ArgName::Mount, einval);
        syscall.set_ret_err_times(ArgName::Mount, 10);

        let err = mounter
            .make_parent_mount_private(Path::new("/a/b"))
            .unwrap_err();
        assert!(matches!(err, MountError::ParentMountPrivate(_)));
    }
}
