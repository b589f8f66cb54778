use std::fs;
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use nix::unistd::chdir;
use oci_spec::runtime::Mount as SpecMount;

use super::device::Device;
use super::mount::Mount;
use super::utils::{find_qemu_data_dir, parse_bind_options, propagation_flag};
use super::{Result, RootfsError};
use crate::syscall::syscall::create_syscall;
use crate::syscall::Syscall;
use crate::utils::PathBufExt;

const FIRECRACKER: &str = "firecracker";

/// Host resources the monitor needs inside its rootfs.
#[derive(Debug, Clone, Default)]
pub struct MonitorRequirements {
    /// Absolute host path of the monitor binary
    pub monitor_path: PathBuf,
    /// Block device handed to the guest, if any
    pub dm_path: Option<PathBuf>,
    pub needs_kvm: bool,
    pub needs_tap: bool,
}

/// Holds information about rootfs
pub struct RootFS {
    syscall: Box<dyn Syscall>,
}

impl Default for RootFS {
    fn default() -> Self {
        Self::new()
    }
}

impl RootFS {
    pub fn new() -> RootFS {
        RootFS {
            syscall: create_syscall(),
        }
    }

    fn mounter(&self) -> Mount {
        Mount::new_with_syscall(create_syscall())
    }

    /// Prepares `rootfs` so the process can pivot into it: the root mount
    /// gets the requested propagation (rslave by default), the parent mount
    /// of the rootfs is made private and the rootfs is bind mounted onto
    /// itself.
    pub fn prepare_root(&self, rootfs: &Path, rootfs_propagation: Option<&str>) -> Result<()> {
        let flags = match rootfs_propagation {
            None | Some("") => MsFlags::MS_SLAVE | MsFlags::MS_REC,
            Some(value) => propagation_flag(value)
                .ok_or_else(|| RootfsError::UnknownRootfsPropagation(value.to_string()))?,
        };

        self.syscall
            .mount(None, Path::new("/"), None, flags, None)
            .map_err(|err| {
                tracing::error!(
                    ?err,
                    ?flags,
                    "failed to change the mount propagation type of the root"
                );
                err
            })?;

        self.mounter().make_parent_mount_private(rootfs)?;

        tracing::debug!(?rootfs, "bind mount rootfs");
        self.syscall
            .mount(
                Some(rootfs),
                rootfs,
                Some("bind"),
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None,
            )
            .map_err(|err| {
                tracing::error!(?rootfs, ?err, "failed to bind mount rootfs");
                err
            })?;
        Ok(())
    }

    /// Populates `mon_rootfs` with what the monitor needs to run: its
    /// binary and shared libraries, qemu firmware, a private /dev and /tmp,
    /// and the device nodes for the guest.
    pub fn prepare_mon_rootfs(&self, mon_rootfs: &Path, req: &MonitorRequirements) -> Result<()> {
        tracing::debug!(?mon_rootfs, ?req, "prepare monitor rootfs");
        let mounter = self.mounter();
        mounter.file_from_host(mon_rootfs, &req.monitor_path, None, false)?;

        let monitor_name = req
            .monitor_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        // firecracker is statically linked
        if monitor_name != FIRECRACKER {
            for lib in ["/lib", "/lib64", "/usr/lib"] {
                let lib = Path::new(lib);
                if lib.exists() {
                    mounter.file_from_host(mon_rootfs, lib, None, false)?;
                }
            }
        }

        if monitor_name.starts_with("qemu") {
            let qemu_data = find_qemu_data_dir("qemu").ok_or(RootfsError::MissingQemuData)?;
            mounter.file_from_host(
                mon_rootfs,
                &qemu_data,
                Some(Path::new("/usr/share/qemu")),
                false,
            )?;
            // not every installation ships seabios
            if let Some(seabios) = find_qemu_data_dir("seabios") {
                mounter.file_from_host(
                    mon_rootfs,
                    &seabios,
                    Some(Path::new("/usr/share/seabios")),
                    false,
                )?;
            }
        }

        mounter.create_tmpfs(
            mon_rootfs,
            Path::new("/dev"),
            MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
            "755",
        )?;
        mounter.create_tmpfs(
            mon_rootfs,
            Path::new("/tmp"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_STRICTATIME,
            "1777",
        )?;

        let device = Device::new_with_syscall(create_syscall());
        device.setup_dev(mon_rootfs, Path::new("/dev/null"))?;
        device.setup_dev(mon_rootfs, Path::new("/dev/urandom"))?;
        if req.needs_tap || monitor_name == FIRECRACKER {
            device.setup_dev(mon_rootfs, Path::new("/dev/net/tun"))?;
        }
        if let Some(dm_path) = &req.dm_path {
            device.setup_dev(mon_rootfs, dm_path)?;
        }
        if req.needs_kvm {
            device.setup_dev(mon_rootfs, Path::new("/dev/kvm"))?;
        }

        Ok(())
    }

    /// Exposes the bind volumes of the bundle inside `rootfs`. Other mount
    /// types are skipped. A file volume marked private is copied.
    pub fn mount_volumes(&self, rootfs: &Path, mounts: &[SpecMount]) -> Result<()> {
        let mounter = self.mounter();
        for m in mounts {
            if m.typ().as_deref() != Some("bind") {
                continue;
            }
            let Some(source) = m.source() else {
                tracing::warn!(destination = ?m.destination(), "bind volume without source, skipping");
                continue;
            };

            let options = parse_bind_options(m.options().as_deref().unwrap_or_default());
            let is_dir = fs::metadata(source)
                .map_err(|err| RootfsError::Io {
                    path: source.to_path_buf(),
                    source: err,
                })?
                .is_dir();
            let with_copy = options.private && !is_dir;

            mounter.file_from_host(rootfs, source, Some(m.destination().as_path()), with_copy)?;

            if let (true, Some(propagation)) = (is_dir, options.propagation) {
                let dst = rootfs
                    .join_safely(m.destination())
                    .map_err(|_| RootfsError::InvalidMountDestination(m.destination().clone()))?;
                self.syscall
                    .mount(Some(&dst), &dst, None, propagation, None)?;
            }
        }
        Ok(())
    }

    /// Makes `rootfs` the root of the process. `pivot` requires a private
    /// mount namespace; otherwise chroot is used.
    pub fn change_root(&self, rootfs: &Path, pivot: bool) -> Result<()> {
        chdir(rootfs).map_err(|err| RootfsError::Chdir {
            path: rootfs.to_path_buf(),
            source: err,
        })?;
        if pivot {
            self.syscall.pivot_rootfs(rootfs)?;
        } else {
            self.syscall.chroot(Path::new("."))?;
        }
        chdir("/").map_err(|err| RootfsError::Chdir {
            path: PathBuf::from("/"),
            source: err,
        })?;
        Ok(())
    }
}
