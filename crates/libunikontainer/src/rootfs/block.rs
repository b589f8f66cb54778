//! Handing a devmapper snapshot that backs the container rootfs to the
//! guest as its block device.
//!
//! The guest cannot share the block device with the host mount, so the files
//! the runtime still needs (unikernel, initrd, urunc.json) are moved out,
//! the snapshot is unmounted and the extracted files take the rootfs place.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use nix::mount::MntFlags;

use crate::config::CONFIG_FILE;
use crate::syscall::{Syscall, SyscallError};
use crate::utils::PathBufExt;

const MOUNTINFO: &str = "/proc/self/mountinfo";

#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("no filesystem is mounted at {0:?}")]
    NotMounted(PathBuf),
    #[error("invalid mountinfo line: {0}")]
    InvalidMountInfo(String),
    #[error("failed to read {path:?}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to move {src:?} to {dst:?}")]
    Move {
        src: PathBuf,
        dst: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to prepare {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to unmount the rootfs")]
    Umount(#[from] SyscallError),
}

type Result<T> = std::result::Result<T, BlockError>;

/// A mount found in mountinfo.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockMount {
    pub path: PathBuf,
    pub device: String,
    pub fstype: String,
}

/// Finds the device and filesystem type mounted at `path`.
pub fn get_block_device(path: &Path) -> Result<BlockMount> {
    let file = fs::File::open(MOUNTINFO).map_err(|err| BlockError::Read {
        path: PathBuf::from(MOUNTINFO),
        source: err,
    })?;
    find_mount(BufReader::new(file), path)
}

fn find_mount<R: BufRead>(reader: R, path: &Path) -> Result<BlockMount> {
    for line in reader.lines() {
        let line = line.map_err(|err| BlockError::Read {
            path: PathBuf::from(MOUNTINFO),
            source: err,
        })?;
        let (before, after) = line
            .split_once(" - ")
            .ok_or_else(|| BlockError::InvalidMountInfo(line.clone()))?;
        let mount_point = before
            .split_whitespace()
            .nth(4)
            .ok_or_else(|| BlockError::InvalidMountInfo(line.clone()))?;
        if Path::new(mount_point) != path {
            continue;
        }

        let mut fields = after.split_whitespace();
        let (Some(fstype), Some(device)) = (fields.next(), fields.next()) else {
            return Err(BlockError::InvalidMountInfo(line.clone()));
        };
        let found = BlockMount {
            path: PathBuf::from(mount_point),
            device: device.to_string(),
            fstype: fstype.to_string(),
        };
        tracing::debug!(mountpoint = ?found.path, device = found.device, fstype = found.fstype, "found container rootfs mount");
        return Ok(found);
    }

    Err(BlockError::NotMounted(path.to_path_buf()))
}

fn move_into(rootfs: &Path, tmp_dir: &Path, file: &Path) -> Result<()> {
    let relative = file.as_relative().unwrap_or(file);
    let src = rootfs.join(relative);
    let dst = tmp_dir.join(relative);
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|err| BlockError::Io {
            path: parent.to_path_buf(),
            source: err,
        })?;
    }
    // rename fails across filesystems, fall back to copy and remove
    if fs::rename(&src, &dst).is_err() {
        fs::copy(&src, &dst)
            .and_then(|_| fs::remove_file(&src))
            .map_err(|err| BlockError::Move {
                src: src.clone(),
                dst: dst.clone(),
                source: err,
            })?;
    }
    Ok(())
}

/// Moves the unikernel, optional initrd and urunc.json out of `rootfs` into
/// `<dirname(rootfs)>/tmp`, keeping their relative paths.
pub fn extract_files_from_block(
    rootfs: &Path,
    unikernel: &Path,
    initrd: Option<&Path>,
) -> Result<PathBuf> {
    let base = rootfs.parent().unwrap_or(Path::new("/"));
    let tmp_dir = base.join("tmp");
    fs::create_dir(&tmp_dir).map_err(|err| BlockError::Io {
        path: tmp_dir.clone(),
        source: err,
    })?;

    let mut files = vec![unikernel, Path::new(CONFIG_FILE)];
    files.extend(initrd);
    for file in files {
        if let Err(err) = move_into(rootfs, &tmp_dir, file) {
            if let Err(rm_err) = fs::remove_dir_all(&tmp_dir) {
                tracing::error!(?tmp_dir, %rm_err, "could not remove directory");
            }
            return Err(err);
        }
    }

    Ok(tmp_dir)
}

/// Extracts the boot files, unmounts the snapshot from `rootfs` and puts
/// the extracted files in its place so paths stay the same.
pub fn prepare_dm_as_block(
    syscall: &dyn Syscall,
    rootfs: &Path,
    unikernel: &Path,
    initrd: Option<&Path>,
) -> Result<()> {
    let tmp_dir = extract_files_from_block(rootfs, unikernel, initrd)?;
    syscall.umount2(rootfs, MntFlags::empty())?;
    fs::remove_dir(rootfs).map_err(|err| BlockError::Io {
        path: rootfs.to_path_buf(),
        source: err,
    })?;
    fs::rename(&tmp_dir, rootfs).map_err(|err| BlockError::Move {
        src: tmp_dir.clone(),
        dst: rootfs.to_path_buf(),
        source: err,
    })?;
    Ok(())
}

/// Removes the files left behind by [`prepare_dm_as_block`].
pub fn cleanup_extracted_files(rootfs: &Path) -> Result<()> {
    match fs::remove_dir_all(rootfs) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(BlockError::Io {
            path: rootfs.to_path_buf(),
            source: err,
        }),
        _ => Ok(()),
    }
}
