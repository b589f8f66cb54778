//! Namespaces the hypervisor process is placed in before it is exec'd.
//! Network is always isolated: a fresh network namespace is created unless
//! the bundle names an existing one. Mount, UTS, IPC and cgroup namespaces
//! follow the bundle. PID, user and time namespaces are not supported for
//! a VMM and are skipped with a warning.

use std::path::{Path, PathBuf};

use nix::{fcntl, sched::CloneFlags, sys::stat, unistd};
use oci_spec::runtime::{LinuxNamespace, LinuxNamespaceType};

use crate::syscall::{Syscall, SyscallError};

#[derive(Debug, thiserror::Error)]
pub enum NamespaceError {
    #[error("failed to open namespace {path:?}")]
    Open {
        path: PathBuf,
        source: nix::Error,
    },
    #[error("failed to close namespace fd")]
    Close(#[source] nix::Error),
    #[error("failed to enter {flag:?} namespace")]
    Enter {
        flag: CloneFlags,
        source: SyscallError,
    },
}

type Result<T> = std::result::Result<T, NamespaceError>;

static ORDERED_NAMESPACES: &[CloneFlags] = &[
    CloneFlags::CLONE_NEWUTS,
    CloneFlags::CLONE_NEWIPC,
    CloneFlags::CLONE_NEWNET,
    CloneFlags::CLONE_NEWCGROUP,
    CloneFlags::CLONE_NEWNS,
];

/// A namespace to enter: unshared when `path` is empty, joined otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceEntry {
    pub flag: CloneFlags,
    pub path: Option<PathBuf>,
}

/// Holds information about namespaces
#[derive(Debug, Clone, Default)]
pub struct Namespaces {
    entries: Vec<NamespaceEntry>,
}

fn get_clone_flag(namespace_type: LinuxNamespaceType) -> Option<CloneFlags> {
    match namespace_type {
        LinuxNamespaceType::Uts => Some(CloneFlags::CLONE_NEWUTS),
        LinuxNamespaceType::Ipc => Some(CloneFlags::CLONE_NEWIPC),
        LinuxNamespaceType::Network => Some(CloneFlags::CLONE_NEWNET),
        LinuxNamespaceType::Cgroup => Some(CloneFlags::CLONE_NEWCGROUP),
        LinuxNamespaceType::Mount => Some(CloneFlags::CLONE_NEWNS),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

impl From<Option<&Vec<LinuxNamespace>>> for Namespaces {
    fn from(namespaces: Option<&Vec<LinuxNamespace>>) -> Self {
        let namespaces = namespaces.map(|ns| ns.as_slice()).unwrap_or_default();
        let mut requested: Vec<NamespaceEntry> = Vec::new();
        for ns in namespaces {
            match get_clone_flag(ns.typ()) {
                Some(flag) => requested.push(NamespaceEntry {
                    flag,
                    path: ns.path().clone(),
                }),
                None => tracing::warn!(typ = ?ns.typ(), "namespace not supported, skipping"),
            }
        }

        if !requested.iter().any(|e| e.flag == CloneFlags::CLONE_NEWNET) {
            requested.push(NamespaceEntry {
                flag: CloneFlags::CLONE_NEWNET,
                path: None,
            });
        }

        let entries = ORDERED_NAMESPACES
            .iter()
            .filter_map(|flag| requested.iter().find(|e| e.flag == *flag).cloned())
            .collect();

        Namespaces { entries }
    }
}

impl Namespaces {
    pub fn apply_namespaces(&self, syscall: &dyn Syscall) -> Result<()> {
        for entry in &self.entries {
            unshare_or_setns(entry, syscall)?;
        }
        Ok(())
    }

    pub fn get(&self, flag: CloneFlags) -> Option<&NamespaceEntry> {
        self.entries.iter().find(|e| e.flag == flag)
    }

    /// Whether the hypervisor gets its own mount namespace, which is the
    /// condition for building a confined root filesystem for it.
    pub fn has_mount(&self) -> bool {
        self.get(CloneFlags::CLONE_NEWNS).is_some()
    }
}

pub fn unshare_or_setns(entry: &NamespaceEntry, syscall: &dyn Syscall) -> Result<()> {
    match &entry.path {
        None => syscall
            .unshare(entry.flag)
            .map_err(|source| NamespaceError::Enter {
                flag: entry.flag,
                source,
            }),
        Some(path) => join_namespace(path, entry.flag, syscall),
    }
}

/// Joins the namespace at `path`. For a network namespace this only moves
/// the calling thread.
pub fn join_namespace(path: &Path, flag: CloneFlags, syscall: &dyn Syscall) -> Result<()> {
    let fd = fcntl::open(path, fcntl::OFlag::O_CLOEXEC, stat::Mode::empty()).map_err(
        |source| NamespaceError::Open {
            path: path.to_path_buf(),
            source,
        },
    )?;
    let joined = syscall
        .set_ns(fd, flag)
        .map_err(|source| NamespaceError::Enter { flag, source });
    unistd::close(fd).map_err(NamespaceError::Close)?;
    joined
}

/// Path of the network namespace named by the bundle, if any.
pub fn network_namespace_path(namespaces: Option<&Vec<LinuxNamespace>>) -> Option<PathBuf> {
    namespaces?
        .iter()
        .find(|ns| ns.typ() == LinuxNamespaceType::Network)
        .and_then(|ns| ns.path().clone())
}
