use std::fs;
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;

/// Maps a rootfs or mount propagation option to its mount flags.
pub fn propagation_flag(value: &str) -> Option<MsFlags> {
    let flag = match value {
        "rprivate" => MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        "private" => MsFlags::MS_PRIVATE,
        "rslave" => MsFlags::MS_SLAVE | MsFlags::MS_REC,
        "slave" => MsFlags::MS_SLAVE,
        "rshared" => MsFlags::MS_SHARED | MsFlags::MS_REC,
        "shared" => MsFlags::MS_SHARED,
        "runbindable" => MsFlags::MS_UNBINDABLE | MsFlags::MS_REC,
        "unbindable" => MsFlags::MS_UNBINDABLE,
        _ => return None,
    };
    Some(flag)
}

/// Maps a mount option to the flag it sets or clears. The boolean is true
/// when the option clears the flag.
pub fn mount_flag(value: &str) -> Option<(bool, MsFlags)> {
    let flag = match value {
        "defaults" => (false, MsFlags::empty()),
        "ro" => (false, MsFlags::MS_RDONLY),
        "rw" => (true, MsFlags::MS_RDONLY),
        "suid" => (true, MsFlags::MS_NOSUID),
        "nosuid" => (false, MsFlags::MS_NOSUID),
        "dev" => (true, MsFlags::MS_NODEV),
        "nodev" => (false, MsFlags::MS_NODEV),
        "exec" => (true, MsFlags::MS_NOEXEC),
        "noexec" => (false, MsFlags::MS_NOEXEC),
        "sync" => (false, MsFlags::MS_SYNCHRONOUS),
        "async" => (true, MsFlags::MS_SYNCHRONOUS),
        "dirsync" => (false, MsFlags::MS_DIRSYNC),
        "remount" => (false, MsFlags::MS_REMOUNT),
        "mand" => (false, MsFlags::MS_MANDLOCK),
        "nomand" => (true, MsFlags::MS_MANDLOCK),
        "atime" => (true, MsFlags::MS_NOATIME),
        "noatime" => (false, MsFlags::MS_NOATIME),
        "diratime" => (true, MsFlags::MS_NODIRATIME),
        "nodiratime" => (false, MsFlags::MS_NODIRATIME),
        "bind" => (false, MsFlags::MS_BIND),
        "rbind" => (false, MsFlags::MS_BIND | MsFlags::MS_REC),
        "relatime" => (false, MsFlags::MS_RELATIME),
        "norelatime" => (true, MsFlags::MS_RELATIME),
        "strictatime" => (false, MsFlags::MS_STRICTATIME),
        "nostrictatime" => (true, MsFlags::MS_STRICTATIME),
        "iversion" => (false, MsFlags::MS_I_VERSION),
        "noiversion" => (true, MsFlags::MS_I_VERSION),
        "lazytime" => (false, MsFlags::MS_LAZYTIME),
        "nolazytime" => (true, MsFlags::MS_LAZYTIME),
        "silent" => (false, MsFlags::MS_SILENT),
        "loud" => (true, MsFlags::MS_SILENT),
        _ => return None,
    };
    Some(flag)
}

/// Options of a bind volume, split into mount flags and propagation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindOptions {
    pub flags: MsFlags,
    pub propagation: Option<MsFlags>,
    /// A private file volume is copied instead of bind mounted.
    pub private: bool,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            flags: MsFlags::empty(),
            propagation: None,
            private: false,
        }
    }
}

pub fn parse_bind_options(options: &[String]) -> BindOptions {
    let mut parsed = BindOptions::default();
    for option in options {
        if let Some((is_clear, flag)) = mount_flag(option) {
            if is_clear {
                parsed.flags &= !flag;
            } else {
                parsed.flags |= flag;
            }
        } else if let Some(flag) = propagation_flag(option) {
            parsed.propagation = Some(flag);
            parsed.private = matches!(option.as_str(), "private" | "rprivate");
        } else {
            tracing::debug!(option, "ignoring unsupported mount option");
        }
    }
    parsed
}

/// Location of a qemu data directory (`qemu`, `seabios`) on the host.
/// `/usr/share/<name>` is preferred, then `/usr/local/share/<name>` with
/// symlinks resolved.
pub fn find_qemu_data_dir(name: &str) -> Option<PathBuf> {
    find_data_dir_in(&[Path::new("/usr/share"), Path::new("/usr/local/share")], name)
}

fn find_data_dir_in(bases: &[&Path], name: &str) -> Option<PathBuf> {
    bases
        .iter()
        .map(|base| base.join(name))
        .find_map(|candidate| fs::canonicalize(&candidate).ok().filter(|p| p.is_dir()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_propagation_flag() {
        assert_eq!(
            propagation_flag("rslave"),
            Some(MsFlags::MS_SLAVE | MsFlags::MS_REC)
        );
        assert_eq!(propagation_flag("unbindable"), Some(MsFlags::MS_UNBINDABLE));
        assert_eq!(propagation_flag("bogus"), None);
    }

    #[test]
    fn test_parse_bind_options() {
        let options: Vec<String> = ["rbind", "ro", "nosuid", "rprivate", "mode=755"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let parsed = parse_bind_options(&options);
        assert_eq!(
            parsed.flags,
            MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_RDONLY | MsFlags::MS_NOSUID
        );
        assert_eq!(
            parsed.propagation,
            Some(MsFlags::MS_PRIVATE | MsFlags::MS_REC)
        );
        assert!(parsed.private);

        let options: Vec<String> = ["bind", "ro", "rw", "rslave"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let parsed = parse_bind_options(&options);
        assert_eq!(parsed.flags, MsFlags::MS_BIND);
        assert!(!parsed.private);
    }

    #[test]
    fn test_bind_options_default() {
        let parsed = parse_bind_options(&[]);
        assert_eq!(parsed, BindOptions::default());
        assert!(parsed.flags.is_empty());
        assert_eq!(parsed.propagation, None);
    }

    #[test]
    fn test_find_data_dir() -> Result<()> {
        let first = tempfile::tempdir()?;
        let second = tempfile::tempdir()?;
        let target = second.path().join("real-qemu");
        fs::create_dir(&target)?;
        std::os::unix::fs::symlink(&target, second.path().join("qemu"))?;

        let found = find_data_dir_in(&[first.path(), second.path()], "qemu");
        assert_eq!(found, Some(fs::canonicalize(&target)?));

        fs::create_dir(first.path().join("qemu"))?;
        let found = find_data_dir_in(&[first.path(), second.path()], "qemu");
        assert_eq!(found, Some(fs::canonicalize(first.path().join("qemu"))?));

        assert_eq!(find_data_dir_in(&[first.path()], "seabios"), None);
        Ok(())
    }
}
