use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use libunikontainer::utils::create_dir_all_with_mode;
use nix::sys::stat::Mode;
use nix::unistd::getuid;

#[cfg(not(test))]
fn get_default_root_path() -> PathBuf {
    PathBuf::from("/run/urunc")
}

#[cfg(test)]
fn get_default_root_path() -> PathBuf {
    std::env::temp_dir().join(format!("default_urunc_path_{}", std::process::id()))
}

/// Resolves the directory that holds the state of every container. A path
/// that does not exist yet is created for the current user with mode 0700.
pub fn determine(root_path: Option<PathBuf>) -> Result<PathBuf> {
    let uid = getuid().as_raw();
    let path = root_path.unwrap_or_else(get_default_root_path);

    if !path.exists() {
        create_dir_all_with_mode(&path, uid, Mode::S_IRWXU)
            .with_context(|| format!("failed to create root directory {}", path.display()))?;
    }
    let path = path
        .canonicalize()
        .with_context(|| format!("failed to canonicalize {}", path.display()))?;
    // e.g. "", "." with cwd at /, or enough ".." to reach it
    if path == Path::new("/") {
        bail!("option --root argument should not be set to /");
    }

    Ok(path)
}
