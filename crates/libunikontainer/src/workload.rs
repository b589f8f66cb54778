//! Hand off of bundles that are not unikernels to a conventional runtime.

use std::convert::Infallible;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use nix::unistd;

/// Runtime that handles every container urunc declines.
pub const RUNC_BINARY: &str = "runc";

#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error("{RUNC_BINARY} was not found in PATH")]
    RuncNotFound(#[source] which::Error),
    #[error("invalid argument {0:?}")]
    InvalidArg(String),
    #[error("failed to exec {path:?}")]
    Exec {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
}

type Result<T> = std::result::Result<T, WorkloadError>;

/// Replaces the current process with runc, passing `args` through
/// untouched. `args[0]` is replaced by the runc path.
pub fn fallback_to_runc(args: &[String]) -> Result<Infallible> {
    let runc = which::which(RUNC_BINARY).map_err(|err| {
        tracing::error!(%err, "failed to find runc");
        WorkloadError::RuncNotFound(err)
    })?;
    exec_with_args(runc, args)
}

fn exec_with_args(program: PathBuf, args: &[String]) -> Result<Infallible> {
    let path = CString::new(program.as_os_str().as_bytes())
        .map_err(|_| WorkloadError::InvalidArg(program.display().to_string()))?;
    let argv = build_argv(&program, args)?;
    tracing::info!(?program, ?args, "bundle is not a unikernel, handing off to runc");

    unistd::execv(&path, &argv).map_err(|err| {
        tracing::error!(?err, ?program, "failed to execv");
        WorkloadError::Exec {
            path: program,
            source: err,
        }
    })
}

fn build_argv(program: &PathBuf, args: &[String]) -> Result<Vec<CString>> {
    let program = program.display().to_string();
    std::iter::once(&program)
        .chain(args.iter().skip(1))
        .map(|arg| CString::new(arg.as_bytes()).map_err(|_| WorkloadError::InvalidArg(arg.clone())))
        .collect()
}
