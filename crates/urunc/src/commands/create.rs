//! Handles the creation of a new container
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use libunikontainer::container::builder::ContainerBuilder;
use libunikontainer::container::Container;
use libunikontainer::context::RuntimeContext;
use libunikontainer::error::UnikontainerError;
use libunikontainer::process::container_init_process::container_init_process;
use libunikontainer::syscall::syscall::SyscallType;
use liboci_cli::Create;

use super::hand_off_to_runc;

const REEXEC_FLAG: &str = "--reexec";

/// Command line for the reexec'd process: the current invocation with the
/// reexec marker appended.
fn reexec_args<I: IntoIterator<Item = OsString>>(args: I) -> Vec<String> {
    args.into_iter()
        .skip(1)
        .map(|arg| arg.to_string_lossy().into_owned())
        .filter(|arg| arg != REEXEC_FLAG)
        .chain(std::iter::once(REEXEC_FLAG.to_owned()))
        .collect()
}

// The engine side spawns a copy of this binary with `--reexec` inside fresh
// namespaces. That copy lands in `reexec` below and ends up as the
// hypervisor once `start` releases it.
pub fn create(args: Create, ctx: &RuntimeContext) -> Result<()> {
    if args.reexec {
        return reexec(&args.container_id, ctx);
    }

    let result = build_container(
        ctx,
        &args.container_id,
        &args.bundle,
        args.pid_file.as_ref(),
        args.console_socket.as_ref(),
    );
    match result {
        Ok(container) => {
            tracing::info!(id = container.id(), pid = ?container.pid(), "container created");
            Ok(())
        }
        Err(err) if err.is_for_runc() => hand_off_to_runc(ctx, &args.container_id),
        Err(err) => {
            Err(err).with_context(|| format!("failed to create container {}", args.container_id))
        }
    }
}

pub(crate) fn build_container(
    ctx: &RuntimeContext,
    container_id: &str,
    bundle: &Path,
    pid_file: Option<&PathBuf>,
    console_socket: Option<&PathBuf>,
) -> Result<Container, UnikontainerError> {
    ContainerBuilder::new(container_id.to_owned(), SyscallType::default())
        .validate_id()?
        .with_pid_file(pid_file)?
        .with_console_socket(console_socket)
        .with_root_path(ctx.root())?
        .with_reexec_args(reexec_args(std::env::args_os()))
        .as_init(bundle)
        .build(ctx)
}

pub(crate) fn reexec(container_id: &str, ctx: &RuntimeContext) -> Result<()> {
    let container_root = ctx.container_root(container_id);
    match container_init_process(ctx, &container_root) {
        Ok(never) => match never {},
        Err(err) => Err(err)
            .with_context(|| format!("failed to boot the unikernel of container {container_id}")),
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[test]
    fn test_reexec_args() {
        let args = ["urunc", "--root", "/run/urunc", "create", "-b", "/bundle", "uk"]
            .into_iter()
            .map(OsString::from);
        assert_eq!(
            reexec_args(args),
            vec!["--root", "/run/urunc", "create", "-b", "/bundle", "uk", "--reexec"]
        );

        // never doubled
        let args = ["urunc", "create", "uk", "--reexec"]
            .into_iter()
            .map(OsString::from);
        assert_eq!(reexec_args(args), vec!["create", "uk", "--reexec"]);
    }

    #[test]
    fn test_create_invalid_id() -> Result<()> {
        let root = tempfile::tempdir()?;
        let ctx = RuntimeContext::new(root.path());
        let args = Create {
            bundle: PathBuf::from("."),
            console_socket: None,
            pid_file: None,
            reexec: false,
            container_id: "not/valid".to_owned(),
        };
        assert!(create(args, &ctx).is_err());
        assert!(!root.path().join("not").exists());
        Ok(())
    }

    #[test]
    fn test_reexec_without_state_fails() -> Result<()> {
        let root = tempfile::tempdir()?;
        let ctx = RuntimeContext::new(root.path());
        let args = Create {
            bundle: PathBuf::from("."),
            console_socket: None,
            pid_file: None,
            reexec: true,
            container_id: "uk".to_owned(),
        };
        assert!(create(args, &ctx).is_err());
        Ok(())
    }
}
