use anyhow::{bail, Context, Result};
use libunikontainer::config::ANNOT_TYPE;
use libunikontainer::container::Container;
use libunikontainer::context::RuntimeContext;
use libunikontainer::workload;

pub mod create;
pub mod delete;
pub mod kill;
pub mod run;
pub mod start;

/// What lives under `<root>/<id>`.
pub(crate) enum Lookup {
    Unikernel(Container),
    /// State written by runc, or by urunc for a bundle it handed off.
    Foreign,
}

fn is_unikernel(container: &Container) -> bool {
    container
        .annotations()
        .get(ANNOT_TYPE)
        .map_or(false, |kind| !kind.is_empty())
}

pub(crate) fn load_container(ctx: &RuntimeContext, container_id: &str) -> Result<Lookup> {
    let container_root = ctx.container_root(container_id);
    if !container_root.exists() {
        bail!("container {} does not exist.", container_id)
    }

    match Container::load(container_root) {
        Ok(container) if is_unikernel(&container) => Ok(Lookup::Unikernel(container)),
        Ok(_) => Ok(Lookup::Foreign),
        Err(err) => {
            tracing::debug!(id = container_id, %err, "state is not a unikernel record");
            Ok(Lookup::Foreign)
        }
    }
}

/// Replaces the process with runc, forwarding the original command line.
/// Only returns on failure.
pub(crate) fn hand_off_to_runc(ctx: &RuntimeContext, container_id: &str) -> Result<()> {
    ctx.capture(container_id, "cTS00");
    let args: Vec<String> = std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    let err = match workload::fallback_to_runc(&args) {
        Ok(never) => match never {},
        Err(err) => err,
    };
    ctx.capture(container_id, "cTS01");
    Err(err).with_context(|| format!("failed to hand container {container_id} to runc"))
}


#[cfg(test)]
mod tests {
    use anyhow::Result;
    use libunikontainer::container::state::UNKNOWN_PID;
    use libunikontainer::container::ContainerStatus;

    use super::*;

    #[test]
    fn test_load_missing_container() -> Result<()> {
        let root = tempfile::tempdir()?;
        let ctx = RuntimeContext::new(root.path());
        assert!(load_container(&ctx, "missing").is_err());
        Ok(())
    }

    #[test]
    fn test_load_unikernel_container() -> Result<()> {
        let root = tempfile::tempdir()?;
        let ctx = RuntimeContext::new(root.path());
        test::save_container(root.path(), "uk", ContainerStatus::Stopped, UNKNOWN_PID)?;
        match load_container(&ctx, "uk")? {
            Lookup::Unikernel(container) => assert_eq!(container.id(), "uk"),
            Lookup::Foreign => panic!("expected a unikernel record"),
        }
        Ok(())
    }

    #[test]
    fn test_load_foreign_state() -> Result<()> {
        let root = tempfile::tempdir()?;
        let ctx = RuntimeContext::new(root.path());
        // runc keeps a differently shaped state.json in the same root
        let container_root = root.path().join("plain");
        std::fs::create_dir_all(&container_root)?;
        std::fs::write(
            container_root.join("state.json"),
            r#"{"id":"plain","init_process_pid":42,"config":{}}"#,
        )?;
        assert!(matches!(load_container(&ctx, "plain")?, Lookup::Foreign));
        Ok(())
    }
}
