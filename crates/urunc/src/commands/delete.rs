use anyhow::{Context, Result};
use libunikontainer::context::RuntimeContext;
use liboci_cli::Delete;

use super::{hand_off_to_runc, load_container, Lookup};

pub fn delete(args: Delete, ctx: &RuntimeContext) -> Result<()> {
    tracing::debug!("start deleting {}", args.container_id);
    let mut container = match load_container(ctx, &args.container_id)? {
        Lookup::Unikernel(container) => container,
        Lookup::Foreign => return hand_off_to_runc(ctx, &args.container_id),
    };
    container
        .delete(ctx, args.force)
        .with_context(|| format!("failed to delete container {}", args.container_id))
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use libunikontainer::container::state::UNKNOWN_PID;
    use libunikontainer::container::ContainerStatus;

    use super::*;
    use crate::commands::test::save_container;

    #[test]
    fn test_delete_stopped_container() -> Result<()> {
        let root = tempfile::tempdir()?;
        let ctx = RuntimeContext::new(root.path());
        save_container(root.path(), "uk", ContainerStatus::Stopped, UNKNOWN_PID)?;
        let args = Delete {
            container_id: "uk".to_owned(),
            force: false,
        };
        delete(args, &ctx)?;
        assert!(!ctx.container_root("uk").exists());
        Ok(())
    }

    #[test]
    fn test_delete_running_needs_force() -> Result<()> {
        let root = tempfile::tempdir()?;
        let ctx = RuntimeContext::new(root.path());
        let mut child = std::process::Command::new("sleep").arg("30").spawn()?;
        let pid = child.id() as i32;
        scopeguard::defer!({
            let _ = child.kill();
            let _ = child.wait();
        });
        save_container(root.path(), "uk", ContainerStatus::Running, pid)?;

        let args = Delete {
            container_id: "uk".to_owned(),
            force: false,
        };
        assert!(delete(args, &ctx).is_err());
        assert!(ctx.container_root("uk").exists());
        Ok(())
    }
}
