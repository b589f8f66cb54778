use super::Container;
use crate::context::RuntimeContext;
use crate::error::UnikontainerError;
use crate::hooks::{self, HookStage};
use crate::ipc::{self, IpcMessage};

impl Container {
    /// Releases a created container: the reexec'd process boots the guest
    /// once it receives `START`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use libunikontainer::container::Container;
    /// use libunikontainer::context::RuntimeContext;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let ctx = RuntimeContext::new("/run/urunc");
    /// let mut container = Container::load(ctx.container_root("74f1a4cb3801"))?;
    /// container.start(&ctx)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn start(&mut self, ctx: &RuntimeContext) -> Result<(), UnikontainerError> {
        ctx.capture(self.id(), "TS11");
        self.refresh_status()?;

        if !self.can_start() {
            tracing::error!(status = ?self.status(), id = ?self.id(), "cannot start container due to incorrect state");
            return Err(UnikontainerError::IncorrectStatus);
        }

        ipc::send_message_retrying(self.ctrl_socket(), IpcMessage::Start).map_err(|err| {
            tracing::error!(id = ?self.id(), %err, "failed to release the reexec'd process");
            err
        })?;
        ctx.capture(self.id(), "TS12");

        // Run post start hooks. It runs after the container process is started.
        // It is called in the runtime namespace.
        let spec = self.spec()?;
        hooks::run_stage(&spec, HookStage::Poststart, &self.state).map_err(|err| {
            tracing::error!(%err, "failed to run post start hooks");
            err
        })?;
        ctx.capture(self.id(), "TS13");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;

    use anyhow::Result;
    use oci_spec::runtime::SpecBuilder;

    use super::*;
    use crate::container::state::UNKNOWN_PID;
    use crate::container::ContainerStatus;
    use crate::context::test::RecordingMetrics;
    use crate::ipc::IpcListener;

    #[test]
    fn test_start_requires_created() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ctx = RuntimeContext::with_metrics(dir.path(), Box::new(RecordingMetrics::default()));
        let mut container = Container::new(
            "uk",
            ContainerStatus::Creating,
            UNKNOWN_PID,
            dir.path(),
            dir.path(),
        )?;
        assert!(matches!(
            container.start(&ctx),
            Err(UnikontainerError::IncorrectStatus)
        ));
        Ok(())
    }

    #[test]
    fn test_start_sends_start() -> Result<()> {
        let root = tempfile::tempdir()?;
        let bundle = tempfile::tempdir()?;
        SpecBuilder::default()
            .build()?
            .save(bundle.path().join("config.json"))?;
        let metrics = RecordingMetrics::default();
        let ctx = RuntimeContext::with_metrics(root.path(), Box::new(metrics.clone()));

        let mut container = Container::new(
            "uk",
            ContainerStatus::Created,
            std::process::id() as i32,
            bundle.path(),
            root.path(),
        )?;
        let listener = IpcListener::new(container.ctrl_socket())?;
        let waiter = thread::spawn(move || listener.await_message(IpcMessage::Start));

        container.start(&ctx)?;
        assert!(waiter.join().unwrap().is_ok());
        let stages: Vec<String> = metrics.stages.borrow().iter().map(|(_, s)| s.clone()).collect();
        assert_eq!(stages, vec!["TS11", "TS12", "TS13"]);
        assert!(fs::metadata(container.ctrl_socket()).is_err());
        Ok(())
    }
}
