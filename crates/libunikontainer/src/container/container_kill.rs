use std::path::PathBuf;
use std::thread;

use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::signal::{self, Signal as NixSignal};

use super::{Container, ContainerStatus};
use crate::context::RuntimeContext;
use crate::error::UnikontainerError;
use crate::namespaces;
use crate::network::{self, create_network_provider, tap_name};
use crate::signal::Signal;
use crate::syscall::syscall::create_syscall;
use crate::vmm::new_vmm;

impl Container {
    /// Stops the guest. The monitor is always killed with SIGKILL; the
    /// requested signal is only recorded. Killing a container whose process
    /// is already gone succeeds.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use libunikontainer::container::Container;
    /// use libunikontainer::context::RuntimeContext;
    /// use nix::sys::signal::Signal;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let ctx = RuntimeContext::new("/run/urunc");
    /// let mut container = Container::load(ctx.container_root("74f1a4cb3801"))?;
    /// container.kill(&ctx, Signal::SIGTERM, false)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn kill<S: Into<Signal>>(
        &mut self,
        ctx: &RuntimeContext,
        signal: S,
        all: bool,
    ) -> Result<(), UnikontainerError> {
        let signal = signal.into();
        self.refresh_status()?;
        tracing::info!(id = self.id(), %signal, all, status = %self.status(), "kill container");
        if self.status() == ContainerStatus::Creating && !self.can_kill() {
            tracing::error!(id = self.id(), "cannot kill a container that is still being created");
            return Err(UnikontainerError::IncorrectStatus);
        }

        self.do_kill()?;
        ctx.capture(self.id(), "TS19");
        self.teardown_network();
        self.set_status(ContainerStatus::Stopped).save()?;
        Ok(())
    }

    pub(crate) fn do_kill(&self) -> Result<(), UnikontainerError> {
        let config = self.unikernel_config();
        match new_vmm(&config.hypervisor) {
            Ok(vmm) => {
                if let Err(err) = vmm.stop(self.id()) {
                    tracing::error!(id = self.id(), %err, "failed to stop the monitor");
                }
            }
            Err(err) => tracing::warn!(hypervisor = config.hypervisor, %err, "cannot stop the monitor"),
        }

        let Some(pid) = self.pid() else {
            return Ok(());
        };
        if !self.is_alive()? {
            tracing::debug!(?pid, "process already exited");
            return Ok(());
        }

        tracing::debug!("kill signal {} to {}", NixSignal::SIGKILL, pid);
        match signal::kill(pid, NixSignal::SIGKILL) {
            Err(Errno::ESRCH) => {
                /* the process does not exist, which is what we want */
                Ok(())
            }
            res => Ok(res?),
        }
    }

    /// Removes the TAP device from the network namespace the container was
    /// created in. A namespace the runtime created dies with the guest, so
    /// only a namespace named by the OCI spec is cleaned. Errors are logged.
    fn teardown_network(&self) {
        let netns = match self.spec() {
            Ok(spec) => namespaces::network_namespace_path(
                spec.linux()
                    .as_ref()
                    .and_then(|linux| linux.namespaces().as_ref()),
            ),
            Err(err) => {
                tracing::error!(%err, "failed to load spec for network teardown");
                return;
            }
        };
        let Some(netns) = netns else {
            return;
        };

        if let Err(err) = cleanup_in_netns(netns) {
            tracing::error!(%err, "failed to tear down the guest network");
        }
    }
}

/// setns(CLONE_NEWNET) only moves the calling thread, so the teardown runs
/// on a thread of its own and the rest of the process is left alone.
fn cleanup_in_netns(netns: PathBuf) -> Result<(), UnikontainerError> {
    let handle = thread::spawn(move || -> Result<(), UnikontainerError> {
        let syscall = create_syscall();
        namespaces::join_namespace(&netns, CloneFlags::CLONE_NEWNET, syscall.as_ref())?;
        tracing::info!(?netns, "joined network namespace");
        let provider = create_network_provider();
        network::cleanup(provider.as_ref(), &tap_name(0))?;
        Ok(())
    });
    handle
        .join()
        .map_err(|_| UnikontainerError::Other("network teardown thread panicked".to_string()))?
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use nix::sys::signal::Signal as NixSignal;
    use nix::unistd::Pid;
    use oci_spec::runtime::SpecBuilder;

    use super::*;
    use crate::container::state::UNKNOWN_PID;
    use crate::context::test::RecordingMetrics;

    fn container_with_pid(pid: i32) -> Result<(tempfile::TempDir, Container)> {
        let dir = tempfile::tempdir()?;
        SpecBuilder::default()
            .build()?
            .save(dir.path().join("config.json"))?;
        let container = Container::new("uk", ContainerStatus::Running, pid, dir.path(), dir.path())?;
        Ok((dir, container))
    }

    #[test]
    fn test_kill_dead_process_succeeds() -> Result<()> {
        let (dir, mut container) = container_with_pid(i32::MAX)?;
        let ctx = RuntimeContext::with_metrics(dir.path(), Box::new(RecordingMetrics::default()));
        container.kill(&ctx, NixSignal::SIGTERM, false)?;
        assert_eq!(container.status(), ContainerStatus::Stopped);
        assert_eq!(Container::load(dir.path().to_path_buf())?.status(), ContainerStatus::Stopped);
        Ok(())
    }

    #[test]
    fn test_kill_live_process() -> Result<()> {
        let mut child = std::process::Command::new("sleep").arg("30").spawn()?;
        let (dir, mut container) = container_with_pid(child.id() as i32)?;
        let ctx = RuntimeContext::with_metrics(dir.path(), Box::new(RecordingMetrics::default()));
        container.kill(&ctx, NixSignal::SIGTERM, false)?;

        let status = child.wait()?;
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(status.signal(), Some(NixSignal::SIGKILL as i32));
        assert_eq!(container.status(), ContainerStatus::Stopped);
        Ok(())
    }

    #[test]
    fn test_kill_creating_container() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ctx = RuntimeContext::with_metrics(dir.path(), Box::new(RecordingMetrics::default()));
        let mut container =
            Container::new("uk", ContainerStatus::Creating, UNKNOWN_PID, dir.path(), dir.path())?;
        assert!(matches!(
            container.kill(&ctx, NixSignal::SIGKILL, false),
            Err(UnikontainerError::IncorrectStatus)
        ));
        assert_eq!(container.pid(), None::<Pid>);
        Ok(())
    }

    #[test]
    fn test_kill_creating_container_with_pid() -> Result<()> {
        let mut child = std::process::Command::new("sleep").arg("30").spawn()?;
        let dir = tempfile::tempdir()?;
        SpecBuilder::default()
            .build()?
            .save(dir.path().join("config.json"))?;
        let ctx = RuntimeContext::with_metrics(dir.path(), Box::new(RecordingMetrics::default()));
        let mut container = Container::new(
            "uk",
            ContainerStatus::Creating,
            child.id() as i32,
            dir.path(),
            dir.path(),
        )?;
        container.kill(&ctx, NixSignal::SIGTERM, false)?;
        assert!(!child.wait()?.success());
        assert_eq!(container.status(), ContainerStatus::Stopped);
        Ok(())
    }
}
