use std::fs;
use std::path::Path;

use super::{Container, ContainerStatus};
use crate::context::RuntimeContext;
use crate::error::UnikontainerError;
use crate::hooks::{self, HookStage};
use crate::rootfs::block;
use crate::unikernel::new_unikernel;
use crate::utils;
use crate::vmm::{new_vmm, VmState, Vmm, VmmKind};

impl Container {
    /// Deletes the container. A created container that never started, or
    /// one whose create failed after spawning, is killed on the way; a
    /// running one only with `force`.
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
    /// container.delete(&ctx, true)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn delete(&mut self, ctx: &RuntimeContext, force: bool) -> Result<(), UnikontainerError> {
        self.refresh_status()?;
        let never_started = matches!(
            self.status(),
            ContainerStatus::Creating | ContainerStatus::Created
        );
        let in_registry = self.is_running_in_registry();
        if (self.can_kill() || in_registry) && (force || never_started) {
            self.do_kill()?;
            self.set_status(ContainerStatus::Stopped).save()?;
        }
        tracing::debug!("container status: {:?}", self.status());

        if !self.can_delete() || (in_registry && !force) {
            tracing::error!(id = self.id(), status = %self.status(), "container is still running");
            return Err(UnikontainerError::StillRunning(self.id().to_string()));
        }

        match self.spec() {
            Ok(spec) => {
                self.cleanup_dm_rootfs(&utils::rootfs_dir(self.bundle(), &spec));
                if let Err(err) = hooks::run_stage(&spec, HookStage::Poststop, &self.state) {
                    tracing::warn!(%err, "failed to run post stop hooks");
                }
            }
            Err(err) => tracing::warn!(%err, "failed to load spec, skipping rootfs cleanup"),
        }

        if self.root.exists() {
            // remove the directory storing container state
            tracing::debug!("remove dir {:?}", self.root);
            fs::remove_dir_all(&self.root).map_err(|err| {
                tracing::error!(?err, path = ?self.root, "failed to remove container dir");
                UnikontainerError::OtherIO(err)
            })?;
        }
        ctx.capture(self.id(), "TS20");

        Ok(())
    }

    /// Guests of registry backed monitors outlive their pid, so the registry
    /// is asked as well.
    fn is_running_in_registry(&self) -> bool {
        let hypervisor = self.unikernel_config().hypervisor;
        match hypervisor.parse::<VmmKind>() {
            Ok(kind) if kind.has_registry() => {}
            _ => return false,
        }
        match new_vmm(&hypervisor) {
            Ok(vmm) => self.registry_reports_running(vmm.as_ref()),
            Err(err) => {
                tracing::warn!(hypervisor, %err, "cannot query the vm registry");
                false
            }
        }
    }

    fn registry_reports_running(&self, vmm: &dyn Vmm) -> bool {
        match vmm.vm_state(self.id()) {
            VmState::Running => true,
            VmState::Unknown => false,
            VmState::Error => {
                tracing::warn!(id = self.id(), "vm registry unavailable, trusting the pid");
                false
            }
        }
    }

    /// Removes the boot files left in place of a devmapper snapshot that was
    /// handed to the guest. A rootfs that is still a mount point was never
    /// replaced and is left alone.
    fn cleanup_dm_rootfs(&self, rootfs: &Path) {
        let config = self.unikernel_config();
        let supports_block = match new_unikernel(&config.unikernel_type) {
            Ok(unikernel) => unikernel.supports_block(),
            Err(err) => {
                tracing::warn!(%err, "unknown unikernel, skipping rootfs cleanup");
                return;
            }
        };
        if !supports_block || !config.block.is_empty() || !config.use_dm_block() {
            return;
        }
        if block::get_block_device(rootfs).is_ok() {
            tracing::debug!(?rootfs, "rootfs is still mounted, nothing was extracted");
            return;
        }

        tracing::debug!(?rootfs, "removing files extracted from the block rootfs");
        if let Err(err) = block::cleanup_extracted_files(rootfs) {
            tracing::error!(?rootfs, %err, "failed to remove extracted files");
        }
    }
}
