use std::path::Path;

use super::{ExecArgs, Result, Vmm, VmmError, VmState, VmmKind};
use crate::unikernel::Unikernel;

/// Hedge runs guests inside a kernel registry instead of a process. It has
/// no binary and is not wired up yet.
pub struct Hedge;

impl Hedge {
    /// Names of the guests the registry holds.
    fn list_vms(&self) -> Result<Vec<String>> {
        Err(VmmError::NotImplemented("hedge registry"))
    }
}

fn state_in(listing: Result<Vec<String>>, name: &str) -> VmState {
    match listing {
        Ok(names) if names.iter().any(|vm| vm == name) => VmState::Running,
        Ok(_) => VmState::Unknown,
        Err(err) => {
            tracing::warn!(%err, name, "failed to list hedge guests");
            VmState::Error
        }
    }
}

impl Vmm for Hedge {
    fn kind(&self) -> VmmKind {
        VmmKind::Hedge
    }

    fn path(&self) -> &Path {
        Path::new("")
    }

    fn healthcheck(&self) -> Result<()> {
        Err(VmmError::NotImplemented("hedge"))
    }

    fn stop(&self, _container_id: &str) -> Result<()> {
        Err(VmmError::NotImplemented("hedge"))
    }

    fn vm_state(&self, name: &str) -> VmState {
        state_in(self.list_vms(), name)
    }

    fn build_args(&self, _args: &ExecArgs, _unikernel: &dyn Unikernel) -> Result<Vec<String>> {
        Err(VmmError::NotImplemented("hedge"))
    }
}
