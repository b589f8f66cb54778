use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use oci_spec::runtime::Spec;
use procfs::process::Process;

use crate::config::UnikernelConfig;
use crate::container::state::UNKNOWN_PID;
use crate::container::{ContainerStatus, State};
use crate::error::UnikontainerError;
use crate::ipc::{CTRL_SOCKET, INIT_SOCKET};

/// Structure representing the container data
#[derive(Debug, Clone)]
pub struct Container {
    // State of the container
    pub state: State,
    // Runtime private directory of the container, `<root>/<id>`
    pub root: PathBuf,
}

impl Default for Container {
    fn default() -> Self {
        Self {
            state: State::default(),
            root: PathBuf::from("/run/urunc"),
        }
    }
}

impl Container {
    pub fn new(
        container_id: &str,
        status: ContainerStatus,
        pid: i32,
        bundle: &Path,
        container_root: &Path,
    ) -> Result<Self, UnikontainerError> {
        let container_root = fs::canonicalize(container_root).map_err(|err| {
            UnikontainerError::InvalidInput(format!(
                "invalid container root {container_root:?}: {err:?}"
            ))
        })?;
        let bundle = fs::canonicalize(bundle).map_err(|err| {
            UnikontainerError::InvalidInput(format!("invalid bundle {bundle:?}: {err:?}"))
        })?;
        let state = State::new(container_id, status, pid, bundle);

        Ok(Self {
            state,
            root: container_root,
        })
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn can_start(&self) -> bool {
        self.state.status.can_start()
    }

    /// A create that failed after spawning leaves a `creating` record with
    /// the pid of the waiting child, which still has to be killable.
    pub fn can_kill(&self) -> bool {
        match self.status() {
            ContainerStatus::Creating => self.pid().is_some(),
            status => status.can_kill(),
        }
    }

    pub fn can_delete(&self) -> bool {
        self.state.status.can_delete()
    }

    pub fn bundle(&self) -> &PathBuf {
        &self.state.bundle
    }

    pub fn annotations(&self) -> &HashMap<String, String> {
        &self.state.annotations
    }

    /// Adds `annotations` to the record, keeping values already present.
    pub fn merge_annotations(&mut self, annotations: &HashMap<String, String>) -> &mut Self {
        for (key, value) in annotations {
            self.state
                .annotations
                .entry(key.to_owned())
                .or_insert_with(|| value.to_owned());
        }
        self
    }

    pub fn pid(&self) -> Option<Pid> {
        match self.state.pid {
            UNKNOWN_PID => None,
            pid => Some(Pid::from_raw(pid)),
        }
    }

    pub fn set_pid(&mut self, pid: i32) -> &mut Self {
        self.state.pid = pid;
        self
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.state.created
    }

    pub fn status(&self) -> ContainerStatus {
        self.state.status
    }

    pub fn set_status(&mut self, status: ContainerStatus) -> &mut Self {
        let created = match (status, self.state.created) {
            (ContainerStatus::Created, None) => Some(Utc::now()),
            _ => self.state.created,
        };

        self.state.created = created;
        self.state.status = status;

        self
    }

    /// Whether the stored pid still names a live, non-zombie process.
    pub fn is_alive(&self) -> Result<bool, UnikontainerError> {
        let Some(pid) = self.pid() else {
            return Ok(false);
        };
        // Note that Process::new does not spawn a new process
        // but instead reads the information about the process with given pid
        match Process::new(pid.as_raw()) {
            Ok(proc) => {
                use procfs::process::ProcState;
                Ok(!matches!(
                    proc.stat()?.state()?,
                    ProcState::Zombie | ProcState::Dead
                ))
            }
            Err(_) => Ok(false),
        }
    }

    pub fn refresh_status(&mut self) -> Result<(), UnikontainerError> {
        let new_status = match self.pid() {
            Some(_) if self.is_alive()? => match self.status() {
                ContainerStatus::Creating | ContainerStatus::Created => self.status(),
                _ => ContainerStatus::Running,
            },
            Some(_) => ContainerStatus::Stopped,
            None => match self.status() {
                ContainerStatus::Creating => ContainerStatus::Creating,
                _ => ContainerStatus::Stopped,
            },
        };

        self.set_status(new_status);
        Ok(())
    }

    pub fn refresh_state(&mut self) -> Result<&mut Self, UnikontainerError> {
        let state = State::load(&self.root)?;
        self.state = state;

        Ok(self)
    }

    pub fn load(container_root: PathBuf) -> Result<Self, UnikontainerError> {
        let state = State::load(&container_root)?;
        let mut container = Self {
            state,
            root: container_root,
        };
        container.refresh_status()?;
        Ok(container)
    }

    pub fn save(&self) -> Result<(), UnikontainerError> {
        tracing::debug!("Save container status: {:?} in {:?}", self, self.root);
        self.state.save(&self.root)?;

        Ok(())
    }

    /// Loads the runtime spec of the bundle the container was created from.
    pub fn spec(&self) -> Result<Spec, UnikontainerError> {
        let spec = Spec::load(self.bundle().join("config.json"))?;
        Ok(spec)
    }

    /// Unikernel configuration decoded at create time.
    pub fn unikernel_config(&self) -> UnikernelConfig {
        UnikernelConfig::from_annotations(self.annotations())
    }

    pub fn init_socket(&self) -> PathBuf {
        self.root.join(INIT_SOCKET)
    }

    pub fn ctrl_socket(&self) -> PathBuf {
        self.root.join(CTRL_SOCKET)
    }
}
