//! Information about status and state of the container
use std::collections::HashMap;
use std::fmt::Display;
use std::fs;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

/// Indicates status of the container
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ContainerStatus {
    // The container is being created
    #[default]
    Creating,
    // The runtime has finished the create operation
    Created,
    // The hypervisor has replaced the reexec'd process
    Running,
    // The hypervisor process has exited or was killed
    Stopped,
}

impl ContainerStatus {
    pub fn can_start(&self) -> bool {
        matches!(self, ContainerStatus::Created)
    }

    pub fn can_kill(&self) -> bool {
        use ContainerStatus::*;
        match self {
            Creating | Stopped => false,
            Created | Running => true,
        }
    }

    /// A container whose create failed half way is still deletable.
    pub fn can_delete(&self) -> bool {
        matches!(self, ContainerStatus::Stopped | ContainerStatus::Creating)
    }
}

impl Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match *self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };

        write!(f, "{print}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to open container state file {state_file_path:?}")]
    OpenStateFile {
        state_file_path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse container state file {state_file_path:?}")]
    ParseStateFile {
        state_file_path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write container state file {state_file_path:?}")]
    WriteStateFile {
        state_file_path: PathBuf,
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, StateError>;

/// Pid stored before the reexec'd process is known.
pub const UNKNOWN_PID: i32 = -1;

/// Stores the state information of the container
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct State {
    // Version of the runtime spec the state conforms to
    pub oci_version: String,
    pub id: String,
    pub status: ContainerStatus,
    // Process that execs the hypervisor, -1 until known
    pub pid: i32,
    // Absolute path to the bundle
    pub bundle: PathBuf,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created: Option<DateTime<Utc>>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            oci_version: "1.0.2".to_string(),
            id: String::new(),
            status: ContainerStatus::default(),
            pid: UNKNOWN_PID,
            bundle: PathBuf::new(),
            annotations: HashMap::new(),
            created: None,
        }
    }
}

impl State {
    const STATE_FILE_PATH: &'static str = "state.json";

    pub fn new(container_id: &str, status: ContainerStatus, pid: i32, bundle: PathBuf) -> Self {
        Self {
            id: container_id.to_string(),
            status,
            pid,
            bundle,
            ..Default::default()
        }
    }

    #[instrument(level = "trace")]
    pub fn save(&self, container_root: &Path) -> Result<()> {
        let state_file_path = Self::file_path(container_root);
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .append(false)
            .create(true)
            .truncate(true)
            .open(&state_file_path)
            .map_err(|err| {
                tracing::error!(
                    state_file_path = ?state_file_path,
                    err = %err,
                    "failed to open container state file",
                );
                StateError::OpenStateFile {
                    state_file_path: state_file_path.to_owned(),
                    source: err,
                }
            })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self).map_err(|err| {
            tracing::error!(?state_file_path, %err, "failed to serialize container state");
            StateError::ParseStateFile {
                state_file_path: state_file_path.to_owned(),
                source: err,
            }
        })?;
        writer.flush().map_err(|err| {
            tracing::error!(?state_file_path, %err, "failed to write container state file");
            StateError::WriteStateFile {
                state_file_path: state_file_path.to_owned(),
                source: err,
            }
        })?;

        Ok(())
    }

    pub fn load(container_root: &Path) -> Result<Self> {
        let state_file_path = Self::file_path(container_root);
        let state_file = File::open(&state_file_path).map_err(|err| {
            tracing::error!(?state_file_path, %err, "failed to open container state file");
            StateError::OpenStateFile {
                state_file_path: state_file_path.to_owned(),
                source: err,
            }
        })?;

        let state: Self = serde_json::from_reader(BufReader::new(state_file)).map_err(|err| {
            tracing::error!(?state_file_path, %err, "failed to parse container state file");
            StateError::ParseStateFile {
                state_file_path: state_file_path.to_owned(),
                source: err,
            }
        })?;

        Ok(state)
    }

    /// Returns the path to the state JSON file for the provided `container_root`.
    ///
    /// ```
    /// # use std::path::Path;
    /// # use libunikontainer::container::State;
    ///
    /// let container_root = Path::new("/run/urunc/container");
    /// let state_file = State::file_path(&container_root);
    /// assert_eq!(state_file.to_str(), Some("/run/urunc/container/state.json"));
    /// ```
    pub fn file_path(container_root: &Path) -> PathBuf {
        container_root.join(Self::STATE_FILE_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_creating_status() {
        let cstatus = ContainerStatus::default();
        assert!(!cstatus.can_start());
        assert!(cstatus.can_delete());
        assert!(!cstatus.can_kill());
    }

    #[test]
    fn test_create_status() {
        let cstatus = ContainerStatus::Created;
        assert!(cstatus.can_start());
        assert!(!cstatus.can_delete());
        assert!(cstatus.can_kill());
    }

    #[test]
    fn test_running_status() {
        let cstatus = ContainerStatus::Running;
        assert!(!cstatus.can_start());
        assert!(!cstatus.can_delete());
        assert!(cstatus.can_kill());
    }

    #[test]
    fn test_stopped_status() {
        let cstatus = ContainerStatus::Stopped;
        assert!(!cstatus.can_start());
        assert!(cstatus.can_delete());
        assert!(!cstatus.can_kill());
    }

    #[test]
    fn test_state_file_format() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut state = State::new(
            "uk1",
            ContainerStatus::Creating,
            UNKNOWN_PID,
            PathBuf::from("/bundle"),
        );
        state
            .annotations
            .insert("com.urunc.unikernel.hypervisor".into(), "hvt".into());
        state.save(tmp.path())?;

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(State::file_path(tmp.path()))?)?;
        assert_eq!(raw["ociVersion"], "1.0.2");
        assert_eq!(raw["status"], "creating");
        assert_eq!(raw["pid"], -1);
        assert_eq!(raw["bundle"], "/bundle");
        assert_eq!(raw["annotations"]["com.urunc.unikernel.hypervisor"], "hvt");

        assert_eq!(State::load(tmp.path())?, state);
        Ok(())
    }

    #[test]
    fn test_load_missing_state() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            State::load(tmp.path()),
            Err(StateError::OpenStateFile { .. })
        ));
    }
}
