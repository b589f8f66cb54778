//! OCI lifecycle hooks. Each hook receives the container state as JSON on
//! stdin and must exit with status 0 within its optional timeout.

use std::{
    collections::HashMap, fmt, io::ErrorKind, io::Write, os::unix::prelude::CommandExt,
    path::PathBuf, process, thread, time,
};

use nix::{sys::signal, unistd::Pid};
use oci_spec::runtime::{Hook, Hooks, Spec};

use crate::{container::State, utils};

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("failed to execute hook {path:?}")]
    CommandExecute {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode container state")]
    EncodeContainerState(#[source] serde_json::Error),
    #[error("hook {path:?} exited with non-zero code {code}")]
    NonZeroExitCode { path: PathBuf, code: i32 },
    #[error("hook {path:?} was killed by a signal")]
    Killed { path: PathBuf },
    #[error("hook {path:?} timed out")]
    Timeout { path: PathBuf },
    #[error("failed to write container state to hook {path:?} stdin")]
    WriteContainerState {
        path: PathBuf,
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, HookError>;

/// Points in the lifecycle at which hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    CreateRuntime,
    CreateContainer,
    StartContainer,
    Prestart,
    Poststart,
    Poststop,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookStage::CreateRuntime => "createRuntime",
            HookStage::CreateContainer => "createContainer",
            HookStage::StartContainer => "startContainer",
            HookStage::Prestart => "prestart",
            HookStage::Poststart => "poststart",
            HookStage::Poststop => "poststop",
        };
        write!(f, "{name}")
    }
}

impl HookStage {
    pub fn select<'a>(&self, hooks: &'a Hooks) -> Option<&'a Vec<Hook>> {
        match self {
            HookStage::CreateRuntime => hooks.create_runtime().as_ref(),
            HookStage::CreateContainer => hooks.create_container().as_ref(),
            HookStage::StartContainer => hooks.start_container().as_ref(),
            #[allow(deprecated)]
            HookStage::Prestart => hooks.prestart().as_ref(),
            HookStage::Poststart => hooks.poststart().as_ref(),
            HookStage::Poststop => hooks.poststop().as_ref(),
        }
    }
}

/// Runs the hooks the OCI spec declares for `stage`.
pub fn run_stage(spec: &Spec, stage: HookStage, state: &State) -> Result<()> {
    let hooks = spec.hooks().as_ref().and_then(|hooks| stage.select(hooks));
    tracing::debug!(%stage, count = hooks.map_or(0, |h| h.len()), "running hooks");
    run_hooks(hooks, state)
}

pub fn run_hooks(hooks: Option<&Vec<Hook>>, state: &State) -> Result<()> {
    let Some(hooks) = hooks else {
        return Ok(());
    };

    for hook in hooks {
        run_hook(hook, state)?;
    }

    Ok(())
}

fn run_hook(hook: &Hook, state: &State) -> Result<()> {
    let path = hook.path().to_path_buf();
    let mut hook_command = process::Command::new(hook.path());
    // The first element of args is arg0, which may differ from the path.
    if let Some((arg0, args)) = hook.args().as_ref().and_then(|a| a.split_first()) {
        tracing::debug!(?arg0, ?args, "run_hooks");
        hook_command.arg0(arg0).args(args)
    } else {
        hook_command.arg0(hook.path().display().to_string())
    };

    let envs: HashMap<String, String> = hook
        .env()
        .as_ref()
        .map(|env| utils::parse_env(env))
        .unwrap_or_default();
    tracing::debug!(?envs, "run_hooks envs");

    let mut hook_process = hook_command
        .env_clear()
        .envs(envs)
        .stdin(process::Stdio::piped())
        .spawn()
        .map_err(|source| HookError::CommandExecute {
            path: path.clone(),
            source,
        })?;
    let hook_process_pid = Pid::from_raw(hook_process.id() as i32);

    if let Some(stdin) = &mut hook_process.stdin {
        let encoded_state = serde_json::to_string(state).map_err(HookError::EncodeContainerState)?;
        // A broken pipe means the hook already exited; its status decides.
        if let Err(e) = stdin.write_all(encoded_state.as_bytes()) {
            if e.kind() != ErrorKind::BrokenPipe {
                let _ = signal::kill(hook_process_pid, signal::Signal::SIGKILL);
                return Err(HookError::WriteContainerState { path, source: e });
            }
        }
    }
    drop(hook_process.stdin.take());

    let res = if let Some(timeout_sec) = hook.timeout() {
        // Wait in another thread so the timeout can be enforced from here.
        let (s, r) = crossbeam_channel::unbounded();
        thread::spawn(move || {
            let res = hook_process.wait();
            let _ = s.send(res);
        });
        match r.recv_timeout(time::Duration::from_secs(timeout_sec as u64)) {
            Ok(res) => res,
            Err(_) => {
                let _ = signal::kill(hook_process_pid, signal::Signal::SIGKILL);
                return Err(HookError::Timeout { path });
            }
        }
    } else {
        hook_process.wait()
    };

    match res {
        Ok(exit_status) => match exit_status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(HookError::NonZeroExitCode { path, code }),
            None => Err(HookError::Killed { path }),
        },
        Err(source) => Err(HookError::CommandExecute { path, source }),
    }
}
