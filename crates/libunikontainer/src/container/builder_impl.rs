use std::io::{Error as IoError, ErrorKind};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command};

use oci_spec::runtime::Spec;

use super::builder::SELF_EXE;
use super::{Container, ContainerStatus};
use crate::context::RuntimeContext;
use crate::error::UnikontainerError;
use crate::hooks::{self, HookStage};
use crate::ipc::{self, IpcListener, IpcMessage};
use crate::namespaces::Namespaces;
use crate::syscall::syscall::SyscallType;
use crate::tty::{self, Pty};
use crate::utils;

pub(super) struct ContainerBuilderImpl {
    /// Interface to operating system primitives
    pub syscall: SyscallType,
    /// Id of the container
    pub container_id: String,
    /// File which will be used to communicate the pid of the
    /// container process to the higher level runtime
    pub pid_file: Option<PathBuf>,
    /// Socket to communicate the file descriptor of the ptty
    pub console_socket: Option<PathBuf>,
    /// Arguments of the reexec'd process
    pub reexec_args: Vec<String>,
    /// OCI compliant runtime spec
    pub spec: Spec,
    /// Container state
    pub container: Container,
}

impl ContainerBuilderImpl {
    /// Runs the engine side of the create handshake. Partial state is left
    /// behind on failure for `delete` to clean up.
    pub(super) fn create(&mut self, ctx: &RuntimeContext) -> Result<(), UnikontainerError> {
        if self.terminal() && self.console_socket.is_none() {
            tracing::error!("terminal requested without a console socket");
            return Err(UnikontainerError::InvalidInput(
                "process.terminal requires --console-socket".to_string(),
            ));
        }

        let listener = IpcListener::new(self.container.init_socket())?;
        ctx.capture(&self.container_id, "TS03");

        let (child, pty) = self.spawn_reexec()?;
        // recorded while still creating so delete can reap a failed create
        let pid = child.id() as i32;
        self.container.set_pid(pid).save()?;
        if let Some(pty) = pty {
            self.forward_console(pty)?;
        }
        ctx.capture(&self.container_id, "TS04");

        listener.await_message(IpcMessage::Booted)?;
        listener.close();
        ctx.capture(&self.container_id, "TS05");

        tracing::debug!(pid, "reexec'd process booted");
        if let Some(pid_file) = &self.pid_file {
            utils::write_pid_file(pid_file, pid)?;
        }
        self.container.set_status(ContainerStatus::Created).save()?;
        ctx.capture(&self.container_id, "TS06");

        hooks::run_stage(&self.spec, HookStage::CreateRuntime, &self.container.state).map_err(
            |err| {
                tracing::error!(%err, "failed to run create runtime hooks");
                err
            },
        )?;
        ctx.capture(&self.container_id, "TS07");

        ipc::send_message_retrying(self.container.ctrl_socket(), IpcMessage::Ack)?;
        ctx.capture(&self.container_id, "TS08");

        hooks::run_stage(&self.spec, HookStage::CreateContainer, &self.container.state).map_err(
            |err| {
                tracing::error!(%err, "failed to run create container hooks");
                err
            },
        )?;
        ctx.capture(&self.container_id, "TS09");

        Ok(())
    }

    fn terminal(&self) -> bool {
        self.spec
            .process()
            .as_ref()
            .and_then(|p| p.terminal())
            .unwrap_or(false)
    }

    /// Starts [`SELF_EXE`] inside the namespaces the OCI spec asks for. The
    /// network namespace is always fresh unless the OCI spec names one.
    fn spawn_reexec(&self) -> Result<(Child, Option<Pty>), UnikontainerError> {
        let namespaces = Namespaces::from(
            self.spec
                .linux()
                .as_ref()
                .and_then(|linux| linux.namespaces().as_ref()),
        );
        let terminal = self.terminal();
        let syscall = self.syscall;

        let mut command = Command::new(SELF_EXE);
        command.args(&self.reexec_args);

        let pty = if terminal {
            let pty = Pty::open()?;
            let (stdin, stdout, stderr) = pty.slave_stdio()?;
            command.stdin(stdin).stdout(stdout).stderr(stderr);
            Some(pty)
        } else {
            None
        };

        // Runs in the forked child right before the exec.
        unsafe {
            command.pre_exec(move || {
                namespaces
                    .apply_namespaces(syscall.create_syscall().as_ref())
                    .map_err(|err| IoError::new(ErrorKind::Other, err.to_string()))?;
                if terminal {
                    tty::set_controlling_terminal()?;
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(|err| {
            tracing::error!(%err, "failed to spawn the reexec'd process");
            err
        })?;

        Ok((child, pty))
    }

    fn forward_console(&self, pty: Pty) -> Result<(), UnikontainerError> {
        let Some(console_socket) = &self.console_socket else {
            return Err(UnikontainerError::InvalidInput(
                "process.terminal requires --console-socket".to_string(),
            ));
        };
        let console = tty::connect_console_socket(console_socket)?;
        tty::send_pty_master(&console, &pty.master)?;
        tracing::debug!(?console_socket, "sent pty master to console socket");
        Ok(())
    }
}
