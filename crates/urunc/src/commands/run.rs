//! Creates a container and starts it right away
use anyhow::{Context, Result};
use libunikontainer::context::RuntimeContext;
use liboci_cli::Run;
use nix::sys::signal::{self, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use super::create::{build_container, reexec};
use super::hand_off_to_runc;

/// Returns the exit code urunc should exit with.
pub fn run(args: Run, ctx: &RuntimeContext) -> Result<i32> {
    if args.reexec {
        reexec(&args.container_id, ctx)?;
        return Ok(0);
    }

    let result = build_container(
        ctx,
        &args.container_id,
        &args.bundle,
        args.pid_file.as_ref(),
        args.console_socket.as_ref(),
    );
    let mut container = match result {
        Ok(container) => container,
        Err(err) if err.is_for_runc() => {
            hand_off_to_runc(ctx, &args.container_id)?;
            return Ok(0);
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to create container {}", args.container_id))
        }
    };

    container
        .start(ctx)
        .with_context(|| format!("failed to start container {}", args.container_id))?;

    if args.detach {
        return Ok(0);
    }

    let pid = container
        .pid()
        .with_context(|| format!("container {} has no monitor pid", args.container_id))?;
    handle_foreground(pid)
}

// The monitor is a child of this process. Wait for it like runc does in
// the foreground and forward every other signal to it.
fn handle_foreground(monitor_pid: Pid) -> Result<i32> {
    let signal_set = SigSet::all();
    signal_set
        .thread_set_mask()
        .with_context(|| "failed to call pthread_sigmask")?;
    loop {
        match signal_set
            .wait()
            .with_context(|| "failed to call sigwait")?
        {
            Signal::SIGCHLD => loop {
                match waitpid(None, Some(WaitPidFlag::WNOHANG))? {
                    WaitStatus::StillAlive => break,
                    status => {
                        if status.pid() == Some(monitor_pid) {
                            if let Some(code) = exit_code(status) {
                                return Ok(code);
                            }
                        }
                    }
                }
            },
            sig => {
                tracing::debug!(?sig, "forwarding signal to the monitor");
                signal::kill(monitor_pid, Some(sig))
                    .with_context(|| format!("failed to forward {sig} to the monitor"))?;
            }
        }
    }
}

/// Shell style exit code of a terminated process.
fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, sig, _) => Some(128 + sig as i32),
        _ => None,
    }
}
