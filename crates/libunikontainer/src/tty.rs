//! tty (teletype) for user-system interaction
//!
//! When the engine asks for a terminal, a pseudo terminal is opened, the
//! master side is handed to the engine over its console socket and the
//! slave side becomes the stdio and controlling terminal of the process
//! that later execs the hypervisor.

use std::io::IoSlice;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::sys::socket::{self, UnixAddr};

#[derive(Debug, thiserror::Error)]
pub enum TTYError {
    #[error("failed to connect to console socket {path:?}")]
    ConnectConsoleSocket {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not create pseudo terminal")]
    CreatePseudoTerminal { source: nix::Error },
    #[error("failed to send pty master")]
    SendPtyMaster { source: nix::Error },
    #[error("failed to duplicate pty slave")]
    DuplicateSlave { source: std::io::Error },
}

type Result<T> = std::result::Result<T, TTYError>;

/// Both ends of a freshly opened pseudo terminal.
#[derive(Debug)]
pub struct Pty {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

impl Pty {
    pub fn open() -> Result<Self> {
        let pty = nix::pty::openpty(None, None)
            .map_err(|err| TTYError::CreatePseudoTerminal { source: err })?;
        Ok(Self {
            master: pty.master,
            slave: pty.slave,
        })
    }

    /// Stdin, stdout and stderr handles for a child, all backed by the slave.
    pub fn slave_stdio(&self) -> Result<(Stdio, Stdio, Stdio)> {
        let dup = || {
            self.slave
                .try_clone()
                .map(Stdio::from)
                .map_err(|err| TTYError::DuplicateSlave { source: err })
        };
        Ok((dup()?, dup()?, dup()?))
    }
}

pub fn connect_console_socket(console_socket_path: &Path) -> Result<UnixStream> {
    UnixStream::connect(console_socket_path).map_err(|err| TTYError::ConnectConsoleSocket {
        path: console_socket_path.to_path_buf(),
        source: err,
    })
}

/// Sends the pty master to the engine with SCM_RIGHTS.
pub fn send_pty_master(console: &UnixStream, master: &OwnedFd) -> Result<()> {
    let pty_name: &[u8] = b"/dev/ptmx";
    let iov = [IoSlice::new(pty_name)];
    let fds = [master.as_raw_fd()];
    let cmsg = socket::ControlMessage::ScmRights(&fds);
    socket::sendmsg::<UnixAddr>(
        console.as_raw_fd(),
        &iov,
        &[cmsg],
        socket::MsgFlags::empty(),
        None,
    )
    .map_err(|err| TTYError::SendPtyMaster { source: err })?;
    Ok(())
}

/// Makes stdin the controlling terminal of a new session. Runs in the
/// forked child after its stdio has been pointed at the pty slave.
pub fn set_controlling_terminal() -> std::io::Result<()> {
    nix::unistd::setsid()?;
    if unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 0) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use anyhow::Result;
    use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
    use std::io::IoSliceMut;
    use std::os::unix::net::UnixListener;

    #[test]
    fn test_connect_missing_console_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let err = connect_console_socket(&tmp.path().join("console.sock")).unwrap_err();
        assert!(matches!(err, TTYError::ConnectConsoleSocket { .. }));
    }

    #[test]
    fn test_send_pty_master() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let socket_path = tmp.path().join("console.sock");
        let listener = UnixListener::bind(&socket_path)?;

        let console = connect_console_socket(&socket_path)?;
        let (engine, _) = listener.accept()?;

        let pty = Pty::open()?;
        send_pty_master(&console, &pty.master)?;

        let mut buf = [0u8; 64];
        let (bytes, received) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let mut cmsg_space = nix::cmsg_space!([std::os::fd::RawFd; 1]);
            let msg = recvmsg::<UnixAddr>(
                engine.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_space),
                MsgFlags::empty(),
            )?;
            let received: Vec<_> = msg
                .cmsgs()
                .filter_map(|c| match c {
                    ControlMessageOwned::ScmRights(fds) => Some(fds),
                    _ => None,
                })
                .flatten()
                .collect();
            (msg.bytes, received)
        };
        assert_eq!(received.len(), 1);
        assert_eq!(&buf[..bytes], b"/dev/ptmx");
        Ok(())
    }

    #[test]
    fn test_slave_stdio() -> Result<()> {
        let pty = Pty::open()?;
        let _stdio = pty.slave_stdio()?;
        Ok(())
    }
}
