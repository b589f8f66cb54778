//! Handshake channel between the runtime and the reexec'd container process.
//!
//! Every message is a short fixed byte string written as the whole payload of
//! a single connection. The receiver reads exactly as many bytes as the
//! message it expects and compares them, so the wire format stays
//! `BOOTED`, `ACK` and `START` with no framing.

use std::fmt::Display;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Socket the child uses to report that it is alive inside its namespaces.
pub const INIT_SOCKET: &str = "init.sock";
/// Socket the child listens on for instructions from the runtime.
pub const CTRL_SOCKET: &str = "ctrl.sock";

// sun_path is 108 bytes including the trailing NUL
const SUN_PATH_MAX: usize = 108;

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 50;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcMessage {
    /// Child is running in its namespaces and waits for instructions
    Booted,
    /// Runtime recorded the child and finished the create hooks
    Ack,
    /// Runtime asks the child to boot the unikernel
    Start,
}

impl IpcMessage {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            IpcMessage::Booted => b"BOOTED",
            IpcMessage::Ack => b"ACK",
            IpcMessage::Start => b"START",
        }
    }
}

impl Display for IpcMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match self {
            IpcMessage::Booted => "BOOTED",
            IpcMessage::Ack => "ACK",
            IpcMessage::Start => "START",
        };
        write!(f, "{print}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("invalid socket address {0:?}")]
    AddressInvalid(PathBuf),
    #[error("failed to bind socket {path:?}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to accept connection on {path:?}")]
    Accept {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read {expected} from {path:?}")]
    Transport {
        path: PathBuf,
        expected: IpcMessage,
        source: std::io::Error,
    },
    #[error("expected {expected} on {path:?} but received {received:?}")]
    ProtocolViolation {
        path: PathBuf,
        expected: IpcMessage,
        received: String,
    },
    #[error("failed to connect to {path:?}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to send {message} to {path:?}")]
    Send {
        path: PathBuf,
        message: IpcMessage,
        source: std::io::Error,
    },
    #[error("failed to connect to {path:?} after {attempts} attempts")]
    ConnectExhausted { path: PathBuf, attempts: u32 },
}

type Result<T> = std::result::Result<T, IpcError>;

fn validate_address(path: &Path) -> Result<()> {
    let len = path.as_os_str().len();
    if len == 0 || len >= SUN_PATH_MAX {
        tracing::error!(?path, len, "socket path is empty or too long");
        return Err(IpcError::AddressInvalid(path.to_path_buf()));
    }
    Ok(())
}

/// Listening end of the handshake. The socket file is removed when the
/// listener is dropped.
pub struct IpcListener {
    socket: UnixListener,
    path: PathBuf,
}

impl IpcListener {
    pub fn new<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        validate_address(&path)?;
        let socket = UnixListener::bind(&path).map_err(|err| {
            tracing::error!(?path, %err, "failed to bind handshake socket");
            IpcError::Bind {
                path: path.clone(),
                source: err,
            }
        })?;
        tracing::debug!(?path, "listening on handshake socket");

        Ok(Self { socket, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts exactly one connection and checks that it carried `expected`.
    pub fn await_message(&self, expected: IpcMessage) -> Result<()> {
        let (mut stream, _) = self.socket.accept().map_err(|err| IpcError::Accept {
            path: self.path.clone(),
            source: err,
        })?;

        let want = expected.as_bytes();
        let mut buf = vec![0u8; want.len()];
        let mut filled = 0;
        while filled < buf.len() {
            match stream.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::error!(path = ?self.path, %expected, %err, "failed to read message");
                    return Err(IpcError::Transport {
                        path: self.path.clone(),
                        expected,
                        source: err,
                    });
                }
            }
        }

        if &buf[..filled] != want {
            let received = String::from_utf8_lossy(&buf[..filled]).into_owned();
            tracing::error!(path = ?self.path, %expected, ?received, "unexpected message");
            return Err(IpcError::ProtocolViolation {
                path: self.path.clone(),
                expected,
                received,
            });
        }
        tracing::debug!(path = ?self.path, message = %expected, "received message");

        Ok(())
    }

    pub fn close(self) {}
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!(path = ?self.path, %err, "failed to remove handshake socket");
            }
        }
    }
}

/// Dials `path` once and writes `message`.
pub fn send_message<P: AsRef<Path>>(path: P, message: IpcMessage) -> Result<()> {
    let path = path.as_ref();
    validate_address(path)?;
    let stream = UnixStream::connect(path).map_err(|err| IpcError::Connect {
        path: path.to_path_buf(),
        source: err,
    })?;
    write_message(stream, path, message)
}

/// Dials `path` up to `max_attempts` times, sleeping `interval` between
/// attempts, because the peer may not have created its socket yet.
pub fn send_message_with_retry<P: AsRef<Path>>(
    path: P,
    message: IpcMessage,
    max_attempts: u32,
    interval: Duration,
) -> Result<()> {
    let path = path.as_ref();
    validate_address(path)?;

    for attempt in 1..=max_attempts {
        match UnixStream::connect(path) {
            Ok(stream) => {
                tracing::debug!(?path, %message, attempt, "connected to handshake socket");
                return write_message(stream, path, message);
            }
            Err(err) => {
                tracing::trace!(?path, %err, attempt, "handshake socket not ready");
                if attempt < max_attempts {
                    thread::sleep(interval);
                }
            }
        }
    }

    tracing::error!(?path, %message, max_attempts, "gave up connecting to handshake socket");
    Err(IpcError::ConnectExhausted {
        path: path.to_path_buf(),
        attempts: max_attempts,
    })
}

/// [`send_message_with_retry`] with the default budget of 50 attempts 5ms apart.
pub fn send_message_retrying<P: AsRef<Path>>(path: P, message: IpcMessage) -> Result<()> {
    send_message_with_retry(
        path,
        message,
        DEFAULT_RETRY_ATTEMPTS,
        DEFAULT_RETRY_INTERVAL,
    )
}

fn write_message(mut stream: UnixStream, path: &Path, message: IpcMessage) -> Result<()> {
    stream
        .write_all(message.as_bytes())
        .map_err(|err| IpcError::Send {
            path: path.to_path_buf(),
            message,
            source: err,
        })?;
    tracing::debug!(?path, %message, "sent message");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::time::Instant;

    #[test]
    fn test_message_wire_format() {
        assert_eq!(IpcMessage::Booted.as_bytes(), b"BOOTED");
        assert_eq!(IpcMessage::Ack.as_bytes(), b"ACK");
        assert_eq!(IpcMessage::Start.as_bytes(), b"START");
        assert_eq!(IpcMessage::Start.to_string(), "START");
    }

    #[test]
    fn test_address_invalid() {
        assert!(matches!(
            IpcListener::new(""),
            Err(IpcError::AddressInvalid(_))
        ));
        let long = PathBuf::from(format!("/tmp/{}", "a".repeat(SUN_PATH_MAX)));
        assert!(matches!(
            IpcListener::new(&long),
            Err(IpcError::AddressInvalid(_))
        ));
        assert!(matches!(
            send_message(&long, IpcMessage::Ack),
            Err(IpcError::AddressInvalid(_))
        ));
    }

    #[test]
    fn test_await_expected_message() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join(INIT_SOCKET);
        let listener = IpcListener::new(&path)?;

        let sender_path = path.clone();
        let sender = thread::spawn(move || send_message(sender_path, IpcMessage::Booted));
        listener.await_message(IpcMessage::Booted)?;
        sender.join().expect("sender panicked")?;
        Ok(())
    }

    #[test]
    fn test_start_before_ack_is_a_violation() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join(CTRL_SOCKET);
        let listener = IpcListener::new(&path)?;

        let sender_path = path.clone();
        let sender = thread::spawn(move || send_message(sender_path, IpcMessage::Start));
        let err = listener.await_message(IpcMessage::Ack).unwrap_err();
        sender.join().expect("sender panicked")?;
        match err {
            IpcError::ProtocolViolation {
                expected, received, ..
            } => {
                assert_eq!(expected, IpcMessage::Ack);
                assert_eq!(received, "STA");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_short_message_is_a_violation() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join(CTRL_SOCKET);
        let listener = IpcListener::new(&path)?;

        let sender_path = path.clone();
        let sender = thread::spawn(move || send_message(sender_path, IpcMessage::Ack));
        let err = listener.await_message(IpcMessage::Start).unwrap_err();
        sender.join().expect("sender panicked")?;
        assert!(matches!(err, IpcError::ProtocolViolation { .. }));
        Ok(())
    }

    #[test]
    fn test_listener_unlinks_socket() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join(INIT_SOCKET);
        let listener = IpcListener::new(&path)?;
        assert!(path.exists());
        listener.close();
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_retry_until_socket_appears() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join(CTRL_SOCKET);

        let listener_path = path.clone();
        let receiver = thread::spawn(move || -> std::result::Result<(), IpcError> {
            thread::sleep(Duration::from_millis(30));
            let listener = IpcListener::new(listener_path)?;
            listener.await_message(IpcMessage::Ack)
        });

        send_message_with_retry(&path, IpcMessage::Ack, 200, Duration::from_millis(5))?;
        receiver.join().expect("receiver panicked")?;
        Ok(())
    }

    #[test]
    fn test_retry_exhausted() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("missing.sock");

        let started = Instant::now();
        let err = send_message_with_retry(&path, IpcMessage::Start, 4, Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, IpcError::ConnectExhausted { attempts: 4, .. }));
        // three sleeps between four attempts
        assert!(started.elapsed() >= Duration::from_millis(15));
        Ok(())
    }
}
