//! Parses the signal argument of `kill`.
//!
//! Accepted forms are a number (`15`), a bare name (`TERM`) or a full name
//! (`SIGTERM`), case-insensitive.

use std::str::FromStr;

use nix::sys::signal::Signal as NixSignal;

/// POSIX Signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal(NixSignal);

#[derive(Debug, thiserror::Error)]
pub enum SignalError<T> {
    #[error("invalid signal: {0}")]
    InvalidSignal(T),
}

impl TryFrom<&str> for Signal {
    type Error = SignalError<String>;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let invalid = || SignalError::InvalidSignal(s.to_string());
        let trimmed = s.trim();

        if let Ok(num) = trimmed.parse::<i32>() {
            return NixSignal::try_from(num).map(Signal).map_err(|_| invalid());
        }

        let upper = trimmed.to_ascii_uppercase();
        let name = match upper.as_str() {
            "IOT" | "SIGIOT" => "SIGABRT".to_string(),
            n if n.starts_with("SIG") => n.to_string(),
            n => format!("SIG{n}"),
        };
        NixSignal::from_str(&name).map(Signal).map_err(|_| invalid())
    }
}

impl TryFrom<i32> for Signal {
    type Error = SignalError<i32>;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        NixSignal::try_from(value)
            .map_err(|_| SignalError::InvalidSignal(value))
            .map(Signal)
    }
}

impl From<NixSignal> for Signal {
    fn from(s: NixSignal) -> Self {
        Signal(s)
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_str())
    }
}

impl Signal {
    pub fn into_raw(self) -> NixSignal {
        self.0
    }
}
