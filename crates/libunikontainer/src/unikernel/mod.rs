//! Guest specific command lines.
//!
//! Each unikernel family expects its boot parameters in a different dialect.
//! A [`Unikernel`] turns the generic network and storage parameters into that
//! dialect and tells the monitor how to attach devices for it.

mod linux;
mod mewz;
mod mirage;
mod rumprun;
mod unikraft;

use std::str::FromStr;

pub use linux::Linux;
pub use mewz::Mewz;
pub use mirage::Mirage;
pub use rumprun::Rumprun;
pub use unikraft::Unikraft;

use crate::network::NetworkError;

#[derive(Debug, thiserror::Error)]
pub enum UnikernelError {
    #[error("unikernel {0:?} is not supported")]
    Unsupported(String),
    #[error("failed to encode the boot configuration")]
    Encode(#[from] serde_json::Error),
    #[error("invalid guest netmask")]
    Mask(#[from] NetworkError),
}

type Result<T> = std::result::Result<T, UnikernelError>;

/// How the guest finds its root filesystem.
pub const ROOTFS_BLOCK: &str = "block";
pub const ROOTFS_INITRD: &str = "initrd";

/// Parameters every unikernel family knows how to render.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnikernelParams {
    /// Command line of the application
    pub cmdline: String,
    pub eth_device_ip: String,
    /// Dotted netmask, empty when the guest has no network
    pub eth_device_mask: String,
    pub eth_device_gateway: String,
    /// `block`, `initrd` or empty
    pub rootfs_type: String,
    pub block_mnt_point: String,
    pub version: String,
}

impl UnikernelParams {
    pub fn has_network(&self) -> bool {
        !self.eth_device_mask.is_empty() && !self.eth_device_ip.is_empty()
    }
}

pub trait Unikernel {
    fn init(&mut self, params: &UnikernelParams) -> Result<()>;
    /// The guest command line, passed to the monitor as is.
    fn command_string(&self) -> Result<String>;
    fn supports_block(&self) -> bool;
    fn supports_fs(&self, fs_type: &str) -> bool;
    /// Monitor option that attaches the TAP device, the device name is
    /// appended to it. Empty selects the monitor default.
    fn monitor_net_cli(&self, _monitor: &str) -> String {
        String::new()
    }
    /// Monitor option that attaches the block device, the device path is
    /// appended to it. Empty selects the monitor default.
    fn monitor_block_cli(&self, _monitor: &str) -> String {
        String::new()
    }
    /// Extra monitor options the guest needs.
    fn monitor_cli(&self, _monitor: &str) -> String {
        String::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnikernelKind {
    Rumprun,
    Unikraft,
    Mirage,
    Mewz,
    Linux,
}

impl FromStr for UnikernelKind {
    type Err = UnikernelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rumprun" => Ok(UnikernelKind::Rumprun),
            "unikraft" => Ok(UnikernelKind::Unikraft),
            "mirage" => Ok(UnikernelKind::Mirage),
            "mewz" => Ok(UnikernelKind::Mewz),
            "linux" => Ok(UnikernelKind::Linux),
            other => Err(UnikernelError::Unsupported(other.to_string())),
        }
    }
}

/// Builds the command builder registered for `unikernel_type`.
pub fn new_unikernel(unikernel_type: &str) -> Result<Box<dyn Unikernel>> {
    let unikernel: Box<dyn Unikernel> = match unikernel_type.parse()? {
        UnikernelKind::Rumprun => Box::<Rumprun>::default(),
        UnikernelKind::Unikraft => Box::<Unikraft>::default(),
        UnikernelKind::Mirage => Box::<Mirage>::default(),
        UnikernelKind::Mewz => Box::<Mewz>::default(),
        UnikernelKind::Linux => Box::<Linux>::default(),
    };
    Ok(unikernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_new_unikernel() -> Result<()> {
        for name in ["rumprun", "unikraft", "mirage", "mewz", "linux"] {
            new_unikernel(name)?;
        }
        assert!(matches!(
            new_unikernel("osv"),
            Err(UnikernelError::Unsupported(name)) if name == "osv"
        ));
        Ok(())
    }

    #[test]
    fn test_capabilities() -> Result<()> {
        let rumprun = new_unikernel("rumprun")?;
        assert!(rumprun.supports_block());
        assert!(rumprun.supports_fs("ext2"));
        assert!(!rumprun.supports_fs("ext4"));

        let linux = new_unikernel("linux")?;
        assert!(linux.supports_block());
        assert!(linux.supports_fs("xfs"));

        for name in ["unikraft", "mirage", "mewz"] {
            let unikernel = new_unikernel(name)?;
            assert!(!unikernel.supports_block());
            assert!(!unikernel.supports_fs("ext2"));
        }
        Ok(())
    }
}
