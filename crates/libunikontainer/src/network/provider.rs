//! Link level operations needed to wire a TAP device to the container
//! interface, behind a trait so setup logic can be tested without
//! privileges.
use std::any::Any;
use std::net::Ipv4Addr;

use nix::unistd::{Gid, Uid};

use super::linux::LinuxNetwork;
use super::test::TestHelperNetwork;
use super::Result;

/// Addressing of an interface as seen by the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub interface: String,
    pub ip: String,
    pub default_gateway: String,
    pub mask: String,
    pub mac: String,
}

pub trait NetworkProvider {
    fn as_any(&self) -> &dyn Any;
    /// Names of every link in the current network namespace.
    fn interfaces(&self) -> Result<Vec<String>>;
    /// IPv4 address, netmask, default gateway and MAC of `name`.
    fn interface_info(&self, name: &str) -> Result<InterfaceInfo>;
    fn mac(&self, name: &str) -> Result<String>;
    fn mtu(&self, name: &str) -> Result<u32>;
    fn create_tap(&self, name: &str, owner: Uid, group: Gid) -> Result<()>;
    fn delete_tap(&self, name: &str) -> Result<()>;
    fn set_mtu(&self, name: &str, mtu: u32) -> Result<()>;
    fn set_address(&self, name: &str, addr: Ipv4Addr, prefix: u8) -> Result<()>;
    fn set_link_up(&self, name: &str, up: bool) -> Result<()>;
    fn add_ingress_qdisc(&self, name: &str) -> Result<()>;
    fn delete_ingress_qdisc(&self, name: &str) -> Result<()>;
    /// Mirrors every packet entering `from` to the egress of `to`.
    fn add_redirect_filter(&self, from: &str, to: &str) -> Result<()>;
    fn delete_filters(&self, name: &str) -> Result<()>;
    fn enable_ip_forwarding(&self) -> Result<()>;
    fn add_masquerade(&self, source: &str, out_interface: &str) -> Result<()>;
}

#[derive(Clone, Copy, Debug)]
pub enum NetworkProviderType {
    Linux,
    Test,
}

impl Default for NetworkProviderType {
    fn default() -> Self {
        if cfg!(test) {
            NetworkProviderType::Test
        } else {
            NetworkProviderType::Linux
        }
    }
}

impl NetworkProviderType {
    pub fn create_provider(&self) -> Box<dyn NetworkProvider> {
        match self {
            NetworkProviderType::Linux => Box::new(LinuxNetwork),
            NetworkProviderType::Test => Box::<TestHelperNetwork>::default(),
        }
    }
}

pub fn create_network_provider() -> Box<dyn NetworkProvider> {
    NetworkProviderType::default().create_provider()
}
