//! Connects the guest to the container network.
//!
//! The container runtime leaves a veth endpoint (`eth0`) in the network
//! namespace. A TAP device is created next to it for the monitor, and either
//! traffic is mirrored between the two with tc (dynamic) or the TAP gets its
//! own subnet that is NATed out of `eth0` (static).

pub mod linux;
pub mod provider;
pub mod queue_proxy;

use std::collections::HashMap;
use std::net::Ipv4Addr;

use nix::unistd::{Gid, Uid};

pub use provider::{create_network_provider, InterfaceInfo, NetworkProvider};

pub const DEFAULT_INTERFACE: &str = "eth0";
/// Annotation set by the CRI plugin with the name of the container.
pub const ANNOT_CONTAINER_NAME: &str = "io.kubernetes.cri.container-name";
const STATIC_CONTAINER_NAME: &str = "user-container";

const MAX_TAP_INDEX: usize = 255;
const STATIC_TAP_ADDR: Ipv4Addr = Ipv4Addr::new(172, 16, 1, 1);
const STATIC_GUEST_ADDR: Ipv4Addr = Ipv4Addr::new(172, 16, 1, 2);
const STATIC_PREFIX: u8 = 24;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("interface {0} not found")]
    InterfaceNotFound(String),
    #[error("interface {0} has no IPv4 address")]
    NoAddress(String),
    #[error("too many TAP devices: {0}")]
    TooManyTaps(usize),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("{op} on {name} failed: {errno}")]
    Ioctl {
        op: &'static str,
        name: String,
        errno: nix::errno::Errno,
    },
    #[error("invalid interface name {0:?}")]
    InvalidName(String),
    #[error("failed to run {command}")]
    Command {
        command: String,
        source: std::io::Error,
    },
    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("failed to read {path}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write {path}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {what}: {value:?}")]
    Parse { what: &'static str, value: String },
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

type Result<T> = std::result::Result<T, NetworkError>;

/// The TAP handed to the monitor and the addressing the guest should use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    pub tap_device: String,
    pub eth: InterfaceInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    Static,
    Dynamic,
}

impl NetworkType {
    /// Knative style deployments name the container `user-container` and
    /// need the static flavour.
    pub fn from_annotations(annotations: Option<&HashMap<String, String>>) -> Self {
        match annotations.and_then(|a| a.get(ANNOT_CONTAINER_NAME)) {
            Some(name) if name == STATIC_CONTAINER_NAME => NetworkType::Static,
            _ => NetworkType::Dynamic,
        }
    }
}

pub fn tap_name(index: usize) -> String {
    format!("tap{index}_urunc")
}

/// User and group that own the TAP device, the ones the monitor runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapOwner {
    pub uid: Uid,
    pub gid: Gid,
}

/// Sets up networking for the guest. `None` means the namespace has no
/// default interface and the guest runs without network.
pub fn setup(
    network_type: NetworkType,
    provider: &dyn NetworkProvider,
    owner: TapOwner,
) -> Result<Option<NetworkInfo>> {
    tracing::debug!(?network_type, ?owner, "setting up network");
    match network_type {
        NetworkType::Static => setup_static(provider, owner).map(Some),
        NetworkType::Dynamic => setup_dynamic(provider, owner),
    }
}

fn setup_dynamic(provider: &dyn NetworkProvider, owner: TapOwner) -> Result<Option<NetworkInfo>> {
    let interfaces = provider.interfaces()?;
    let index = interfaces
        .iter()
        .filter(|name| name.starts_with("tap"))
        .count();
    if index > MAX_TAP_INDEX {
        return Err(NetworkError::TooManyTaps(index));
    }
    if index > 0 {
        return Err(NetworkError::UnsupportedOperation(
            "multiple TAP devices in one network namespace".to_string(),
        ));
    }
    if !interfaces.iter().any(|name| name == DEFAULT_INTERFACE) {
        tracing::info!("no {DEFAULT_INTERFACE} interface, assuming a ctr container without network");
        return Ok(None);
    }

    let tap = tap_name(index);
    let tap_addr = Ipv4Addr::new(172, 16, index as u8 + 1, 2);
    wire_tap(provider, &tap, owner, tap_addr, 24, DEFAULT_INTERFACE, true)?;

    let eth = provider.interface_info(DEFAULT_INTERFACE)?;
    tracing::info!(tap, ip = eth.ip, gateway = eth.default_gateway, "dynamic network ready");
    Ok(Some(NetworkInfo {
        tap_device: tap,
        eth,
    }))
}

fn setup_static(provider: &dyn NetworkProvider, owner: TapOwner) -> Result<NetworkInfo> {
    let interfaces = provider.interfaces()?;
    if !interfaces.iter().any(|name| name == DEFAULT_INTERFACE) {
        return Err(NetworkError::InterfaceNotFound(DEFAULT_INTERFACE.to_string()));
    }

    let tap = tap_name(0);
    wire_tap(
        provider,
        &tap,
        owner,
        STATIC_TAP_ADDR,
        STATIC_PREFIX,
        DEFAULT_INTERFACE,
        false,
    )?;

    provider.enable_ip_forwarding()?;
    provider.add_masquerade(
        &format!("{STATIC_TAP_ADDR}/{STATIC_PREFIX}"),
        DEFAULT_INTERFACE,
    )?;

    let eth = InterfaceInfo {
        interface: DEFAULT_INTERFACE.to_string(),
        ip: STATIC_GUEST_ADDR.to_string(),
        default_gateway: STATIC_TAP_ADDR.to_string(),
        mask: prefix_to_mask(STATIC_PREFIX).to_string(),
        mac: provider.mac(DEFAULT_INTERFACE)?,
    };
    tracing::info!(tap, ip = eth.ip, "static network ready");
    Ok(NetworkInfo {
        tap_device: tap,
        eth,
    })
}

/// Creates `tap` owned by `owner` with the MTU of `redirect`,
/// optionally mirrors traffic between the two, and brings it up with
/// `addr/prefix`.
fn wire_tap(
    provider: &dyn NetworkProvider,
    tap: &str,
    owner: TapOwner,
    addr: Ipv4Addr,
    prefix: u8,
    redirect: &str,
    mirror: bool,
) -> Result<()> {
    let mtu = provider.mtu(redirect)?;
    provider.create_tap(tap, owner.uid, owner.gid)?;
    provider.set_mtu(tap, mtu)?;

    if mirror {
        provider.add_ingress_qdisc(redirect)?;
        provider.add_ingress_qdisc(tap)?;
        provider.add_redirect_filter(redirect, tap)?;
        provider.add_redirect_filter(tap, redirect)?;
    }

    provider.set_address(tap, addr, prefix)?;
    provider.set_link_up(tap, true)?;
    tracing::debug!(tap, %addr, prefix, mtu, "tap device configured");
    Ok(())
}

/// Removes `tap` and the tc state that tied it to the default interface.
/// A missing TAP is not an error.
pub fn cleanup(provider: &dyn NetworkProvider, tap: &str) -> Result<()> {
    let interfaces = provider.interfaces()?;
    if !interfaces.iter().any(|name| name == tap) {
        tracing::debug!(tap, "tap device already gone");
        return Ok(());
    }

    for name in [tap, DEFAULT_INTERFACE] {
        if name == DEFAULT_INTERFACE && !interfaces.iter().any(|i| i == DEFAULT_INTERFACE) {
            continue;
        }
        provider.delete_filters(name)?;
        provider.delete_ingress_qdisc(name)?;
    }

    provider.set_link_up(tap, false)?;
    provider.delete_tap(tap)?;
    tracing::info!(tap, "tap device removed");
    Ok(())
}

pub fn prefix_to_mask(prefix: u8) -> Ipv4Addr {
    let bits = match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - p),
    };
    Ipv4Addr::from(bits)
}

/// Number of leading ones in a dotted netmask.
pub fn subnet_mask_to_cidr(mask: &str) -> Result<u8> {
    let parsed: Ipv4Addr = mask.parse().map_err(|_| NetworkError::Parse {
        what: "netmask",
        value: mask.to_string(),
    })?;
    let bits = u32::from(parsed);
    if bits.leading_ones() + bits.trailing_zeros() != 32 {
        return Err(NetworkError::Parse {
            what: "netmask",
            value: mask.to_string(),
        });
    }
    Ok(bits.leading_ones() as u8)
}

#[cfg(test)]
mod tests {
    use super::test::{LinkCall, TestHelperNetwork};
    use super::*;
    use anyhow::Result;

    const OWNER: TapOwner = TapOwner {
        uid: Uid::from_raw(1000),
        gid: Gid::from_raw(1001),
    };

    fn provider_with(interfaces: &[&str]) -> TestHelperNetwork {
        let provider = TestHelperNetwork::default();
        provider.set_interfaces(interfaces);
        provider.set_info(InterfaceInfo {
            interface: DEFAULT_INTERFACE.to_string(),
            ip: "10.4.0.7".to_string(),
            default_gateway: "10.4.0.1".to_string(),
            mask: "255.255.255.0".to_string(),
            mac: "aa:bb:cc:dd:ee:ff".to_string(),
        });
        provider.set_mtu_value(1450);
        provider
    }

    #[test]
    fn test_network_type() {
        let mut annotations = HashMap::new();
        assert_eq!(NetworkType::from_annotations(None), NetworkType::Dynamic);
        annotations.insert(ANNOT_CONTAINER_NAME.to_string(), "sidecar".to_string());
        assert_eq!(
            NetworkType::from_annotations(Some(&annotations)),
            NetworkType::Dynamic
        );
        annotations.insert(ANNOT_CONTAINER_NAME.to_string(), "user-container".to_string());
        assert_eq!(
            NetworkType::from_annotations(Some(&annotations)),
            NetworkType::Static
        );
    }

    #[test]
    fn test_dynamic_setup() -> Result<()> {
        let provider = provider_with(&["lo", "eth0"]);
        let info = setup(NetworkType::Dynamic, &provider, OWNER)?.expect("network info");

        assert_eq!(info.tap_device, "tap0_urunc");
        assert_eq!(info.eth.ip, "10.4.0.7");
        assert_eq!(info.eth.default_gateway, "10.4.0.1");
        assert_eq!(info.eth.mask, "255.255.255.0");
        assert_eq!(info.eth.mac, "aa:bb:cc:dd:ee:ff");

        let tap = "tap0_urunc".to_string();
        let eth = "eth0".to_string();
        assert_eq!(
            provider.calls(),
            vec![
                LinkCall::CreateTap(tap.clone(), OWNER.uid, OWNER.gid),
                LinkCall::SetMtu(tap.clone(), 1450),
                LinkCall::AddIngress(eth.clone()),
                LinkCall::AddIngress(tap.clone()),
                LinkCall::Redirect(eth.clone(), tap.clone()),
                LinkCall::Redirect(tap.clone(), eth),
                LinkCall::SetAddress(tap.clone(), Ipv4Addr::new(172, 16, 1, 2), 24),
                LinkCall::SetUp(tap, true),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_dynamic_without_eth0() -> Result<()> {
        let provider = provider_with(&["lo"]);
        assert_eq!(setup(NetworkType::Dynamic, &provider, OWNER)?, None);
        assert!(provider.calls().is_empty());
        Ok(())
    }

    #[test]
    fn test_dynamic_existing_tap() {
        let provider = provider_with(&["lo", "eth0", "tap0_urunc"]);
        let err = setup(NetworkType::Dynamic, &provider, OWNER).unwrap_err();
        assert!(matches!(err, NetworkError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_dynamic_ignores_tap_lookalikes() -> Result<()> {
        let provider = provider_with(&["lo", "eth0", "laptop0", "bridge-tap"]);
        let info = setup(NetworkType::Dynamic, &provider, OWNER)?.expect("network info");
        assert_eq!(info.tap_device, "tap0_urunc");
        Ok(())
    }

    #[test]
    fn test_dynamic_too_many_taps() {
        let names: Vec<String> = (0..300).map(|i| format!("tap{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let provider = provider_with(&refs);
        let err = setup(NetworkType::Dynamic, &provider, OWNER).unwrap_err();
        assert!(matches!(err, NetworkError::TooManyTaps(300)));
    }

    #[test]
    fn test_static_setup() -> Result<()> {
        let provider = provider_with(&["lo", "eth0"]);
        let info = setup(NetworkType::Static, &provider, OWNER)?.expect("network info");

        assert_eq!(info.tap_device, "tap0_urunc");
        assert_eq!(info.eth.ip, "172.16.1.2");
        assert_eq!(info.eth.default_gateway, "172.16.1.1");
        assert_eq!(info.eth.mask, "255.255.255.0");
        assert_eq!(info.eth.mac, "aa:bb:cc:dd:ee:ff");

        let calls = provider.calls();
        assert_eq!(
            calls[0],
            LinkCall::CreateTap("tap0_urunc".to_string(), OWNER.uid, OWNER.gid)
        );
        assert!(!calls.iter().any(|c| matches!(c, LinkCall::Redirect(..))));
        assert!(calls.contains(&LinkCall::SetAddress(
            "tap0_urunc".to_string(),
            Ipv4Addr::new(172, 16, 1, 1),
            24
        )));
        assert!(calls.contains(&LinkCall::IpForward));
        assert!(calls.contains(&LinkCall::Masquerade(
            "172.16.1.1/24".to_string(),
            "eth0".to_string()
        )));
        Ok(())
    }

    #[test]
    fn test_static_without_eth0() {
        let provider = provider_with(&["lo"]);
        let err = setup(NetworkType::Static, &provider, OWNER).unwrap_err();
        assert!(matches!(err, NetworkError::InterfaceNotFound(_)));
    }

    #[test]
    fn test_cleanup() -> Result<()> {
        let provider = provider_with(&["lo", "eth0", "tap0_urunc"]);
        cleanup(&provider, "tap0_urunc")?;

        let tap = "tap0_urunc".to_string();
        let eth = "eth0".to_string();
        assert_eq!(
            provider.calls(),
            vec![
                LinkCall::DeleteFilters(tap.clone()),
                LinkCall::DeleteIngress(tap.clone()),
                LinkCall::DeleteFilters(eth.clone()),
                LinkCall::DeleteIngress(eth),
                LinkCall::SetUp(tap.clone(), false),
                LinkCall::DeleteTap(tap),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_cleanup_missing_tap() -> Result<()> {
        let provider = provider_with(&["lo", "eth0"]);
        cleanup(&provider, "tap0_urunc")?;
        assert!(provider.calls().is_empty());
        Ok(())
    }

    #[test]
    fn test_masks() -> Result<()> {
        assert_eq!(prefix_to_mask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(prefix_to_mask(0), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(prefix_to_mask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(subnet_mask_to_cidr("255.255.255.0")?, 24);
        assert_eq!(subnet_mask_to_cidr("255.255.240.0")?, 20);
        assert!(subnet_mask_to_cidr("255.0.255.0").is_err());
        assert!(subnet_mask_to_cidr("not a mask").is_err());
        Ok(())
    }
}
