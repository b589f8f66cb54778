//! Execution parameters for the monitor and the guest, derived from the
//! bundle before anything is touched on the host.

use std::path::{Path, PathBuf};

use oci_spec::runtime::Spec;

use crate::config::UnikernelConfig;
use crate::network::NetworkInfo;
use crate::unikernel::{Unikernel, UnikernelParams, ROOTFS_BLOCK, ROOTFS_INITRD};
use crate::vmm::ExecArgs;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecPlan {
    pub args: ExecArgs,
    pub params: UnikernelParams,
}

/// Paths in the configuration are absolute inside the rootfs. They are kept
/// relative so they resolve both before and after the root changes.
pub fn guest_path(path: &str) -> PathBuf {
    PathBuf::from(path.trim_start_matches('/'))
}

/// Memory limit in bytes, zero when the OCI spec sets none.
pub fn memory_limit(spec: &Spec) -> u64 {
    spec.linux()
        .as_ref()
        .and_then(|linux| linux.resources().as_ref())
        .and_then(|resources| resources.memory().as_ref())
        .and_then(|memory| memory.limit())
        .filter(|limit| *limit > 0)
        .map(|limit| limit as u64)
        .unwrap_or(0)
}

/// A container with no seccomp profile is unconfined.
pub fn seccomp_requested(spec: &Spec) -> bool {
    spec.linux()
        .as_ref()
        .map(|linux| linux.seccomp().is_some())
        .unwrap_or(false)
}

/// `process.args` win over the cmdline annotation.
pub fn guest_cmdline(spec: &Spec, config: &UnikernelConfig) -> String {
    match spec.process().as_ref().and_then(|p| p.args().as_ref()) {
        Some(args) if !args.is_empty() => args.join(" "),
        _ => config.cmdline.clone(),
    }
}

impl ExecPlan {
    pub fn new(container_id: &str, spec: &Spec, config: &UnikernelConfig) -> Self {
        let seccomp = seccomp_requested(spec);
        if !seccomp {
            tracing::warn!("seccomp is disabled");
        }
        let initrd_path = (!config.initrd.is_empty()).then(|| guest_path(&config.initrd));
        let rootfs_type = if initrd_path.is_some() {
            ROOTFS_INITRD.to_string()
        } else {
            String::new()
        };

        ExecPlan {
            args: ExecArgs {
                container_id: container_id.to_string(),
                unikernel_path: guest_path(&config.binary),
                initrd_path,
                seccomp,
                mem_size_b: memory_limit(spec),
                environment: std::env::vars().map(|(k, v)| format!("{k}={v}")).collect(),
                ..Default::default()
            },
            params: UnikernelParams {
                cmdline: guest_cmdline(spec, config),
                rootfs_type,
                block_mnt_point: config.blk_mnt_point.clone(),
                version: config.unikernel_version.clone(),
                ..Default::default()
            },
        }
    }

    /// Wires the TAP device to the monitor and the interface addresses to
    /// the guest. `None` leaves the guest without network.
    pub fn set_network(&mut self, info: Option<&NetworkInfo>) {
        let Some(info) = info else {
            self.args.tap_device = None;
            self.args.guest_mac = None;
            return;
        };
        self.args.tap_device = Some(info.tap_device.clone());
        // the guest keeps the MAC of the interface it replaces
        self.args.guest_mac = Some(info.eth.mac.clone());
        self.params.eth_device_ip = info.eth.ip.clone();
        self.params.eth_device_mask = info.eth.mask.clone();
        self.params.eth_device_gateway = info.eth.default_gateway.clone();
    }

    /// Hands `device` to the guest as its root block device.
    pub fn set_block(&mut self, device: &Path) {
        self.args.block_device = Some(device.display().to_string());
        self.params.rootfs_type = ROOTFS_BLOCK.to_string();
    }

    /// Uses the block device named in the configuration, if the guest can
    /// boot from one. Returns whether it did.
    pub fn use_configured_block(&mut self, config: &UnikernelConfig, unikernel: &dyn Unikernel) -> bool {
        if config.block.is_empty() || !unikernel.supports_block() {
            return false;
        }
        self.set_block(&guest_path(&config.block));
        true
    }

    pub fn has_block(&self) -> bool {
        self.args.block_device.is_some()
    }
}
