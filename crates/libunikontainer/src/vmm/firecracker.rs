use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::{find_binary, ExecArgs, Result, Vmm, VmmError, VmmKind};
use crate::unikernel::Unikernel;

const FIRECRACKER_BINARY: &str = "firecracker";
/// Written next to the guest kernel.
pub const FC_CONFIG_FILE: &str = "fc.json";

#[derive(Debug, Serialize)]
struct BootSource {
    kernel_image_path: String,
    boot_args: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    initrd_path: Option<String>,
}

#[derive(Debug, Serialize)]
struct MachineConfig {
    vcpu_count: u32,
    mem_size_mib: u64,
    smt: bool,
    track_dirty_pages: bool,
}

#[derive(Debug, Serialize)]
struct Drive {
    drive_id: String,
    is_read_only: bool,
    is_root_device: bool,
    path_on_host: String,
}

#[derive(Debug, Serialize)]
struct NetworkInterface {
    iface_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    guest_mac: Option<String>,
    host_dev_name: String,
}

#[derive(Debug, Serialize)]
struct Config {
    #[serde(rename = "boot-source")]
    boot_source: BootSource,
    #[serde(rename = "machine-config")]
    machine_config: MachineConfig,
    drives: Vec<Drive>,
    #[serde(rename = "network-interfaces")]
    network_interfaces: Vec<NetworkInterface>,
}

pub struct Firecracker {
    path: PathBuf,
}

impl Firecracker {
    pub fn new() -> Result<Self> {
        Ok(Self::with_path(find_binary(FIRECRACKER_BINARY)?))
    }

    pub fn with_path(path: PathBuf) -> Self {
        Firecracker { path }
    }

    /// Location of the configuration for a guest kernel at `unikernel_path`.
    pub fn config_path(unikernel_path: &Path) -> PathBuf {
        unikernel_path
            .parent()
            .unwrap_or(Path::new("/"))
            .join(FC_CONFIG_FILE)
    }

    fn config(args: &ExecArgs) -> Config {
        let mut boot_args = args.command.clone();
        if cfg!(target_arch = "aarch64") {
            boot_args.push_str(" console=ttyS0");
        }

        Config {
            boot_source: BootSource {
                kernel_image_path: args.unikernel_path.display().to_string(),
                boot_args,
                initrd_path: args.initrd_path.as_ref().map(|p| p.display().to_string()),
            },
            machine_config: MachineConfig {
                vcpu_count: 1,
                mem_size_mib: args.mem_size_mb(),
                smt: false,
                track_dirty_pages: false,
            },
            drives: args
                .block_device
                .iter()
                .map(|block| Drive {
                    drive_id: "rootfs".to_string(),
                    is_read_only: false,
                    is_root_device: false,
                    path_on_host: block.clone(),
                })
                .collect(),
            network_interfaces: args
                .tap_device
                .iter()
                .map(|tap| NetworkInterface {
                    iface_id: "net1".to_string(),
                    guest_mac: args.guest_mac.clone(),
                    host_dev_name: tap.clone(),
                })
                .collect(),
        }
    }
}

impl Vmm for Firecracker {
    fn kind(&self) -> VmmKind {
        VmmKind::Firecracker
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn healthcheck(&self) -> Result<()> {
        find_binary(FIRECRACKER_BINARY).map(|_| ())
    }

    fn build_args(&self, args: &ExecArgs, _unikernel: &dyn Unikernel) -> Result<Vec<String>> {
        let mut argv = vec![
            self.path.display().to_string(),
            "--no-api".to_string(),
            "--config-file".to_string(),
            Self::config_path(&args.unikernel_path).display().to_string(),
        ];
        if !args.seccomp {
            argv.push("--no-seccomp".to_string());
        }
        Ok(argv)
    }

    fn prepare(&self, args: &ExecArgs) -> Result<()> {
        let path = Self::config_path(&args.unikernel_path);
        let config = serde_json::to_string(&Self::config(args))?;
        tracing::info!(?path, config, "firecracker configuration");
        fs::write(&path, config).map_err(|err| VmmError::WriteConfig { path, source: err })
    }
}
