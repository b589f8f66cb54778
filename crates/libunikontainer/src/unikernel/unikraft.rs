use super::{Result, Unikernel, UnikernelParams, ROOTFS_INITRD};

/// First release that understands `netdev.ip=`.
const COMPAT_VERSION: [u64; 3] = [0, 16, 1];
const DEFAULT_APP_NAME: &str = "unikraft";
const NAMESERVER: &str = "8.8.8.8";

#[derive(Debug, Default)]
pub struct Unikraft {
    app_name: String,
    command: String,
    net: Vec<String>,
    vfs_rootfs: String,
}

/// Parses `1.2.3`, `v0.16` and similar into numeric components.
fn parse_version(version: &str) -> Option<Vec<u64>> {
    let version = version.trim().trim_start_matches('v');
    let core = version.split(['-', '+']).next()?;
    core.split('.').map(|part| part.parse().ok()).collect()
}

fn at_least(version: &[u64], target: &[u64]) -> bool {
    let len = version.len().max(target.len());
    let pad = |v: &[u64]| {
        let mut v = v.to_vec();
        v.resize(len, 0);
        v
    };
    pad(version) >= pad(target)
}

impl Unikraft {
    fn configure_net(&mut self, params: &UnikernelParams) {
        self.net.clear();
        if params.eth_device_ip.is_empty() {
            return;
        }

        let current = match parse_version(&params.version) {
            _ if params.version.is_empty() => {
                tracing::warn!("unikraft version is undefined, using the current network options");
                true
            }
            None => {
                tracing::warn!(version = params.version, "failed to parse unikraft version, using the current network options");
                true
            }
            Some(version) => at_least(&version, &COMPAT_VERSION),
        };

        if current {
            self.net.push(format!(
                "netdev.ip={}/24:{}:{NAMESERVER}",
                params.eth_device_ip, params.eth_device_gateway
            ));
        } else {
            self.net.push(format!("netdev.ipv4_addr={}", params.eth_device_ip));
            self.net.push(format!(
                "netdev.ipv4_gw_addr={}",
                params.eth_device_gateway
            ));
            self.net.push(format!(
                "netdev.ipv4_subnet_mask={}",
                params.eth_device_mask
            ));
        }
    }
}

impl Unikernel for Unikraft {
    fn init(&mut self, params: &UnikernelParams) -> Result<()> {
        let cmdline = params.cmdline.trim();
        // the first word names the application when there is more than one
        match cmdline.split_once(' ') {
            Some((app, rest)) => {
                self.app_name = app.to_string();
                self.command = rest.trim_start().to_string();
            }
            None => {
                self.app_name = DEFAULT_APP_NAME.to_string();
                self.command = cmdline.to_string();
            }
        }

        self.vfs_rootfs = if params.rootfs_type == ROOTFS_INITRD {
            format!("vfs.rootfs={ROOTFS_INITRD}")
        } else {
            String::new()
        };

        self.configure_net(params);
        Ok(())
    }

    fn command_string(&self) -> Result<String> {
        let mut parts = vec![self.app_name.as_str()];
        parts.extend(self.net.iter().map(String::as_str));
        if !self.vfs_rootfs.is_empty() {
            parts.push(&self.vfs_rootfs);
        }
        parts.push("--");
        if !self.command.is_empty() {
            parts.push(&self.command);
        }
        Ok(parts.join(" "))
    }

    fn supports_block(&self) -> bool {
        false
    }

    fn supports_fs(&self, _fs_type: &str) -> bool {
        false
    }
}
