use super::{Result, Unikernel, UnikernelParams, ROOTFS_BLOCK};

const BASE_CMDLINE: &str = "panic=-1 console=ttyS0 loglevel=15 nokaslr";
const ROOT_BLOCK: &str = "root=/dev/vda rw";

/// A regular Linux kernel booted directly by the monitor.
#[derive(Debug, Default)]
pub struct Linux {
    root: String,
    ip: String,
    init: String,
}

impl Unikernel for Linux {
    fn init(&mut self, params: &UnikernelParams) -> Result<()> {
        self.root = if params.rootfs_type == ROOTFS_BLOCK {
            ROOT_BLOCK.to_string()
        } else {
            String::new()
        };

        // kernel level autoconfiguration, see Documentation/admin-guide/nfs/nfsroot.rst
        self.ip = if params.has_network() {
            format!(
                "ip={}::{}:{}:urunc:eth0:off",
                params.eth_device_ip, params.eth_device_gateway, params.eth_device_mask
            )
        } else {
            String::new()
        };

        let cmdline = params.cmdline.trim();
        self.init = match cmdline.split_once(' ') {
            Some((init, args)) => format!("init={init} -- {}", args.trim_start()),
            None if !cmdline.is_empty() => format!("init={cmdline}"),
            None => String::new(),
        };
        Ok(())
    }

    fn command_string(&self) -> Result<String> {
        let parts = [BASE_CMDLINE, &self.root, &self.ip, &self.init];
        Ok(parts
            .iter()
            .filter(|p| !p.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn supports_block(&self) -> bool {
        true
    }

    fn supports_fs(&self, _fs_type: &str) -> bool {
        true
    }
}
