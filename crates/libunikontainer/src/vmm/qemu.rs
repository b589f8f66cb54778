use std::path::{Path, PathBuf};

use super::{cli_with_value, find_binary, ExecArgs, Result, Vmm, VmmKind};
use crate::unikernel::Unikernel;

const QEMU_BINARY_PREFIX: &str = "qemu-system-";
const DEFAULT_NET_CLI: &str = "-net nic,model=virtio -net tap,script=no,ifname=";
const DEFAULT_BLOCK_CLI: &str = "-drive format=raw,if=virtio,file=";
const SANDBOX: &str = "on,obsolete=deny,elevateprivileges=deny,spawn=deny,resourcecontrol=deny";

fn binary_name() -> String {
    format!("{QEMU_BINARY_PREFIX}{}", std::env::consts::ARCH)
}

pub struct Qemu {
    path: PathBuf,
}

impl Qemu {
    pub fn new() -> Result<Self> {
        Ok(Self::with_path(find_binary(&binary_name())?))
    }

    pub fn with_path(path: PathBuf) -> Self {
        Qemu { path }
    }
}

impl Vmm for Qemu {
    fn kind(&self) -> VmmKind {
        VmmKind::Qemu
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn healthcheck(&self) -> Result<()> {
        find_binary(&binary_name()).map(|_| ())
    }

    fn build_args(&self, args: &ExecArgs, unikernel: &dyn Unikernel) -> Result<Vec<String>> {
        let monitor = VmmKind::Qemu.as_str();
        let mut argv: Vec<String> = vec![self.path.display().to_string()];
        argv.extend(
            ["-cpu", "host", "-m"]
                .iter()
                .map(|s| s.to_string())
                .chain([args.mem_size_mb().to_string()])
                .chain(
                    ["-enable-kvm", "-nographic", "-vga", "none"]
                        .iter()
                        .map(|s| s.to_string()),
                ),
        );

        if args.seccomp {
            argv.push("--sandbox".to_string());
            argv.push(SANDBOX.to_string());
        }
        if cfg!(target_arch = "aarch64") {
            argv.push("-M".to_string());
            argv.push("virt".to_string());
        }

        argv.push("-kernel".to_string());
        argv.push(args.unikernel_path.display().to_string());

        if let Some(tap) = &args.tap_device {
            let cli = unikernel.monitor_net_cli(monitor);
            let cli = if cli.is_empty() { DEFAULT_NET_CLI.to_string() } else { cli };
            argv.extend(cli_with_value(&cli, tap));
        }
        if let Some(block) = &args.block_device {
            let cli = unikernel.monitor_block_cli(monitor);
            let cli = if cli.is_empty() { DEFAULT_BLOCK_CLI.to_string() } else { cli };
            argv.extend(cli_with_value(&cli, block));
        }
        argv.extend(cli_with_value(&unikernel.monitor_cli(monitor), ""));

        if let Some(initrd) = &args.initrd_path {
            argv.push("-initrd".to_string());
            argv.push(initrd.display().to_string());
        }
        argv.push("-append".to_string());
        argv.push(args.command.clone());
        Ok(argv)
    }
}
