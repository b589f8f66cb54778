//! Solo5 tenders. `spt` runs the guest as a seccomp sandboxed process, `hvt`
//! on top of KVM.
use std::path::{Path, PathBuf};

use super::{cli_with_value, find_binary, ExecArgs, Result, Vmm, VmmError, VmmKind};
use crate::unikernel::Unikernel;

const SPT_BINARY: &str = "solo5-spt";
const HVT_BINARY: &str = "solo5-hvt";
/// Device names solo5 uses when the guest does not ask for others.
const DEFAULT_NET_CLI: &str = "--net:service=";
const DEFAULT_BLOCK_CLI: &str = "--block:storage=";
const SPT_NET_CLI: &str = "--net:tap=";
const SPT_BLOCK_CLI: &str = "--block:rootfs=";

fn or_default(cli: String, default: &str) -> String {
    if cli.is_empty() {
        default.to_string()
    } else {
        cli
    }
}

struct Tender {
    kind: VmmKind,
    path: PathBuf,
    net_cli: &'static str,
    block_cli: &'static str,
}

impl Tender {
    fn build_args(&self, args: &ExecArgs, unikernel: &dyn Unikernel) -> Vec<String> {
        let monitor = self.kind.as_str();
        let mut argv = vec![
            self.path.display().to_string(),
            format!("--mem={}", args.mem_size_mb()),
        ];
        if let Some(tap) = &args.tap_device {
            let cli = or_default(unikernel.monitor_net_cli(monitor), self.net_cli);
            argv.extend(cli_with_value(&cli, tap));
        }
        if let Some(block) = &args.block_device {
            let cli = or_default(unikernel.monitor_block_cli(monitor), self.block_cli);
            argv.extend(cli_with_value(&cli, block));
        }
        argv.extend(cli_with_value(&unikernel.monitor_cli(monitor), ""));
        argv.push(args.unikernel_path.display().to_string());
        if !args.command.is_empty() {
            argv.push(args.command.clone());
        }
        argv
    }
}

pub struct Spt {
    tender: Tender,
}

impl Spt {
    pub fn new() -> Result<Self> {
        Ok(Self::with_path(find_binary(SPT_BINARY)?))
    }

    pub fn with_path(path: PathBuf) -> Self {
        Spt {
            tender: Tender {
                kind: VmmKind::Spt,
                path,
                net_cli: SPT_NET_CLI,
                block_cli: SPT_BLOCK_CLI,
            },
        }
    }
}

impl Vmm for Spt {
    fn kind(&self) -> VmmKind {
        VmmKind::Spt
    }

    fn path(&self) -> &Path {
        &self.tender.path
    }

    fn healthcheck(&self) -> Result<()> {
        find_binary(SPT_BINARY).map(|_| ())
    }

    fn build_args(&self, args: &ExecArgs, unikernel: &dyn Unikernel) -> Result<Vec<String>> {
        Ok(self.tender.build_args(args, unikernel))
    }
}

pub struct Hvt {
    tender: Tender,
}

impl Hvt {
    pub fn new() -> Result<Self> {
        Ok(Self::with_path(find_binary(HVT_BINARY)?))
    }

    pub fn with_path(path: PathBuf) -> Self {
        Hvt {
            tender: Tender {
                kind: VmmKind::Hvt,
                path,
                net_cli: DEFAULT_NET_CLI,
                block_cli: DEFAULT_BLOCK_CLI,
            },
        }
    }
}

impl Vmm for Hvt {
    fn kind(&self) -> VmmKind {
        VmmKind::Hvt
    }

    fn path(&self) -> &Path {
        &self.tender.path
    }

    fn healthcheck(&self) -> Result<()> {
        find_binary(HVT_BINARY).map(|_| ())
    }

    fn build_args(&self, args: &ExecArgs, unikernel: &dyn Unikernel) -> Result<Vec<String>> {
        Ok(self.tender.build_args(args, unikernel))
    }

    // The tender and everything it could exec can never gain privileges.
    fn prepare(&self, args: &ExecArgs) -> Result<()> {
        if args.seccomp {
            nix::sys::prctl::set_no_new_privs().map_err(VmmError::NoNewPrivs)?;
            tracing::info!("no_new_privs set for the hvt tender");
        }
        Ok(())
    }
}
