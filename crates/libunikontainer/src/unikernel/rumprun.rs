use serde::Serialize;

use super::{Result, Unikernel, UnikernelParams, ROOTFS_BLOCK};
use crate::network::subnet_mask_to_cidr;

/// NetBSD refuses a default gateway that is not directly reachable, so the
/// guest always gets a mask that covers it.
const INCLUSIVE_MASK: &str = "128.0.0.0";
const DEFAULT_MOUNTPOINT: &str = "/data";

/// Rumprun boots from a JSON manifest passed as the command line.
#[derive(Debug, Default, Serialize)]
pub struct Rumprun {
    cmdline: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    net: Option<RumprunNet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blk: Option<RumprunBlk>,
}

#[derive(Debug, Serialize)]
struct RumprunNet {
    #[serde(rename = "if")]
    interface: String,
    cloner: String,
    #[serde(rename = "type")]
    typ: String,
    method: String,
    addr: String,
    mask: String,
    gw: String,
}

#[derive(Debug, Serialize)]
struct RumprunBlk {
    source: String,
    path: String,
    fstype: String,
    mountpoint: String,
}

impl Unikernel for Rumprun {
    fn init(&mut self, params: &UnikernelParams) -> Result<()> {
        self.cmdline = params.cmdline.clone();

        self.net = if params.has_network() {
            Some(RumprunNet {
                interface: "ukvmif0".to_string(),
                cloner: "True".to_string(),
                typ: "inet".to_string(),
                method: "static".to_string(),
                addr: params.eth_device_ip.clone(),
                mask: subnet_mask_to_cidr(INCLUSIVE_MASK)?.to_string(),
                gw: params.eth_device_gateway.clone(),
            })
        } else {
            None
        };

        self.blk = (params.rootfs_type == ROOTFS_BLOCK).then(|| RumprunBlk {
            source: "etfs".to_string(),
            path: "/dev/ld0a".to_string(),
            fstype: "blk".to_string(),
            mountpoint: if params.block_mnt_point.is_empty() {
                DEFAULT_MOUNTPOINT.to_string()
            } else {
                params.block_mnt_point.clone()
            },
        });
        Ok(())
    }

    fn command_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn supports_block(&self) -> bool {
        true
    }

    fn supports_fs(&self, fs_type: &str) -> bool {
        fs_type == "ext2"
    }

    fn monitor_net_cli(&self, monitor: &str) -> String {
        match monitor {
            "hvt" | "spt" => "--net:tap=".to_string(),
            _ => String::new(),
        }
    }

    fn monitor_block_cli(&self, monitor: &str) -> String {
        match monitor {
            "hvt" | "spt" => "--block:rootfs=".to_string(),
            _ => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_rumprun_manifest() -> Result<()> {
        let mut rumprun = Rumprun::default();
        rumprun.init(&UnikernelParams {
            cmdline: "nginx -c /data/conf/nginx.conf".to_string(),
            eth_device_ip: "10.4.0.7".to_string(),
            eth_device_mask: "255.255.255.0".to_string(),
            eth_device_gateway: "10.4.0.1".to_string(),
            rootfs_type: "block".to_string(),
            ..Default::default()
        })?;
        assert_eq!(
            rumprun.command_string()?,
            concat!(
                r#"{"cmdline":"nginx -c /data/conf/nginx.conf","#,
                r#""net":{"if":"ukvmif0","cloner":"True","type":"inet","method":"static","addr":"10.4.0.7","mask":"1","gw":"10.4.0.1"},"#,
                r#""blk":{"source":"etfs","path":"/dev/ld0a","fstype":"blk","mountpoint":"/data"}}"#
            )
        );
        Ok(())
    }

    #[test]
    fn test_rumprun_without_network_or_block() -> Result<()> {
        let mut rumprun = Rumprun::default();
        rumprun.init(&UnikernelParams {
            cmdline: "hello".to_string(),
            ..Default::default()
        })?;
        assert_eq!(rumprun.command_string()?, r#"{"cmdline":"hello"}"#);
        Ok(())
    }

    #[test]
    fn test_rumprun_monitor_cli() {
        let rumprun = Rumprun::default();
        assert_eq!(rumprun.monitor_net_cli("hvt"), "--net:tap=");
        assert_eq!(rumprun.monitor_block_cli("spt"), "--block:rootfs=");
        assert_eq!(rumprun.monitor_net_cli("qemu"), "");
    }
}
