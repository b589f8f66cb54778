use super::{Result, Unikernel, UnikernelParams};
use crate::network::subnet_mask_to_cidr;

const DEFAULT_PREFIX: u8 = 24;

/// Mewz only reads its network configuration from the command line.
#[derive(Debug, Default)]
pub struct Mewz {
    address: String,
    gateway: String,
    prefix: u8,
}

impl Unikernel for Mewz {
    fn init(&mut self, params: &UnikernelParams) -> Result<()> {
        self.prefix = if params.eth_device_mask.is_empty() {
            DEFAULT_PREFIX
        } else {
            subnet_mask_to_cidr(&params.eth_device_mask)?
        };
        self.address = params.eth_device_ip.clone();
        self.gateway = params.eth_device_gateway.clone();
        Ok(())
    }

    fn command_string(&self) -> Result<String> {
        if self.address.is_empty() {
            return Ok(String::new());
        }
        Ok(format!(
            "ip={}/{} gateway={}",
            self.address, self.prefix, self.gateway
        ))
    }

    fn supports_block(&self) -> bool {
        false
    }

    fn supports_fs(&self, _fs_type: &str) -> bool {
        false
    }

    fn monitor_net_cli(&self, monitor: &str) -> String {
        match monitor {
            "qemu" => concat!(
                "-device virtio-net-pci,netdev=net0,disable-legacy=on,disable-modern=off ",
                "-netdev tap,script=no,downscript=no,id=net0,ifname="
            )
            .to_string(),
            _ => String::new(),
        }
    }

    fn monitor_cli(&self, monitor: &str) -> String {
        match monitor {
            "qemu" => "-no-reboot -device isa-debug-exit,iobase=0x501,iosize=2".to_string(),
            _ => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_mewz() -> Result<()> {
        let mut mewz = Mewz::default();
        mewz.init(&UnikernelParams {
            eth_device_ip: "10.4.0.7".to_string(),
            eth_device_mask: "255.255.0.0".to_string(),
            eth_device_gateway: "10.4.0.1".to_string(),
            ..Default::default()
        })?;
        assert_eq!(mewz.command_string()?, "ip=10.4.0.7/16 gateway=10.4.0.1");
        assert!(mewz.monitor_net_cli("qemu").ends_with("ifname="));
        assert_eq!(mewz.monitor_cli("hvt"), "");
        Ok(())
    }

    #[test]
    fn test_mewz_bad_mask() {
        let mut mewz = Mewz::default();
        let err = mewz
            .init(&UnikernelParams {
                eth_device_ip: "10.4.0.7".to_string(),
                eth_device_mask: "255.0.255.0".to_string(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, super::super::UnikernelError::Mask(_)));
    }
}
