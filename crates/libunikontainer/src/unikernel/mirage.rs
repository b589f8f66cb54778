use super::{Result, Unikernel, UnikernelParams};

#[derive(Debug, Default)]
pub struct Mirage {
    command: String,
    address: String,
    gateway: String,
}

impl Unikernel for Mirage {
    fn init(&mut self, params: &UnikernelParams) -> Result<()> {
        if params.has_network() {
            self.address = format!("--ipv4={}/24", params.eth_device_ip);
            self.gateway = format!("--ipv4-gateway={}", params.eth_device_gateway);
        } else {
            self.address.clear();
            self.gateway.clear();
        }
        self.command = params.cmdline.clone();
        Ok(())
    }

    fn command_string(&self) -> Result<String> {
        let parts = [&self.address, &self.gateway, &self.command];
        Ok(parts
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn supports_block(&self) -> bool {
        false
    }

    fn supports_fs(&self, _fs_type: &str) -> bool {
        false
    }

    // solo5 devices of mirage are named after the manifest entries
    fn monitor_net_cli(&self, monitor: &str) -> String {
        match monitor {
            "hvt" | "spt" => "--net:service=".to_string(),
            _ => String::new(),
        }
    }

    fn monitor_block_cli(&self, monitor: &str) -> String {
        match monitor {
            "hvt" | "spt" => "--block:storage=".to_string(),
            _ => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_mirage() -> Result<()> {
        let mut mirage = Mirage::default();
        mirage.init(&UnikernelParams {
            cmdline: "--port=8080".to_string(),
            eth_device_ip: "10.4.0.7".to_string(),
            eth_device_mask: "255.255.255.0".to_string(),
            eth_device_gateway: "10.4.0.1".to_string(),
            ..Default::default()
        })?;
        assert_eq!(
            mirage.command_string()?,
            "--ipv4=10.4.0.7/24 --ipv4-gateway=10.4.0.1 --port=8080"
        );

        mirage.init(&UnikernelParams::default())?;
        assert_eq!(mirage.command_string()?, "");
        assert_eq!(mirage.monitor_net_cli("hvt"), "--net:service=");
        Ok(())
    }
}
