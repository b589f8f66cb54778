//! Network provider backed by the kernel: tun ioctls for the TAP device,
//! SIOCSIF* ioctls for addressing and the `tc`/`iptables` tools for traffic
//! control and NAT.
use std::any::Any;
use std::fs::{self, File, OpenOptions};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Command;

use nix::errno::Errno;
use nix::ifaddrs::getifaddrs;
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use nix::unistd::{Gid, Uid};

use super::provider::{InterfaceInfo, NetworkProvider};
use super::{prefix_to_mask, NetworkError, Result};

const TUN_DEVICE: &str = "/dev/net/tun";
const SYS_CLASS_NET: &str = "/sys/class/net";
const PROC_NET_ROUTE: &str = "/proc/net/route";
const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";
const INGRESS_PARENT: &str = "ffff:";

nix::ioctl_write_ptr_bad!(
    tunsetiff,
    nix::request_code_write!(b'T', 202, std::mem::size_of::<libc::c_int>()),
    libc::ifreq
);
nix::ioctl_write_int!(tunsetpersist, b'T', 203);
nix::ioctl_write_int!(tunsetowner, b'T', 204);
nix::ioctl_write_int!(tunsetgroup, b'T', 206);

#[derive(Clone, Copy)]
pub struct LinuxNetwork;

impl LinuxNetwork {
    fn ifreq(name: &str) -> Result<libc::ifreq> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ || bytes.contains(&0) {
            return Err(NetworkError::InvalidName(name.to_string()));
        }
        // SAFETY: ifreq is plain old data, all zeroes is a valid value
        let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in req.ifr_name.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        Ok(req)
    }

    fn control_socket() -> Result<OwnedFd> {
        Ok(socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?)
    }

    fn ioctl(
        fd: &OwnedFd,
        op: &'static str,
        request: libc::c_ulong,
        name: &str,
        req: &mut libc::ifreq,
    ) -> Result<()> {
        // SAFETY: req is a valid ifreq for the lifetime of the call
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, req as *mut libc::ifreq) };
        Errno::result(ret).map_err(|errno| NetworkError::Ioctl {
            op,
            name: name.to_string(),
            errno,
        })?;
        Ok(())
    }

    fn open_tap(name: &str) -> Result<File> {
        let tun = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEVICE)
            .map_err(|err| NetworkError::Read {
                path: TUN_DEVICE.to_string(),
                source: err,
            })?;
        let mut req = Self::ifreq(name)?;
        req.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI | libc::IFF_VNET_HDR) as libc::c_short;
        // SAFETY: tun is an open tun device and req outlives the call
        unsafe { tunsetiff(tun.as_raw_fd(), &req) }.map_err(|errno| NetworkError::Ioctl {
            op: "TUNSETIFF",
            name: name.to_string(),
            errno,
        })?;
        Ok(tun)
    }

    fn read_sys(name: &str, attr: &str) -> Result<String> {
        let path = format!("{SYS_CLASS_NET}/{name}/{attr}");
        fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(|err| NetworkError::Read { path, source: err })
    }

    fn default_gateway(name: &str) -> Result<String> {
        let routes = fs::read_to_string(PROC_NET_ROUTE).map_err(|err| NetworkError::Read {
            path: PROC_NET_ROUTE.to_string(),
            source: err,
        })?;
        parse_default_gateway(&routes, name).map(|gw| gw.to_string())
    }
}

fn sockaddr(addr: Ipv4Addr) -> libc::sockaddr {
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from(addr).to_be(),
        },
        sin_zero: [0; 8],
    };
    // SAFETY: sockaddr_in and sockaddr have the same size
    unsafe { std::mem::transmute::<libc::sockaddr_in, libc::sockaddr>(sin) }
}

/// Finds the gateway of the default route through `name`. Addresses in
/// /proc/net/route are hex in host byte order.
fn parse_default_gateway(routes: &str, name: &str) -> Result<Ipv4Addr> {
    for line in routes.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[0] != name || fields[1] != "00000000" {
            continue;
        }
        let raw = u32::from_str_radix(fields[2], 16).map_err(|_| NetworkError::Parse {
            what: "gateway",
            value: fields[2].to_string(),
        })?;
        return Ok(Ipv4Addr::from(raw.to_le_bytes()));
    }
    Err(NetworkError::Parse {
        what: "default route",
        value: name.to_string(),
    })
}

fn run(program: &str, args: &[&str]) -> Result<String> {
    let command = format!("{program} {}", args.join(" "));
    tracing::debug!(command, "running");
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|err| NetworkError::Command {
            command: command.clone(),
            source: err,
        })?;
    if !output.status.success() {
        return Err(NetworkError::CommandFailed {
            command,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl NetworkProvider for LinuxNetwork {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn interfaces(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(SYS_CLASS_NET).map_err(|err| NetworkError::Read {
            path: SYS_CLASS_NET.to_string(),
            source: err,
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| NetworkError::Read {
                path: SYS_CLASS_NET.to_string(),
                source: err,
            })?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn interface_info(&self, name: &str) -> Result<InterfaceInfo> {
        let (ip, mask) = getifaddrs()?
            .filter(|ifa| ifa.interface_name == name)
            .find_map(|ifa| {
                let addr = ifa.address.as_ref()?.as_sockaddr_in().copied()?;
                let mask = ifa
                    .netmask
                    .as_ref()
                    .and_then(|m| m.as_sockaddr_in().copied())
                    .map(|m| *SocketAddrV4::from(m).ip())
                    .unwrap_or_else(|| prefix_to_mask(32));
                Some((*SocketAddrV4::from(addr).ip(), mask))
            })
            .ok_or_else(|| NetworkError::NoAddress(name.to_string()))?;

        Ok(InterfaceInfo {
            interface: name.to_string(),
            ip: ip.to_string(),
            default_gateway: Self::default_gateway(name)?,
            mask: mask.to_string(),
            mac: self.mac(name)?,
        })
    }

    fn mac(&self, name: &str) -> Result<String> {
        Self::read_sys(name, "address")
    }

    fn mtu(&self, name: &str) -> Result<u32> {
        let value = Self::read_sys(name, "mtu")?;
        value.parse().map_err(|_| NetworkError::Parse {
            what: "mtu",
            value,
        })
    }

    fn create_tap(&self, name: &str, owner: Uid, group: Gid) -> Result<()> {
        let tun = Self::open_tap(name)?;
        let fd = tun.as_raw_fd();
        let ioctl_err = |op: &'static str| {
            move |errno: Errno| NetworkError::Ioctl {
                op,
                name: name.to_string(),
                errno,
            }
        };
        // SAFETY: fd is an attached tun device
        unsafe {
            tunsetowner(fd, owner.as_raw() as _).map_err(ioctl_err("TUNSETOWNER"))?;
            tunsetgroup(fd, group.as_raw() as _).map_err(ioctl_err("TUNSETGROUP"))?;
            tunsetpersist(fd, 1).map_err(ioctl_err("TUNSETPERSIST"))?;
        }
        tracing::debug!(name, %owner, %group, "created tap device");
        Ok(())
    }

    fn delete_tap(&self, name: &str) -> Result<()> {
        let tun = Self::open_tap(name)?;
        // SAFETY: tun is attached to the device being removed
        unsafe { tunsetpersist(tun.as_raw_fd(), 0) }.map_err(|errno| NetworkError::Ioctl {
            op: "TUNSETPERSIST",
            name: name.to_string(),
            errno,
        })?;
        Ok(())
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> Result<()> {
        let sock = Self::control_socket()?;
        let mut req = Self::ifreq(name)?;
        req.ifr_ifru.ifru_mtu = mtu as libc::c_int;
        Self::ioctl(&sock, "SIOCSIFMTU", libc::SIOCSIFMTU as _, name, &mut req)
    }

    fn set_address(&self, name: &str, addr: Ipv4Addr, prefix: u8) -> Result<()> {
        let sock = Self::control_socket()?;
        let mut req = Self::ifreq(name)?;
        req.ifr_ifru.ifru_addr = sockaddr(addr);
        Self::ioctl(&sock, "SIOCSIFADDR", libc::SIOCSIFADDR as _, name, &mut req)?;

        let mut req = Self::ifreq(name)?;
        req.ifr_ifru.ifru_netmask = sockaddr(prefix_to_mask(prefix));
        Self::ioctl(&sock, "SIOCSIFNETMASK", libc::SIOCSIFNETMASK as _, name, &mut req)
    }

    fn set_link_up(&self, name: &str, up: bool) -> Result<()> {
        let sock = Self::control_socket()?;
        let mut req = Self::ifreq(name)?;
        Self::ioctl(&sock, "SIOCGIFFLAGS", libc::SIOCGIFFLAGS as _, name, &mut req)?;
        let flags = (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        // SAFETY: SIOCGIFFLAGS filled the flags member
        unsafe {
            if up {
                req.ifr_ifru.ifru_flags |= flags;
            } else {
                req.ifr_ifru.ifru_flags &= !flags;
            }
        }
        Self::ioctl(&sock, "SIOCSIFFLAGS", libc::SIOCSIFFLAGS as _, name, &mut req)
    }

    fn add_ingress_qdisc(&self, name: &str) -> Result<()> {
        run("tc", &["qdisc", "add", "dev", name, "ingress"]).map(|_| ())
    }

    fn delete_ingress_qdisc(&self, name: &str) -> Result<()> {
        let qdiscs = run("tc", &["qdisc", "show", "dev", name])?;
        if qdiscs.lines().any(|line| line.contains("ingress")) {
            run("tc", &["qdisc", "del", "dev", name, "ingress"])?;
        }
        Ok(())
    }

    fn add_redirect_filter(&self, from: &str, to: &str) -> Result<()> {
        run(
            "tc",
            &[
                "filter", "add", "dev", from, "parent", INGRESS_PARENT, "protocol", "all", "u32",
                "match", "u32", "0", "0", "action", "mirred", "egress", "redirect", "dev", to,
            ],
        )
        .map(|_| ())
    }

    fn delete_filters(&self, name: &str) -> Result<()> {
        let qdiscs = run("tc", &["qdisc", "show", "dev", name])?;
        if !qdiscs.lines().any(|line| line.contains("ingress")) {
            return Ok(());
        }
        let filters = run("tc", &["filter", "show", "dev", name, "parent", INGRESS_PARENT])?;
        if !filters.trim().is_empty() {
            run("tc", &["filter", "del", "dev", name, "parent", INGRESS_PARENT])?;
        }
        Ok(())
    }

    fn enable_ip_forwarding(&self) -> Result<()> {
        fs::write(IP_FORWARD, "1").map_err(|err| NetworkError::Write {
            path: IP_FORWARD.to_string(),
            source: err,
        })
    }

    fn add_masquerade(&self, source: &str, out_interface: &str) -> Result<()> {
        run(
            "iptables",
            &[
                "-t",
                "nat",
                "-A",
                "POSTROUTING",
                "-s",
                source,
                "-o",
                out_interface,
                "-j",
                "MASQUERADE",
                "--wait",
                "1",
            ],
        )
        .map(|_| ())
    }
}
