//! Host interface addresses via getifaddrs(3)

use sockwatch_core::AddressSource;
use std::net::IpAddr;

#[derive(Debug, Default, Clone, Copy)]
pub struct IfAddrSource;

impl AddressSource for IfAddrSource {
    fn local_addresses(&self) -> std::io::Result<Vec<IpAddr>> {
        let addrs = nix::ifaddrs::getifaddrs().map_err(std::io::Error::from)?;

        let mut out = Vec::new();
        for ifa in addrs {
            let Some(address) = ifa.address else {
                continue;
            };
            if let Some(v4) = address.as_sockaddr_in() {
                out.push(IpAddr::V4(v4.ip()));
            } else if let Some(v6) = address.as_sockaddr_in6() {
                out.push(IpAddr::V6(v6.ip()));
            }
        }
        Ok(out)
    }
}
