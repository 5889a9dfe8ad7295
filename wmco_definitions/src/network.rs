use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use super::{ErrorKind, Result};

/// Default VXLAN port of the hybrid overlay when the network operator does
/// not pin one
pub const DEFAULT_VXLAN_PORT: u16 = 4789;

/// Offset into the service network at which the cluster DNS service lives
const CLUSTER_DNS_OFFSET: u32 = 10;

/// Service network and hybrid overlay parameters derived from the cluster
/// network configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkSettings {
    /// First entry of the cluster's service network
    pub service_cidr: Ipv4Net,
    /// VXLAN port used for east-west traffic between Linux and Windows pods
    pub vxlan_port: Option<u16>,
}

impl NetworkSettings {
    /// Validate the first service network entry into settings.
    ///
    /// The entry must be a well formed IPv4 CIDR; the hybrid overlay does not
    /// support IPv6 service networks.
    pub fn new(service_network: &[String], vxlan_port: Option<u16>) -> Result<NetworkSettings> {
        let first = service_network
            .first()
            .ok_or_else(|| ErrorKind::InvalidServiceCidr("<empty service network>".into()))?;
        let service_cidr: Ipv4Net = first
            .parse()
            .map_err(|_| ErrorKind::InvalidServiceCidr(first.clone()))?;
        Ok(NetworkSettings {
            service_cidr,
            vxlan_port,
        })
    }

    /// Cluster DNS address: the tenth host of the service network.
    pub fn cluster_dns(&self) -> Ipv4Addr {
        let base = u32::from(self.service_cidr.network());
        Ipv4Addr::from(base + CLUSTER_DNS_OFFSET)
    }

    /// Port the hybrid overlay is configured with
    pub fn vxlan_port(&self) -> u16 {
        self.vxlan_port.unwrap_or(DEFAULT_VXLAN_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::NetworkSettings;

    #[test]
    fn cluster_dns_is_tenth_host() {
        let s = NetworkSettings::new(&["172.30.0.0/16".to_string()], None).unwrap();
        assert_eq!(s.cluster_dns().to_string(), "172.30.0.10");
        let s = NetworkSettings::new(&["10.3.0.0/24".to_string()], Some(4800)).unwrap();
        assert_eq!(s.cluster_dns().to_string(), "10.3.0.10");
        assert_eq!(s.vxlan_port(), 4800);
    }

    #[test]
    fn first_entry_wins() {
        let s = NetworkSettings::new(
            &["172.30.0.0/16".to_string(), "10.0.0.0/16".to_string()],
            None,
        )
        .unwrap();
        assert_eq!(s.service_cidr.to_string(), "172.30.0.0/16");
        assert_eq!(s.vxlan_port(), 4789);
    }

    #[test]
    fn rejects_bad_cidrs() {
        assert!(NetworkSettings::new(&[], None).is_err());
        assert!(NetworkSettings::new(&["not-a-cidr".to_string()], None).is_err());
        // ipv6 service networks are unsupported
        assert!(NetworkSettings::new(&["fd02::/112".to_string()], None).is_err());
    }
}
