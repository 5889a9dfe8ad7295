use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::Node;

use super::{ErrorKind, Result, ResultExt};
use crate::netutil::AddressResolver;
use wmco_definitions::instance::{parse_username, Instance};

/// Parse the BYOH instances ConfigMap and correlate entries with nodes.
///
/// Keys are host addresses (IPv4 or DNS resolving to IPv4), values must be
/// `username=<user>`. Any malformed entry fails the whole parse: a partially
/// applied instances map would silently deconfigure hosts.
pub async fn parse(
    data: &BTreeMap<String, String>,
    nodes: &[Node],
    resolver: &dyn AddressResolver,
) -> Result<Vec<Instance>> {
    let mut instances = Vec::with_capacity(data.len());
    for (address, value) in data {
        let username = parse_username(value)
            .chain_err(|| ErrorKind::InvalidInstanceEntry(address.clone(), value.clone()))?;
        let ipv4 = resolver
            .lookup_ipv4(address)
            .await
            .chain_err(|| ErrorKind::InvalidInstanceEntry(address.clone(), value.clone()))?;
        let mut instance = Instance::new(address.clone(), ipv4, username);
        instance.node = find_node(address, &ipv4.to_string(), nodes, resolver).await;
        instances.push(instance);
    }
    Ok(instances)
}

/// Find the node backing an instance address.
///
/// Direct comparison against `status.addresses` first (raw address and its
/// resolution), then a reverse lookup of each node IP against a DNS address.
async fn find_node(
    address: &str,
    ipv4: &str,
    nodes: &[Node],
    resolver: &dyn AddressResolver,
) -> Option<Node> {
    for node in nodes {
        let addrs = match node.status.as_ref().and_then(|s| s.addresses.as_ref()) {
            Some(a) => a,
            None => continue,
        };
        if addrs.iter().any(|a| a.address == address || a.address == ipv4) {
            return Some(node.clone());
        }
    }
    // the instance may be listed by DNS name while the node only reports IPs
    if address.parse::<IpAddr>().is_ok() {
        return None;
    }
    for node in nodes {
        let addrs = match node.status.as_ref().and_then(|s| s.addresses.as_ref()) {
            Some(a) => a,
            None => continue,
        };
        for a in addrs {
            let node_ip = match a.address.parse() {
                Ok(IpAddr::V4(ip)) => ip,
                _ => continue,
            };
            match resolver.reverse_lookup(node_ip).await {
                Ok(names) => {
                    if names.iter().any(|n| n == address) {
                        return Some(node.clone());
                    }
                }
                Err(e) => debug!("reverse lookup of {} failed: {}", node_ip, e),
            }
        }
    }
    None
}

/// Instances present in the map but backed by no node yet
pub fn pending_configuration<'a>(instances: &'a [Instance]) -> Vec<&'a Instance> {
    instances.iter().filter(|i| i.node.is_none()).collect()
}

/// Nodes carrying the BYOH label with no instance entry behind them
pub fn orphaned_nodes<'a>(instances: &[Instance], byoh_nodes: &'a [Node]) -> Vec<&'a Node> {
    byoh_nodes
        .iter()
        .filter(|n| {
            let name = n.metadata.name.as_deref();
            !instances
                .iter()
                .any(|i| i.node_name().is_some() && i.node_name() == name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netutil::AddressResolver;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{Node, NodeAddress, NodeStatus};
    use maplit::btreemap;
    use std::net::Ipv4Addr;

    struct FakeResolver;

    #[async_trait]
    impl AddressResolver for FakeResolver {
        async fn lookup_ipv4(&self, host: &str) -> Result<Ipv4Addr> {
            if let Ok(ip) = host.parse::<std::net::IpAddr>() {
                return match ip {
                    std::net::IpAddr::V4(v4) => Ok(v4),
                    std::net::IpAddr::V6(_) => bail!("ipv6 address '{}' is not supported", host),
                };
            }
            match host {
                "winhost-5.lan" => Ok(Ipv4Addr::new(10, 0, 0, 5)),
                // NAT'd address that no node reports directly
                "winhost-9.lan" => Ok(Ipv4Addr::new(10, 0, 0, 90)),
                _ => bail!("no A record found for '{}'", host),
            }
        }

        async fn reverse_lookup(&self, ip: Ipv4Addr) -> Result<Vec<String>> {
            if ip == Ipv4Addr::new(10, 0, 0, 9) {
                Ok(vec!["winhost-9.lan".to_string()])
            } else {
                Ok(vec![])
            }
        }
    }

    fn node(name: &str, address: &str) -> Node {
        let mut n = Node::default();
        n.metadata.name = Some(name.into());
        n.status = Some(NodeStatus {
            addresses: Some(vec![NodeAddress {
                type_: "InternalIP".into(),
                address: address.into(),
            }]),
            ..Default::default()
        });
        n
    }

    #[tokio::test]
    async fn direct_ip_match() {
        let data = btreemap! {
            "10.0.0.5".to_string() => "username=Administrator".to_string(),
        };
        let nodes = vec![node("winhost-5", "10.0.0.5")];
        let parsed = parse(&data, &nodes, &FakeResolver).await.unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].username, "Administrator");
        assert_eq!(parsed[0].node_name(), Some("winhost-5"));
    }

    #[tokio::test]
    async fn dns_entry_resolves_and_matches_by_ip() {
        let data = btreemap! {
            "winhost-5.lan".to_string() => "username=core".to_string(),
        };
        let nodes = vec![node("winhost-5", "10.0.0.5")];
        let parsed = parse(&data, &nodes, &FakeResolver).await.unwrap();
        assert_eq!(parsed[0].ipv4, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(parsed[0].node_name(), Some("winhost-5"));
    }

    #[tokio::test]
    async fn dns_entry_matches_by_reverse_lookup() {
        // the entry resolves to a NAT'd address no node reports; the node's
        // own IP has a PTR record naming the instance
        let data = btreemap! {
            "winhost-9.lan".to_string() => "username=core".to_string(),
        };
        let nodes = vec![node("winhost-9", "10.0.0.9")];
        let parsed = parse(&data, &nodes, &FakeResolver).await.unwrap();
        assert_eq!(parsed[0].node_name(), Some("winhost-9"));
    }

    #[tokio::test]
    async fn unmatched_instance_has_no_node() {
        let data = btreemap! {
            "10.0.0.7".to_string() => "username=Administrator".to_string(),
        };
        let nodes = vec![node("winhost-5", "10.0.0.5")];
        let parsed = parse(&data, &nodes, &FakeResolver).await.unwrap();
        assert!(parsed[0].node.is_none());
        assert_eq!(pending_configuration(&parsed).len(), 1);
    }

    #[tokio::test]
    async fn malformed_entry_fails_whole_parse() {
        let data = btreemap! {
            "10.0.0.5".to_string() => "username=Administrator".to_string(),
            "10.0.0.6".to_string() => "Administrator".to_string(),
        };
        assert!(parse(&data, &[], &FakeResolver).await.is_err());
    }

    #[tokio::test]
    async fn ipv6_key_rejected() {
        let data = btreemap! {
            "fd00::5".to_string() => "username=Administrator".to_string(),
        };
        assert!(parse(&data, &[], &FakeResolver).await.is_err());
    }

    #[test]
    fn orphans_are_nodes_without_entries() {
        let nodes = vec![node("winhost-5", "10.0.0.5"), node("winhost-6", "10.0.0.6")];
        let mut i = Instance::new(
            "10.0.0.5".into(),
            Ipv4Addr::new(10, 0, 0, 5),
            "Administrator".into(),
        );
        i.node = Some(nodes[0].clone());
        let orphans = orphaned_nodes(&[i], &nodes);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].metadata.name.as_deref(), Some("winhost-6"));
    }
}
