use std::net::Ipv4Addr;

use k8s_openapi::api::core::v1::Node;
use regex::Regex;

use super::Result;
use crate::constants::{PUB_KEY_HASH_ANNOTATION, VERSION_ANNOTATION};

/// Parse the value side of an instances ConfigMap entry.
///
/// The only accepted form is `username=<non-empty string>`.
pub fn parse_username(value: &str) -> Result<String> {
    let re = Regex::new(r"^username=(\S+)$").unwrap();
    match re.captures(value).and_then(|c| c.get(1)) {
        Some(m) => Ok(m.as_str().to_string()),
        None => bail!("value must be of the form username=<user>"),
    }
}

/// Annotation getter tolerant of absent metadata maps
pub fn node_annotation<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Label getter tolerant of absent metadata maps
pub fn node_label<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

/// A Windows host under management.
///
/// Machine backed instances are resolved from the Machine's internal address;
/// BYOH instances come from the `windows-instances` ConfigMap. Either way the
/// address has already been validated to resolve to IPv4 by the time an
/// `Instance` exists.
#[derive(Clone, Debug)]
pub struct Instance {
    /// Address as given (IPv4 literal or DNS name)
    pub address: String,
    /// Cached IPv4 resolution of `address`
    pub ipv4: Ipv4Addr,
    /// Username to authenticate with
    pub username: String,
    /// When set, the host must be renamed to this before bootstrapping
    pub new_hostname: Option<String>,
    /// Whether the kubelet needs `--node-ip` pinned to `ipv4`
    pub set_node_ip: bool,
    /// Backing node object, when one was correlated
    pub node: Option<Node>,
}

impl Instance {
    pub fn new(address: String, ipv4: Ipv4Addr, username: String) -> Instance {
        Instance {
            address,
            ipv4,
            username,
            new_hostname: None,
            set_node_ip: false,
            node: None,
        }
    }

    /// Name of the backing node, if any
    pub fn node_name(&self) -> Option<&str> {
        self.node
            .as_ref()
            .and_then(|n| n.metadata.name.as_deref())
    }

    /// Version annotation on the backing node, if any
    pub fn node_version(&self) -> Option<&str> {
        self.node
            .as_ref()
            .and_then(|n| node_annotation(n, VERSION_ANNOTATION))
    }

    /// Public key hash annotation on the backing node, if any
    pub fn node_pubkey_hash(&self) -> Option<&str> {
        self.node
            .as_ref()
            .and_then(|n| node_annotation(n, PUB_KEY_HASH_ANNOTATION))
    }

    /// An instance is up to date iff it has a node whose version annotation
    /// equals the operator's build version.
    pub fn up_to_date(&self, operator_version: &str) -> bool {
        self.node_version() == Some(operator_version)
    }

    /// An instance requires an upgrade iff it has a node carrying a version
    /// annotation that differs from the operator's build version.
    pub fn upgrade_required(&self, operator_version: &str) -> bool {
        match self.node_version() {
            Some(v) => v != operator_version,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Instance;
    use crate::constants::VERSION_ANNOTATION;
    use k8s_openapi::api::core::v1::Node;
    use maplit::btreemap;

    fn node_with_version(version: Option<&str>) -> Node {
        let mut n = Node::default();
        n.metadata.name = Some("winhost-5".into());
        if let Some(v) = version {
            n.metadata.annotations = Some(btreemap! {
                VERSION_ANNOTATION.to_string() => v.to_string(),
            });
        }
        n
    }

    fn instance() -> Instance {
        Instance::new(
            "10.0.0.5".into(),
            "10.0.0.5".parse().unwrap(),
            "Administrator".into(),
        )
    }

    #[test]
    fn no_node_is_neither_current_nor_upgradeable() {
        let i = instance();
        assert!(!i.up_to_date("8.1.0"));
        assert!(!i.upgrade_required("8.1.0"));
    }

    #[test]
    fn matching_version_is_up_to_date() {
        let mut i = instance();
        i.node = Some(node_with_version(Some("8.1.0")));
        assert!(i.up_to_date("8.1.0"));
        assert!(!i.upgrade_required("8.1.0"));
    }

    #[test]
    fn differing_version_requires_upgrade() {
        let mut i = instance();
        i.node = Some(node_with_version(Some("8.0.2")));
        assert!(!i.up_to_date("8.1.0"));
        assert!(i.upgrade_required("8.1.0"));
    }

    #[test]
    fn unannotated_node_is_not_an_upgrade() {
        let mut i = instance();
        i.node = Some(node_with_version(None));
        assert!(!i.up_to_date("8.1.0"));
        assert!(!i.upgrade_required("8.1.0"));
    }

    #[test]
    fn username_values() {
        use super::parse_username;
        assert_eq!(parse_username("username=Administrator").unwrap(), "Administrator");
        assert_eq!(parse_username("username=core").unwrap(), "core");
        assert!(parse_username("username=").is_err());
        assert!(parse_username("user=Administrator").is_err());
        assert!(parse_username("Administrator").is_err());
        assert!(parse_username("username=two words").is_err());
    }
}
