use super::{ErrorKind, Result};

/// Infrastructure platform the cluster runs on.
///
/// Closed set; behavior differences are tabled on this enum rather than
/// dispatched dynamically. `None` covers clusters installed with
/// platform-agnostic infrastructure (user provisioned).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum Platform {
    Aws,
    Azure,
    Gcp,
    VSphere,
    BareMetal,
    Nutanix,
    None,
}

impl Platform {
    /// Parse the `platformStatus.type` field of the infrastructure object
    pub fn from_infrastructure(platform_type: &str) -> Result<Platform> {
        let p = match platform_type {
            "AWS" => Platform::Aws,
            "Azure" => Platform::Azure,
            "GCP" => Platform::Gcp,
            "VSphere" => Platform::VSphere,
            "BareMetal" => Platform::BareMetal,
            "Nutanix" => Platform::Nutanix,
            "None" => Platform::None,
            "" => bail!("infrastructure status does not declare a platform type"),
            other => bail!(ErrorKind::UnsupportedPlatform(other.to_string())),
        };
        Ok(p)
    }

    /// Whether the kubelet must be told its node IP explicitly.
    ///
    /// On these platforms instances can have multiple NICs and the kubelet's
    /// own interface selection picks the wrong one.
    pub fn needs_node_ip(&self) -> bool {
        match self {
            Platform::VSphere | Platform::BareMetal | Platform::Nutanix | Platform::None => true,
            Platform::Aws | Platform::Azure | Platform::Gcp => false,
        }
    }

    /// Administrator account cloud images are provisioned with
    pub fn default_username(&self) -> &'static str {
        match self {
            Platform::Azure => "capi",
            _ => "Administrator",
        }
    }

    /// Whether the platform has an external cloud provider integration
    pub fn has_cloud_provider(&self) -> bool {
        match self {
            Platform::Aws | Platform::Azure | Platform::Gcp | Platform::VSphere => true,
            Platform::BareMetal | Platform::Nutanix | Platform::None => false,
        }
    }

    /// kubelet `--cloud-provider` argument value, when one applies
    pub fn cloud_provider_arg(&self, ccm_owned: bool) -> Option<&'static str> {
        if !self.has_cloud_provider() {
            return None;
        }
        if ccm_owned {
            Some("external")
        } else {
            match self {
                Platform::Aws => Some("aws"),
                Platform::Azure => Some("azure"),
                Platform::Gcp => Some("gce"),
                Platform::VSphere => Some("vsphere"),
                _ => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Platform;

    #[test]
    fn recognised_platforms_parse() {
        assert_eq!(Platform::from_infrastructure("AWS").unwrap(), Platform::Aws);
        assert_eq!(Platform::from_infrastructure("None").unwrap(), Platform::None);
        assert!(Platform::from_infrastructure("").is_err());
        assert!(Platform::from_infrastructure("DigitalOcean").is_err());
    }

    #[test]
    fn node_ip_tabling() {
        assert!(Platform::VSphere.needs_node_ip());
        assert!(Platform::None.needs_node_ip());
        assert!(!Platform::Aws.needs_node_ip());
    }

    #[test]
    fn cloud_provider_args() {
        assert_eq!(Platform::Aws.cloud_provider_arg(true), Some("external"));
        assert_eq!(Platform::Aws.cloud_provider_arg(false), Some("aws"));
        assert_eq!(Platform::BareMetal.cloud_provider_arg(true), None);
    }
}
