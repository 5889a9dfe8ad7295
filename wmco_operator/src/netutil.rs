use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;

use super::Result;

/// Forward and reverse DNS as the instance parser and CSR approver need it.
///
/// Behind a trait so tests can run without a resolver; the operator always
/// uses [`DnsResolver`].
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Resolve a host (IPv4 literal or DNS name) to an IPv4 address.
    ///
    /// IPv6 literals and names without an A record are errors.
    async fn lookup_ipv4(&self, host: &str) -> Result<Ipv4Addr>;

    /// PTR names for an address, without the trailing dot
    async fn reverse_lookup(&self, ip: Ipv4Addr) -> Result<Vec<String>>;
}

/// System-configured resolver
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
}

impl DnsResolver {
    pub fn from_system() -> Result<DnsResolver> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(DnsResolver { resolver })
    }
}

#[async_trait]
impl AddressResolver for DnsResolver {
    async fn lookup_ipv4(&self, host: &str) -> Result<Ipv4Addr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return match ip {
                IpAddr::V4(v4) => Ok(v4),
                IpAddr::V6(_) => bail!("ipv6 address '{}' is not supported", host),
            };
        }
        let response = self.resolver.ipv4_lookup(host).await?;
        match response.iter().next() {
            Some(a) => Ok(a.0),
            None => bail!("no A record found for '{}'", host),
        }
    }

    async fn reverse_lookup(&self, ip: Ipv4Addr) -> Result<Vec<String>> {
        let response = self.resolver.reverse_lookup(IpAddr::V4(ip)).await?;
        Ok(response
            .iter()
            .map(|ptr| ptr.to_string().trim_end_matches('.').to_string())
            .collect())
    }
}

/// Strip a DNS name down to its first label
pub fn host_label(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::host_label;

    #[test]
    fn host_labels() {
        assert_eq!(host_label("winhost-5.lan"), "winhost-5");
        assert_eq!(host_label("winhost-5"), "winhost-5");
        assert_eq!(host_label(""), "");
    }
}
