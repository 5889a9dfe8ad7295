//! Kubelet and daemon CSR validation.
//!
//! BYOH hosts have no Machine object, so their kubelet bootstrap and serving
//! CSRs arrive with nothing vouching for them. This module decides whether a
//! pending CSR belongs to one of our instances and whether its contents match
//! what a kubelet of that identity is allowed to ask for.

use std::collections::BTreeSet;
use std::convert::TryInto;
use std::net::IpAddr;

use chrono::Utc;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Patch, PatchParams},
    Api, Client,
};
use regex::Regex;
use x509_parser::{
    certification_request::X509CertificationRequest,
    extensions::{GeneralName, ParsedExtension},
    pem::parse_x509_pem,
    prelude::FromDer,
};

use super::{ErrorKind, Result};
use crate::netutil::{host_label, AddressResolver};
use crate::windows::Connector;
use wmco_definitions::constants::{
    AUTHENTICATED_GROUP, DAEMON_SUBJECT_PREFIX, NODES_GROUP, NODE_USER_PREFIX,
};
use wmco_definitions::instance::Instance;

/// Reason recorded on the Approved condition
pub const APPROVE_REASON: &str = "WMCOApprove";

/// Subject contents of a parsed certificate request.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub cn: String,
    pub organizations: Vec<String>,
    pub dns_sans: Vec<String>,
    pub ip_sans: Vec<IpAddr>,
}

impl ParsedRequest {
    pub fn has_sans(&self) -> bool {
        !self.dns_sans.is_empty() || !self.ip_sans.is_empty()
    }

    /// Node name encoded in the CN, when this is a kubelet identity
    pub fn node_name(&self) -> Option<&str> {
        self.cn.strip_prefix(NODE_USER_PREFIX)
    }
}

/// Parse a PEM encoded certificate request.
pub fn parse_request(pem_bytes: &[u8]) -> Result<ParsedRequest> {
    let (_, pem) = parse_x509_pem(pem_bytes)
        .map_err(|e| ErrorKind::InvalidCsr(format!("not valid PEM: {}", e)))?;
    if pem.label != "CERTIFICATE REQUEST" && pem.label != "NEW CERTIFICATE REQUEST" {
        bail!(ErrorKind::InvalidCsr(format!(
            "unexpected PEM block '{}'",
            pem.label
        )));
    }
    let (_, req) = X509CertificationRequest::from_der(&pem.contents)
        .map_err(|e| ErrorKind::InvalidCsr(format!("not a certificate request: {}", e)))?;

    let subject = &req.certification_request_info.subject;
    let cn = subject
        .iter_common_name()
        .next()
        .and_then(|a| a.as_str().ok())
        .unwrap_or_default()
        .to_string();
    let organizations = subject
        .iter_organization()
        .filter_map(|a| a.as_str().ok())
        .map(str::to_string)
        .collect();

    let mut dns_sans = vec![];
    let mut ip_sans = vec![];
    if let Some(extensions) = req.requested_extensions() {
        for ext in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(d) => dns_sans.push(d.to_string()),
                        GeneralName::IPAddress(bytes) => match bytes.len() {
                            4 => {
                                let arr: [u8; 4] = (*bytes).try_into().unwrap();
                                ip_sans.push(IpAddr::from(arr));
                            }
                            16 => {
                                let arr: [u8; 16] = (*bytes).try_into().unwrap();
                                ip_sans.push(IpAddr::from(arr));
                            }
                            _ => {}
                        },
                        // rfc822/URI entries are never present on kubelet CSRs
                        _ => {}
                    }
                }
            }
        }
    }

    Ok(ParsedRequest {
        cn,
        organizations,
        dns_sans,
        ip_sans,
    })
}

/// The two kubelet CSR flavours we approve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubeletCsrKind {
    /// First contact: client certificate requested before the node exists
    ClientBootstrap,
    /// Periodic serving certificate renewal for a joined node
    Serving,
}

/// A bootstrap CSR has no SAN entries and exactly the nodes group as its
/// subject organization; everything else is treated as serving.
pub fn kubelet_kind(parsed: &ParsedRequest) -> KubeletCsrKind {
    if !parsed.has_sans() && parsed.organizations == [NODES_GROUP.to_string()] {
        KubeletCsrKind::ClientBootstrap
    } else {
        KubeletCsrKind::Serving
    }
}

/// Outcome of validating a pending CSR.
#[derive(Debug)]
pub enum Verdict {
    /// Valid; approve it. Any warnings are emitted as events by the caller.
    Approve { warnings: Vec<String> },
    /// Not addressed to any of our instances; log and drop.
    NotOurs(String),
    /// Addressed to us but malformed; warn and drop.
    Invalid(String),
}

/// Validates kubelet CSRs against the current BYOH instance set.
pub struct KubeletCsrValidator<'a> {
    pub instances: &'a [Instance],
    pub resolver: &'a dyn AddressResolver,
    /// Session fallback for hostname comparison; skipped when absent
    pub connector: Option<&'a dyn Connector>,
    /// Names of nodes that currently exist
    pub existing_nodes: &'a BTreeSet<String>,
}

impl<'a> KubeletCsrValidator<'a> {
    pub async fn validate(&self, csr: &CertificateSigningRequest) -> Result<Verdict> {
        let parsed = match parse_request(&csr.spec.request.0) {
            Ok(p) => p,
            Err(e) => return Ok(Verdict::Invalid(e.to_string())),
        };
        let node_name = match parsed.node_name() {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => {
                return Ok(Verdict::NotOurs(format!(
                    "CN '{}' is not a kubelet node user",
                    parsed.cn
                )))
            }
        };

        let (matched, via_probe) = match self.match_instance(&node_name).await? {
            Some(m) => m,
            None => {
                return Ok(Verdict::NotOurs(format!(
                    "no instance corresponds to node name '{}'",
                    node_name
                )))
            }
        };

        let usages: BTreeSet<String> = csr.spec.usages.clone().unwrap_or_default().into_iter().collect();
        let groups: BTreeSet<String> = csr.spec.groups.clone().unwrap_or_default().into_iter().collect();

        match kubelet_kind(&parsed) {
            KubeletCsrKind::ClientBootstrap => {
                let expected: BTreeSet<String> =
                    ["digital signature", "key encipherment", "client auth"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect();
                if usages != expected {
                    return Ok(Verdict::Invalid(format!(
                        "bootstrap CSR for '{}' carries usages {:?}",
                        node_name, usages
                    )));
                }
                if self.existing_nodes.contains(&node_name) {
                    return Ok(Verdict::Invalid(format!(
                        "bootstrap CSR for '{}' but that node already exists",
                        node_name
                    )));
                }
            }
            KubeletCsrKind::Serving => {
                let expected: BTreeSet<String> =
                    ["digital signature", "key encipherment", "server auth"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect();
                if usages != expected {
                    return Ok(Verdict::Invalid(format!(
                        "serving CSR for '{}' carries usages {:?}",
                        node_name, usages
                    )));
                }
                if !groups.contains(NODES_GROUP) || !groups.contains(AUTHENTICATED_GROUP) {
                    return Ok(Verdict::Invalid(format!(
                        "serving CSR for '{}' missing required groups, has {:?}",
                        node_name, groups
                    )));
                }
                if !parsed.organizations.iter().any(|o| o == NODES_GROUP) {
                    return Ok(Verdict::Invalid(format!(
                        "serving CSR for '{}' subject is not in {}",
                        node_name, NODES_GROUP
                    )));
                }
                if let Some(w) = self
                    .check_sans(&parsed, &node_name, &matched)
                    .await?
                {
                    return Ok(Verdict::Invalid(w));
                }
            }
        }
        // a name DNS could produce is syntactically sound already; only the
        // hostname-probe fallback can admit one that is not, and that gets a
        // warning rather than a refusal
        let mut warnings = vec![];
        if via_probe && !is_rfc1123_subdomain(&node_name) {
            warnings.push(format!(
                "node name '{}' is not an RFC-1123 subdomain",
                node_name
            ));
        }
        Ok(Verdict::Approve { warnings })
    }

    /// Find the instance behind a node name.
    ///
    /// Addresses first (reverse DNS for IPs, name comparison for DNS
    /// entries), then a remote hostname query as the fallback. The returned
    /// flag is true iff only the hostname probe matched, which is the one
    /// path that can admit a node name DNS never vouched for.
    async fn match_instance(&self, node_name: &str) -> Result<Option<(Instance, bool)>> {
        for instance in self.instances {
            if instance.address.parse::<IpAddr>().is_ok() {
                match self.resolver.reverse_lookup(instance.ipv4).await {
                    Ok(names) => {
                        if names
                            .iter()
                            .any(|n| n == node_name || host_label(n) == node_name)
                        {
                            return Ok(Some((instance.clone(), false)));
                        }
                    }
                    Err(e) => debug!("reverse lookup of {} failed: {}", instance.ipv4, e),
                }
            } else if instance.address == node_name || host_label(&instance.address) == node_name {
                return Ok(Some((instance.clone(), false)));
            }
        }

        let connector = match self.connector {
            Some(c) => c,
            None => return Ok(None),
        };
        for instance in self.instances {
            let host = match connector.open(&instance.address, &instance.username).await {
                Ok(h) => h,
                Err(e) => {
                    debug!("hostname probe of {} failed: {}", instance.address, e);
                    continue;
                }
            };
            match host.hostname().await {
                Ok(h) if h.eq_ignore_ascii_case(node_name) => {
                    return Ok(Some((instance.clone(), true)));
                }
                Ok(_) => {}
                Err(e) => debug!("hostname query of {} failed: {}", instance.address, e),
            }
        }
        Ok(None)
    }

    /// Serving CSR SANs must stay within the instance's identity.
    async fn check_sans(
        &self,
        parsed: &ParsedRequest,
        node_name: &str,
        instance: &Instance,
    ) -> Result<Option<String>> {
        let mut allowed_dns: BTreeSet<String> = BTreeSet::new();
        allowed_dns.insert(node_name.to_string());
        allowed_dns.insert(instance.address.clone());
        if instance.address.parse::<IpAddr>().is_ok() {
            if let Ok(names) = self.resolver.reverse_lookup(instance.ipv4).await {
                for n in names {
                    allowed_dns.insert(host_label(&n).to_string());
                    allowed_dns.insert(n);
                }
            }
        }
        for dns in &parsed.dns_sans {
            if !allowed_dns.contains(dns) {
                return Ok(Some(format!(
                    "serving CSR for '{}' asks for unrelated DNS name '{}'",
                    node_name, dns
                )));
            }
        }
        for ip in &parsed.ip_sans {
            if *ip != IpAddr::V4(instance.ipv4) {
                return Ok(Some(format!(
                    "serving CSR for '{}' asks for unrelated address '{}'",
                    node_name, ip
                )));
            }
        }
        Ok(None)
    }
}

/// Whether a CSR still awaits a decision
pub fn is_pending(csr: &CertificateSigningRequest) -> bool {
    !csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Approved" || c.type_ == "Denied")
        })
        .unwrap_or(false)
}

/// Whether the daemon CSR predicate accepts this request
pub fn is_daemon_csr(csr: &CertificateSigningRequest, daemon_user: &str) -> bool {
    if csr.spec.username.as_deref() == Some(daemon_user) {
        return true;
    }
    // certificate based re-authentication carries the daemon subject instead
    parse_request(&csr.spec.request.0)
        .map(|p| p.cn.starts_with(DAEMON_SUBJECT_PREFIX))
        .unwrap_or(false)
}

/// Append the Approved condition and perform the typed approval call.
pub async fn approve(client: &Client, csr: &CertificateSigningRequest) -> Result<()> {
    let name = csr
        .metadata
        .name
        .clone()
        .ok_or_else(|| "csr without a name".to_string())?;
    let api: Api<CertificateSigningRequest> = Api::all(client.clone());

    let mut conditions = csr
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();
    conditions.push(CertificateSigningRequestCondition {
        type_: "Approved".into(),
        status: "True".into(),
        reason: Some(APPROVE_REASON.into()),
        message: Some("request validated against the managed Windows instances".into()),
        last_transition_time: Some(Time(Utc::now())),
        last_update_time: Some(Time(Utc::now())),
    });
    let patch = serde_json::json!({ "status": { "conditions": conditions } });
    api.patch_approval(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(ErrorKind::KubeError)?;
    info!("approved CSR {} ({})", name, APPROVE_REASON);
    Ok(())
}

fn is_rfc1123_subdomain(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    let re = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .unwrap();
    re.is_match(name)
}
