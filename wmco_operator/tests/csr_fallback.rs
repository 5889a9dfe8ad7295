//! CSR approval through the remote-hostname fallback path.

mod common;

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use common::{FakeConnector, FakeHost, Op};
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;

use wmco_definitions::instance::Instance;
use wmco_operator::csr::{KubeletCsrValidator, Verdict};
use wmco_operator::netutil::AddressResolver;
use wmco_operator::Result;

// CN=system:node:winhost-5, O=system:nodes, no SANs
const BOOTSTRAP_CSR: &str = "-----BEGIN CERTIFICATE REQUEST-----
MIHyMIGZAgEAMDcxFTATBgNVBAoMDHN5c3RlbTpub2RlczEeMBwGA1UEAwwVc3lz
dGVtOm5vZGU6d2luaG9zdC01MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEkTBQ
nbjSsj1eBYQamIJPyciXYNOvysBJGwcjWqiiV52fw0L6EfVoE2+qqsGb3BTV22Fr
E6thmlTUNQvEUWf7uKAAMAoGCCqGSM49BAMCA0gAMEUCIDkXSKaiFYpnFzJsrDdB
8InJXCc2wcgcVIUL0CQGJPUrAiEA1w4Ho8fn9BpPOlKTqSDzSmPL28qsxLKvLfkB
rrXETPA=
-----END CERTIFICATE REQUEST-----
";

// CN=system:node:WINHOST-5, O=system:nodes, no SANs
const UPPERCASE_CSR: &str = "-----BEGIN CERTIFICATE REQUEST-----
MIHyMIGZAgEAMDcxFTATBgNVBAoMDHN5c3RlbTpub2RlczEeMBwGA1UEAwwVc3lz
dGVtOm5vZGU6V0lOSE9TVC01MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEkTBQ
nbjSsj1eBYQamIJPyciXYNOvysBJGwcjWqiiV52fw0L6EfVoE2+qqsGb3BTV22Fr
E6thmlTUNQvEUWf7uKAAMAoGCCqGSM49BAMCA0gAMEUCIQDU76a4mWZbpGwUq4lx
lLFrWAle6ZkVzy6DVg1A3f8G4QIgGCMQWfPSCajU1AHtsFZodvdFBRm1aWeayrlJ
1CTPlns=
-----END CERTIFICATE REQUEST-----
";

/// Resolver that never matches anything
struct DeadResolver;

#[async_trait]
impl AddressResolver for DeadResolver {
    async fn lookup_ipv4(&self, host: &str) -> Result<Ipv4Addr> {
        bail_like(host)
    }

    async fn reverse_lookup(&self, _ip: Ipv4Addr) -> Result<Vec<String>> {
        Ok(vec![])
    }
}

fn bail_like(host: &str) -> Result<Ipv4Addr> {
    Err(format!("no A record found for '{}'", host).into())
}

fn csr_for(request: &str) -> CertificateSigningRequest {
    let mut csr = CertificateSigningRequest::default();
    csr.metadata.name = Some("csr-xyz".into());
    csr.spec.request = k8s_openapi::ByteString(request.as_bytes().to_vec());
    csr.spec.usages = Some(
        ["digital signature", "key encipherment", "client auth"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    csr.spec.groups = Some(vec!["system:nodes".into()]);
    csr
}

fn csr() -> CertificateSigningRequest {
    csr_for(BOOTSTRAP_CSR)
}

#[tokio::test]
async fn hostname_probe_identifies_the_instance() {
    // the instance address gives DNS no way to produce the node name; only
    // asking the host itself can match it
    let instance = Instance::new(
        "gateway.internal".into(),
        Ipv4Addr::new(192, 168, 10, 20),
        "Administrator".into(),
    );
    let connector = FakeConnector::new(FakeHost::new("winhost-5"));
    let instances = vec![instance];
    let existing = BTreeSet::new();
    let validator = KubeletCsrValidator {
        instances: &instances,
        resolver: &DeadResolver,
        connector: Some(&connector),
        existing_nodes: &existing,
    };

    match validator.validate(&csr()).await.unwrap() {
        Verdict::Approve { warnings } => assert!(warnings.is_empty()),
        v => panic!("expected approval via hostname probe, got {:?}", v),
    }
    assert_eq!(*connector.opens.lock().unwrap(), 1);
    assert!(connector.host.ops().contains(&Op::Hostname));
}

#[tokio::test]
async fn probe_matched_names_get_syntax_warnings() {
    // only the hostname probe vouches for this name, and the name breaks
    // DNS label syntax: approved, but with a warning attached
    let instance = Instance::new(
        "gateway.internal".into(),
        Ipv4Addr::new(192, 168, 10, 20),
        "Administrator".into(),
    );
    let connector = FakeConnector::new(FakeHost::new("WINHOST-5"));
    let instances = vec![instance];
    let existing = BTreeSet::new();
    let validator = KubeletCsrValidator {
        instances: &instances,
        resolver: &DeadResolver,
        connector: Some(&connector),
        existing_nodes: &existing,
    };

    match validator.validate(&csr_for(UPPERCASE_CSR)).await.unwrap() {
        Verdict::Approve { warnings } => {
            assert_eq!(warnings.len(), 1);
            assert!(warnings[0].contains("RFC-1123"));
        }
        v => panic!("expected approval with warning, got {:?}", v),
    }
}

#[tokio::test]
async fn hostname_mismatch_means_not_ours() {
    let instance = Instance::new(
        "gateway.internal".into(),
        Ipv4Addr::new(192, 168, 10, 20),
        "Administrator".into(),
    );
    let connector = FakeConnector::new(FakeHost::new("some-other-box"));
    let instances = vec![instance];
    let existing = BTreeSet::new();
    let validator = KubeletCsrValidator {
        instances: &instances,
        resolver: &DeadResolver,
        connector: Some(&connector),
        existing_nodes: &existing,
    };
    assert!(matches!(
        validator.validate(&csr()).await.unwrap(),
        Verdict::NotOurs(_)
    ));
}
