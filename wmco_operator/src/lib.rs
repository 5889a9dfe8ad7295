#![recursion_limit = "1024"]
#![allow(renamed_and_removed_lints)]

#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_json;
extern crate serde_yaml;

#[macro_use]
extern crate log;

extern crate base64;
extern crate chrono;
extern crate regex;
extern crate semver;

#[macro_use]
extern crate error_chain;
error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    links {
        Defs(wmco_definitions::Error, wmco_definitions::ErrorKind);
    }
    foreign_links {
        Fmt(::std::fmt::Error);
        Io(::std::io::Error) #[cfg(unix)];
        Int(::std::num::ParseIntError);
        SerdeY(serde_yaml::Error);
        SerdeJ(serde_json::Error);
        Utf8(::std::string::FromUtf8Error);
        Addr(::std::net::AddrParseError);
        Env(::std::env::VarError);
        SemVer(semver::SemVerError);
        SshKey(ssh_key::Error);
        Resolve(hickory_resolver::error::ResolveError);
    }
    errors {
        KubeError(err: kube::Error) {
            description("kube api call failed")
            display("kube api call failed: {}", err)
        }
        AuthFailure(addr: String) {
            description("remote authentication failed")
            display("authentication to {} was refused; key material is stale", &addr)
        }
        SessionFailure(addr: String) {
            description("remote session could not be established")
            display("could not open a session to {}", &addr)
        }
        RemoteCommandFailure(cmd: String, stderr: String) {
            description("remote command returned non-zero")
            display("remote command '{}' failed: {}", &cmd, &stderr)
        }
        PolicyDenied(reason: String) {
            description("operation denied by policy")
            display("denied: {}", &reason)
        }
        InvalidCsr(reason: String) {
            description("certificate request does not validate")
            display("invalid certificate request: {}", &reason)
        }
        InvalidInstanceEntry(host: String, value: String) {
            description("instances configmap entry is malformed")
            display("invalid instances entry '{}: {}'", &host, &value)
        }
        NodeMissing(name: String) {
            description("expected node object is absent")
            display("node '{}' did not appear in the cluster", &name)
        }
        Timeout(what: String) {
            description("operation did not complete in time")
            display("timed out waiting for {}", &what)
        }
        UnsupportedNetwork(plugin: String) {
            description("cluster network plugin is unsupported")
            display("network plugin '{}' is not supported; only OVNKubernetes with hybrid overlay", &plugin)
        }
        UnsupportedKubeVersion(version: String) {
            description("cluster kubernetes version outside the supported window")
            display("kubernetes {} is outside the supported version window", &version)
        }
        MissingEnv(var: String) {
            description("required environment variable unset")
            display("{} must be set", &var)
        }
    }
}

/// Whether a kube error is a benign not-found
pub fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

/// Whether a kube error is an optimistic lock conflict
pub fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409)
}

pub use wmco_definitions::{constants, crypto, instance, platform, services};

/// Cluster-state discovery: platform, network, versions, proxy
pub mod cluster;

/// Session signer derived from the administrator supplied private key
pub mod signer;

/// DNS helpers: IPv4 resolution and reverse lookups
pub mod netutil;

/// Instances ConfigMap parsing and node correlation
pub mod instances;

/// The remote Windows host abstraction and its ssh reference transport
pub mod windows;

/// Per-host configure/deconfigure pipeline
pub mod nodeconfig;

/// Node listers, patches and retry helpers
pub mod nodeutil;

/// Process-wide busy set feeding the Upgradeable condition
pub mod condition;

/// Metrics Endpoints sync and the service monitor artifact
pub mod metrics;

/// CSR parsing, validation and approval
pub mod csr;

/// Startup-owned RBAC objects for the on-host daemon
pub mod rbac;

/// The controllers binding everything to cluster events
pub mod controllers;
