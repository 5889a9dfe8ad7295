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
extern crate regex;

#[macro_use]
extern crate error_chain;
error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    links {}
    foreign_links {
        Fmt(::std::fmt::Error);
        Io(::std::io::Error) #[cfg(unix)];
        Int(::std::num::ParseIntError);
        SerdeY(serde_yaml::Error);
        SerdeJ(serde_json::Error);
        Base64(base64::DecodeError);
        Addr(::std::net::AddrParseError);
        Net(ipnet::AddrParseError);
        Utf8(::std::string::FromUtf8Error);
    }
    errors {
        CryptoFailure(op: String) {
            description("symmetric crypto operation failed")
            display("failed to {} annotation payload", &op)
        }
        InvalidServicesManifest(reason: String) {
            description("services manifest does not validate")
            display("services manifest invalid: {}", &reason)
        }
        InvalidServiceCidr(cidr: String) {
            description("service network entry is not a valid IPv4 CIDR")
            display("invalid service network entry '{}'", &cidr)
        }
        InvalidInstanceEntry(key: String, reason: String) {
            description("instances configmap entry is malformed")
            display("invalid entry for host '{}': {}", &key, &reason)
        }
        UnsupportedPlatform(platform: String) {
            description("platform type is not recognised")
            display("unsupported platform type '{}'", &platform)
        }
        InvalidPullSecret {
            description("global pull secret is malformed")
            display("global pull secret does not contain a valid dockerconfigjson payload")
        }
    }
}

/// Names, labels, annotations and on-host paths owned by the operator
pub mod constants;

/// Symmetric encryption of short strings for on-node annotation storage
pub mod crypto;

/// The Windows host model
pub mod instance;

/// Closed sum type over recognised infrastructure platforms
pub mod platform;

/// Service network and hybrid overlay configuration
pub mod network;

/// Cluster-wide proxy variables and their Windows form
pub mod proxy;

/// Versioned manifest of agent services to run on each host
pub mod services;

/// Cloud user-data payload generation
pub mod userdata;

/// Container-runtime mirror and pull-secret file generation
pub mod registry;

/// Typed shims for external cluster objects (Machine, Infrastructure, ...)
pub mod crds;

pub use crate::instance::Instance;
pub use crate::platform::Platform;
pub use crate::services::{Service, ServicesData};
