use std::collections::BTreeMap;

use async_trait::async_trait;

use super::Result;
use wmco_definitions::services::Service;

pub mod commands;
pub mod ssh;

pub use ssh::SshConnector;

/// An open authenticated session against one Windows host.
///
/// The transport is pluggable; reconcilers only see this capability set. A
/// session is owned by a single reconcile invocation and released when it is
/// dropped, whatever the exit path.
#[async_trait]
pub trait WindowsHost: Send + Sync {
    /// The remote hostname, used as a CSR validation fallback
    async fn hostname(&self) -> Result<String>;

    /// Run a command, returning stdout. Non-zero exit is an error carrying
    /// the captured stderr.
    async fn run(&self, cmd: &str) -> Result<String>;

    /// Write a file, creating parent directories. Atomic within the file.
    async fn upload(&self, dst: &str, content: &[u8]) -> Result<()>;

    /// Replace a directory's contents with exactly the given files.
    ///
    /// Observers on the host see either the old or the new full set.
    async fn replace_dir(&self, dst: &str, files: &BTreeMap<String, Vec<u8>>) -> Result<()>;

    /// Remove a file or directory tree if present
    async fn remove_path(&self, path: &str) -> Result<()>;

    /// Whether a service of this name is registered
    async fn service_exists(&self, name: &str) -> Result<bool>;

    /// Register a service with exactly the given parameters.
    ///
    /// An existing registration under the same name is replaced. Arguments
    /// have per-host variables rendered with `node_ip`/`hostname`.
    async fn install_service(&self, svc: &Service, node_ip: &str, hostname: &str) -> Result<()>;

    /// Idempotent service start
    async fn start_service(&self, name: &str) -> Result<()>;

    /// Idempotent service stop
    async fn stop_service(&self, name: &str) -> Result<()>;

    /// Deregister a service
    async fn remove_service(&self, name: &str) -> Result<()>;

    /// Rename the host and reboot it
    async fn rename(&self, new_hostname: &str) -> Result<()>;
}

/// Opens sessions to hosts.
///
/// Built fresh from the private-key secret on every reconcile entry so key
/// rotation takes effect on the next tick.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session, distinguishing authentication refusal (the caller
    /// deletes the Machine) from transient connectivity failures.
    async fn open(&self, address: &str, username: &str) -> Result<Box<dyn WindowsHost>>;
}
