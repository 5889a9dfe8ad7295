//! Reference transport: an OpenSSH subprocess per command.
//!
//! Key material lives in a mode-0600 tempfile for the connector's lifetime
//! and is removed when the connector drops. Host key checking is disabled:
//! hosts are freshly provisioned and their keys are not known to anyone.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::process::Command;

use super::{commands, Connector, WindowsHost};
use crate::signer::Signer;
use crate::{ErrorKind, Result};
use wmco_definitions::services::Service;

const SSH_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "ConnectTimeout=30",
    "-o",
    "ServerAliveInterval=15",
    "-q",
];

/// Connector holding the session identity on disk.
pub struct SshConnector {
    identity: Arc<NamedTempFile>,
}

impl SshConnector {
    pub fn new(signer: &Signer) -> Result<SshConnector> {
        // NamedTempFile is created 0600 on unix
        let mut identity = NamedTempFile::new()?;
        identity.write_all(signer.key_bytes())?;
        identity.flush()?;
        Ok(SshConnector {
            identity: Arc::new(identity),
        })
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn open(&self, address: &str, username: &str) -> Result<Box<dyn WindowsHost>> {
        let host = SshHost {
            address: address.to_string(),
            target: format!("{}@{}", username, address),
            identity: self.identity.clone(),
        };
        // probe both connectivity and authentication up front; a refusal
        // here is what makes the Machine reconciler delete the Machine
        host.run("$PSVersionTable.PSVersion.Major").await?;
        debug!("session open against {}", address);
        Ok(Box::new(host))
    }
}

struct SshHost {
    address: String,
    target: String,
    identity: Arc<NamedTempFile>,
}

impl SshHost {
    async fn exec(&self, remote_cmd: &str) -> Result<String> {
        let wrapped = format!(
            "powershell.exe -NonInteractive -NoProfile -Command \"{}\"",
            remote_cmd.replace('"', "\\\"")
        );
        trace!("ssh {} {}", self.target, remote_cmd);
        let out = Command::new("ssh")
            .args(SSH_OPTIONS)
            .arg("-i")
            .arg(self.identity.path())
            .arg(&self.target)
            .arg(&wrapped)
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        if out.status.success() {
            return Ok(stdout);
        }
        // 255 is ssh itself failing rather than the remote command
        if out.status.code() == Some(255) {
            if stderr.contains("Permission denied") {
                bail!(ErrorKind::AuthFailure(self.address.clone()));
            }
            bail!(ErrorKind::SessionFailure(self.address.clone()));
        }
        bail!(ErrorKind::RemoteCommandFailure(
            remote_cmd.to_string(),
            stderr
        ))
    }
}

#[async_trait]
impl WindowsHost for SshHost {
    async fn hostname(&self) -> Result<String> {
        self.exec(&commands::hostname()).await
    }

    async fn run(&self, cmd: &str) -> Result<String> {
        self.exec(cmd).await
    }

    async fn upload(&self, dst: &str, content: &[u8]) -> Result<()> {
        if let Some(parent) = commands::parent_dir(dst) {
            self.exec(&commands::ensure_dir(parent)).await?;
        }
        self.exec(&commands::clear_staging(dst)).await?;
        let encoded = base64::encode(content);
        for chunk in encoded.as_bytes().chunks(commands::UPLOAD_CHUNK) {
            // chunk boundaries fall on char boundaries in base64
            let chunk = ::std::str::from_utf8(chunk).expect("base64 is ascii");
            self.exec(&commands::append_chunk(dst, chunk)).await?;
        }
        self.exec(&commands::commit_upload(dst)).await?;
        Ok(())
    }

    async fn replace_dir(&self, dst: &str, files: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        // build the full set next to the target, then swap it in with one
        // remote command; readers never see a partially-written directory
        let staging = commands::staging_dir(dst);
        self.exec(&commands::remove_path(&staging)).await?;
        self.exec(&commands::ensure_dir(&staging)).await?;
        for (relpath, content) in files {
            let full = format!("{}\\{}", staging, relpath.replace('/', "\\"));
            self.upload(&full, content).await?;
        }
        self.exec(&commands::swap_dir(&staging, dst)).await?;
        Ok(())
    }

    async fn remove_path(&self, path: &str) -> Result<()> {
        self.exec(&commands::remove_path(path)).await?;
        Ok(())
    }

    async fn service_exists(&self, name: &str) -> Result<bool> {
        let out = self.exec(&commands::service_exists(name)).await?;
        Ok(out == "true")
    }

    async fn install_service(&self, svc: &Service, node_ip: &str, hostname: &str) -> Result<()> {
        if self.service_exists(&svc.name).await? {
            self.stop_service(&svc.name).await?;
            self.remove_service(&svc.name).await?;
        }
        self.exec(&commands::create_service(svc, node_ip, hostname))
            .await?;
        self.exec(&commands::set_service_description(&svc.name))
            .await?;
        if let Some(cmd) = commands::set_recovery(svc) {
            self.exec(&cmd).await?;
        }
        if let Some(cmd) = commands::set_service_env(svc) {
            self.exec(&cmd).await?;
        }
        Ok(())
    }

    async fn start_service(&self, name: &str) -> Result<()> {
        self.exec(&commands::start_service(name)).await?;
        Ok(())
    }

    async fn stop_service(&self, name: &str) -> Result<()> {
        self.exec(&commands::stop_service(name)).await?;
        Ok(())
    }

    async fn remove_service(&self, name: &str) -> Result<()> {
        self.exec(&commands::delete_service(name)).await?;
        Ok(())
    }

    async fn rename(&self, new_hostname: &str) -> Result<()> {
        info!("renaming {} to {}", self.address, new_hostname);
        self.exec(&commands::rename_computer(new_hostname)).await?;
        Ok(())
    }
}
