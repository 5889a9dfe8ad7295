//! In-memory host transport for pipeline tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use wmco_definitions::services::Service;
use wmco_operator::windows::{Connector, WindowsHost};
use wmco_operator::{ErrorKind, Result};

#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Run(String),
    Upload(String),
    ReplaceDir(String),
    Remove(String),
    Install(String),
    Start(String),
    Stop(String),
    DeleteService(String),
    Hostname,
    Rename(String),
}

/// Records every operation; service state is a shared set so exists checks
/// behave across install/remove.
#[derive(Clone)]
pub struct FakeHost {
    pub hostname: String,
    pub services: Arc<Mutex<BTreeSet<String>>>,
    pub ops: Arc<Mutex<Vec<Op>>>,
}

impl FakeHost {
    pub fn new(hostname: &str) -> FakeHost {
        FakeHost {
            hostname: hostname.to_string(),
            services: Arc::new(Mutex::new(BTreeSet::new())),
            ops: Arc::new(Mutex::new(vec![])),
        }
    }

    pub fn with_services(hostname: &str, services: &[&str]) -> FakeHost {
        let host = FakeHost::new(hostname);
        let mut set = host.services.lock().unwrap();
        for s in services {
            set.insert(s.to_string());
        }
        drop(set);
        host
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl WindowsHost for FakeHost {
    async fn hostname(&self) -> Result<String> {
        self.record(Op::Hostname);
        Ok(self.hostname.clone())
    }

    async fn run(&self, cmd: &str) -> Result<String> {
        self.record(Op::Run(cmd.to_string()));
        Ok(String::new())
    }

    async fn upload(&self, dst: &str, _content: &[u8]) -> Result<()> {
        self.record(Op::Upload(dst.to_string()));
        Ok(())
    }

    async fn replace_dir(&self, dst: &str, _files: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        self.record(Op::ReplaceDir(dst.to_string()));
        Ok(())
    }

    async fn remove_path(&self, path: &str) -> Result<()> {
        self.record(Op::Remove(path.to_string()));
        Ok(())
    }

    async fn service_exists(&self, name: &str) -> Result<bool> {
        Ok(self.services.lock().unwrap().contains(name))
    }

    async fn install_service(&self, svc: &Service, _node_ip: &str, _hostname: &str) -> Result<()> {
        self.record(Op::Install(svc.name.clone()));
        self.services.lock().unwrap().insert(svc.name.clone());
        Ok(())
    }

    async fn start_service(&self, name: &str) -> Result<()> {
        self.record(Op::Start(name.to_string()));
        Ok(())
    }

    async fn stop_service(&self, name: &str) -> Result<()> {
        self.record(Op::Stop(name.to_string()));
        Ok(())
    }

    async fn remove_service(&self, name: &str) -> Result<()> {
        self.record(Op::DeleteService(name.to_string()));
        self.services.lock().unwrap().remove(name);
        Ok(())
    }

    async fn rename(&self, new_hostname: &str) -> Result<()> {
        self.record(Op::Rename(new_hostname.to_string()));
        Ok(())
    }
}

/// Hands out clones of one [`FakeHost`]; can simulate authentication refusal.
pub struct FakeConnector {
    pub host: FakeHost,
    pub opens: Arc<Mutex<u32>>,
    pub fail_auth: bool,
}

impl FakeConnector {
    pub fn new(host: FakeHost) -> FakeConnector {
        FakeConnector {
            host,
            opens: Arc::new(Mutex::new(0)),
            fail_auth: false,
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, address: &str, _username: &str) -> Result<Box<dyn WindowsHost>> {
        if self.fail_auth {
            return Err(ErrorKind::AuthFailure(address.to_string()).into());
        }
        *self.opens.lock().unwrap() += 1;
        Ok(Box::new(self.host.clone()))
    }
}
