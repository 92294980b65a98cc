//! Process-wide service port registry

use crate::signals::{SignalBus, SERVER_CONFIG_CHANGED};
use crate::types::{DEFAULT_DB_PORT, DEFAULT_SSH_PORT};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::info;

/// Logical service names with overridable ports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Ssh,
    Db,
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Service::Ssh => write!(f, "SSH"),
            Service::Db => write!(f, "DB"),
        }
    }
}

/// Single source of truth for the SSH and DB ports.
///
/// Reads are lock-free. Every change fires `server_config_changed` so facades
/// rebuild their cached clients before the next use.
#[derive(Debug)]
pub struct PortRegistry {
    ssh: AtomicU16,
    db: AtomicU16,
    signals: Arc<SignalBus>,
}

impl PortRegistry {
    pub fn new(signals: Arc<SignalBus>) -> Self {
        Self {
            ssh: AtomicU16::new(DEFAULT_SSH_PORT),
            db: AtomicU16::new(DEFAULT_DB_PORT),
            signals,
        }
    }

    pub fn get(&self, service: Service) -> u16 {
        match service {
            Service::Ssh => self.ssh.load(Ordering::Acquire),
            Service::Db => self.db.load(Ordering::Acquire),
        }
    }

    pub fn ssh(&self) -> u16 {
        self.get(Service::Ssh)
    }

    pub fn db(&self) -> u16 {
        self.get(Service::Db)
    }

    /// Override a port. Fires the invalidation signal only if the value changed.
    pub fn set(&self, service: Service, port: u16) {
        let previous = match service {
            Service::Ssh => self.ssh.swap(port, Ordering::AcqRel),
            Service::Db => self.db.swap(port, Ordering::AcqRel),
        };
        if previous != port {
            info!("{} port changed {} -> {}", service, previous, port);
            self.signals.fire(SERVER_CONFIG_CHANGED);
        }
    }
}
