//! Core types for the appliance control plane

use serde::{Deserialize, Serialize};

/// Root of the application tree on an appliance
pub const VMDB_ROOT: &str = "/var/www/miq/vmdb";

/// Name of the application database
pub const VMDB_DATABASE: &str = "vmdb_production";

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default PostgreSQL port
pub const DEFAULT_DB_PORT: u16 = 5432;

/// Default HTTPS port of the web UI
pub const DEFAULT_UI_PORT: u16 = 443;

/// Network location of an appliance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub ssh_port: u16,
    pub db_port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ssh_port: DEFAULT_SSH_PORT,
            db_port: DEFAULT_DB_PORT,
        }
    }

    pub fn with_ports(address: impl Into<String>, ssh_port: u16, db_port: u16) -> Self {
        Self {
            address: address.into(),
            ssh_port,
            db_port,
        }
    }

    /// Base URL of the web UI
    pub fn ui_url(&self) -> String {
        format!("https://{}/", self.address)
    }
}

/// Named credential bundle
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Database an appliance is attached to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbTarget {
    pub address: String,
    pub port: u16,
    pub credentials: Credentials,
    pub db_name: String,
}

impl DbTarget {
    pub fn new(address: impl Into<String>, port: u16, credentials: Credentials) -> Self {
        Self {
            address: address.into(),
            port,
            credentials,
            db_name: VMDB_DATABASE.to_string(),
        }
    }

    pub fn with_db_name(mut self, db_name: impl Into<String>) -> Self {
        self.db_name = db_name.into();
        self
    }

    /// Whether this target lives on the appliance at `appliance_address`
    pub fn is_internal_to(&self, appliance_address: &str) -> bool {
        self.address == appliance_address
    }

    /// PostgreSQL connection URL
    pub fn url(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.credentials.username,
            self.credentials.password,
            self.address,
            self.port,
            self.db_name
        )
    }
}

/// Bring-up phase of an appliance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliancePhase {
    Unreachable,
    Reachable,
    DbEnabled,
    DbReady,
    WebReady,
    Configured,
}

impl Default for AppliancePhase {
    fn default() -> Self {
        Self::Unreachable
    }
}

impl std::fmt::Display for AppliancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppliancePhase::Unreachable => write!(f, "unreachable"),
            AppliancePhase::Reachable => write!(f, "reachable"),
            AppliancePhase::DbEnabled => write!(f, "db_enabled"),
            AppliancePhase::DbReady => write!(f, "db_ready"),
            AppliancePhase::WebReady => write!(f, "web_ready"),
            AppliancePhase::Configured => write!(f, "configured"),
        }
    }
}

/// A named YAML configuration document stored per appliance
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    pub name: String,
    pub payload: serde_yaml::Value,
}

/// Outcome of a web UI probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebStatus {
    /// 200 with the dashboard marker in the body
    Up,
    /// Connection refused, reset or timed out
    Down,
    /// Something answered, but not the ready UI
    Unsure,
}

impl std::fmt::Display for WebStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebStatus::Up => write!(f, "up"),
            WebStatus::Down => write!(f, "down"),
            WebStatus::Unsure => write!(f, "unsure"),
        }
    }
}
