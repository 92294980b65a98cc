//! Simulated database accessor and web UI probe

use crate::lab::{unreachable, Database, LabState};
use async_trait::async_trait;
use cfme_common::db::Column;
use cfme_common::{Error, Result, TableDescriptor, TableInfo, Vmdb, WebProbe, WebStatus};
use parking_lot::Mutex;
use std::sync::Arc;

const TABLES: [&str; 2] = ["configurations", "miq_servers"];

/// Accessor for the database hosted on one lab address
pub struct LabVmdb {
    state: Arc<Mutex<LabState>>,
    address: String,
}

impl LabVmdb {
    pub fn new(state: Arc<Mutex<LabState>>, address: &str) -> Self {
        Self {
            state,
            address: address.to_string(),
        }
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let state = self.state.lock();
        match state.databases.get(&self.address) {
            Some(db) if db.online => f(db),
            _ => Err(unreachable(&self.address)),
        }
    }
}

fn descriptor(name: &str) -> TableDescriptor {
    let columns: &[(&str, &str)] = match name {
        "miq_servers" => &[
            ("id", "bigint"),
            ("guid", "character varying"),
            ("name", "character varying"),
            ("version", "character varying"),
        ],
        _ => &[
            ("id", "bigint"),
            ("typ", "character varying"),
            ("settings", "text"),
            ("miq_server_id", "bigint"),
        ],
    };
    TableDescriptor {
        name: name.to_string(),
        columns: columns
            .iter()
            .map(|(column, data_type)| Column {
                name: column.to_string(),
                data_type: data_type.to_string(),
                nullable: *column != "id",
            })
            .collect(),
        primary_key: vec!["id".to_string()],
        indices: Vec::new(),
    }
}

#[async_trait]
impl Vmdb for LabVmdb {
    fn address(&self) -> &str {
        &self.address
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        self.with_db(|db| {
            Ok(if db.migrated {
                TABLES.iter().map(|t| t.to_string()).collect()
            } else {
                Vec::new()
            })
        })
    }

    async fn table(&self, name: &str) -> Result<TableInfo> {
        self.with_db(|db| {
            if db.migrated && TABLES.contains(&name) {
                Ok(TableInfo::Reflected(descriptor(name)))
            } else {
                Err(Error::NoSuchTable(name.to_string()))
            }
        })
    }

    async fn fetch_column(&self, sql: &str) -> Result<Vec<String>> {
        let query = sql.trim().trim_end_matches(';');
        self.with_db(|db| {
            let servers = db.servers.iter();
            match query {
                "SELECT version FROM miq_servers" => Ok(servers.map(|s| s.version.clone()).collect()),
                "SELECT name FROM miq_servers" => Ok(servers.map(|s| s.name.clone()).collect()),
                "SELECT guid FROM miq_servers" => Ok(servers.map(|s| s.guid.clone()).collect()),
                "SELECT count(*) FROM miq_servers" => Ok(vec![db.servers.len().to_string()]),
                _ => Err(Error::Invariant(format!("lab database cannot run: {}", sql))),
            }
        })
    }

    async fn server_settings(&self, guid: &str, name: &str) -> Result<Option<String>> {
        self.with_db(|db| {
            Ok(db
                .settings
                .get(&(guid.to_string(), name.to_string()))
                .cloned())
        })
    }
}

/// Web UI of one lab appliance
pub struct LabProbe {
    state: Arc<Mutex<LabState>>,
    address: String,
}

impl LabProbe {
    pub fn new(state: Arc<Mutex<LabState>>, address: &str) -> Self {
        Self {
            state,
            address: address.to_string(),
        }
    }
}

#[async_trait]
impl WebProbe for LabProbe {
    async fn probe(&self) -> WebStatus {
        let state = self.state.lock();
        if state.web_ready(&self.address) {
            return WebStatus::Up;
        }
        match state.hosts.get(&self.address) {
            Some(host) if host.powered && host.evm_running => WebStatus::Unsure,
            _ => WebStatus::Down,
        }
    }
}
