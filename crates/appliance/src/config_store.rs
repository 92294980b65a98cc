//! Appliance configuration documents
//!
//! Reads go straight to the `configurations` table. Writes go through the
//! application's own loader over SSH so that its validation and side effects
//! run, then announce `server_config_changed`.

use crate::scripts;
use cfme_common::{ConfigDocument, Error, Result, Shell, SignalBus, Vmdb, SERVER_CONFIG_CHANGED};
use std::io::Write;
use tracing::{debug, info};

/// Scratch path of the uploaded YAML document
pub const REMOTE_YAML: &str = "/tmp/conf.yaml";

/// Scratch path of the uploaded loader script
pub const REMOTE_LOADER: &str = "/tmp/load_conf.rb";

/// Read configuration `name` of the server identified by `guid`
pub async fn get_document(db: &dyn Vmdb, guid: &str, name: &str) -> Result<ConfigDocument> {
    let raw = db.server_settings(guid, name).await?.ok_or_else(|| {
        Error::ConfigLookup(format!("configuration {} not found for server {}", name, guid))
    })?;
    Ok(ConfigDocument {
        name: name.to_string(),
        payload: serde_yaml::from_str(&raw)?,
    })
}

/// Read configuration `name` as a nested mapping
pub async fn get_yaml(db: &dyn Vmdb, guid: &str, name: &str) -> Result<serde_yaml::Value> {
    Ok(get_document(db, guid, name).await?.payload)
}

/// Write configuration `name` through the application loader.
///
/// The loader exits non-zero on exceptions and prints a marker after saving;
/// either failure is reported as a shell step error. Validation problems that
/// the application only detects on its next load are not visible here.
pub async fn set_yaml(
    shell: &dyn Shell,
    signals: &SignalBus,
    name: &str,
    data: &serde_yaml::Value,
) -> Result<()> {
    info!("Writing configuration {} on {}", name, shell.hostname());

    let mut yaml_file = tempfile::NamedTempFile::new()?;
    yaml_file.write_all(serde_yaml::to_string(data)?.as_bytes())?;
    yaml_file.flush()?;
    shell.put_file(yaml_file.path(), REMOTE_YAML).await?;

    let mut loader = tempfile::NamedTempFile::new()?;
    loader.write_all(scripts::config_loader(name, REMOTE_YAML).as_bytes())?;
    loader.flush()?;
    shell.put_file(loader.path(), REMOTE_LOADER).await?;

    let step = format!("load configuration {}", name);
    let result = shell
        .run_rails(REMOTE_LOADER)
        .await?
        .check(shell.hostname(), &step)?;
    if !result.output.contains(scripts::CONFIG_LOADED_MARKER) {
        return Err(Error::shell_step(shell.hostname(), step, &result.output));
    }

    let notified = signals.fire(SERVER_CONFIG_CHANGED);
    debug!("Configuration {} written, {} subscribers notified", name, notified);
    Ok(())
}

/// Look up a nested key, e.g. `["server", "name"]`
pub fn lookup<'a>(value: &'a serde_yaml::Value, path: &[&str]) -> Option<&'a serde_yaml::Value> {
    path.iter().try_fold(value, |node, key| node.get(*key))
}

/// Set a nested key, creating intermediate mappings as needed
pub fn assign(value: &mut serde_yaml::Value, path: &[&str], new: serde_yaml::Value) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        *value = new;
        return Ok(());
    };
    let mut node = value;
    for key in parents {
        if node.is_null() {
            *node = serde_yaml::Value::Mapping(Default::default());
        }
        let mapping = node
            .as_mapping_mut()
            .ok_or_else(|| Error::ConfigLookup(format!("{} is not a mapping", key)))?;
        node = mapping
            .entry(serde_yaml::Value::String((*key).to_string()))
            .or_insert(serde_yaml::Value::Null);
    }
    if node.is_null() {
        *node = serde_yaml::Value::Mapping(Default::default());
    }
    node.as_mapping_mut()
        .ok_or_else(|| Error::ConfigLookup(format!("parent of {} is not a mapping", last)))?
        .insert(serde_yaml::Value::String((*last).to_string()), new);
    Ok(())
}
