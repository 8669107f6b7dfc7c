use std::path::Path;

use anyhow::{bail, Context};
use serde_json::{json, Map, Value};

use crate::local_runner::DEFAULT_LOCAL_INTERPRETER;

/// Load a YAML inventory: a mapping of group names to `{hosts: {...}}`.
pub fn load_inventory(inventory_file: impl AsRef<Path>) -> anyhow::Result<Value> {
    let text = std::fs::read_to_string(inventory_file.as_ref()).with_context(|| {
        format!(
            "reading inventory file {}",
            inventory_file.as_ref().display()
        )
    })?;
    let inventory: Value = serde_yaml::from_str(&text)?;
    Ok(inventory)
}

/// Flatten an inventory to a unique host-name → host-vars mapping. A host
/// that appears in several groups keeps the last occurrence.
pub fn unique_hosts(inventory: &Value) -> anyhow::Result<Map<String, Value>> {
    let groups = match inventory.as_object() {
        Some(groups) => groups,
        None => bail!("inventory must be a mapping of groups"),
    };

    let mut hosts = Map::new();
    for (group_name, group) in groups {
        let group_hosts = group
            .get("hosts")
            .and_then(Value::as_object)
            .with_context(|| format!("group {} has no hosts mapping", group_name))?;
        for (host_name, host_vars) in group_hosts {
            hosts.insert(host_name.clone(), host_vars.clone());
        }
    }
    Ok(hosts)
}

pub fn host_vars(host: &Value) -> Map<String, Value> {
    host.as_object().cloned().unwrap_or_default()
}

/// The canonical single-host inventory for running against the driver machine.
pub fn load_localhost(interpreter: Option<&str>) -> Value {
    let interpreter = interpreter.unwrap_or(DEFAULT_LOCAL_INTERPRETER);
    json!({
        "all": {
            "hosts": {
                "localhost": {
                    "ansible_connection": "local",
                    "ansible_python_interpreter": interpreter,
                }
            }
        }
    })
}

pub fn write_localhost(inventory_file: impl AsRef<Path>) -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(&load_localhost(None))?;
    std::fs::write(inventory_file, yaml)?;
    Ok(())
}
