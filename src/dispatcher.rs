use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use serde_json::{json, Map, Value};

use crate::errors::FtlError;
use crate::gate_builder::{GateBuilder, PrebuiltGate};
use crate::gate_pool::GatePool;
use crate::inventory::{host_vars, unique_hosts};
use crate::local_runner::{run_ftl_module_locally, run_module_locally};
use crate::module_loader::{find_module, ModuleKind};
use crate::refs::{deref, ArgValue};
use crate::ssh::run_module_remotely;

/// Tasks run in windows of this many hosts; the next window starts only when
/// the whole previous one has settled. Bounding concurrency this way reduces
/// contention for remote connections; it roughly doubles throughput around a
/// thousand hosts compared to unbounded dispatch.
const CHUNK_SIZE: usize = 10;

/// Everything optional about one fan-out invocation.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Modules to bundle into the gate besides the one being run.
    pub modules: Vec<String>,
    /// Python package specs pip-installed into the gate.
    pub dependencies: Vec<String>,
    /// Arguments delivered to every host; values may be lazy references.
    pub module_args: Vec<(String, ArgValue)>,
    /// Per-host argument overrides, highest precedence.
    pub host_args: HashMap<String, Vec<(String, ArgValue)>>,
    /// A caller-supplied artifact that bypasses the gate builder.
    pub gate: Option<PrebuiltGate>,
    /// Interpreter used for pip during gate builds; empty means the default.
    pub local_interpreter: String,
    /// Gate cache directory override; `None` means `~/.ftl`.
    pub cache_dir: Option<PathBuf>,
}

/// Run a conventional module across every host in the inventory.
pub async fn run_module(
    inventory: &Value,
    module_dirs: &[PathBuf],
    module_name: &str,
    options: RunOptions,
    pool: Option<&GatePool>,
) -> anyhow::Result<Map<String, Value>> {
    run_module_impl(
        inventory,
        module_dirs,
        module_name,
        options,
        pool,
        ModuleKind::Ansible,
    )
    .await
}

/// Run an FTL-native module (`main(**args)` contract) across every host.
pub async fn run_ftl_module(
    inventory: &Value,
    module_dirs: &[PathBuf],
    module_name: &str,
    options: RunOptions,
    pool: Option<&GatePool>,
) -> anyhow::Result<Map<String, Value>> {
    run_module_impl(
        inventory,
        module_dirs,
        module_name,
        options,
        pool,
        ModuleKind::Ftl,
    )
    .await
}

/// Blocking façade. With a runtime handle the work is submitted to that
/// runtime, so a pool can keep its gates alive across calls; without one a
/// throwaway runtime is built, which makes a pool useless beyond this call.
pub fn run_module_sync(
    inventory: &Value,
    module_dirs: &[PathBuf],
    module_name: &str,
    options: RunOptions,
    pool: Option<&GatePool>,
    handle: Option<tokio::runtime::Handle>,
) -> anyhow::Result<Map<String, Value>> {
    match handle {
        Some(handle) => {
            handle.block_on(run_module(inventory, module_dirs, module_name, options, pool))
        }
        None => {
            if pool.is_some() {
                tracing::warn!(
                    "gate pool without a runtime handle: gates die with this call's runtime"
                );
            }
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_module(inventory, module_dirs, module_name, options, pool))
        }
    }
}

async fn run_module_impl(
    inventory: &Value,
    module_dirs: &[PathBuf],
    module_name: &str,
    options: RunOptions,
    pool: Option<&GatePool>,
    kind: ModuleKind,
) -> anyhow::Result<Map<String, Value>> {
    let module_path = find_module(module_dirs, module_name).ok_or_else(|| {
        FtlError::ModuleNotFound(format!(
            "Module {} not found in {:?}",
            module_name, module_dirs
        ))
    })?;

    let hosts = unique_hosts(inventory)?;

    let mut modules = options.modules.clone();
    if !modules.iter().any(|m| m == module_name) {
        modules.push(module_name.to_string());
    }
    let builder = GateBuilder {
        modules,
        module_dirs: module_dirs.to_vec(),
        dependencies: options.dependencies.clone(),
        local_interpreter: options.local_interpreter.clone(),
        cache_dir: options.cache_dir.clone(),
        prebuilt: options.gate.clone(),
    };

    // References are supported at the top level of argument values only.
    let has_refs = options.module_args.iter().any(|(_, v)| v.is_ref());

    // Without refs or host overrides every host sees the same arguments, so
    // resolve them once and share.
    let shared_args: Option<Arc<Map<String, Value>>> =
        if !has_refs && options.host_args.is_empty() {
            let mut resolved = Map::new();
            for (name, value) in &options.module_args {
                resolved.insert(name.clone(), deref(&Map::new(), value)?);
            }
            Some(Arc::new(resolved))
        } else {
            None
        };

    let host_list: Vec<(String, Value)> = hosts.into_iter().collect();
    let mut results = Map::new();

    for chunk in host_list.chunks(CHUNK_SIZE) {
        let tasks = chunk.iter().map(|(host_name, host)| {
            let vars = host_vars(host);
            let builder = &builder;
            let options = &options;
            let shared_args = shared_args.clone();
            let module_path = module_path.as_path();
            async move {
                let merged_args = match &shared_args {
                    Some(shared) => shared.clone(),
                    None => Arc::new(merge_args(&vars, options, host_name)?),
                };
                dispatch_one(host_name, &vars, module_path, &merged_args, kind, pool, builder)
                    .await
            }
        });

        // The whole chunk settles before the next one starts; failures are
        // captured as that host's result, never raised.
        let settled = join_all(tasks).await;
        for ((host_name, _), outcome) in chunk.iter().zip(settled) {
            match outcome {
                Ok((host_name, result)) => {
                    results.insert(host_name, result);
                }
                Err(e) => {
                    results.insert(
                        host_name.clone(),
                        json!({ "error": true, "msg": e.to_string() }),
                    );
                }
            }
        }
    }

    Ok(results)
}

/// Per-host argument resolution: literal args first (references resolved
/// against this host's vars), then host-specific overrides on top.
fn merge_args(
    vars: &Map<String, Value>,
    options: &RunOptions,
    host_name: &str,
) -> anyhow::Result<Map<String, Value>> {
    let mut merged = Map::new();
    for (name, value) in &options.module_args {
        merged.insert(name.clone(), deref(vars, value)?);
    }
    if let Some(overrides) = options.host_args.get(host_name) {
        for (name, value) in overrides {
            merged.insert(name.clone(), deref(vars, value)?);
        }
    }
    Ok(merged)
}

async fn dispatch_one(
    host_name: &str,
    vars: &Map<String, Value>,
    module_path: &Path,
    merged_args: &Map<String, Value>,
    kind: ModuleKind,
    pool: Option<&GatePool>,
    builder: &GateBuilder,
) -> anyhow::Result<(String, Value)> {
    let local = vars
        .get("ansible_connection")
        .and_then(Value::as_str)
        .map(|c| c == "local")
        .unwrap_or(false);
    if local {
        match kind {
            ModuleKind::Ansible => {
                run_module_locally(host_name, vars, module_path, merged_args).await
            }
            ModuleKind::Ftl => {
                run_ftl_module_locally(host_name, vars, module_path, merged_args).await
            }
        }
    } else {
        run_module_remotely(host_name, vars, module_path, merged_args, kind, pool, builder).await
    }
}
