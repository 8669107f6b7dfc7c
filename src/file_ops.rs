use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use openssh::Session;
use serde_json::{json, Map, Value};

use crate::gate_pool::GatePool;
use crate::inventory::{host_vars, unique_hosts};
use crate::ssh::connect_session;
use crate::transfer;

// Per-host file helpers. Each reuses the host's pooled gate connection when
// one exists and otherwise opens (and closes) a fresh session.

enum Lease {
    /// The session belongs to a gate that stays in the pool.
    Pooled,
    Fresh,
}

async fn lease_session(
    host_name: &str,
    host: &Map<String, Value>,
    pool: Option<&GatePool>,
) -> anyhow::Result<(Arc<Session>, Lease)> {
    if let Some(pool) = pool {
        if let Some(session) = pool.session_for(host_name).await {
            return Ok((session, Lease::Pooled));
        }
    }
    Ok((connect_session(host_name, host).await?, Lease::Fresh))
}

async fn end_lease(lease: Lease, session: Arc<Session>) {
    match lease {
        Lease::Pooled => drop(session),
        Lease::Fresh => {
            if let Ok(session) = Arc::try_unwrap(session) {
                let _ = session.close().await;
            }
        }
    }
}

async fn for_each_host<'a, F, Fut>(
    inventory: &Value,
    pool: Option<&'a GatePool>,
    op: F,
) -> anyhow::Result<Map<String, Value>>
where
    F: Fn(Arc<Session>, String, Map<String, Value>) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    let hosts = unique_hosts(inventory)?;
    let op = &op;
    let tasks = hosts.iter().map(|(host_name, host)| async move {
        let vars = host_vars(host);
        let (session, lease) = lease_session(host_name, &vars, pool).await?;
        let outcome = op(session.clone(), host_name.clone(), vars).await;
        end_lease(lease, session).await;
        outcome
    });

    let settled = join_all(tasks).await;
    let mut results = Map::new();
    for ((host_name, _), outcome) in hosts.iter().zip(settled) {
        let value = match outcome {
            Ok(()) => json!({ "changed": true }),
            Err(e) => json!({ "error": true, "msg": e.to_string() }),
        };
        results.insert(host_name.clone(), value);
    }
    Ok(results)
}

/// Create a directory (and parents) on every host.
pub async fn mkdir(
    inventory: &Value,
    pool: Option<&GatePool>,
    name: &str,
) -> anyhow::Result<Map<String, Value>> {
    for_each_host(inventory, pool, |session, _, _| async move {
        transfer::make_dirs(&session, name).await
    })
    .await
}

/// Copy a local file or directory tree to every host.
pub async fn copy(
    inventory: &Value,
    pool: Option<&GatePool>,
    src: &Path,
    dest: &str,
) -> anyhow::Result<Map<String, Value>> {
    for_each_host(inventory, pool, |session, _, _| async move {
        transfer::put_path(&session, src, dest).await
    })
    .await
}

/// Copy a remote file or directory tree from every host to the local side.
pub async fn copy_from(
    inventory: &Value,
    pool: Option<&GatePool>,
    src: &str,
    dest: &Path,
) -> anyhow::Result<Map<String, Value>> {
    for_each_host(inventory, pool, |session, _, _| async move {
        transfer::get_path(&session, src, dest).await
    })
    .await
}

/// Render `src` as a Jinja2-compatible template against each host's vars and
/// upload the rendered file to `dest` on that host.
pub async fn template(
    inventory: &Value,
    pool: Option<&GatePool>,
    src: &Path,
    dest: &str,
) -> anyhow::Result<Map<String, Value>> {
    let source = std::fs::read_to_string(src)?;
    let environment = minijinja::Environment::new();
    let environment = &environment;
    let source = &source;

    for_each_host(inventory, pool, |session, host_name, vars| async move {
        let rendered = environment
            .render_str(source, &vars)
            .map_err(|e| anyhow::anyhow!("rendering template for {}: {}", host_name, e))?;
        let staged = tempfile::NamedTempFile::new()?;
        std::fs::write(staged.path(), rendered.as_bytes())?;
        transfer::put_file(&session, staged.path(), dest).await
    })
    .await
}

pub fn mkdir_sync(
    inventory: &Value,
    pool: Option<&GatePool>,
    name: &str,
    handle: Option<tokio::runtime::Handle>,
) -> anyhow::Result<Map<String, Value>> {
    block_on(handle, mkdir(inventory, pool, name))
}

pub fn copy_sync(
    inventory: &Value,
    pool: Option<&GatePool>,
    src: &Path,
    dest: &str,
    handle: Option<tokio::runtime::Handle>,
) -> anyhow::Result<Map<String, Value>> {
    block_on(handle, copy(inventory, pool, src, dest))
}

pub fn copy_from_sync(
    inventory: &Value,
    pool: Option<&GatePool>,
    src: &str,
    dest: &Path,
    handle: Option<tokio::runtime::Handle>,
) -> anyhow::Result<Map<String, Value>> {
    block_on(handle, copy_from(inventory, pool, src, dest))
}

pub fn template_sync(
    inventory: &Value,
    pool: Option<&GatePool>,
    src: &Path,
    dest: &str,
    handle: Option<tokio::runtime::Handle>,
) -> anyhow::Result<Map<String, Value>> {
    block_on(handle, template(inventory, pool, src, dest))
}

fn block_on<T>(
    handle: Option<tokio::runtime::Handle>,
    future: impl std::future::Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match handle {
        Some(handle) => handle.block_on(future),
        None => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(future)
        }
    }
}
