use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use base64::Engine;
use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use serde_json::{json, Map, Value};
use tokio::io::AsyncReadExt;

use crate::errors::{is_transport_error, FtlError};
use crate::gate_builder::GateBuilder;
use crate::gate_pool::{Closeable, GatePool};
use crate::message::{read_message, send_message, send_message_best_effort, GateMessage};
use crate::module_loader::{module_name_of, ModuleKind};

/// Remote targets get a sensible system python unless the inventory says
/// otherwise.
pub const DEFAULT_REMOTE_INTERPRETER: &str = "/usr/bin/python3";

const REMOTE_TEMP_DIR: &str = "/tmp";

/// One live helper process on a target host, reachable through the captured
/// stdio of the spawned archive. Ends at orderly shutdown or transport failure.
pub struct Gate {
    pub(crate) session: Arc<Session>,
    pub(crate) stdin: openssh::ChildStdin,
    pub(crate) stdout: openssh::ChildStdout,
    pub(crate) stderr: openssh::ChildStderr,
    pub temp_dir: String,
}

#[async_trait::async_trait]
impl Closeable for Gate {
    async fn close(mut self) {
        let _ = send_message_best_effort(&mut self.stdin, "Shutdown", &json!({})).await;
        let mut tail = Vec::new();
        let _ = tokio::time::timeout(
            Duration::from_secs(2),
            self.stderr.read_to_end(&mut tail),
        )
        .await;
        if !tail.is_empty() {
            tracing::debug!(stderr = %String::from_utf8_lossy(&tail), "gate exit output");
        }
        if let Ok(session) = Arc::try_unwrap(self.session) {
            let _ = session.close().await;
        }
    }
}

#[derive(Clone, Debug)]
struct SshParams {
    host: String,
    port: u16,
    user: String,
    interpreter: String,
}

fn current_user() -> String {
    for var in ["LOGNAME", "USER", "LNAME", "USERNAME"] {
        if let Ok(user) = std::env::var(var) {
            if !user.is_empty() {
                return user;
            }
        }
    }
    "root".to_string()
}

fn port_of(host: &Map<String, Value>) -> u16 {
    match host.get("ansible_port") {
        Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()).unwrap_or(22),
        Some(Value::String(s)) => s.parse().unwrap_or(22),
        _ => 22,
    }
}

fn ssh_params(host_name: &str, host: &Map<String, Value>) -> SshParams {
    let ssh_host = host
        .get("ansible_host")
        .and_then(Value::as_str)
        .unwrap_or(host_name)
        .to_string();
    let user = host
        .get("ansible_user")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(current_user);
    let interpreter = host
        .get("ansible_python_interpreter")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_REMOTE_INTERPRETER)
        .to_string();
    SshParams {
        host: ssh_host,
        port: port_of(host),
        user,
        interpreter,
    }
}

async fn connect(params: &SshParams) -> anyhow::Result<Arc<Session>> {
    tracing::info!(
        host = %params.host,
        port = params.port,
        user = %params.user,
        "connecting"
    );
    let mut builder = SessionBuilder::default();
    builder
        .user(params.user.clone())
        .port(params.port)
        .known_hosts_check(KnownHosts::Accept)
        .connect_timeout(Duration::from_secs(3600));
    let session = builder
        .connect(&params.host)
        .await
        .with_context(|| format!("ssh connection to {} failed", params.host))?;
    Ok(Arc::new(session))
}

/// Open a plain session for file operations, without any gate involvement.
pub(crate) async fn connect_session(
    host_name: &str,
    host: &Map<String, Value>,
) -> anyhow::Result<Arc<Session>> {
    connect(&ssh_params(host_name, host)).await
}

/// Probe the remote interpreter. Non-interactive shells must be silent: the
/// only acceptable output is a single `Python X.Y.Z` line, and the major
/// version must be at least 3.
async fn check_version(session: &Session, interpreter: &str) -> anyhow::Result<()> {
    let output = session
        .command("sh")
        .arg("-c")
        .arg(format!("{} --version", interpreter))
        .output()
        .await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.trim().is_empty() {
        bail!(
            "interpreter version probe produced no output: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.strip_prefix("Python ") {
            Some(version) => {
                let major: u32 = version
                    .split('.')
                    .next()
                    .unwrap_or("")
                    .parse()
                    .with_context(|| format!("unparseable interpreter version {}", version))?;
                if major < 3 {
                    bail!("Python 3 or greater required for interpreter");
                }
            }
            None => bail!("Ensure that non-interactive shells emit no text: {}", line),
        }
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UploadAction {
    Send,
    Resend,
    Reuse,
}

/// The content-addressed upload decision: absent means send, size zero means
/// a half-transfer to recover from, anything else is reusable as-is.
fn upload_action(remote_size: Option<u64>) -> UploadAction {
    match remote_size {
        Some(size) if size > 0 => UploadAction::Reuse,
        Some(_) => UploadAction::Resend,
        None => UploadAction::Send,
    }
}

/// Make sure the gate artifact for this interpreter is present on the target.
/// The upload is content-addressed and idempotent: present with a non-zero
/// size means another dispatcher already delivered it.
async fn send_gate(
    builder: &GateBuilder,
    session: &Session,
    temp_dir: &str,
    interpreter: &str,
) -> anyhow::Result<String> {
    let (gate_path, gate_hash) = builder.build(interpreter).await?;
    let gate_file = format!("{}/ftl_gate_{}.pyz", temp_dir, gate_hash);

    match upload_action(crate::transfer::file_size(session, &gate_file).await?) {
        UploadAction::Reuse => {
            tracing::info!(gate_file = %gate_file, "reusing gate already on target");
        }
        action => {
            if action == UploadAction::Resend {
                tracing::info!(gate_file = %gate_file, "resending half-transferred gate");
            } else {
                tracing::info!(gate_file = %gate_file, "sending gate");
            }
            crate::transfer::put_file(session, &gate_path, &gate_file).await?;
            crate::transfer::chmod(session, "700", &gate_file).await?;
        }
    }
    Ok(gate_file)
}

/// Spawn the gate process and complete the `Hello` handshake.
async fn open_gate(session: &Arc<Session>, gate_file: &str) -> anyhow::Result<Gate> {
    let mut child = session
        .command(gate_file)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .await?;
    let mut stdin = child.stdin().take().context("gate stdin unavailable")?;
    let mut stdout = child.stdout().take().context("gate stdout unavailable")?;
    let mut stderr = child.stderr().take().context("gate stderr unavailable")?;
    // The child handle borrows the session; the streams are all we need from
    // here on, so detach it and let the process run.
    child.disconnect().await?;

    send_message(&mut stdin, "Hello", &json!({})).await?;
    match read_message(&mut stdout).await? {
        Some((tag, _)) if tag == "Hello" => {}
        reply => {
            let mut noise = Vec::new();
            let _ = tokio::time::timeout(
                Duration::from_secs(5),
                stderr.read_to_end(&mut noise),
            )
            .await;
            let detail = if noise.is_empty() {
                format!("unexpected reply {:?}", reply)
            } else {
                String::from_utf8_lossy(&noise).into_owned()
            };
            tracing::error!(detail = %detail, "gate handshake failed");
            return Err(FtlError::Handshake(detail).into());
        }
    }

    Ok(Gate {
        session: session.clone(),
        stdin,
        stdout,
        stderr,
        temp_dir: REMOTE_TEMP_DIR.to_string(),
    })
}

/// Full connect sequence with the evict-and-retry loop: transport-class
/// failures free a pooled connection and try again, anything else propagates.
async fn connect_gate(
    builder: &GateBuilder,
    params: &SshParams,
    pool: Option<&GatePool>,
) -> anyhow::Result<Gate> {
    loop {
        let attempt = async {
            let session = connect(params).await?;
            check_version(&session, &params.interpreter).await?;
            let gate_file =
                send_gate(builder, &session, REMOTE_TEMP_DIR, &params.interpreter).await?;
            open_gate(&session, &gate_file).await
        }
        .await;

        match attempt {
            Ok(gate) => return Ok(gate),
            Err(e) if is_transport_error(&e) => {
                tracing::info!(host = %params.host, error = %e, "retry connection");
                if let Some(pool) = pool {
                    pool.evict_one().await;
                }
                continue;
            }
            Err(e) => {
                tracing::error!(host = %params.host, error = %e, "gate connection failed");
                return Err(e);
            }
        }
    }
}

fn b64_module(module_bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(module_bytes)
}

/// Interpret a gate reply as a host result. `ModuleNotFound` and unknown tags
/// surface as typed errors; a vanished stream is a transport error so the
/// caller's retry loop can take over.
fn process_module_result(message: Option<GateMessage>) -> anyhow::Result<Value> {
    let (msg_type, body) = match message {
        Some(message) => message,
        None => return Err(FtlError::GateEof.into()),
    };
    match msg_type.as_str() {
        "ModuleResult" => {
            let stdout = body.get("stdout").and_then(Value::as_str).unwrap_or("");
            if !stdout.is_empty() {
                Ok(serde_json::from_str(stdout)
                    .with_context(|| format!("module produced unparseable output: {}", stdout))?)
            } else {
                let stderr = body.get("stderr").cloned().unwrap_or(Value::Null);
                Ok(json!({ "error": { "message": stderr } }))
            }
        }
        "FTLModuleResult" => Ok(body.get("result").cloned().unwrap_or(Value::Null)),
        "GateSystemError" => Ok(json!({
            "error": { "error_type": "GateSystemError", "message": body }
        })),
        "ModuleNotFound" => {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("module not found in gate")
                .to_string();
            Err(FtlError::ModuleNotFound(message).into())
        }
        other => Err(FtlError::UnsupportedMessage(other.to_string()).into()),
    }
}

/// Ask the gate to run a module by name, hoping it lives inside the archive;
/// fall back to shipping the bytes inline when the gate does not have it.
async fn run_module_through_gate(
    gate: &mut Gate,
    module_path: &Path,
    module_name: &str,
    module_args: &Map<String, Value>,
) -> anyhow::Result<Value> {
    send_message_best_effort(
        &mut gate.stdin,
        "Module",
        &json!({ "module_name": module_name, "module_args": module_args }),
    )
    .await?;
    match process_module_result(read_message(&mut gate.stdout).await?) {
        Err(e) if matches!(e.downcast_ref::<FtlError>(), Some(FtlError::ModuleNotFound(_))) => {
            let module_bytes = tokio::fs::read(module_path).await?;
            send_message_best_effort(
                &mut gate.stdin,
                "Module",
                &json!({
                    "module": b64_module(&module_bytes),
                    "module_name": module_name,
                    "module_args": module_args,
                }),
            )
            .await?;
            process_module_result(read_message(&mut gate.stdout).await?)
        }
        result => result,
    }
}

/// FTL-native modules always travel inline; the gate loads them and calls
/// `main` directly.
async fn run_ftl_module_through_gate(
    gate: &mut Gate,
    module_path: &Path,
    module_name: &str,
    module_args: &Map<String, Value>,
) -> anyhow::Result<Value> {
    let module_bytes = tokio::fs::read(module_path).await?;
    send_message_best_effort(
        &mut gate.stdin,
        "FTLModule",
        &json!({
            "module": b64_module(&module_bytes),
            "module_name": module_name,
            "module_args": module_args,
        }),
    )
    .await?;
    process_module_result(read_message(&mut gate.stdout).await?)
}

/// Run one module on one remote host: acquire or build the host's gate,
/// dispatch, and either return the gate to the pool or shut it down. A
/// transport failure evicts a pool victim and restarts the whole sequence.
pub async fn run_module_remotely(
    host_name: &str,
    host: &Map<String, Value>,
    module_path: &Path,
    module_args: &Map<String, Value>,
    kind: ModuleKind,
    pool: Option<&GatePool>,
    builder: &GateBuilder,
) -> anyhow::Result<(String, Value)> {
    let module_name = module_name_of(module_path);
    let params = ssh_params(host_name, host);

    loop {
        let pooled = match pool {
            Some(pool) => pool.acquire(host_name).await,
            None => None,
        };
        let mut gate = match pooled {
            Some(gate) => gate,
            None => connect_gate(builder, &params, pool).await?,
        };

        let outcome = match kind {
            ModuleKind::Ansible => {
                run_module_through_gate(&mut gate, module_path, &module_name, module_args).await
            }
            ModuleKind::Ftl => {
                run_ftl_module_through_gate(&mut gate, module_path, &module_name, module_args)
                    .await
            }
        };

        match outcome {
            Ok(result) => {
                stash_gate(pool, host_name, gate).await;
                return Ok((host_name.to_string(), result));
            }
            Err(e) if is_transport_error(&e) => {
                tracing::info!(host_name, error = %e, "retry connection");
                gate.close().await;
                if let Some(pool) = pool {
                    pool.evict_one().await;
                }
                continue;
            }
            Err(e) => {
                stash_gate(pool, host_name, gate).await;
                return Err(e);
            }
        }
    }
}

async fn stash_gate(pool: Option<&GatePool>, host_name: &str, gate: Gate) {
    match pool {
        Some(pool) => pool.release(host_name, gate).await,
        None => gate.close().await,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn ssh_params_fall_back_to_host_name_and_defaults() {
        let params = ssh_params("web1", &Map::new());
        assert_eq!(params.host, "web1");
        assert_eq!(params.port, 22);
        assert_eq!(params.interpreter, DEFAULT_REMOTE_INTERPRETER);
    }

    #[test]
    fn ssh_params_read_inventory_overrides() {
        let params = ssh_params(
            "web1",
            &vars(json!({
                "ansible_host": "10.1.2.3",
                "ansible_port": 2222,
                "ansible_user": "deploy",
                "ansible_python_interpreter": "/opt/python3/bin/python3",
            })),
        );
        assert_eq!(params.host, "10.1.2.3");
        assert_eq!(params.port, 2222);
        assert_eq!(params.user, "deploy");
        assert_eq!(params.interpreter, "/opt/python3/bin/python3");
    }

    #[test]
    fn port_accepts_strings_too() {
        assert_eq!(port_of(&vars(json!({"ansible_port": "2200"}))), 2200);
        assert_eq!(port_of(&vars(json!({"ansible_port": "junk"}))), 22);
    }

    #[test]
    fn absent_gate_is_sent() {
        assert_eq!(upload_action(None), UploadAction::Send);
    }

    #[test]
    fn half_transferred_gate_is_resent() {
        assert_eq!(upload_action(Some(0)), UploadAction::Resend);
    }

    #[test]
    fn delivered_gate_is_reused() {
        assert_eq!(upload_action(Some(1)), UploadAction::Reuse);
        assert_eq!(upload_action(Some(1_048_576)), UploadAction::Reuse);
    }

    #[test]
    fn module_result_stdout_is_decoded_as_json() {
        let result = process_module_result(Some((
            "ModuleResult".into(),
            json!({"stdout": "{\"changed\": true}", "stderr": ""}),
        )))
        .unwrap();
        assert_eq!(result, json!({"changed": true}));
    }

    #[test]
    fn module_result_empty_stdout_surfaces_stderr() {
        let result = process_module_result(Some((
            "ModuleResult".into(),
            json!({"stdout": "", "stderr": "Traceback: boom"}),
        )))
        .unwrap();
        assert_eq!(result["error"]["message"], "Traceback: boom");
    }

    #[test]
    fn ftl_module_result_passes_through() {
        let result = process_module_result(Some((
            "FTLModuleResult".into(),
            json!({"result": {"kwargs": {"a": 1}}}),
        )))
        .unwrap();
        assert_eq!(result["kwargs"]["a"], 1);
    }

    #[test]
    fn gate_system_error_becomes_an_error_value() {
        let result = process_module_result(Some((
            "GateSystemError".into(),
            json!({"message": "Exception ... traceback ..."}),
        )))
        .unwrap();
        assert_eq!(result["error"]["error_type"], "GateSystemError");
    }

    #[test]
    fn module_not_found_raises_by_type() {
        let err = process_module_result(Some((
            "ModuleNotFound".into(),
            json!({"message": "Module argtest not found in gate bundle."}),
        )))
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FtlError>(),
            Some(FtlError::ModuleNotFound(_))
        ));
    }

    #[test]
    fn eof_is_a_transport_error() {
        let err = process_module_result(None).unwrap_err();
        assert!(is_transport_error(&err));
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let err = process_module_result(Some(("Surprise".into(), json!({})))).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FtlError>(),
            Some(FtlError::UnsupportedMessage(_))
        ));
    }
}
