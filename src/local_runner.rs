use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context};
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;

use crate::module_loader::ModuleStyle;

/// The driver carries no interpreter of its own, so local execution defaults
/// to whatever `python3` resolves to on PATH.
pub const DEFAULT_LOCAL_INTERPRETER: &str = "python3";

/// Driver-side runner for FTL-native modules: loads the file, calls
/// `main(**args)` and prints the JSON result. argv[1] is the module path,
/// argv[2] the JSON-encoded arguments.
const FTL_MODULE_SHIM: &str = r#"
import asyncio, inspect, json, runpy, sys
mod = runpy.run_path(sys.argv[1])
args = json.loads(sys.argv[2]) if len(sys.argv) > 2 else {}
result = mod["main"](**args)
if inspect.iscoroutine(result):
    result = asyncio.run(result)
print(json.dumps(result))
"#;

pub(crate) async fn exec_module(
    argv: &[String],
    stdin: Option<&[u8]>,
) -> anyhow::Result<std::process::Output> {
    let (program, args) = argv
        .split_first()
        .context("empty command line for module execution")?;
    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("spawning {}", program))?;
    if let Some(input) = stdin {
        let mut writer = child.stdin.take().context("child stdin unavailable")?;
        writer.write_all(input).await?;
        writer.shutdown().await?;
    }
    Ok(child.wait_with_output().await?)
}

fn interpreter_for(host: &Map<String, Value>) -> anyhow::Result<Vec<String>> {
    let interpreter = host
        .get("ansible_python_interpreter")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_LOCAL_INTERPRETER);
    Ok(shell_words::split(interpreter)
        .with_context(|| format!("parsing interpreter {}", interpreter))?)
}

pub(crate) fn old_style_args(module_args: &Map<String, Value>) -> String {
    module_args
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{}={}", k, s),
            other => format!("{}={}", k, other),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run a module on the driver host, choosing the argument delivery that its
/// calling convention expects. The module's merged stdout/stderr is parsed as
/// JSON; unparseable output becomes `{"error": <raw>}` rather than a failure.
pub async fn run_module_locally(
    host_name: &str,
    host: &Map<String, Value>,
    module_path: &Path,
    module_args: &Map<String, Value>,
) -> anyhow::Result<(String, Value)> {
    tracing::debug!(host_name, module = %module_path.display(), "run_module_locally");

    let tmp = tempfile::tempdir()?;
    let tmp_module = tmp.path().join("module.py");
    // fs::copy preserves the mode bits, which binary modules rely on.
    std::fs::copy(module_path, &tmp_module)?;
    let module_bytes = std::fs::read(&tmp_module)?;
    let interpreter = interpreter_for(host)?;

    let tmp_module_str = tmp_module.display().to_string();
    let args_file = tmp.path().join("args");
    let args_file_str = args_file.display().to_string();

    let output = match ModuleStyle::classify(&module_bytes) {
        ModuleStyle::Binary => {
            std::fs::write(&args_file, serde_json::to_string(module_args)?)?;
            exec_module(&[tmp_module_str, args_file_str], None).await?
        }
        ModuleStyle::NewStyle => {
            let stdin = serde_json::to_vec(&json!({ "ANSIBLE_MODULE_ARGS": module_args }))?;
            let mut argv = interpreter;
            argv.push(tmp_module_str);
            exec_module(&argv, Some(&stdin)).await?
        }
        ModuleStyle::WantJson => {
            std::fs::write(&args_file, serde_json::to_string(module_args)?)?;
            let mut argv = interpreter;
            argv.extend([tmp_module_str, args_file_str]);
            exec_module(&argv, None).await?
        }
        ModuleStyle::OldStyle => {
            std::fs::write(&args_file, old_style_args(module_args))?;
            let mut argv = interpreter;
            argv.extend([tmp_module_str, args_file_str]);
            exec_module(&argv, None).await?
        }
    };

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    match serde_json::from_slice::<Value>(&combined) {
        Ok(result) => Ok((host_name.to_string(), result)),
        Err(_) => Ok((
            host_name.to_string(),
            json!({ "error": String::from_utf8_lossy(&combined) }),
        )),
    }
}

/// Run an FTL-native module on the driver host: no args file, no stdin
/// convention. The module's `main` is called with the arguments and its
/// return value is the result.
pub async fn run_ftl_module_locally(
    host_name: &str,
    host: &Map<String, Value>,
    module_path: &Path,
    module_args: &Map<String, Value>,
) -> anyhow::Result<(String, Value)> {
    tracing::debug!(host_name, module = %module_path.display(), "run_ftl_module_locally");

    let mut argv = interpreter_for(host)?;
    argv.extend([
        "-c".to_string(),
        FTL_MODULE_SHIM.to_string(),
        module_path.display().to_string(),
        serde_json::to_string(module_args)?,
    ]);

    let output = exec_module(&argv, None).await?;
    if !output.status.success() {
        bail!(
            "ftl module {} failed: {}",
            module_path.display(),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    let result: Value = serde_json::from_slice(&output.stdout).with_context(|| {
        format!(
            "ftl module {} did not return JSON: {}",
            module_path.display(),
            String::from_utf8_lossy(&output.stdout)
        )
    })?;
    Ok((host_name.to_string(), result))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    fn localhost_vars() -> Map<String, Value> {
        match json!({"ansible_connection": "local", "ansible_python_interpreter": "python3"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn args(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    fn write_module(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn new_style_module_receives_args_on_stdin() {
        let tmp = tempfile::tempdir().unwrap();
        let module = write_module(
            tmp.path(),
            "echo.py",
            "# AnsibleModule(\nimport json, sys\nprint(json.dumps({\"input\": json.load(sys.stdin)}))\n",
        );
        let (host, result) =
            run_module_locally("localhost", &localhost_vars(), &module, &args(&[("k", "v")]))
                .await
                .unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(result["input"]["ANSIBLE_MODULE_ARGS"]["k"], "v");
    }

    #[tokio::test]
    async fn old_style_module_receives_kv_args_file() {
        let tmp = tempfile::tempdir().unwrap();
        let module = write_module(
            tmp.path(),
            "argtest.py",
            "import json, sys\nprint(json.dumps({\"more_args\": open(sys.argv[1]).read()}))\n",
        );
        let (_, result) = run_module_locally(
            "localhost",
            &localhost_vars(),
            &module,
            &args(&[("somekey", "somevalue")]),
        )
        .await
        .unwrap();
        assert_eq!(result["more_args"], "somekey=somevalue");
    }

    #[tokio::test]
    async fn want_json_module_receives_json_args_file() {
        let tmp = tempfile::tempdir().unwrap();
        let module = write_module(
            tmp.path(),
            "wj.py",
            "# WANT_JSON\nimport json, sys\nprint(json.dumps({\"got\": json.load(open(sys.argv[1]))}))\n",
        );
        let (_, result) = run_module_locally(
            "localhost",
            &localhost_vars(),
            &module,
            &args(&[("somekey", "somevalue")]),
        )
        .await
        .unwrap();
        assert_eq!(result["got"]["somekey"], "somevalue");
    }

    #[tokio::test]
    async fn non_json_output_becomes_error_value() {
        let tmp = tempfile::tempdir().unwrap();
        let module = write_module(tmp.path(), "noise.py", "print('this is not json')\n");
        let (_, result) = run_module_locally(
            "localhost",
            &localhost_vars(),
            &module,
            &Map::new(),
        )
        .await
        .unwrap();
        assert!(result["error"]
            .as_str()
            .unwrap()
            .contains("this is not json"));
    }

    #[tokio::test]
    async fn ftl_module_main_return_value_is_the_result() {
        let tmp = tempfile::tempdir().unwrap();
        let module = write_module(
            tmp.path(),
            "ftl_argtest.py",
            "async def main(**kwargs):\n    return {\"kwargs\": kwargs}\n",
        );
        let (_, result) = run_ftl_module_locally(
            "localhost",
            &localhost_vars(),
            &module,
            &args(&[("somekey", "somevalue")]),
        )
        .await
        .unwrap();
        assert_eq!(result["kwargs"]["somekey"], "somevalue");
    }

    #[tokio::test]
    async fn ftl_module_plain_function_is_not_awaited() {
        let tmp = tempfile::tempdir().unwrap();
        let module = write_module(
            tmp.path(),
            "sync_main.py",
            "def main(**kwargs):\n    return {\"ok\": True}\n",
        );
        let (_, result) =
            run_ftl_module_locally("localhost", &localhost_vars(), &module, &Map::new())
                .await
                .unwrap();
        assert_eq!(result["ok"], true);
    }

    #[test]
    fn old_style_args_stringify_non_strings() {
        let mut module_args = Map::new();
        module_args.insert("name".into(), Value::String("web".into()));
        module_args.insert("port".into(), json!(8080));
        assert_eq!(old_style_args(&module_args), "name=web port=8080");
    }
}
