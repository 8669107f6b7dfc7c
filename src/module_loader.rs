use std::path::{Path, PathBuf};

use crate::errors::FtlError;

/// Which execution surface a module targets: the conventional subprocess
/// contract, or the FTL-native `main(**args)` contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleKind {
    Ansible,
    Ftl,
}

/// The four calling conventions a module can follow. Classification drives
/// how arguments reach the module subprocess.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleStyle {
    /// Not valid UTF-8; executed directly with a JSON args file.
    Binary,
    /// Mentions `AnsibleModule(`; takes JSON args on stdin.
    NewStyle,
    /// Mentions `WANT_JSON`; takes a JSON args file path.
    WantJson,
    /// Anything else; takes a `k=v k=v` args file path.
    OldStyle,
}

impl ModuleStyle {
    /// Precedence is Binary > NewStyle > WantJson > OldStyle, so every byte
    /// sequence lands in exactly one style.
    pub fn classify(module: &[u8]) -> ModuleStyle {
        let text = match std::str::from_utf8(module) {
            Ok(text) => text,
            Err(_) => return ModuleStyle::Binary,
        };
        if text.contains("AnsibleModule(") {
            ModuleStyle::NewStyle
        } else if text.contains("WANT_JSON") {
            ModuleStyle::WantJson
        } else {
            ModuleStyle::OldStyle
        }
    }
}

/// Find a module by scanning the directory list in order: `<dir>/<name>.py`
/// first, then `<dir>/<name>` for suffix-less (usually binary) modules.
/// Empty directory entries are skipped rather than treated as errors.
pub fn find_module(module_dirs: &[PathBuf], module_name: &str) -> Option<PathBuf> {
    for dir in module_dirs {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(format!("{}.py", module_name));
        if candidate.exists() {
            return Some(candidate);
        }
    }
    for dir in module_dirs {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(module_name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

pub fn read_module(module_dirs: &[PathBuf], module_name: &str) -> anyhow::Result<Vec<u8>> {
    match find_module(module_dirs, module_name) {
        Some(path) => Ok(std::fs::read(path)?),
        None => Err(FtlError::ModuleNotFound(format!(
            "Cannot find {} in {:?}",
            module_name, module_dirs
        ))
        .into()),
    }
}

pub fn module_name_of(module_path: &Path) -> String {
    module_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
