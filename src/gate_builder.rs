use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use sha2::{Digest, Sha256};

use crate::errors::FtlError;
use crate::module_loader::{find_module, read_module};

/// The helper runtime packed into every gate archive.
const GATE_MAIN_PY: &str = include_str!("ftl_gate/__main__.py");

/// Everything the remote transport needs to materialize a gate artifact for
/// one target interpreter. Cloned freely into per-host tasks.
#[derive(Clone, Debug, Default)]
pub struct GateBuilder {
    pub modules: Vec<String>,
    pub module_dirs: Vec<PathBuf>,
    pub dependencies: Vec<String>,
    pub local_interpreter: String,
    pub cache_dir: Option<PathBuf>,
    pub prebuilt: Option<PrebuiltGate>,
}

/// A caller-supplied, already-built artifact that short-circuits the builder.
#[derive(Clone, Debug)]
pub struct PrebuiltGate {
    pub path: PathBuf,
    pub hash: String,
}

impl GateBuilder {
    pub async fn build(&self, interpreter: &str) -> anyhow::Result<(PathBuf, String)> {
        if let Some(prebuilt) = &self.prebuilt {
            return Ok((prebuilt.path.clone(), prebuilt.hash.clone()));
        }
        let local_interpreter = if self.local_interpreter.is_empty() {
            crate::local_runner::DEFAULT_LOCAL_INTERPRETER
        } else {
            &self.local_interpreter
        };
        build_ftl_gate(
            &self.modules,
            &self.module_dirs,
            &self.dependencies,
            interpreter,
            local_interpreter,
            self.cache_dir.as_deref(),
        )
        .await
    }
}

fn ensure_directory(dir: &Path) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok(dir.to_path_buf())
}

fn default_cache_dir() -> anyhow::Result<PathBuf> {
    let home = dirs::home_dir().context("cannot determine home directory for the gate cache")?;
    Ok(home.join(".ftl"))
}

/// The gate hash covers every build input positionally: module names, module
/// dirs, dependency specs, then the target interpreter. The interpreter path
/// is normalized (trailing separators stripped) so equivalent spellings share
/// a cache entry.
pub fn gate_hash(
    modules: &[String],
    module_dirs: &[PathBuf],
    dependencies: &[String],
    interpreter: &str,
) -> String {
    let mut hasher = Sha256::new();
    for module in modules {
        hasher.update(module.as_bytes());
    }
    for dir in module_dirs {
        hasher.update(dir.to_string_lossy().as_bytes());
    }
    for dep in dependencies {
        hasher.update(dep.as_bytes());
    }
    hasher.update(interpreter.trim_end_matches('/').as_bytes());
    hex::encode(hasher.finalize())
}

/// Assemble helper runtime + modules + pip-installed dependencies into a
/// single executable archive named by the hash of its inputs. A cache hit
/// returns without building anything.
pub async fn build_ftl_gate(
    modules: &[String],
    module_dirs: &[PathBuf],
    dependencies: &[String],
    interpreter: &str,
    local_interpreter: &str,
    cache_dir: Option<&Path>,
) -> anyhow::Result<(PathBuf, String)> {
    tracing::debug!(?modules, ?module_dirs, ?dependencies, interpreter, "build_ftl_gate");

    let cache = match cache_dir {
        Some(dir) => ensure_directory(dir)?,
        None => ensure_directory(&default_cache_dir()?)?,
    };

    let hash = gate_hash(modules, module_dirs, dependencies, interpreter);
    let cached_gate = cache.join(format!("ftl_gate_{}.pyz", hash));
    if cached_gate.exists() {
        tracing::info!(gate = %cached_gate.display(), "reusing cached gate");
        return Ok((cached_gate, hash));
    }

    let scratch = tempfile::tempdir()?;
    let gate_dir = scratch.path().join("ftl_gate");
    fs::create_dir(&gate_dir)?;
    fs::write(gate_dir.join("__main__.py"), GATE_MAIN_PY)?;

    let bundled_modules = gate_dir.join("ftl_gate");
    fs::create_dir_all(&bundled_modules)?;
    fs::write(bundled_modules.join("__init__.py"), "")?;

    for module in modules {
        let module_path = find_module(module_dirs, module).ok_or_else(|| {
            FtlError::ModuleNotFound(format!("Cannot find {} in {:?}", module, module_dirs))
        })?;
        let file_name = module_path
            .file_name()
            .with_context(|| format!("module path {} has no file name", module_path.display()))?;
        fs::write(
            bundled_modules.join(file_name),
            read_module(module_dirs, module)?,
        )?;
    }

    if !dependencies.is_empty() {
        let requirements = scratch.path().join("requirements.txt");
        fs::write(&requirements, dependencies.join("\n"))?;

        let mut argv = shell_words::split(local_interpreter)
            .with_context(|| format!("parsing interpreter {}", local_interpreter))?;
        argv.extend([
            "-m".to_string(),
            "pip".to_string(),
            "install".to_string(),
            "-r".to_string(),
            requirements.display().to_string(),
            "--target".to_string(),
            gate_dir.display().to_string(),
        ]);
        tracing::debug!(command = %argv.join(" "), "installing gate dependencies");
        let output = crate::local_runner::exec_module(&argv, None).await?;
        if !output.status.success() {
            bail!(
                "pip install of gate dependencies failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
    }

    let archive = scratch.path().join("ftl_gate.pyz");
    write_zipapp(&gate_dir, &archive, interpreter)?;

    // Content-addressed name, so concurrent builders of the same inputs race
    // harmlessly on this final rename.
    let staged = tempfile::NamedTempFile::new_in(&cache)?;
    fs::copy(&archive, staged.path())?;
    staged
        .persist(&cached_gate)
        .map_err(|e| anyhow::anyhow!("caching gate artifact: {}", e))?;
    fs::set_permissions(&cached_gate, fs::Permissions::from_mode(0o755))?;

    Ok((cached_gate, hash))
}

/// An executable archive is a shebang line for the target interpreter
/// followed by a zip of the gate directory. Entry timestamps are pinned so
/// identical inputs produce bit-identical artifacts.
fn write_zipapp(gate_dir: &Path, archive: &Path, interpreter: &str) -> anyhow::Result<()> {
    let mut file = fs::File::create(archive)?;
    writeln!(file, "#!{}", interpreter)?;

    let options = zip::write::SimpleFileOptions::default()
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);
    let mut writer = zip::ZipWriter::new(file);

    let mut entries: Vec<_> = walkdir::WalkDir::new(gate_dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .collect::<Result<_, _>>()?;
    entries.sort_by(|a, b| a.path().cmp(b.path()));

    for entry in entries {
        let relative = entry
            .path()
            .strip_prefix(gate_dir)?
            .to_string_lossy()
            .replace('\\', "/");
        if entry.file_type().is_dir() {
            writer.add_directory(relative, options)?;
        } else {
            writer.start_file(relative, options)?;
            writer.write_all(&fs::read(entry.path())?)?;
        }
    }
    writer.finish()?;

    let mut perms = fs::metadata(archive)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(archive, perms)?;
    Ok(())
}

/// Remove the gate cache. Guarded so nothing outside a `.ftl` directory can
/// ever be deleted.
pub fn clean_cache(cache_dir: Option<&Path>) -> anyhow::Result<()> {
    let cache = match cache_dir {
        Some(dir) => dir.to_path_buf(),
        None => default_cache_dir()?,
    };
    if cache.is_dir() && cache.to_string_lossy().contains(".ftl") {
        fs::remove_dir_all(&cache)?;
    }
    Ok(())
}

/// Remove stale `/tmp/ftl-*` scratch directories left by interrupted runs.
pub fn clean_tmp() -> anyhow::Result<()> {
    for entry in fs::read_dir("/tmp")? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("ftl-") && entry.path().is_dir() {
            fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn test_modules_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("testdata")
            .join("modules")
    }

    #[test]
    fn hash_is_deterministic() {
        let dirs = vec![PathBuf::from("./modules")];
        let a = gate_hash(&["argtest".into()], &dirs, &[], "/usr/bin/python3");
        let b = gate_hash(&["argtest".into()], &dirs, &[], "/usr/bin/python3");
        assert_eq!(a, b);
    }

    #[test]
    fn hash_depends_on_list_order() {
        let dirs = vec![PathBuf::from("./modules")];
        let a = gate_hash(&["a".into(), "b".into()], &dirs, &[], "/usr/bin/python3");
        let b = gate_hash(&["b".into(), "a".into()], &dirs, &[], "/usr/bin/python3");
        assert_ne!(a, b);
    }

    #[test]
    fn hash_covers_every_input() {
        let dirs = vec![PathBuf::from("./modules")];
        let base = gate_hash(&["argtest".into()], &dirs, &[], "/usr/bin/python3");
        assert_ne!(
            base,
            gate_hash(&["other".into()], &dirs, &[], "/usr/bin/python3")
        );
        assert_ne!(
            base,
            gate_hash(&["argtest".into()], &[PathBuf::from("./elsewhere")], &[], "/usr/bin/python3")
        );
        assert_ne!(
            base,
            gate_hash(&["argtest".into()], &dirs, &["requests".into()], "/usr/bin/python3")
        );
        assert_ne!(
            base,
            gate_hash(&["argtest".into()], &dirs, &[], "/opt/python3")
        );
    }

    #[test]
    fn hash_normalizes_trailing_interpreter_separator() {
        let dirs = vec![PathBuf::from("./modules")];
        assert_eq!(
            gate_hash(&[], &dirs, &[], "/usr/bin/python3"),
            gate_hash(&[], &dirs, &[], "/usr/bin/python3/")
        );
    }

    #[tokio::test]
    async fn builds_a_shebanged_archive_with_modules_inside() {
        let cache = tempfile::tempdir().unwrap();
        let (path, hash) = build_ftl_gate(
            &["argtest".into()],
            &[test_modules_dir()],
            &[],
            "/usr/bin/python3",
            "python3",
            Some(cache.path()),
        )
        .await
        .unwrap();

        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            format!("ftl_gate_{}.pyz", hash)
        );
        let bytes = fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"#!/usr/bin/python3\n"));

        let mut archive = zip::ZipArchive::new(fs::File::open(&path).unwrap()).unwrap();
        assert!(archive.by_name("__main__.py").is_ok());
        assert!(archive.by_name("ftl_gate/__init__.py").is_ok());
        assert!(archive.by_name("ftl_gate/argtest.py").is_ok());
    }

    #[tokio::test]
    async fn second_build_is_a_cache_hit() {
        let cache = tempfile::tempdir().unwrap();
        let inputs = (
            vec!["argtest".to_string()],
            vec![test_modules_dir()],
            Vec::<String>::new(),
        );
        let (first_path, first_hash) = build_ftl_gate(
            &inputs.0, &inputs.1, &inputs.2, "/usr/bin/python3", "python3", Some(cache.path()),
        )
        .await
        .unwrap();
        let first_mtime = fs::metadata(&first_path)
            .unwrap()
            .modified()
            .unwrap()
            .duration_since(UNIX_EPOCH)
            .unwrap();

        let (second_path, second_hash) = build_ftl_gate(
            &inputs.0, &inputs.1, &inputs.2, "/usr/bin/python3", "python3", Some(cache.path()),
        )
        .await
        .unwrap();
        let second_mtime = fs::metadata(&second_path)
            .unwrap()
            .modified()
            .unwrap()
            .duration_since(UNIX_EPOCH)
            .unwrap();

        assert_eq!(first_path, second_path);
        assert_eq!(first_hash, second_hash);
        assert_eq!(first_mtime, second_mtime);
    }

    #[tokio::test]
    async fn missing_module_fails_the_build_distinctly() {
        let cache = tempfile::tempdir().unwrap();
        let err = build_ftl_gate(
            &["no_such_module".into()],
            &[test_modules_dir()],
            &[],
            "/usr/bin/python3",
            "python3",
            Some(cache.path()),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FtlError>(),
            Some(FtlError::ModuleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn prebuilt_gate_short_circuits_the_builder() {
        let builder = GateBuilder {
            prebuilt: Some(PrebuiltGate {
                path: PathBuf::from("/tmp/prebuilt.pyz"),
                hash: "cafe".into(),
            }),
            ..Default::default()
        };
        let (path, hash) = builder.build("/usr/bin/python3").await.unwrap();
        assert_eq!(path, PathBuf::from("/tmp/prebuilt.pyz"));
        assert_eq!(hash, "cafe");
    }
}
