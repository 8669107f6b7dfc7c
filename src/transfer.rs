use std::path::Path;

use anyhow::{bail, Context};
use openssh::{Session, Stdio};
use tokio::io::AsyncWriteExt;

// Remote file plumbing rides the ssh session itself, using the standard
// tools every supported target has. One session per host owns every channel.

fn quoted(path: &str) -> String {
    shell_words::quote(path).into_owned()
}

pub async fn exists(session: &Session, path: &str) -> anyhow::Result<bool> {
    let status = session.command("test").arg("-e").arg(path).status().await?;
    Ok(status.success())
}

pub async fn is_dir(session: &Session, path: &str) -> anyhow::Result<bool> {
    let status = session.command("test").arg("-d").arg(path).status().await?;
    Ok(status.success())
}

/// Size of a remote file, or `None` when it does not exist.
pub async fn file_size(session: &Session, path: &str) -> anyhow::Result<Option<u64>> {
    let output = session
        .command("sh")
        .arg("-c")
        .arg(format!("wc -c < {} 2>/dev/null", quoted(path)))
        .output()
        .await?;
    if !output.status.success() {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text.trim().parse::<u64>().ok())
}

pub async fn make_dirs(session: &Session, path: &str) -> anyhow::Result<()> {
    let output = session.command("mkdir").arg("-p").arg(path).output().await?;
    if !output.status.success() {
        bail!(
            "mkdir -p {} failed: {}",
            path,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

pub async fn chmod(session: &Session, mode: &str, path: &str) -> anyhow::Result<()> {
    let output = session.command("chmod").arg(mode).arg(path).output().await?;
    if !output.status.success() {
        bail!(
            "chmod {} {} failed: {}",
            mode,
            path,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

/// Stream bytes into a remote file through the session's stdin.
pub async fn put_bytes(session: &Session, data: &[u8], remote_path: &str) -> anyhow::Result<()> {
    let mut child = session
        .command("sh")
        .arg("-c")
        .arg(format!("cat > {}", quoted(remote_path)))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .await?;
    let mut writer = child
        .stdin()
        .take()
        .context("remote stdin unavailable for upload")?;
    writer.write_all(data).await?;
    writer.shutdown().await?;
    drop(writer);

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        bail!(
            "upload to {} failed: {}",
            remote_path,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

pub async fn put_file(
    session: &Session,
    local_path: &Path,
    remote_path: &str,
) -> anyhow::Result<()> {
    let data = tokio::fs::read(local_path)
        .await
        .with_context(|| format!("reading {}", local_path.display()))?;
    put_bytes(session, &data, remote_path).await
}

pub async fn get_bytes(session: &Session, remote_path: &str) -> anyhow::Result<Vec<u8>> {
    let output = session.command("cat").arg(remote_path).output().await?;
    if !output.status.success() {
        bail!(
            "download of {} failed: {}",
            remote_path,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(output.stdout)
}

/// Recursive upload: the local tree is tarred in memory and unpacked on the
/// far side under `remote_dir`.
pub async fn put_tree(
    session: &Session,
    local_dir: &Path,
    remote_dir: &str,
) -> anyhow::Result<()> {
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_dir_all(".", local_dir)
        .with_context(|| format!("archiving {}", local_dir.display()))?;
    let data = builder.into_inner()?;

    let mut child = session
        .command("sh")
        .arg("-c")
        .arg(format!(
            "mkdir -p {dir} && tar -C {dir} -xf -",
            dir = quoted(remote_dir)
        ))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .await?;
    let mut writer = child
        .stdin()
        .take()
        .context("remote stdin unavailable for upload")?;
    writer.write_all(&data).await?;
    writer.shutdown().await?;
    drop(writer);

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        bail!(
            "unpacking into {} failed: {}",
            remote_dir,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

/// Recursive download: the remote tree arrives as a tar stream and is
/// unpacked under `local_dir`.
pub async fn get_tree(
    session: &Session,
    remote_dir: &str,
    local_dir: &Path,
) -> anyhow::Result<()> {
    let output = session
        .command("sh")
        .arg("-c")
        .arg(format!("tar -C {} -cf - .", quoted(remote_dir)))
        .output()
        .await?;
    if !output.status.success() {
        bail!(
            "archiving remote {} failed: {}",
            remote_dir,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    tokio::fs::create_dir_all(local_dir).await?;
    tar::Archive::new(&output.stdout[..])
        .unpack(local_dir)
        .with_context(|| format!("unpacking into {}", local_dir.display()))?;
    Ok(())
}

/// Copy a local file or directory to the remote side.
pub async fn put_path(session: &Session, src: &Path, dest: &str) -> anyhow::Result<()> {
    if src.is_dir() {
        put_tree(session, src, dest).await
    } else {
        put_file(session, src, dest).await
    }
}

/// Copy a remote file or directory to the local side.
pub async fn get_path(session: &Session, src: &str, dest: &Path) -> anyhow::Result<()> {
    if is_dir(session, src).await? {
        get_tree(session, src, dest).await
    } else {
        let data = get_bytes(session, src).await?;
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(dest, data).await?;
        Ok(())
    }
}
