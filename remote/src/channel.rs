//! File transfer over an ssh session using POSIX tools on the remote side
//!
//! - put: `cat > path` fed from the local file
//! - get: `cat path` streamed into the local file
//! - stat: `stat -c %s path`, a non-zero exit means the path does not exist
//! - mkdir: `mkdir path`
//! - list: `find path -mindepth 1 -maxdepth 1 -printf '%y %s %f\0'`

use anyhow::{Context, anyhow};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use common::transport::RemoteEntry;

/// Quote `value` for a POSIX shell
pub fn shell_escape(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Parse NUL-separated `%y %s %f` records produced by `find -printf`
pub fn parse_listing(output: &[u8]) -> anyhow::Result<Vec<RemoteEntry>> {
    let mut entries = Vec::new();
    for record in output.split(|byte| *byte == 0) {
        if record.is_empty() {
            continue;
        }
        let record = String::from_utf8_lossy(record);
        let mut fields = record.splitn(3, ' ');
        let (Some(kind), Some(size), Some(name)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(anyhow!("malformed listing record: {:?}", record));
        };
        let size = size
            .parse::<u64>()
            .with_context(|| format!("bad size in listing record: {:?}", record))?;
        entries.push(RemoteEntry {
            name: name.to_string(),
            is_dir: kind == "d",
            size,
        });
    }
    Ok(entries)
}

fn failure(what: &str, path: &str, stderr: &[u8]) -> anyhow::Error {
    anyhow!(
        "{} {} failed: {}",
        what,
        path,
        String::from_utf8_lossy(stderr).trim()
    )
}

pub struct SshFileChannel {
    session: Arc<openssh::Session>,
}

impl SshFileChannel {
    pub(crate) fn new(session: Arc<openssh::Session>) -> Self {
        Self { session }
    }

    async fn run(&self, program: &str, args: &[&str]) -> anyhow::Result<std::process::Output> {
        self.session
            .command(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to run remote {}", program))
    }
}

impl common::transport::FileChannel for SshFileChannel {
    async fn put(&mut self, local: &std::path::Path, remote: &str) -> anyhow::Result<()> {
        let mut file = tokio::fs::File::open(local)
            .await
            .with_context(|| format!("failed opening {:?}", local))?;
        let cmd = format!("cat > {}", shell_escape(remote));
        let mut child = self
            .session
            .command("sh")
            .arg("-c")
            .arg(&cmd)
            .stdin(openssh::Stdio::piped())
            .stdout(openssh::Stdio::null())
            .stderr(openssh::Stdio::piped())
            .spawn()
            .await
            .context("failed to spawn remote cat")?;
        let mut stdin = child
            .stdin()
            .take()
            .context("failed to get stdin for remote cat")?;
        let mut stderr = child
            .stderr()
            .take()
            .context("failed to get stderr for remote cat")?;
        let stderr_fut = async {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        };
        let write_fut = async {
            tokio::io::copy(&mut file, &mut stdin).await?;
            stdin.shutdown().await?;
            drop(stdin);
            Ok::<_, std::io::Error>(())
        };
        let (written, stderr_data) = tokio::join!(write_fut, stderr_fut);
        let status = child
            .wait()
            .await
            .context("failed to wait for remote cat")?;
        if !status.success() {
            return Err(failure("upload to", remote, &stderr_data));
        }
        written.with_context(|| format!("failed streaming {:?} to {}", local, remote))
    }

    async fn get(&mut self, remote: &str, local: &std::path::Path) -> anyhow::Result<()> {
        let mut file = tokio::fs::File::create(local)
            .await
            .with_context(|| format!("failed creating {:?}", local))?;
        let mut child = self
            .session
            .command("cat")
            .arg(remote)
            .stdin(openssh::Stdio::null())
            .stdout(openssh::Stdio::piped())
            .stderr(openssh::Stdio::piped())
            .spawn()
            .await
            .context("failed to spawn remote cat")?;
        let mut stdout = child
            .stdout()
            .take()
            .context("failed to get stdout for remote cat")?;
        let mut stderr = child
            .stderr()
            .take()
            .context("failed to get stderr for remote cat")?;
        let stderr_fut = async {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        };
        let read_fut = async {
            tokio::io::copy(&mut stdout, &mut file).await?;
            file.flush().await
        };
        let (copied, stderr_data) = tokio::join!(read_fut, stderr_fut);
        let status = child
            .wait()
            .await
            .context("failed to wait for remote cat")?;
        if !status.success() {
            return Err(failure("download of", remote, &stderr_data));
        }
        copied.with_context(|| format!("failed writing {:?}", local))
    }

    async fn stat(&mut self, path: &str) -> anyhow::Result<Option<u64>> {
        let output = self.run("stat", &["-c", "%s", path]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let size = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<u64>()
            .with_context(|| format!("unexpected stat output for {}", path))?;
        Ok(Some(size))
    }

    async fn mkdir(&mut self, path: &str) -> anyhow::Result<()> {
        let output = self.run("mkdir", &[path]).await?;
        if !output.status.success() {
            return Err(failure("mkdir", path, &output.stderr));
        }
        Ok(())
    }

    async fn list_entries(&mut self, path: &str) -> anyhow::Result<Vec<RemoteEntry>> {
        let output = self
            .run(
                "find",
                &[path, "-mindepth", "1", "-maxdepth", "1", "-printf", r"%y %s %f\0"],
            )
            .await?;
        if !output.status.success() {
            return Err(failure("listing", path, &output.stderr));
        }
        parse_listing(&output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_plain_and_quoted_values() {
        assert_eq!(shell_escape("/srv/data"), "'/srv/data'");
        assert_eq!(shell_escape("it's here"), r"'it'\''s here'");
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn parse_find_listing() {
        let output = b"f 12 a.txt\0d 4096 sub dir\0l 7 link\0";
        let entries = parse_listing(output).unwrap();
        assert_eq!(
            entries,
            vec![
                RemoteEntry {
                    name: "a.txt".to_string(),
                    is_dir: false,
                    size: 12
                },
                RemoteEntry {
                    name: "sub dir".to_string(),
                    is_dir: true,
                    size: 4096
                },
                RemoteEntry {
                    name: "link".to_string(),
                    is_dir: false,
                    size: 7
                },
            ]
        );
    }

    #[test]
    fn parse_empty_listing() {
        assert!(parse_listing(b"").unwrap().is_empty());
    }

    #[test]
    fn reject_malformed_listing() {
        assert!(parse_listing(b"f a.txt\0").is_err());
        assert!(parse_listing(b"f notanumber a.txt\0").is_err());
    }
}
