use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use super::{TransferEngine, TransferRequest};
use crate::core::checksum::ChecksumRecord;
use crate::logging::LogThrottle;

/// First-time host keys are accepted and pinned; a changed key still fails.
/// Batch mode turns a password prompt into an error instead of a hang.
const SSH_OPTIONS: [&str; 4] = [
    "-o",
    "StrictHostKeyChecking=accept-new",
    "-o",
    "BatchMode=yes",
];

/// ssh reserves 255 for its own connection and authentication errors.
const SSH_ERROR_EXIT: i32 = 255;

// "  12,345,678   45%  10.2MB/s ..."
static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([\d,]+)\s+(\d+)%").expect("valid progress regex"));

pub struct RsyncEngine {
    rsync: PathBuf,
    ssh: PathBuf,
}

impl RsyncEngine {
    pub fn new(rsync: PathBuf, ssh: PathBuf) -> Self {
        Self { rsync, ssh }
    }

    /// Remote shell handed to rsync through `-e`.
    pub fn remote_shell(&self) -> String {
        let mut shell = self.ssh.to_string_lossy().into_owned();
        for opt in SSH_OPTIONS {
            shell.push(' ');
            shell.push_str(opt);
        }
        shell
    }

    pub fn rsync_args(&self, req: &TransferRequest) -> Vec<String> {
        let mut args: Vec<String> = [
            "--archive",
            "--partial",
            "--checksum",
            "--compress",
            "--info=progress2",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push("-e".to_string());
        args.push(self.remote_shell());
        args.extend(
            req.files()
                .iter()
                .map(|f| f.to_string_lossy().into_owned()),
        );
        args.push(req.destination.rsync_target());
        args
    }

    /// `ssh` arguments running the algorithm's `-c` tool inside the
    /// destination directory.
    pub fn verify_args(&self, req: &TransferRequest, record: &ChecksumRecord) -> Result<Vec<String>> {
        let (record_file, _) = req
            .checksum
            .as_ref()
            .ok_or_else(|| anyhow!("no checksum file was shipped"))?;
        let record_name = file_name(record_file)?;

        let command = format!(
            "cd {} && {} -c {}",
            remote_cd_arg(req.destination.remote_dir()),
            record.algorithm.check_tool(),
            shell_quote(&record_name)
        );

        let mut args: Vec<String> = SSH_OPTIONS.iter().map(|s| s.to_string()).collect();
        args.push(req.destination.account_host.clone());
        args.push(command);
        Ok(args)
    }
}

#[async_trait]
impl TransferEngine for RsyncEngine {
    async fn transfer(&self, req: &TransferRequest) -> Result<()> {
        let args = self.rsync_args(req);
        debug!(rsync = %self.rsync.display(), ?args, "Spawning rsync");

        let mut child = Command::new(&self.rsync)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.rsync.display()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to get rsync stdout"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("Failed to get rsync stderr"))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        // progress2 rewrites its line with '\r', so split on both terminators
        let mut reader = BufReader::new(stdout);
        let throttle = LogThrottle::new(Duration::from_secs(5));
        let mut line_buffer = Vec::new();
        let mut byte_buffer = [0u8; 1];

        while let Ok(n) = reader.read(&mut byte_buffer).await {
            if n == 0 {
                break;
            }
            let b = byte_buffer[0];
            if b != b'\r' && b != b'\n' {
                line_buffer.push(b);
                continue;
            }
            if line_buffer.is_empty() {
                continue;
            }

            let line = String::from_utf8_lossy(&line_buffer);
            if let Some((bytes_copied, percentage)) = parse_progress(&line) {
                if throttle.should_log() {
                    info!(bytes_copied, percentage, "Transfer progress");
                }
            }
            line_buffer.clear();
        }

        let status = child
            .wait()
            .await
            .context("Failed to wait for rsync")?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            bail!("rsync exited with {}: {}", status, stderr.trim());
        }
        Ok(())
    }

    async fn verify_remote(&self, req: &TransferRequest, record: &ChecksumRecord) -> Result<bool> {
        let args = self.verify_args(req, record)?;
        debug!(ssh = %self.ssh.display(), ?args, "Running remote checksum");

        let output = Command::new(&self.ssh)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", self.ssh.display()))?;

        match output.status.code() {
            Some(0) => Ok(true),
            Some(SSH_ERROR_EXIT) | None => bail!(
                "ssh to {} failed ({}): {}",
                req.destination.account_host,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Some(code) => {
                debug!(
                    code,
                    stdout = %String::from_utf8_lossy(&output.stdout).trim(),
                    "Remote checksum tool reported a failure"
                );
                Ok(false)
            }
        }
    }

    fn required_tools(&self) -> Vec<(&'static str, PathBuf)> {
        vec![("rsync", self.rsync.clone()), ("ssh", self.ssh.clone())]
    }
}

/// Bytes copied and percentage from one `--info=progress2` line.
fn parse_progress(line: &str) -> Option<(u64, u8)> {
    let caps = PROGRESS_RE.captures(line)?;
    let bytes = caps.get(1)?.as_str().replace(',', "").parse().ok()?;
    let percentage = caps.get(2)?.as_str().parse().ok()?;
    Some((bytes, percentage))
}

fn file_name(path: &Path) -> Result<String> {
    Ok(path
        .file_name()
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))?
        .to_string_lossy()
        .into_owned())
}

/// `cd` operand for the remote shell. A leading `~` stays unquoted so the
/// remote shell expands it the way rsync does for the target.
fn remote_cd_arg(dir: &str) -> String {
    match dir.strip_prefix('~') {
        Some("") | Some("/") => "~".to_string(),
        Some(rest) if rest.starts_with('/') => {
            format!("~/{}", shell_quote(rest.trim_start_matches('/')))
        }
        _ => shell_quote(dir),
    }
}

/// Single-quote for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteDestination;
    use crate::core::checksum::{ChecksumAlgorithm, hash_file};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn engine() -> RsyncEngine {
        RsyncEngine::new(PathBuf::from("rsync"), PathBuf::from("ssh"))
    }

    fn request(dir: &Path, remote_path: Option<&str>) -> TransferRequest {
        let artifact = dir.join("disk.img");
        std::fs::write(&artifact, b"payload").unwrap();
        let digest = hash_file(&artifact, ChecksumAlgorithm::Sha256).unwrap();
        let record = ChecksumRecord::new(ChecksumAlgorithm::Sha256, digest, &artifact).unwrap();
        let sum = dir.join("disk.img.sha256");
        record.write(&sum).unwrap();

        TransferRequest {
            run_id: "r".into(),
            artifact,
            checksum: Some((sum, record)),
            destination: RemoteDestination::new("backup@nas", remote_path.map(String::from))
                .unwrap(),
        }
    }

    fn script(path: &Path, body: &str) {
        std::fs::write(path, body).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn rsync_arguments() {
        let temp = tempdir().unwrap();
        let req = request(temp.path(), Some("/srv/images"));
        let args = engine().rsync_args(&req);

        assert_eq!(&args[..4], ["--archive", "--partial", "--checksum", "--compress"]);
        let e = args.iter().position(|a| a == "-e").unwrap();
        assert_eq!(
            args[e + 1],
            "ssh -o StrictHostKeyChecking=accept-new -o BatchMode=yes"
        );
        assert!(args[args.len() - 3].ends_with("disk.img"));
        assert!(args[args.len() - 2].ends_with("disk.img.sha256"));
        assert_eq!(args.last().unwrap(), "backup@nas:/srv/images/");
    }

    #[test]
    fn verify_arguments_quote_the_directory() {
        let temp = tempdir().unwrap();
        let req = request(temp.path(), Some("my dir"));
        let (_, record) = req.checksum.clone().unwrap();
        let args = engine().verify_args(&req, &record).unwrap();

        assert_eq!(args[..4], SSH_OPTIONS);
        assert_eq!(args[4], "backup@nas");
        assert_eq!(args[5], "cd 'my dir' && sha256sum -c 'disk.img.sha256'");
    }

    #[test]
    fn verify_defaults_to_login_directory() {
        let temp = tempdir().unwrap();
        let req = request(temp.path(), None);
        let (_, record) = req.checksum.clone().unwrap();
        let args = engine().verify_args(&req, &record).unwrap();
        assert!(args[5].starts_with("cd '.' && "));
    }

    #[test]
    fn verify_expands_home_relative_directory() {
        let temp = tempdir().unwrap();
        let req = request(temp.path(), Some("~/my images"));
        let (_, record) = req.checksum.clone().unwrap();
        let args = engine().verify_args(&req, &record).unwrap();
        assert_eq!(args[5], "cd ~/'my images' && sha256sum -c 'disk.img.sha256'");

        assert_eq!(remote_cd_arg("~"), "~");
        assert_eq!(remote_cd_arg("~/"), "~");
        assert_eq!(remote_cd_arg("~backup/x"), "'~backup/x'");
        assert_eq!(remote_cd_arg("/srv/images"), "'/srv/images'");
    }

    #[tokio::test]
    async fn verify_runs_in_home_relative_directory() {
        let temp = tempdir().unwrap();
        let home = temp.path().join("home");
        std::fs::create_dir_all(home.join("images")).unwrap();
        let local = temp.path().join("local");
        std::fs::create_dir(&local).unwrap();

        // Runs the remote command with HOME pointing at the fake home.
        let ssh = temp.path().join("ssh");
        script(
            &ssh,
            &format!(
                "#!/bin/sh\nfor a in \"$@\"; do cmd=\"$a\"; done\ncd \"{home}\" && HOME=\"{home}\" sh -c \"$cmd\"\n",
                home = home.display()
            ),
        );

        let req = request(&local, Some("~/images"));
        let (sum, record) = req.checksum.clone().unwrap();
        std::fs::copy(&req.artifact, home.join("images/disk.img")).unwrap();
        std::fs::copy(&sum, home.join("images/disk.img.sha256")).unwrap();

        let engine = RsyncEngine::new(PathBuf::from("rsync"), ssh);
        assert!(engine.verify_remote(&req, &record).await.unwrap());
    }

    #[test]
    fn progress_lines() {
        assert_eq!(
            parse_progress("     12,345,678  45%   10.20MB/s    0:00:01"),
            Some((12_345_678, 45))
        );
        assert_eq!(parse_progress("sending incremental file list"), None);
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn fake_tools_transfer_and_verify() {
        let temp = tempdir().unwrap();
        let remote_root = temp.path().join("remote");
        std::fs::create_dir(&remote_root).unwrap();
        let local = temp.path().join("local");
        std::fs::create_dir(&local).unwrap();

        // Drops options and the -e value, then copies sources into the
        // path part of the target under the fake remote root.
        let rsync = temp.path().join("rsync");
        script(
            &rsync,
            &format!(
                r#"#!/bin/sh
files=""
skip=0
for a in "$@"; do
  if [ "$skip" = 1 ]; then skip=0; continue; fi
  case "$a" in
    -e) skip=1 ;;
    -*) ;;
    *) files="$files $a"; target="$a" ;;
  esac
done
dest="{root}/${{target#*:}}"
mkdir -p "$dest"
for f in $files; do [ "$f" = "$target" ] || cp "$f" "$dest"; done
"#,
                root = remote_root.display()
            ),
        );
        // Runs the remote command locally from the fake remote root.
        let ssh = temp.path().join("ssh");
        script(
            &ssh,
            &format!(
                r#"#!/bin/sh
for a in "$@"; do cmd="$a"; done
cd "{root}" && sh -c "$cmd"
"#,
                root = remote_root.display()
            ),
        );

        let engine = RsyncEngine::new(rsync, ssh);
        let req = request(&local, Some("images"));
        let (_, record) = req.checksum.clone().unwrap();

        engine.transfer(&req).await.unwrap();
        assert!(remote_root.join("images/disk.img").exists());
        assert!(remote_root.join("images/disk.img.sha256").exists());
        assert!(engine.verify_remote(&req, &record).await.unwrap());

        std::fs::write(remote_root.join("images/disk.img"), b"bitrot").unwrap();
        assert!(!engine.verify_remote(&req, &record).await.unwrap());
    }

    #[tokio::test]
    async fn rsync_failure_carries_stderr() {
        let temp = tempdir().unwrap();
        let rsync = temp.path().join("rsync");
        script(
            &rsync,
            "#!/bin/sh\necho 'ssh: connect to host nas port 22: Connection refused' >&2\nexit 255\n",
        );
        let engine = RsyncEngine::new(rsync, PathBuf::from("ssh"));
        let req = request(temp.path(), None);

        let err = engine.transfer(&req).await.unwrap_err();
        assert!(format!("{err:#}").contains("Connection refused"));
    }
}
