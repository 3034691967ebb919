//! Log files for managed services, and best-effort log discovery for
//! processes we did not spawn.
//!
//! Layout: `<root>/<service>/<YYYY-MM-DDTHH-MM-SS.mmm>.log`, one file per
//! start. The lexicographically greatest name is the latest run.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio::process::Command as TokioCommand;

use super::error::SupervisorError;

/// Only this much of the end of a file is read when tailing.
const MAX_TAIL_BYTES: u64 = 4 * 1024 * 1024;

const FACILITY_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Managed service logs ────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LogStore {
    root: PathBuf,
}

impl LogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn service_dir(&self, service_name: &str) -> PathBuf {
        self.root.join(service_name)
    }

    /// Create a fresh, timestamp-named log file for a new run.
    pub fn create(&self, service_name: &str) -> Result<(PathBuf, File), SupervisorError> {
        let dir = self.service_dir(service_name);
        fs::create_dir_all(&dir).map_err(|source| SupervisorError::LogFile {
            path: dir.clone(),
            source,
        })?;

        // 같은 밀리초에 두 번 시작되는 경우를 대비해 몇 번 재시도
        let mut attempts = 0;
        loop {
            let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f");
            let path = dir.join(format!("{}.log", stamp));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempts < 5 => {
                    attempts += 1;
                    std::thread::sleep(Duration::from_millis(2));
                }
                Err(source) => return Err(SupervisorError::LogFile { path, source }),
            }
        }
    }

    /// Most recent log file of `service_name`.
    pub fn latest(&self, service_name: &str) -> Result<PathBuf, SupervisorError> {
        let dir = self.service_dir(service_name);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SupervisorError::NoLogs(service_name.to_string()))
            }
            Err(source) => return Err(SupervisorError::LogRead { path: dir, source }),
        };

        entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().map_or(false, |ext| ext == "log"))
            .max_by(|a, b| a.file_name().cmp(&b.file_name()))
            .ok_or_else(|| SupervisorError::NoLogs(service_name.to_string()))
    }

    /// Last `lines` lines of the latest run's log.
    pub fn tail(&self, service_name: &str, lines: usize) -> Result<Vec<String>, SupervisorError> {
        if lines == 0 {
            return Ok(Vec::new());
        }
        let path = self.latest(service_name)?;
        tail_file(&path, lines).map_err(|source| SupervisorError::LogRead { path, source })
    }
}

/// Last `lines` lines of `path`, reading at most the final `MAX_TAIL_BYTES`.
pub fn tail_file(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let truncated = len > MAX_TAIL_BYTES;
    if truncated {
        file.seek(SeekFrom::Start(len - MAX_TAIL_BYTES))?;
    }

    let mut reader = BufReader::new(file);
    let mut ring: VecDeque<String> = VecDeque::with_capacity(lines.min(1024));
    let mut buf = Vec::new();
    let mut first = true;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        // 중간부터 읽었다면 첫 줄은 잘린 조각
        if first && truncated {
            first = false;
            continue;
        }
        first = false;

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);
        if ring.len() >= lines {
            ring.pop_front();
        }
        ring.push_back(line.to_string());
    }

    Ok(ring.into_iter().collect())
}

/// Last `n` non-blank entries of `lines`.
fn last_non_blank(lines: impl Iterator<Item = String>, n: usize) -> Vec<String> {
    let mut ring = VecDeque::with_capacity(n.min(1024));
    for line in lines.filter(|l| !l.trim().is_empty()) {
        if ring.len() >= n {
            ring.pop_front();
        }
        ring.push_back(line);
    }
    ring.into_iter().collect()
}

// ─── Foreign processes ───────────────────────────────────────

fn looks_like_log(path: &Path) -> bool {
    let lower = path.to_string_lossy().to_lowercase();
    lower.contains(".log") || lower.contains("/log")
}

/// Regular files held open by `pid` that look like logs, newest first.
pub async fn open_log_files(pid: u32) -> Vec<PathBuf> {
    let mut candidates: Vec<(PathBuf, SystemTime)> = open_files(pid)
        .await
        .into_iter()
        .filter(|path| looks_like_log(path))
        .filter_map(|path| {
            let meta = fs::metadata(&path).ok()?;
            if !meta.is_file() {
                return None;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((path, modified))
        })
        .collect();

    candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    candidates.dedup_by(|a, b| a.0 == b.0);
    candidates.into_iter().map(|(path, _)| path).collect()
}

async fn open_files(pid: u32) -> Vec<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(entries) = fs::read_dir(format!("/proc/{}/fd", pid)) {
            return entries
                .flatten()
                .filter_map(|entry| fs::read_link(entry.path()).ok())
                .collect();
        }
    }

    let mut cmd = TokioCommand::new("lsof");
    cmd.args(["-nP", "-p", &pid.to_string(), "-Fn"])
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);
    match tokio::time::timeout(FACILITY_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => crate::scanner::lsof::parse_name_fields(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .map(PathBuf::from)
            .collect(),
        _ => Vec::new(),
    }
}

/// Recent entries for `pid` from the host's structured log, if any.
pub async fn system_log_tail(pid: u32, lines: usize) -> Option<Vec<String>> {
    let mut cmd = system_log_command(pid, lines);
    cmd.stdin(std::process::Stdio::null()).kill_on_drop(true);

    let output = match tokio::time::timeout(FACILITY_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(Ok(output)) => {
            tracing::debug!("System log query for pid {} exited with {}", pid, output.status);
            return None;
        }
        Ok(Err(e)) => {
            tracing::debug!("System log query for pid {} failed: {}", pid, e);
            return None;
        }
        Err(_) => {
            tracing::debug!("System log query for pid {} timed out", pid);
            return None;
        }
    };

    let text = String::from_utf8_lossy(&output.stdout);
    let tail = last_non_blank(text.lines().map(String::from), lines);
    (!tail.is_empty()).then_some(tail)
}

#[cfg(target_os = "macos")]
fn system_log_command(pid: u32, _lines: usize) -> TokioCommand {
    let mut cmd = TokioCommand::new("log");
    cmd.args([
        "show",
        "--last",
        "2m",
        "--style",
        "compact",
        "--predicate",
        &format!("processID == {}", pid),
    ]);
    cmd
}

#[cfg(not(target_os = "macos"))]
fn system_log_command(pid: u32, lines: usize) -> TokioCommand {
    let mut cmd = TokioCommand::new("journalctl");
    cmd.args([
        format!("_PID={}", pid),
        "--since=-2min".to_string(),
        format!("--lines={}", lines),
        "--no-pager".to_string(),
        "--quiet".to_string(),
        "--output=short-iso".to_string(),
    ]);
    cmd
}
