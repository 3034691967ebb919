//! Port discovery: who is listening on which TCP port right now.
//!
//! The listener table comes from `lsof`; command lines and parent PIDs from
//! the process table (`sysinfo`); working directories from `/proc` or `lsof`
//! under a per-PID time ceiling. Everything here is rebuilt each cycle.

pub mod filter;
pub mod lsof;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tokio::process::Command as TokioCommand;

use crate::reconcile::Source;
use crate::resolver::ProjectResolver;

/// Default per-PID ceiling for working-directory lookups.
pub const DEFAULT_CWD_TIMEOUT: Duration = Duration::from_millis(400);

/// Ceiling for the listener table itself.
const LISTEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum ScanError {
    #[error("port discovery unavailable ({facility}): {reason}")]
    Unavailable { facility: &'static str, reason: String },
}

impl ScanError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "SCAN_UNAVAILABLE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Marks a listener as likely started by an automation agent. Populated by
/// an external detector; discovery itself leaves it empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTag {
    pub source: Source,
    pub agent_name: String,
    pub confidence: Confidence,
}

/// Identity of a discovered record within one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessKey {
    pub pid: u32,
    pub port: u16,
}

/// A process observed holding a listening socket at scan time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredProcess {
    pub pid: u32,
    pub ppid: Option<u32>,
    pub user: Option<String>,
    pub command: String,
    pub port: u16,
    pub protocol: String,
    pub cwd: Option<PathBuf>,
    pub project_root: Option<PathBuf>,
    pub agent_tag: Option<AgentTag>,
}

impl DiscoveredProcess {
    pub fn key(&self) -> ProcessKey {
        ProcessKey {
            pid: self.pid,
            port: self.port,
        }
    }
}

struct ProcessMeta {
    ppid: Option<u32>,
    command: String,
}

pub struct Scanner {
    cwd_timeout: Duration,
    /// Negative results are stored as `None` so failures are not retried.
    cwd_cache: RwLock<HashMap<u32, Option<PathBuf>>>,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new(DEFAULT_CWD_TIMEOUT)
    }
}

impl Scanner {
    pub fn new(cwd_timeout: Duration) -> Self {
        Self {
            cwd_timeout,
            cwd_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Discover every listening TCP socket, deduplicated by `(pid, port)`
    /// and enriched with command line, parent PID and working directory.
    pub async fn scan(&self) -> Result<Vec<DiscoveredProcess>, ScanError> {
        let output = list_listeners().await?;
        let mut records = lsof::parse_listeners(&output);
        tracing::debug!("Found {} listening sockets", records.len());

        self.enrich(&mut records).await;
        Ok(records)
    }

    async fn enrich(&self, records: &mut [DiscoveredProcess]) {
        let mut pids: Vec<u32> = records.iter().map(|r| r.pid).collect();
        pids.sort_unstable();
        pids.dedup();

        // sysinfo는 프로세스 테이블 전체를 동기적으로 스캔하므로 블로킹 스레드풀에서 실행
        let metadata = tokio::task::spawn_blocking(move || process_metadata(&pids))
            .await
            .unwrap_or_default();

        for record in records.iter_mut() {
            if let Some(meta) = metadata.get(&record.pid) {
                record.ppid = meta.ppid;
                if !meta.command.is_empty() {
                    record.command = meta.command.clone();
                }
            }
            if record.cwd.is_none() {
                record.cwd = self.cwd_for(record.pid).await;
            }
        }
    }

    /// Best-effort working directory of `pid`, bounded by the configured
    /// ceiling and cached for this scanner's lifetime.
    pub async fn cwd_for(&self, pid: u32) -> Option<PathBuf> {
        if let Ok(cache) = self.cwd_cache.read() {
            if let Some(cached) = cache.get(&pid) {
                return cached.clone();
            }
        }

        let found = match tokio::time::timeout(self.cwd_timeout, lookup_cwd(pid)).await {
            Ok(found) => found,
            Err(_) => {
                tracing::debug!("cwd lookup for pid {} exceeded {:?}", pid, self.cwd_timeout);
                None
            }
        };

        if let Ok(mut cache) = self.cwd_cache.write() {
            cache.insert(pid, found.clone());
        }
        found
    }

    pub fn clear_cwd_cache(&self) {
        if let Ok(mut cache) = self.cwd_cache.write() {
            cache.clear();
        }
    }
}

/// Fill in `project_root` for every record with a known working directory.
pub fn attach_project_roots(records: &mut [DiscoveredProcess], resolver: &ProjectResolver) {
    for record in records.iter_mut() {
        if let Some(cwd) = &record.cwd {
            record.project_root = resolver.find_root(cwd);
        }
    }
}

async fn list_listeners() -> Result<String, ScanError> {
    run_listing("lsof", &["-nP", "-iTCP", "-sTCP:LISTEN"], LISTEN_TIMEOUT).await
}

async fn run_listing(program: &'static str, args: &[&str], limit: Duration) -> Result<String, ScanError> {
    let mut cmd = TokioCommand::new(program);
    cmd.args(args).stdin(std::process::Stdio::null()).kill_on_drop(true);

    let output = match tokio::time::timeout(limit, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(unavailable(program, e.to_string())),
        Err(_) => return Err(unavailable(program, format!("no answer within {:?}", limit))),
    };
    interpret_listing(program, output)
}

/// lsof exits 1 both when nothing matches and when it partly fails, so the
/// exit status alone does not decide.
fn interpret_listing(program: &'static str, output: std::process::Output) -> Result<String, ScanError> {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (true, true) => Ok(String::new()),
        (true, false) => Err(unavailable(program, format!("{}: {}", output.status, stderr.trim()))),
        (false, _) => {
            tracing::warn!("{} reported problems but produced output: {}", program, stderr.trim());
            Ok(stdout)
        }
    }
}

fn unavailable(facility: &'static str, reason: String) -> ScanError {
    ScanError::Unavailable { facility, reason }
}

fn process_metadata(pids: &[u32]) -> HashMap<u32, ProcessMeta> {
    let mut sys = System::new();
    sys.refresh_processes();

    pids.iter()
        .filter_map(|pid| {
            let process = sys.process(Pid::from_u32(*pid))?;
            let command = if process.cmd().is_empty() {
                process.name().to_string()
            } else {
                process.cmd().join(" ")
            };
            Some((
                *pid,
                ProcessMeta {
                    ppid: process.parent().map(|p| p.as_u32()),
                    command,
                },
            ))
        })
        .collect()
}

async fn lookup_cwd(pid: u32) -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(path) = tokio::fs::read_link(format!("/proc/{}/cwd", pid)).await {
            return Some(path);
        }
    }

    let output = TokioCommand::new("lsof")
        .args(["-a", "-p", &pid.to_string(), "-d", "cwd", "-Fn"])
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    lsof::parse_name_fields(&String::from_utf8_lossy(&output.stdout))
        .into_iter()
        .next()
        .map(PathBuf::from)
}
