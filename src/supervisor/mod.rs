//! Lifecycle of managed services at the OS level: spawn into a fresh
//! process group with output captured to a log file, stop with
//! SIGTERM→SIGKILL escalation, probe liveness, read logs back.

pub mod command;
pub mod error;
pub mod logs;
pub mod process;
pub mod state_machine;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use tokio::process::Command as TokioCommand;

use crate::registry::ManagedService;
pub use command::CommandError;
pub use error::SupervisorError;
use logs::LogStore;
pub use process::{ProcessControl, SignalTarget, StopSignal, UnixControl};
pub use state_machine::{PendingStart, State, StateMachine, StopAction, StopPhase, StopTiming, TransitionError};

/// Default grace period for SIGTERM before escalating.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Supervisor<C: ProcessControl = UnixControl> {
    logs: LogStore,
    control: C,
    stop_timeout: Duration,
    timing: StopTiming,
}

impl Supervisor<UnixControl> {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self::with_control(logs_dir, UnixControl)
    }
}

impl<C: ProcessControl> Supervisor<C> {
    pub fn with_control(logs_dir: impl Into<PathBuf>, control: C) -> Self {
        Self {
            logs: LogStore::new(logs_dir),
            control,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            timing: StopTiming::default(),
        }
    }

    /// Timeout used by `restart` when stopping the previous run.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_timing(mut self, timing: StopTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    /// Spawn `service` and return its PID.
    ///
    /// The command is tokenized, never handed to a shell. The child leads a
    /// new process group and writes stdout/stderr into a new log file.
    pub async fn start(&self, service: &ManagedService) -> Result<u32, SupervisorError> {
        check_cwd(&service.cwd)?;

        let argv = command::parse_command_args(&service.command)?;
        let (program, args) = argv.split_first().ok_or(CommandError::Empty)?;

        let (log_path, log_file) = self.logs.create(&service.name)?;
        let stderr = log_file.try_clone().map_err(|source| SupervisorError::LogFile {
            path: log_path.clone(),
            source,
        })?;

        let mut cmd = TokioCommand::new(program);
        cmd.args(args)
            .current_dir(&service.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(false);

        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| SupervisorError::Spawn {
            program: program.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "child exited before its pid was read"),
        })?;

        tracing::info!(
            "Started service '{}' with PID {} (log: {})",
            service.name,
            pid,
            log_path.display()
        );
        Ok(pid)
    }

    /// Stop `pid` and its process group: SIGTERM, wait up to `timeout`,
    /// then SIGKILL and a short grace period. A process that is already gone
    /// is a success without any signal.
    pub async fn stop(&self, pid: u32, timeout: Duration) -> Result<(), SupervisorError> {
        validate_pid(pid)?;
        if !self.control.is_alive(pid) {
            tracing::debug!("PID {} is not running; nothing to stop", pid);
            return Ok(());
        }

        tracing::info!("Stopping PID {} (timeout {:?})", pid, timeout);
        match self.deliver(pid, StopSignal::Terminate) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(()),
            Err(Errno::EPERM) => return Err(SupervisorError::EscalationRequiresPrivilege { pid }),
            Err(errno) => return Err(SupervisorError::SignalFailed { pid, errno }),
        }

        let mut phase = StopPhase::terminating(Instant::now(), timeout);
        loop {
            let alive = self.control.is_alive(pid);
            let (next, action) = phase.advance(alive, Instant::now(), &self.timing);
            phase = next;
            match action {
                StopAction::Poll(wait) => tokio::time::sleep(wait).await,
                StopAction::Escalate => {
                    tracing::warn!("PID {} ignored SIGTERM for {:?}; sending SIGKILL", pid, timeout);
                    if let Err(errno) = self.deliver(pid, StopSignal::Kill) {
                        tracing::warn!("SIGKILL to PID {} failed: {}", pid, errno);
                    }
                }
                StopAction::Finish => break,
            }
        }

        match phase {
            StopPhase::Confirmed => {
                tracing::info!("PID {} stopped", pid);
                Ok(())
            }
            _ => Err(SupervisorError::EscalationRequiresPrivilege { pid }),
        }
    }

    /// Signal the group led by `pid`, falling back to `pid` alone when
    /// group signaling is refused or the process is not a group leader.
    fn deliver(&self, pid: u32, signal: StopSignal) -> Result<(), Errno> {
        match self.control.signal(SignalTarget::Group(pid), signal) {
            Ok(()) => Ok(()),
            Err(group_err) => {
                tracing::debug!("Group signal to {} failed ({}); signaling PID directly", pid, group_err);
                self.control.signal(SignalTarget::Pid(pid), signal)
            }
        }
    }

    pub fn is_running(&self, pid: u32) -> bool {
        pid > 0 && self.control.is_alive(pid)
    }

    /// Stop the previously recorded run, if any, then start again.
    /// Nothing is spawned unless the previous run is confirmed gone.
    pub async fn restart(&self, service: &ManagedService) -> Result<u32, SupervisorError> {
        if let Some(pid) = service.last_pid.filter(|pid| *pid > 0) {
            self.stop(pid, self.stop_timeout).await?;
        }
        self.start(service).await
    }

    /// Lifecycle state as observed right now.
    pub fn observed_state(&self, service: &ManagedService) -> State {
        state_machine::observe(service, |pid| self.is_running(pid))
    }

    pub fn latest_log_path(&self, service_name: &str) -> Result<PathBuf, SupervisorError> {
        self.logs.latest(service_name)
    }

    /// Last `lines` lines of the service's most recent log.
    pub fn tail(&self, service_name: &str, lines: usize) -> Result<Vec<String>, SupervisorError> {
        self.logs.tail(service_name, lines)
    }

    /// Best-effort logs for a process this supervisor did not spawn: an open
    /// log-like file first, then the host's structured log.
    pub async fn tail_foreign_process(&self, pid: u32, lines: usize) -> Result<Vec<String>, SupervisorError> {
        validate_pid(pid)?;
        if lines == 0 {
            return Ok(Vec::new());
        }

        for path in logs::open_log_files(pid).await {
            match logs::tail_file(&path, lines) {
                Ok(tail) if tail.iter().any(|l| !l.trim().is_empty()) => {
                    tracing::debug!("Using {} for PID {}", path.display(), pid);
                    return Ok(tail);
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("Cannot read {}: {}", path.display(), e),
            }
        }

        if let Some(tail) = logs::system_log_tail(pid, lines).await {
            return Ok(tail);
        }
        Err(SupervisorError::NoAccessibleLogs(pid))
    }
}

fn validate_pid(pid: u32) -> Result<(), SupervisorError> {
    if pid == 0 || i32::try_from(pid).is_err() {
        return Err(SupervisorError::InvalidPid(pid));
    }
    Ok(())
}

fn check_cwd(cwd: &Path) -> Result<(), SupervisorError> {
    match fs::metadata(cwd) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(SupervisorError::InvalidCwd {
            path: cwd.to_path_buf(),
            reason: "not a directory".to_string(),
        }),
        Err(e) => Err(SupervisorError::InvalidCwd {
            path: cwd.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}
