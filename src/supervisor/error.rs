//! Supervisor 전용 에러 타입. 검증 실패, 권한 문제, 로그 부재를 구분하여
//! 호출자가 사용자에게 알맞은 안내를 할 수 있게 합니다.

use std::path::PathBuf;

use nix::errno::Errno;

use super::command::CommandError;

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("invalid working directory {path}: {reason}")]
    InvalidCwd { path: PathBuf, reason: String },

    #[error("invalid command: {0}")]
    Command(#[from] CommandError),

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pid: {0}")]
    InvalidPid(u32),

    #[error("failed to signal pid {pid}: {errno}")]
    SignalFailed { pid: u32, errno: Errno },

    #[error("pid {pid} survived SIGKILL; terminating it requires elevated privileges")]
    EscalationRequiresPrivilege { pid: u32 },

    #[error("no logs available for service '{0}'")]
    NoLogs(String),

    #[error("no accessible logs for pid {0}")]
    NoAccessibleLogs(u32),

    #[error("failed to create log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read logs at {path}: {source}")]
    LogRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidCwd { .. } => "INVALID_CWD",
            Self::Command(e) => e.error_code(),
            Self::Spawn { .. } => "SPAWN_FAILED",
            Self::InvalidPid(_) => "INVALID_PID",
            Self::SignalFailed { .. } => "SIGNAL_FAILED",
            Self::EscalationRequiresPrivilege { .. } => "ESCALATION_REQUIRES_PRIVILEGE",
            Self::NoLogs(_) => "NO_LOGS",
            Self::NoAccessibleLogs(_) => "NO_ACCESSIBLE_LOGS",
            Self::LogFile { .. } => "LOG_FILE_FAILED",
            Self::LogRead { .. } => "LOG_READ_FAILED",
        }
    }
}
