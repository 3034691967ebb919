//! Registry 전용 에러 타입. 호출자가 중복/부재/손상을 구분할 수 있게 합니다.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("service '{0}' already exists")]
    DuplicateName(String),

    #[error("service '{0}' not found")]
    NotFound(String),

    #[error("registry file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to persist registry to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read registry file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry lock poisoned")]
    LockPoisoned,
}

impl RegistryError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DuplicateName(_) => "DUPLICATE_NAME",
            Self::NotFound(_) => "SERVICE_NOT_FOUND",
            Self::Corrupt { .. } => "REGISTRY_CORRUPT",
            Self::Persist { .. } => "REGISTRY_PERSIST_FAILED",
            Self::Io { .. } => "REGISTRY_IO",
            Self::LockPoisoned => "LOCK_POISONED",
        }
    }
}
