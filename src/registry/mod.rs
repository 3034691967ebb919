//! Managed-service registry - the durable, user-curated half of the picture.
//!
//! `RegistryStore` owns `registry.json`. Every mutation happens under one
//! write lock that also covers the full-file rewrite, so readers never see a
//! half-applied change.

pub mod error;

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use error::RegistryError;

/// On-disk schema version.
pub const REGISTRY_VERSION: &str = "1.0";

/// 사용자가 등록한 관리 대상 서버
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedService {
    pub name: String,
    pub cwd: PathBuf,
    pub command: String,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stop: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ManagedService {
    /// Build an unregistered definition. Duplicate ports are dropped, keeping
    /// the first occurrence's position.
    pub fn new(name: &str, cwd: impl Into<PathBuf>, command: &str, ports: &[u16]) -> Self {
        let now = Utc::now();
        let mut unique = Vec::with_capacity(ports.len());
        for port in ports {
            if !unique.contains(port) {
                unique.push(*port);
            }
        }
        Self {
            name: name.to_string(),
            cwd: cwd.into(),
            command: command.to_string(),
            ports: unique,
            tags: Vec::new(),
            last_pid: None,
            last_start: None,
            last_stop: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A PID is on record and no stop has been recorded since it started.
    pub fn has_unstopped_run(&self) -> bool {
        match (self.last_pid, self.last_stop) {
            (None, _) | (Some(0), _) => false,
            (Some(_), None) => true,
            (Some(_), Some(stopped)) => self.last_start.map_or(false, |started| started > stopped),
        }
    }
}

/// Versioned name → service map. Ordered so the serialized form is canonical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    pub version: String,
    #[serde(default)]
    pub services: BTreeMap<String, ManagedService>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION.to_string(),
            services: BTreeMap::new(),
        }
    }
}

/// Thread-safe store backed by a single JSON file.
pub struct RegistryStore {
    file_path: PathBuf,
    data: RwLock<Registry>,
}

impl RegistryStore {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            data: RwLock::new(Registry::default()),
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Registry>, RegistryError> {
        self.data.read().map_err(|e| {
            tracing::error!("Registry lock poisoned: {}", e);
            RegistryError::LockPoisoned
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Registry>, RegistryError> {
        self.data.write().map_err(|e| {
            tracing::error!("Registry lock poisoned: {}", e);
            RegistryError::LockPoisoned
        })
    }

    /// 파일에서 레지스트리 로드. 파일이 없으면 빈 레지스트리로 시작
    pub fn load(&self) -> Result<(), RegistryError> {
        let mut data = self.write()?;

        let content = match fs::read_to_string(&self.file_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Registry file {} does not exist, starting empty", self.file_path.display());
                *data = Registry::default();
                return Ok(());
            }
            Err(source) => {
                return Err(RegistryError::Io {
                    path: self.file_path.clone(),
                    source,
                })
            }
        };

        let parsed: Registry = serde_json::from_str(&content).map_err(|source| RegistryError::Corrupt {
            path: self.file_path.clone(),
            source,
        })?;
        tracing::debug!("Loaded {} managed services", parsed.services.len());
        *data = parsed;
        Ok(())
    }

    /// Register a new service. Fails if the name is taken.
    pub fn add(&self, mut service: ManagedService) -> Result<(), RegistryError> {
        let mut data = self.write()?;
        if data.services.contains_key(&service.name) {
            return Err(RegistryError::DuplicateName(service.name));
        }

        let now = Utc::now();
        service.created_at = now;
        service.updated_at = now;
        tracing::info!("Registering service '{}'", service.name);
        data.services.insert(service.name.clone(), service);

        self.persist(&data)
    }

    /// Replace an existing definition. `created_at` is kept from the stored copy.
    pub fn update(&self, mut service: ManagedService) -> Result<(), RegistryError> {
        let mut data = self.write()?;
        let existing = data
            .services
            .get(&service.name)
            .ok_or_else(|| RegistryError::NotFound(service.name.clone()))?;

        service.created_at = existing.created_at;
        service.updated_at = Utc::now();
        data.services.insert(service.name.clone(), service);

        self.persist(&data)
    }

    pub fn remove(&self, name: &str) -> Result<(), RegistryError> {
        let mut data = self.write()?;
        if data.services.remove(name).is_none() {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        tracing::info!("Removed service '{}'", name);

        self.persist(&data)
    }

    pub fn get(&self, name: &str) -> Result<Option<ManagedService>, RegistryError> {
        Ok(self.read()?.services.get(name).cloned())
    }

    /// All services, ordered by name.
    pub fn list(&self) -> Result<Vec<ManagedService>, RegistryError> {
        Ok(self.read()?.services.values().cloned().collect())
    }

    /// Record a fresh run: PID and start time, with any previous stop cleared.
    pub fn set_last_pid(&self, name: &str, pid: u32) -> Result<(), RegistryError> {
        self.mutate(name, |service, now| {
            service.last_pid = Some(pid);
            service.last_start = Some(now);
            service.last_stop = None;
        })
    }

    /// Mark the service as deliberately stopped.
    pub fn clear_last_pid(&self, name: &str) -> Result<(), RegistryError> {
        self.mutate(name, |service, now| {
            service.last_pid = None;
            service.last_stop = Some(now);
        })
    }

    fn mutate<F>(&self, name: &str, apply: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut ManagedService, DateTime<Utc>),
    {
        let mut data = self.write()?;
        let service = data
            .services
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        let now = Utc::now();
        apply(service, now);
        service.updated_at = now;

        self.persist(&data)
    }

    /// Full rewrite through a sibling temp file, renamed into place.
    /// Caller must hold the write lock.
    fn persist(&self, data: &Registry) -> Result<(), RegistryError> {
        let persist_err = |source: std::io::Error| RegistryError::Persist {
            path: self.file_path.clone(),
            source,
        };

        let dir = match self.file_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(persist_err)?;

        let content = serde_json::to_vec_pretty(data).map_err(|e| persist_err(e.into()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(persist_err)?;
        tmp.write_all(&content).map_err(persist_err)?;
        tmp.as_file().sync_all().map_err(persist_err)?;
        tmp.persist(&self.file_path).map_err(|e| persist_err(e.error))?;

        tracing::debug!("Saved {} managed services", data.services.len());
        Ok(())
    }
}
