//! Filesystem layout and tunables.
//!
//! Everything lives under one directory: `$PORTWARDEN_HOME`, or
//! `$HOME/.config/portwarden` when unset.
//!
//! ```text
//! <home>/config.toml     optional settings
//! <home>/registry.json   managed services
//! <home>/logs/<service>/ one log file per start
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

pub const HOME_ENV: &str = "PORTWARDEN_HOME";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub home: PathBuf,
    pub registry_file: PathBuf,
    pub logs_dir: PathBuf,
    pub settings_file: PathBuf,
}

impl Paths {
    pub fn under(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            registry_file: home.join("registry.json"),
            logs_dir: home.join("logs"),
            settings_file: home.join("config.toml"),
            home,
        }
    }

    /// Resolve from the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::under(home));
        }
        match std::env::var_os("HOME").filter(|v| !v.is_empty()) {
            Some(user_home) => Ok(Self::under(Path::new(&user_home).join(".config").join("portwarden"))),
            None => bail!("neither {} nor HOME is set", HOME_ENV),
        }
    }

    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        for dir in [&self.home, &self.logs_dir] {
            fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// `config.toml`. Every key is optional.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub stop_timeout_secs: u64,
    pub cwd_lookup_timeout_ms: u64,
    pub crash_tail_lines: usize,
    pub start_timeout_secs: u64,
    pub health_timeout_ms: u64,
    /// Hide listeners that do not look like development servers.
    pub dev_only: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 5,
            cwd_lookup_timeout_ms: 400,
            crash_tail_lines: 12,
            start_timeout_secs: 15,
            health_timeout_ms: 5_000,
            dev_only: true,
        }
    }
}

impl Settings {
    /// Missing file means defaults; a file that does not parse is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        toml::from_str(&raw).with_context(|| format!("malformed settings in {}", path.display()))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn cwd_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.cwd_lookup_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub paths: Paths,
    pub settings: Settings,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(Paths::from_env()?)
    }

    pub fn load_from(paths: Paths) -> anyhow::Result<Self> {
        let settings = Settings::load(&paths.settings_file)?;
        Ok(Self { paths, settings })
    }
}
