//! Application facade: wires config, registry, scanner, resolver, supervisor
//! and health checker together and exposes service-level operations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{anyhow, bail, Context};
use serde::Serialize;

use crate::config::{Config, Settings};
use crate::health::{HealthCheck, HealthChecker};
use crate::reconcile::{self, Discovery, ServerInfo};
use crate::registry::{ManagedService, RegistryError, RegistryStore};
use crate::resolver::ProjectResolver;
use crate::scanner::{self, filter, DiscoveredProcess, Scanner};
use crate::supervisor::command::{legacy_command_warnings, validate_managed_command};
use crate::supervisor::{PendingStart, State, StateMachine, Supervisor};

/// Everything known about one server, for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub server: ServerInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<DiscoveredProcess>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ManagedService>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
    pub health: HealthCheck,
}

pub struct App {
    settings: Settings,
    registry: RegistryStore,
    scanner: Scanner,
    resolver: ProjectResolver,
    supervisor: Supervisor,
    health: HealthChecker,
    pending: Mutex<HashMap<String, PendingStart>>,
}

impl App {
    /// Open the registry and build every component. The second value holds
    /// the startup warnings (registered commands with shell syntax); they
    /// are computed here once and never again.
    pub fn open(config: Config) -> anyhow::Result<(Self, Vec<String>)> {
        config.paths.ensure_dirs()?;

        let registry = RegistryStore::new(&config.paths.registry_file);
        registry
            .load()
            .with_context(|| format!("failed to load registry {}", config.paths.registry_file.display()))?;

        let warnings = legacy_command_warnings(&registry.list()?)
            .into_iter()
            .map(|entry| format!("managed command uses shell syntax and will not run as intended: {}", entry))
            .collect();

        let settings = config.settings;
        let app = Self {
            scanner: Scanner::new(settings.cwd_lookup_timeout()),
            resolver: ProjectResolver::new(),
            supervisor: Supervisor::new(&config.paths.logs_dir).with_stop_timeout(settings.stop_timeout()),
            health: HealthChecker::new(settings.health_timeout()),
            registry,
            settings,
            pending: Mutex::new(HashMap::new()),
        };
        Ok((app, warnings))
    }

    pub fn registry(&self) -> &RegistryStore {
        &self.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ─── Discovery ───────────────────────────────────────────

    /// Scan, enrich and reconcile.
    pub async fn discover(&self) -> anyhow::Result<Discovery> {
        let mut processes = self.scanner.scan().await.context("failed to scan processes")?;
        if self.settings.dev_only {
            filter::retain_dev_processes(&mut processes);
        }
        scanner::attach_project_roots(&mut processes, &self.resolver);
        self.discovery_from(processes)
    }

    /// Reconcile an already enriched snapshot against the registry.
    pub fn discovery_from(&self, processes: Vec<DiscoveredProcess>) -> anyhow::Result<Discovery> {
        let services = self.registry.list()?;
        let servers = reconcile::reconcile(
            &processes,
            &services,
            &self.resolver,
            &self.supervisor,
            self.settings.crash_tail_lines,
        );
        Ok(Discovery {
            processes,
            services,
            servers,
        })
    }

    // ─── Registry ────────────────────────────────────────────

    pub fn add_service(&self, name: &str, cwd: impl Into<PathBuf>, command: &str, ports: &[u16]) -> anyhow::Result<()> {
        let name = name.trim();
        if name.is_empty() {
            bail!("service name must not be empty");
        }
        // 이름이 로그 디렉터리 경로의 한 구성요소로 쓰임
        if name == "." || name.contains("..") || name.contains(['/', '\\']) {
            bail!("service name '{}' must not contain path separators or '..'", name);
        }
        validate_managed_command(command).with_context(|| format!("rejected command for '{}'", name))?;

        self.registry.add(ManagedService::new(name, cwd, command.trim(), ports))?;
        tracing::info!("Registered service '{}'", name);
        Ok(())
    }

    pub fn remove_service(&self, name: &str) -> anyhow::Result<()> {
        self.registry.remove(name)?;
        self.forget_pending(name);
        self.resolver.clear_cache();
        tracing::info!("Removed service '{}'", name);
        Ok(())
    }

    // ─── Lifecycle ───────────────────────────────────────────

    pub async fn start_service(&self, name: &str) -> anyhow::Result<u32> {
        let svc = self.service(name)?;
        let mut machine = StateMachine::from_state(self.service_state_of(&svc));
        machine
            .transition(State::Starting)
            .with_context(|| format!("cannot start '{}'", name))?;

        let pid = self
            .supervisor
            .start(&svc)
            .await
            .with_context(|| format!("failed to start '{}'", name))?;
        self.record_start(name, pid)?;
        Ok(pid)
    }

    /// Stop by service name or port. Returns the PID that was stopped.
    pub async fn stop(&self, identifier: &str) -> anyhow::Result<u32> {
        let (pid, service_name) = match self.registry.get(identifier)? {
            Some(svc) => (self.pid_for_service(&svc).await?, Some(svc.name)),
            None => {
                let port: u16 = identifier
                    .parse()
                    .map_err(|_| anyhow!("invalid service name or port: {}", identifier))?;
                let discovery = self.discover().await?;
                let server = discovery
                    .servers_on_port(port)
                    .next()
                    .ok_or_else(|| anyhow!("no process found on port {}", port))?;
                let pid = server
                    .pid()
                    .ok_or_else(|| anyhow!("no process found on port {}", port))?;
                (pid, server.service_name().map(str::to_string))
            }
        };

        self.supervisor
            .stop(pid, self.settings.stop_timeout())
            .await
            .with_context(|| format!("failed to stop PID {}", pid))?;

        if let Some(name) = service_name {
            self.forget_pending(&name);
            self.registry
                .clear_last_pid(&name)
                .with_context(|| format!("PID {} stopped but '{}' could not be marked stopped", pid, name))?;
        }
        Ok(pid)
    }

    pub async fn restart_service(&self, name: &str) -> anyhow::Result<u32> {
        let svc = self.service(name)?;
        let pid = self
            .supervisor
            .restart(&svc)
            .await
            .with_context(|| format!("failed to restart '{}'", name))?;
        self.record_start(name, pid)?;
        Ok(pid)
    }

    /// Lifecycle state, `Starting` while a recent start shows no process yet.
    /// A crash inside that window is reported as `Crashed` right away.
    pub fn service_state(&self, name: &str) -> anyhow::Result<State> {
        let svc = self.service(name)?;
        Ok(self.service_state_of(&svc))
    }

    // ─── Logs & status ───────────────────────────────────────

    pub fn service_logs(&self, name: &str, lines: usize) -> anyhow::Result<Vec<String>> {
        self.service(name)?;
        Ok(self.supervisor.tail(name, lines)?)
    }

    pub async fn process_logs(&self, pid: u32, lines: usize) -> anyhow::Result<Vec<String>> {
        Ok(self.supervisor.tail_foreign_process(pid, lines).await?)
    }

    /// Status of the server matching `identifier` (service name or port).
    pub async fn status(&self, identifier: &str) -> anyhow::Result<ServerStatus> {
        let discovery = self.discover().await?;
        self.status_in(&discovery, identifier).await
    }

    pub async fn status_in(&self, discovery: &Discovery, identifier: &str) -> anyhow::Result<ServerStatus> {
        let server = discovery
            .servers
            .iter()
            .find(|s| s.service_name() == Some(identifier) || s.port().map(|p| p.to_string()).as_deref() == Some(identifier))
            .ok_or_else(|| anyhow!("server {:?} not found", identifier))?;

        let process = match server.process() {
            Some(reconcile::ProcessRef::Discovered(key)) => discovery.process(key).cloned(),
            _ => None,
        };
        let service = server.service_name().and_then(|name| discovery.service(name)).cloned();
        let state = service.as_ref().map(|svc| self.service_state_of(svc));

        let port = server
            .port()
            .or_else(|| service.as_ref().and_then(|svc| svc.ports.first().copied()));
        let health = match port {
            Some(port) => self.health.check(port).await,
            None => HealthCheck::unknown(),
        };

        Ok(ServerStatus {
            server: server.clone(),
            process,
            service,
            state,
            health,
        })
    }

    // ─── Internals ───────────────────────────────────────────

    fn service(&self, name: &str) -> anyhow::Result<ManagedService> {
        self.registry
            .get(name)?
            .ok_or_else(|| RegistryError::NotFound(name.to_string()).into())
    }

    fn service_state_of(&self, svc: &ManagedService) -> State {
        let observed = self.supervisor.observed_state(svc);
        let Ok(mut pending) = self.pending.lock() else {
            return observed;
        };
        let Some(start) = pending.get(&svc.name).copied() else {
            return observed;
        };
        let now = Instant::now();
        if observed != State::Stopped || start.is_expired(now) {
            pending.remove(&svc.name);
        }
        start.resolve(observed, now)
    }

    /// The process is already running when this is called, so the pending
    /// window opens even if the PID cannot be persisted.
    fn record_start(&self, name: &str, pid: u32) -> anyhow::Result<()> {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(name.to_string(), PendingStart::new(self.settings.start_timeout()));
        }
        self.registry
            .set_last_pid(name, pid)
            .with_context(|| format!("'{}' is running as PID {} but the PID could not be recorded", name, pid))
    }

    fn forget_pending(&self, name: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(name);
        }
    }

    /// Recorded PID first, then the reconciled pairing, then whoever owns
    /// one of the declared ports.
    async fn pid_for_service(&self, svc: &ManagedService) -> anyhow::Result<u32> {
        if let Some(pid) = svc.last_pid.filter(|pid| *pid > 0) {
            return Ok(pid);
        }

        let discovery = self.discover().await?;
        if let Some(pid) = discovery.server_for_service(&svc.name).and_then(ServerInfo::pid) {
            return Ok(pid);
        }
        svc.ports
            .iter()
            .find_map(|port| discovery.servers_on_port(*port).find_map(ServerInfo::pid))
            .ok_or_else(|| anyhow!("cannot determine PID to stop for '{}'", svc.name))
    }
}
