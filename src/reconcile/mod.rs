//! Reconciliation: one view over what is listening and what is registered.
//!
//! Every discovered process yields exactly one entry. Each registered service
//! then claims discovered entries by PID, by project root / cwd, or by a
//! uniquely declared port, in that order. Services that claim nothing show up
//! as portless-running, crashed or stopped.

pub mod crash;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::registry::ManagedService;
use crate::resolver::ProjectResolver;
use crate::scanner::{DiscoveredProcess, ProcessKey};
use crate::supervisor::{ProcessControl, Supervisor};
use crate::utils::{conflicting_paths, same_path};
pub use crash::{CrashCategory, CrashClassifier, CrashReason, CrashReport};

/// Who is responsible for a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Manual,
    Managed,
    Agent,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Running,
    Stopped,
    Crashed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessRef {
    /// A record of the current scan snapshot.
    Discovered(ProcessKey),
    /// A live recorded PID that holds no scanned port.
    Portless { pid: u32 },
}

impl ProcessRef {
    pub fn pid(&self) -> u32 {
        match self {
            Self::Discovered(key) => key.pid,
            Self::Portless { pid } => *pid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pairing {
    Process { process: ProcessRef },
    Service { service: String },
    Paired { process: ProcessRef, service: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub pairing: Pairing,
    pub source: Source,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crash: Option<CrashReport>,
}

impl ServerInfo {
    pub fn process(&self) -> Option<&ProcessRef> {
        match &self.pairing {
            Pairing::Process { process } | Pairing::Paired { process, .. } => Some(process),
            Pairing::Service { .. } => None,
        }
    }

    pub fn service_name(&self) -> Option<&str> {
        match &self.pairing {
            Pairing::Service { service } | Pairing::Paired { service, .. } => Some(service),
            Pairing::Process { .. } => None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process().map(ProcessRef::pid)
    }

    pub fn port(&self) -> Option<u16> {
        match self.process() {
            Some(ProcessRef::Discovered(key)) => Some(key.port),
            _ => None,
        }
    }
}

/// One reconciliation cycle: the inputs plus the entries that reference them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Discovery {
    pub processes: Vec<DiscoveredProcess>,
    pub services: Vec<ManagedService>,
    pub servers: Vec<ServerInfo>,
}

impl Discovery {
    pub fn process(&self, key: &ProcessKey) -> Option<&DiscoveredProcess> {
        self.processes.iter().find(|p| p.key() == *key)
    }

    pub fn service(&self, name: &str) -> Option<&ManagedService> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn server_for_service(&self, name: &str) -> Option<&ServerInfo> {
        self.servers.iter().find(|s| s.service_name() == Some(name))
    }

    /// Entries whose discovered process listens on `port`.
    pub fn servers_on_port(&self, port: u16) -> impl Iterator<Item = &ServerInfo> {
        self.servers.iter().filter(move |s| s.port() == Some(port))
    }
}

/// Merge a scan snapshot with the registry.
pub fn reconcile<C: ProcessControl>(
    processes: &[DiscoveredProcess],
    services: &[ManagedService],
    resolver: &ProjectResolver,
    supervisor: &Supervisor<C>,
    crash_tail_lines: usize,
) -> Vec<ServerInfo> {
    // servers[i] describes processes[i] for every i < processes.len()
    let mut servers: Vec<ServerInfo> = processes
        .iter()
        .map(|p| ServerInfo {
            pairing: Pairing::Process {
                process: ProcessRef::Discovered(p.key()),
            },
            source: p.agent_tag.as_ref().map_or(Source::Manual, |tag| tag.source),
            status: Status::Running,
            crash: None,
        })
        .collect();
    let mut paired = vec![false; processes.len()];

    let ports = PortIndex::build(processes, services);
    let classifier = CrashClassifier::new();

    let mut ordered: Vec<&ManagedService> = services.iter().collect();
    ordered.sort_by(|a, b| a.name.cmp(&b.name));

    for svc in ordered {
        let svc_root = resolver.find_root(&svc.cwd);

        let mut claimed = match_by_pid(svc, processes, &paired);
        if claimed.is_empty() {
            claimed.extend(match_by_root(svc, svc_root.as_deref(), processes, &paired));
        }
        if claimed.is_empty() {
            claimed.extend(match_by_port(svc, svc_root.as_deref(), processes, &paired, &ports));
        }

        if !claimed.is_empty() {
            for idx in claimed {
                tracing::debug!("Service '{}' paired with PID {}", svc.name, processes[idx].pid);
                paired[idx] = true;
                servers[idx].pairing = Pairing::Paired {
                    process: ProcessRef::Discovered(processes[idx].key()),
                    service: svc.name.clone(),
                };
                servers[idx].source = Source::Managed;
            }
            continue;
        }

        if let Some(pid) = svc.last_pid.filter(|pid| supervisor.is_running(*pid)) {
            servers.push(ServerInfo {
                pairing: Pairing::Paired {
                    process: ProcessRef::Portless { pid },
                    service: svc.name.clone(),
                },
                source: Source::Managed,
                status: Status::Running,
                crash: None,
            });
            continue;
        }

        let (status, crash) = if svc.has_unstopped_run() {
            (
                Status::Crashed,
                Some(classifier.report(svc, supervisor, crash_tail_lines)),
            )
        } else {
            (Status::Stopped, None)
        };
        servers.push(ServerInfo {
            pairing: Pairing::Service {
                service: svc.name.clone(),
            },
            source: Source::Managed,
            status,
            crash,
        });
    }

    servers
}

/// Port usage on both sides of the merge.
struct PortIndex {
    declared_by: HashMap<u16, usize>,
    owner_pids: HashMap<u16, BTreeSet<u32>>,
}

impl PortIndex {
    fn build(processes: &[DiscoveredProcess], services: &[ManagedService]) -> Self {
        let mut declared_by: HashMap<u16, usize> = HashMap::new();
        for port in services.iter().flat_map(|s| s.ports.iter()) {
            *declared_by.entry(*port).or_default() += 1;
        }
        let mut owner_pids: HashMap<u16, BTreeSet<u32>> = HashMap::new();
        for p in processes {
            owner_pids.entry(p.port).or_default().insert(p.pid);
        }
        Self {
            declared_by,
            owner_pids,
        }
    }

    /// A port identifies a service only if both sides are unambiguous.
    fn is_unique(&self, port: u16) -> bool {
        self.declared_by.get(&port) == Some(&1) && self.owner_pids.get(&port).map_or(false, |pids| pids.len() == 1)
    }
}

fn match_by_pid(svc: &ManagedService, processes: &[DiscoveredProcess], paired: &[bool]) -> Vec<usize> {
    let Some(pid) = svc.last_pid.filter(|pid| *pid > 0) else {
        return Vec::new();
    };
    (0..processes.len())
        .filter(|&i| !paired[i] && processes[i].pid == pid)
        .collect()
}

fn match_by_root(
    svc: &ManagedService,
    svc_root: Option<&Path>,
    processes: &[DiscoveredProcess],
    paired: &[bool],
) -> Option<usize> {
    (0..processes.len()).find(|&i| {
        let p = &processes[i];
        !paired[i]
            && (same_path(svc_root, p.project_root.as_deref()) || same_path(Some(&svc.cwd), p.cwd.as_deref()))
    })
}

fn match_by_port(
    svc: &ManagedService,
    svc_root: Option<&Path>,
    processes: &[DiscoveredProcess],
    paired: &[bool],
    ports: &PortIndex,
) -> Option<usize> {
    svc.ports.iter().filter(|port| ports.is_unique(**port)).find_map(|port| {
        (0..processes.len()).find(|&i| {
            let p = &processes[i];
            !paired[i]
                && p.port == *port
                && !conflicting_paths(svc_root, p.project_root.as_deref())
                && !conflicting_paths(Some(&svc.cwd), p.cwd.as_deref())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{AgentTag, Confidence};
    use crate::supervisor::{SignalTarget, StopSignal};
    use nix::errno::Errno;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Only the listed PIDs are alive.
    struct Alive(Vec<u32>);

    impl ProcessControl for Alive {
        fn is_alive(&self, pid: u32) -> bool {
            self.0.contains(&pid)
        }

        fn signal(&self, _target: SignalTarget, _signal: StopSignal) -> Result<(), Errno> {
            Ok(())
        }
    }

    struct Fixture {
        dir: TempDir,
        resolver: ProjectResolver,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                resolver: ProjectResolver::new(),
            }
        }

        fn supervisor(&self, alive: &[u32]) -> Supervisor<Alive> {
            Supervisor::with_control(self.dir.path().join("logs"), Alive(alive.to_vec()))
        }

        /// A project directory with a marker file.
        fn project(&self, name: &str) -> PathBuf {
            let root = self.dir.path().join(name);
            fs::create_dir_all(root.join("src")).unwrap();
            fs::write(root.join("package.json"), "{}").unwrap();
            root
        }

        fn run(&self, processes: &[DiscoveredProcess], services: &[ManagedService], alive: &[u32]) -> Vec<ServerInfo> {
            reconcile(processes, services, &self.resolver, &self.supervisor(alive), 12)
        }
    }

    fn process(pid: u32, port: u16, cwd: Option<&Path>) -> DiscoveredProcess {
        DiscoveredProcess {
            pid,
            ppid: None,
            user: None,
            command: "node server.js".into(),
            port,
            protocol: "tcp".into(),
            cwd: cwd.map(Path::to_path_buf),
            project_root: None,
            agent_tag: None,
        }
    }

    fn service(name: &str, cwd: &Path, ports: &[u16], last_pid: Option<u32>) -> ManagedService {
        let mut svc = ManagedService::new(name, cwd, "npm run dev", ports);
        svc.last_pid = last_pid;
        if last_pid.is_some() {
            svc.last_start = Some(chrono::Utc::now());
        }
        svc
    }

    #[test]
    fn test_unmanaged_processes_keep_their_source() {
        let fx = Fixture::new();
        let mut tagged = process(2, 5173, None);
        tagged.agent_tag = Some(AgentTag {
            source: Source::Agent,
            agent_name: "codex".into(),
            confidence: Confidence::High,
        });
        let servers = fx.run(&[process(1, 3000, None), tagged], &[], &[]);

        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].source, Source::Manual);
        assert_eq!(servers[1].source, Source::Agent);
        assert!(servers.iter().all(|s| s.status == Status::Running && s.service_name().is_none()));
    }

    #[test]
    fn test_pid_beats_cwd() {
        let fx = Fixture::new();
        let api = fx.project("api");
        let processes = [process(200, 4000, Some(&api)), process(100, 3000, Some(Path::new("/elsewhere")))];
        let services = [service("api", &api, &[], Some(100))];

        let servers = fx.run(&processes, &services, &[100, 200]);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].service_name(), None);
        assert_eq!(servers[1].service_name(), Some("api"));
        assert_eq!(servers[1].source, Source::Managed);
    }

    #[test]
    fn test_pid_claims_every_port_of_that_pid() {
        let fx = Fixture::new();
        let api = fx.project("api");
        let processes = [process(100, 3000, None), process(100, 9229, None)];
        let services = [service("api", &api, &[], Some(100))];

        let servers = fx.run(&processes, &services, &[100]);
        assert_eq!(servers.len(), 2);
        assert!(servers.iter().all(|s| s.service_name() == Some("api")));
    }

    #[test]
    fn test_root_beats_port() {
        let fx = Fixture::new();
        let web = fx.project("web");
        let mut in_root = process(2, 4000, Some(&web.join("src")));
        in_root.project_root = fx.resolver.find_root(&web.join("src"));
        let processes = [process(1, 3000, None), in_root];
        let services = [service("web", &web, &[3000], None)];

        let servers = fx.run(&processes, &services, &[]);
        assert_eq!(servers[0].service_name(), None);
        assert_eq!(servers[1].service_name(), Some("web"));
        assert_eq!(servers[1].port(), Some(4000));
    }

    #[test]
    fn test_unique_port_pairs_unless_contradicted() {
        let fx = Fixture::new();
        let api = fx.project("api");
        let services = [service("api", &api, &[3000], None)];

        let servers = fx.run(&[process(1, 3000, None)], &services, &[]);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].service_name(), Some("api"));

        let servers = fx.run(&[process(1, 3000, Some(Path::new("/other/project")))], &services, &[]);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].service_name(), None);
        assert_eq!(servers[1].status, Status::Stopped);
    }

    #[test]
    fn test_port_declared_twice_never_pairs() {
        let fx = Fixture::new();
        let a = fx.project("a");
        let b = fx.project("b");
        let services = [service("a", &a, &[3000], None), service("b", &b, &[3000], None)];

        let servers = fx.run(&[process(1, 3000, None)], &services, &[]);
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0].pairing, Pairing::Process {
            process: ProcessRef::Discovered(ProcessKey { pid: 1, port: 3000 })
        });
        assert_eq!(servers[1].service_name(), Some("a"));
        assert_eq!(servers[2].service_name(), Some("b"));
        assert!(servers[1..].iter().all(|s| s.status == Status::Stopped));
    }

    #[test]
    fn test_portless_live_pid() {
        let fx = Fixture::new();
        let worker = fx.project("worker");
        let services = [service("worker", &worker, &[], Some(555))];

        let servers = fx.run(&[], &services, &[555]);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].process(), Some(&ProcessRef::Portless { pid: 555 }));
        assert_eq!(servers[0].status, Status::Running);
    }

    #[test]
    fn test_dead_pid_is_crashed_with_report() {
        let fx = Fixture::new();
        let api = fx.project("api");
        let log_dir = fx.dir.path().join("logs/api");
        fs::create_dir_all(&log_dir).unwrap();
        fs::write(
            log_dir.join("2026-10-18T09-00-00.000.log"),
            "ready\nError: listen EADDRINUSE: address already in use :::3000\n",
        )
        .unwrap();

        let services = [service("api", &api, &[3000], Some(4242)), service("idle", &api, &[], None)];
        let servers = fx.run(&[], &services, &[]);

        assert_eq!(servers[0].status, Status::Crashed);
        let crash = servers[0].crash.as_ref().unwrap();
        assert!(matches!(
            crash.reason,
            CrashReason::Keyword {
                category: CrashCategory::AddressInUse,
                ..
            }
        ));
        assert_eq!(crash.log_excerpt.len(), 2);

        assert_eq!(servers[1].status, Status::Stopped);
        assert!(servers[1].crash.is_none());
    }

    #[test]
    fn test_services_processed_in_name_order() {
        let fx = Fixture::new();
        let shared = fx.project("shared");
        // 같은 cwd를 가진 두 서비스 중 이름순으로 먼저인 쪽이 프로세스를 가져감
        let services = [service("zeta", &shared, &[], None), service("alpha", &shared, &[], None)];
        let servers = fx.run(&[process(1, 3000, Some(&shared))], &services, &[]);

        assert_eq!(servers[0].service_name(), Some("alpha"));
        assert_eq!(servers[1].service_name(), Some("zeta"));
        assert_eq!(servers[1].status, Status::Stopped);
    }

    #[test]
    fn test_discovery_lookups() {
        let fx = Fixture::new();
        let api = fx.project("api");
        let processes = vec![process(1, 3000, Some(&api))];
        let services = vec![service("api", &api, &[3000], None)];
        let servers = fx.run(&processes, &services, &[]);
        let discovery = Discovery {
            processes,
            services,
            servers,
        };

        let entry = discovery.server_for_service("api").unwrap();
        let ProcessRef::Discovered(key) = entry.process().unwrap() else {
            panic!("expected a discovered process");
        };
        assert_eq!(discovery.process(key).unwrap().port, 3000);
        assert_eq!(discovery.servers_on_port(3000).count(), 1);
        assert!(discovery.service("api").is_some());
    }
}
