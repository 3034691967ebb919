/// 실제 자식 프로세스를 띄워 Supervisor의 시작/중지/로그 동작을 검증

use std::path::Path;
use std::time::{Duration, Instant};

use portwarden::registry::ManagedService;
use portwarden::supervisor::{Supervisor, SupervisorError};
use tempfile::TempDir;

fn service(name: &str, cwd: &Path, command: &str) -> ManagedService {
    ManagedService::new(name, cwd, command, &[])
}

/// Poll `cond` until it holds or `limit` passes.
async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

#[tokio::test]
async fn test_start_then_stop_gracefully() {
    let dir = TempDir::new().unwrap();
    let sup = Supervisor::new(dir.path().join("logs"));

    let pid = sup.start(&service("sleeper", dir.path(), "sleep 30")).await.unwrap();
    assert!(pid > 0);
    assert!(sup.is_running(pid));

    let started = Instant::now();
    sup.stop(pid, Duration::from_secs(3)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3), "sleep should honor SIGTERM");
    assert!(!sup.is_running(pid));

    // 이미 종료된 프로세스를 다시 중지해도 성공
    sup.stop(pid, Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_stop_escalates_when_term_is_ignored() {
    let dir = TempDir::new().unwrap();
    let sup = Supervisor::new(dir.path().join("logs"));

    let svc = service("stubborn", dir.path(), "sh -c \"trap '' TERM; echo armed; sleep 30\"");
    let pid = sup.start(&svc).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(3), || {
            sup.tail("stubborn", 5).map_or(false, |lines| lines.iter().any(|l| l == "armed"))
        })
        .await,
        "trap was never installed"
    );

    let timeout = Duration::from_millis(500);
    let started = Instant::now();
    sup.stop(pid, timeout).await.unwrap();

    assert!(started.elapsed() >= timeout);
    assert!(!sup.is_running(pid));
}

#[tokio::test]
async fn test_output_is_captured_to_log() {
    let dir = TempDir::new().unwrap();
    let sup = Supervisor::new(dir.path().join("logs"));

    let svc = service("chatty", dir.path(), "sh -c \"echo hello; echo oops >&2\"");
    sup.start(&svc).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            sup.tail("chatty", 10).map_or(false, |lines| lines.len() == 2)
        })
        .await
    );
    let lines = sup.tail("chatty", 10).unwrap();
    assert_eq!(lines, vec!["hello".to_string(), "oops".to_string()]);
    assert_eq!(sup.tail("chatty", 1).unwrap(), vec!["oops".to_string()]);
    assert!(sup.tail("chatty", 0).unwrap().is_empty());

    let log = sup.latest_log_path("chatty").unwrap();
    assert!(log.starts_with(dir.path().join("logs").join("chatty")));
}

#[tokio::test]
async fn test_child_runs_in_service_cwd() {
    let dir = TempDir::new().unwrap();
    let workdir = dir.path().join("project");
    std::fs::create_dir_all(&workdir).unwrap();
    let sup = Supervisor::new(dir.path().join("logs"));

    sup.start(&service("pwd", &workdir, "pwd")).await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || sup.tail("pwd", 1).map_or(false, |l| !l.is_empty())).await);

    let printed = sup.tail("pwd", 1).unwrap().remove(0);
    let expected = workdir.canonicalize().unwrap();
    assert_eq!(Path::new(&printed).canonicalize().unwrap(), expected);
}

#[tokio::test]
async fn test_restart_replaces_previous_run() {
    let dir = TempDir::new().unwrap();
    let sup = Supervisor::new(dir.path().join("logs")).with_stop_timeout(Duration::from_secs(2));

    let mut svc = service("sleeper", dir.path(), "sleep 30");
    let first = sup.start(&svc).await.unwrap();
    svc.last_pid = Some(first);

    let second = sup.restart(&svc).await.unwrap();
    assert_ne!(first, second);
    assert!(!sup.is_running(first));
    assert!(sup.is_running(second));

    sup.stop(second, Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_tail_without_logs() {
    let dir = TempDir::new().unwrap();
    let sup = Supervisor::new(dir.path().join("logs"));
    let err = sup.tail("never-started", 10).unwrap_err();
    assert_eq!(err.error_code(), "NO_LOGS");
}

#[tokio::test]
async fn test_foreign_tail_rejects_bad_pid() {
    let dir = TempDir::new().unwrap();
    let sup = Supervisor::new(dir.path().join("logs"));
    assert!(matches!(
        sup.tail_foreign_process(0, 10).await,
        Err(SupervisorError::InvalidPid(0))
    ));
    assert!(sup.tail_foreign_process(std::process::id(), 0).await.unwrap().is_empty());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_foreign_tail_finds_open_log_file() {
    let dir = TempDir::new().unwrap();
    let sup = Supervisor::new(dir.path().join("logs"));

    let svc = service("holder", dir.path(), "sh -c \"echo ready; sleep 30\"");
    let pid = sup.start(&svc).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(3), || {
            sup.tail("holder", 1).map_or(false, |l| l == vec!["ready".to_string()])
        })
        .await
    );

    // 스폰한 프로세스가 열어둔 로그 파일을 /proc을 통해 찾아야 함
    let lines = sup.tail_foreign_process(pid, 5).await.unwrap();
    assert_eq!(lines, vec!["ready".to_string()]);

    sup.stop(pid, Duration::from_secs(2)).await.unwrap();
}
