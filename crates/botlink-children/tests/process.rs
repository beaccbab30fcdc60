//! Child supervision against real `sh` processes.

#![cfg(unix)]

use std::net::{Ipv4Addr, TcpListener};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;

use botlink_children::{
    ChildError, ChildProcessManager, ChildStatus, LaunchOutcome, ManagerOptions, PortAllocator,
};
use botlink_settings::{BotSettings, PortSettings};

const SLEEPER: &str = "exec sleep 30\n";

fn declare(root: &Path, name: &str, description: &str, script: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("subbot.json"),
        format!(
            r#"{{"name": "{name}", "version": "1.0", "description": "{description}",
                "entry_point": "run.sh", "startup": true}}"#
        ),
    )
    .unwrap();
    std::fs::write(dir.join("run.sh"), script).unwrap();
}

fn manager_with(root: &Path, max_restarts: Option<u32>, ports: Arc<PortAllocator>) -> ChildProcessManager {
    let mut settings = BotSettings::default();
    settings.children.dir = root.display().to_string();
    settings.children.runtime = Some("sh".into());
    settings.children.manager_version = Some("1.0.0".into());
    settings.children.monitor_interval_secs = 0.05;
    settings.children.max_restarts = max_restarts;
    ChildProcessManager::new(ManagerOptions::from_settings(&settings), ports)
}

fn default_ports() -> Arc<PortAllocator> {
    Arc::new(PortAllocator::new(&PortSettings::default()))
}

fn pid_of(m: &ChildProcessManager, name: &str) -> Option<u32> {
    m.list().into_iter().find(|c| c.name == name).and_then(|c| c.pid)
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn launch_list_and_stop() {
    let root = tempfile::tempdir().unwrap();
    declare(root.path(), "echo", "echo bot", SLEEPER);
    let ports = default_ports();
    let m = manager_with(root.path(), None, Arc::clone(&ports));
    let _ = m.discover();

    let port = match m.launch("echo").await.unwrap() {
        LaunchOutcome::Launched { port } => port,
        other => panic!("unexpected outcome {other:?}"),
    };
    assert!(m.is_running("echo"));
    assert!(ports.is_allocated(port));

    let info = m.list().into_iter().find(|c| c.name == "echo").unwrap();
    assert_eq!(info.status, ChildStatus::Running);
    assert_eq!(info.port, Some(port));
    assert!(info.pid.is_some());
    assert!(info.started_at.is_some());
    assert_eq!(info.restarts, 0);

    assert_matches!(m.launch("echo").await, Err(ChildError::AlreadyRunning(_)));

    m.stop("echo").await.unwrap();
    assert!(!m.is_running("echo"));
    assert!(!ports.is_allocated(port));
    assert_eq!(m.list()[0].status, ChildStatus::Stopped);

    m.stop_all().await;
}

/// One `pid port token` line per launch, written by the child script.
fn launches(path: &Path) -> Vec<(u32, u16, String)> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next().unwrap().parse().unwrap();
            let port = parts.next().unwrap().parse().unwrap();
            let token = parts.next().unwrap().to_string();
            (pid, port, token)
        })
        .collect()
}

#[tokio::test]
async fn crashed_child_is_restarted_with_fresh_port_and_token() {
    let root = tempfile::tempdir().unwrap();
    // Argv is `run.sh --ws_port <port> --token <token>`. The first run dies;
    // the restart finds the marker and stays up.
    declare(
        root.path(),
        "flaky",
        "crashes once",
        "echo \"$$ $2 $4\" >> launches\n\
         if [ -f crashed ]; then exec sleep 30; fi\n\
         touch crashed\n\
         exit 1\n",
    );
    let ports = default_ports();
    let m = manager_with(root.path(), None, Arc::clone(&ports));
    let _ = m.discover();

    let first_port = match m.launch("flaky").await.unwrap() {
        LaunchOutcome::Launched { port } => port,
        other => panic!("unexpected outcome {other:?}"),
    };
    let log = root.path().join("flaky").join("launches");
    wait_until("restart", || {
        m.list()
            .iter()
            .any(|c| c.name == "flaky" && c.restarts >= 1 && c.status == ChildStatus::Running)
            && launches(&log).len() >= 2
    })
    .await;

    let runs = launches(&log);
    let (old_pid, old_port, old_token) = &runs[0];
    let (new_pid, new_port, new_token) = &runs[1];
    assert_eq!(*old_port, first_port);
    assert_ne!(old_pid, new_pid);
    assert_ne!(old_token, new_token);

    let info = m.list().into_iter().find(|c| c.name == "flaky").unwrap();
    assert_eq!(info.pid, Some(*new_pid));
    assert_eq!(info.port, Some(*new_port));
    assert!(ports.is_allocated(*new_port));
    if new_port != old_port {
        assert!(!ports.is_allocated(*old_port));
    }

    m.stop_all().await;
    assert!(!m.is_running("flaky"));
}

#[tokio::test]
async fn restart_cap_leaves_child_stopped() {
    let root = tempfile::tempdir().unwrap();
    let counter = root.path().join("runs");
    let script = format!("echo run >> '{}'\nexit 1\n", counter.display());
    declare(root.path(), "doomed", "always crashes", &script);
    let m = manager_with(root.path(), Some(2), default_ports());
    let _ = m.discover();

    let _ = m.launch("doomed").await.unwrap();
    wait_until("three runs", || {
        std::fs::read_to_string(&counter).is_ok_and(|s| s.lines().count() >= 3)
    })
    .await;
    wait_until("child stopped", || !m.is_running("doomed")).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(!m.is_running("doomed"));
    let runs = std::fs::read_to_string(&counter).unwrap().lines().count();
    assert_eq!(runs, 3);

    m.stop_all().await;
}

#[tokio::test]
async fn boot_runs_once() {
    let root = tempfile::tempdir().unwrap();
    declare(root.path(), "auto", "autostarted", SLEEPER);
    let m = manager_with(root.path(), None, default_ports());

    assert_eq!(m.boot().await, vec!["auto".to_string()]);
    assert!(m.is_running("auto"));
    assert!(m.boot().await.is_empty());

    m.stop_all().await;
    assert!(!m.is_running("auto"));
}

#[tokio::test]
async fn reload_picks_up_new_declaration() {
    let root = tempfile::tempdir().unwrap();
    declare(root.path(), "echo", "before", SLEEPER);
    let m = manager_with(root.path(), None, default_ports());
    let _ = m.discover();

    let _ = m.launch("echo").await.unwrap();
    let first_pid = pid_of(&m, "echo").unwrap();

    declare(root.path(), "echo", "after", SLEEPER);
    assert_matches!(m.reload("echo").await, Ok(LaunchOutcome::Launched { .. }));
    assert_eq!(m.metadata("echo").unwrap().description, "after");
    let second_pid = pid_of(&m, "echo").unwrap();
    assert_ne!(first_pid, second_pid);

    m.stop_all().await;
}

#[tokio::test]
async fn reload_of_stopped_child_launches_it() {
    let root = tempfile::tempdir().unwrap();
    declare(root.path(), "echo", "idle", SLEEPER);
    let m = manager_with(root.path(), None, default_ports());
    let _ = m.discover();

    assert_matches!(m.reload("echo").await, Ok(LaunchOutcome::Launched { .. }));
    assert!(m.is_running("echo"));

    m.stop_all().await;
}

#[tokio::test]
async fn stop_all_stops_every_child() {
    let root = tempfile::tempdir().unwrap();
    declare(root.path(), "one", "first", SLEEPER);
    declare(root.path(), "two", "second", SLEEPER);
    let ports = default_ports();
    let m = manager_with(root.path(), None, Arc::clone(&ports));
    let _ = m.discover();

    let _ = m.launch("one").await.unwrap();
    let _ = m.launch("two").await.unwrap();
    assert_eq!(ports.allocated_count(), 2);

    m.stop_all().await;
    assert!(!m.is_running("one"));
    assert!(!m.is_running("two"));
    assert_eq!(ports.allocated_count(), 0);
}

#[tokio::test]
async fn occupied_port_range_is_exhausted() {
    let holder = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = holder.local_addr().unwrap().port();
    let ports = Arc::new(PortAllocator::new(&PortSettings {
        range_start: port,
        range_end: port,
        random_attempts: 3,
    }));

    let root = tempfile::tempdir().unwrap();
    declare(root.path(), "echo", "no room", SLEEPER);
    let m = manager_with(root.path(), None, ports);
    let _ = m.discover();

    assert_matches!(m.launch("echo").await, Err(ChildError::PortsExhausted));
    assert!(!m.is_running("echo"));
}
