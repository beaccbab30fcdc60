//! OS process plumbing: spawn, output capture, liveness polling, termination.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use botlink_core::logging::CHILD_OUTPUT_TARGET;

use crate::spec::ChildSpec;

/// Grace period between the terminate signal and a forced kill.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

const EXIT_POLL: Duration = Duration::from_millis(50);

/// Shared handle to a spawned child.
pub(crate) type ProcessHandle = Arc<Mutex<Child>>;

/// A watched child exited on its own.
#[derive(Clone, Debug)]
pub(crate) struct ExitNotice {
    pub name: String,
    pub launch_id: Uuid,
}

/// Build the launch command: `[runtime] <entry_point> --ws_port <port> --token <token>`.
pub(crate) fn build_command(spec: &ChildSpec, runtime: Option<&str>, port: u16, token: &str) -> Command {
    let entry = spec.entry_path();
    let mut cmd = match runtime {
        Some(runtime) => {
            let mut cmd = Command::new(runtime);
            let _ = cmd.arg(&entry);
            cmd
        }
        None => Command::new(&entry),
    };
    let _ = cmd
        .arg("--ws_port")
        .arg(port.to_string())
        .arg("--token")
        .arg(token)
        .current_dir(&spec.dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Spawn the child and start forwarding its stdout/stderr into the log.
pub(crate) fn spawn(
    spec: &ChildSpec,
    runtime: Option<&str>,
    port: u16,
    token: &str,
) -> std::io::Result<Child> {
    let mut child = build_command(spec, runtime, port, token).spawn()?;
    if let Some(stdout) = child.stdout.take() {
        forward_output(spec.name.clone(), "stdout", stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        forward_output(spec.name.clone(), "stderr", stderr);
    }
    Ok(child)
}

fn forward_output<R>(name: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    drop(tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(target: CHILD_OUTPUT_TARGET, child = %name, "[{name} {stream}] {line}"),
                Ok(None) => break,
                Err(e) => {
                    debug!(child = %name, stream, error = %e, "child output read failed");
                    break;
                }
            }
        }
    }));
}

/// Poll the child every `every`; report an unexpected exit once.
pub(crate) async fn watch(
    notice: ExitNotice,
    process: ProcessHandle,
    every: Duration,
    exits: mpsc::UnboundedSender<ExitNotice>,
    cancel: CancellationToken,
) {
    let every = every.max(EXIT_POLL);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let status = process.lock().try_wait();
                match status {
                    Ok(None) => {}
                    Ok(Some(status)) => {
                        warn!(child = %notice.name, %status, "child exited unexpectedly");
                        let _ = exits.send(notice);
                        return;
                    }
                    Err(e) => warn!(child = %notice.name, error = %e, "child status check failed"),
                }
            }
            () = cancel.cancelled() => return,
        }
    }
}

/// Terminate gracefully, wait up to `grace`, then kill.
pub(crate) async fn terminate(name: &str, process: &ProcessHandle, grace: Duration) {
    if has_exited(process) {
        return;
    }

    send_terminate(name, process);
    if wait_exit(process, grace).await {
        return;
    }

    warn!(child = name, grace_secs = grace.as_secs_f64(), "child ignored terminate, killing");
    if let Err(e) = process.lock().start_kill() {
        debug!(child = name, error = %e, "kill failed");
    }
    if !wait_exit(process, grace).await {
        warn!(child = name, "child still not reaped after kill");
    }
}

#[cfg(unix)]
fn send_terminate(name: &str, process: &ProcessHandle) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = process.lock().id().and_then(|pid| i32::try_from(pid).ok());
    match pid {
        Some(pid) => {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                debug!(child = name, pid, error = %e, "SIGTERM failed");
            }
        }
        None => debug!(child = name, "no pid, process already reaped"),
    }
}

#[cfg(not(unix))]
fn send_terminate(name: &str, process: &ProcessHandle) {
    if let Err(e) = process.lock().start_kill() {
        debug!(child = name, error = %e, "terminate failed");
    }
}

fn has_exited(process: &ProcessHandle) -> bool {
    !matches!(process.lock().try_wait(), Ok(None))
}

async fn wait_exit(process: &ProcessHandle, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if has_exited(process) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec() -> ChildSpec {
        ChildSpec {
            name: "echo".into(),
            version: "1.0.0".into(),
            description: "test".into(),
            author: String::new(),
            entry_point: "bot.py".into(),
            startup: false,
            compatible_versions: Vec::new(),
            dir: PathBuf::from("/srv/subbots/echo"),
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn command_with_runtime() {
        let cmd = build_command(&spec(), Some("python3"), 30_123, "tok");
        assert_eq!(cmd.as_std().get_program(), "python3");
        assert_eq!(
            args(&cmd),
            vec!["/srv/subbots/echo/bot.py", "--ws_port", "30123", "--token", "tok"]
        );
    }

    #[test]
    fn command_without_runtime_runs_entry_directly() {
        let cmd = build_command(&spec(), None, 30_000, "t");
        assert_eq!(cmd.as_std().get_program(), "/srv/subbots/echo/bot.py");
        assert_eq!(args(&cmd), vec!["--ws_port", "30000", "--token", "t"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_stops_sleeping_process() {
        let child = Command::new("sleep").arg("30").kill_on_drop(true).spawn().unwrap();
        let handle: ProcessHandle = Arc::new(Mutex::new(child));
        terminate("sleeper", &handle, Duration::from_secs(2)).await;
        assert!(has_exited(&handle));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_kills_process_ignoring_sigterm() {
        let child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let handle: ProcessHandle = Arc::new(Mutex::new(child));
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        terminate("stubborn", &handle, Duration::from_millis(300)).await;
        assert!(has_exited(&handle));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn watch_reports_exit() {
        let child = Command::new("true").spawn().unwrap();
        let handle: ProcessHandle = Arc::new(Mutex::new(child));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notice = ExitNotice {
            name: "quick".into(),
            launch_id: Uuid::now_v7(),
        };
        let id = notice.launch_id;
        drop(tokio::spawn(watch(
            notice,
            handle,
            Duration::from_millis(20),
            tx,
            CancellationToken::new(),
        )));
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.launch_id, id);
        assert_eq!(got.name, "quick");
    }
}
