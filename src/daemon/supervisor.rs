use super::log_buffer::LogBuffer;
use crate::error::{DaemonError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// How long to wait for the reap after SIGKILL before giving up.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Published once when the supervised process is reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitEvent {
    /// Exit status code, `None` when killed by a signal or the reap failed.
    pub code: Option<i32>,
    /// `true` when the exit followed a stop request from the daemon.
    pub requested: bool,
}

impl std::fmt::Display for ExitEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit status {code}"),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// A started server process.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Receiver that holds `Some` once the process has exited.
    fn exit_events(&self) -> watch::Receiver<Option<ExitEvent>>;

    /// Graceful stop with escalation. Succeeds immediately if the process
    /// already exited.
    async fn stop(&mut self, cancel: &CancellationToken) -> Result<()>;
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn start(&self, args: &[String]) -> Result<Box<dyn ProcessHandle>>;
}

/// Waits until an exit has been published and returns it.
pub async fn wait_exit(rx: &mut watch::Receiver<Option<ExitEvent>>) -> Option<ExitEvent> {
    if let Ok(event) = rx.wait_for(Option::is_some).await {
        return *event;
    }
    *rx.borrow()
}

/// Spawns the inference server binary.
pub struct ServerLauncher {
    binary: PathBuf,
    log_buffer: Arc<LogBuffer>,
    stop_timeout: Duration,
}

impl ServerLauncher {
    pub fn new(binary: impl Into<PathBuf>, log_buffer: Arc<LogBuffer>, stop_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            log_buffer,
            stop_timeout,
        }
    }
}

#[async_trait]
impl Launcher for ServerLauncher {
    async fn start(&self, args: &[String]) -> Result<Box<dyn ProcessHandle>> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(binary = %self.binary.display(), args = ?args, "Spawning inference server");
        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to start {}: {}", self.binary.display(), e);
            DaemonError::ProcessStartFailed(format!("{}: {}", self.binary.display(), e))
        })?;

        let pid = child.id();
        info!(pid = ?pid, "Started inference server");

        let session = self.log_buffer.begin_session();
        spawn_log_readers(&mut child, &self.log_buffer, session);

        let (control_tx, control_rx) = mpsc::channel(4);
        let (exit_tx, exit_rx) = watch::channel(None);
        let requested = Arc::new(AtomicBool::new(false));
        tokio::spawn(watch_child(child, control_rx, exit_tx, Arc::clone(&requested)));

        Ok(Box::new(ServerProcess {
            pid,
            control: control_tx,
            exit: exit_rx,
            requested,
            stop_timeout: self.stop_timeout,
        }))
    }
}

enum Control {
    Terminate,
    Kill,
}

/// Handle to a process owned by its waiter task. Dropping the handle closes
/// the control channel, which makes the waiter kill the process.
pub struct ServerProcess {
    pid: Option<u32>,
    control: mpsc::Sender<Control>,
    exit: watch::Receiver<Option<ExitEvent>>,
    requested: Arc<AtomicBool>,
    stop_timeout: Duration,
}

#[async_trait]
impl ProcessHandle for ServerProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn exit_events(&self) -> watch::Receiver<Option<ExitEvent>> {
        self.exit.clone()
    }

    async fn stop(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.exit.borrow().is_some() {
            return Ok(());
        }

        self.requested.store(true, Ordering::SeqCst);
        info!(pid = ?self.pid, "Stopping inference server");
        if self.control.send(Control::Terminate).await.is_err() {
            trace!("Waiter already finished");
        }

        let graceful = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            exited = tokio::time::timeout(self.stop_timeout, wait_exit(&mut self.exit)) => exited.ok().flatten(),
        };
        if graceful.is_some() {
            debug!(pid = ?self.pid, "Inference server stopped gracefully");
            return Ok(());
        }

        warn!(pid = ?self.pid, "Inference server did not stop in time, killing");
        let _ = self.control.send(Control::Kill).await;
        match tokio::time::timeout(KILL_GRACE, wait_exit(&mut self.exit)).await {
            Ok(Some(_)) => Ok(()),
            _ => Err(DaemonError::StopFailed(format!(
                "process {} did not exit after kill",
                self.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into())
            ))),
        }
    }
}

async fn watch_child(
    mut child: Child,
    mut control: mpsc::Receiver<Control>,
    exit: watch::Sender<Option<ExitEvent>>,
    requested: Arc<AtomicBool>,
) {
    let pid = child.id();
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            msg = control.recv() => match msg {
                Some(Control::Terminate) => terminate(&mut child),
                Some(Control::Kill) => kill(&mut child),
                None => {
                    kill(&mut child);
                    break child.wait().await;
                }
            },
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(pid = ?pid, "Failed to reap inference server: {}", e);
            None
        }
    };
    let event = ExitEvent {
        code,
        requested: requested.load(Ordering::SeqCst),
    };
    if event.requested {
        info!(pid = ?pid, "Inference server exited ({})", event);
    } else {
        warn!(pid = ?pid, "Inference server exited on its own ({})", event);
    }
    exit.send_replace(Some(event));
}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: signalling a pid we spawned and have not reaped yet.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            return;
        }
    }
    kill(child);
}

fn kill(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("Kill request ignored: {}", e);
    }
}

fn spawn_log_readers(child: &mut Child, log_buffer: &Arc<LogBuffer>, session: u64) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(capture_lines(stdout, Arc::clone(log_buffer), session));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(capture_lines(stderr, Arc::clone(log_buffer), session));
    }
}

async fn capture_lines<R>(stream: R, log_buffer: Arc<LogBuffer>, session: u64)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        trace!(target: "modeld::server", "{}", line);
        log_buffer.push(session, line);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn launcher(binary: &str, stop_timeout: Duration) -> (ServerLauncher, Arc<LogBuffer>) {
        let logs = Arc::new(LogBuffer::default());
        (ServerLauncher::new(binary, Arc::clone(&logs), stop_timeout), logs)
    }

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn missing_binary_is_start_failure() {
        let (launcher, _) = launcher("/nonexistent/modeld-server", Duration::from_secs(1));
        let err = launcher.start(&[]).await.err().unwrap();
        assert_eq!(err.code(), Some("process_start_failed"));
    }

    #[tokio::test]
    async fn requested_stop_is_marked_requested() {
        let (launcher, _) = launcher("sleep", Duration::from_secs(5));
        let mut process = launcher.start(&strings(&["30"])).await.unwrap();
        let mut exits = process.exit_events();

        process.stop(&CancellationToken::new()).await.unwrap();
        let event = wait_exit(&mut exits).await.unwrap();
        assert!(event.requested);
    }

    #[tokio::test]
    async fn unprompted_exit_is_not_requested() {
        let (launcher, _) = launcher("sh", Duration::from_secs(5));
        let process = launcher
            .start(&strings(&["-c", "echo starting; exit 3"]))
            .await
            .unwrap();
        let mut exits = process.exit_events();

        let event = wait_exit(&mut exits).await.unwrap();
        assert_eq!(event, ExitEvent { code: Some(3), requested: false });
    }

    #[tokio::test]
    async fn stop_after_exit_is_noop() {
        let (launcher, _) = launcher("true", Duration::from_secs(1));
        let mut process = launcher.start(&[]).await.unwrap();
        let mut exits = process.exit_events();
        wait_exit(&mut exits).await;

        process.stop(&CancellationToken::new()).await.unwrap();
        process.stop(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn stop_escalates_when_term_is_ignored() {
        let (launcher, _) = launcher("sh", Duration::from_millis(200));
        let mut process = launcher
            .start(&strings(&["-c", "trap '' TERM; sleep 30"]))
            .await
            .unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut exits = process.exit_events();

        process.stop(&CancellationToken::new()).await.unwrap();
        let event = wait_exit(&mut exits).await.unwrap();
        assert!(event.requested);
        assert_eq!(event.code, None);
    }

    #[tokio::test]
    async fn output_lands_in_log_buffer() {
        let (launcher, logs) = launcher("sh", Duration::from_secs(1));
        let process = launcher
            .start(&strings(&["-c", "echo hello; echo oops 1>&2"]))
            .await
            .unwrap();
        let mut exits = process.exit_events();
        wait_exit(&mut exits).await;

        // Readers may trail the reap slightly.
        for _ in 0..50 {
            if logs.tail(10).len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut lines = logs.tail(10);
        lines.sort();
        assert_eq!(lines, vec!["hello", "oops"]);
    }

    #[tokio::test]
    async fn earlier_process_output_stays_out_of_new_session() {
        let (launcher, logs) = launcher("sh", Duration::from_secs(1));
        let mut first = launcher
            .start(&strings(&["-c", "echo first; sleep 0.3; echo late; sleep 30"]))
            .await
            .unwrap();
        for _ in 0..100 {
            if logs.tail(10) == vec!["first"] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let second = launcher
            .start(&strings(&["-c", "echo second"]))
            .await
            .unwrap();
        let mut exits = second.exit_events();
        wait_exit(&mut exits).await;
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(logs.tail(10), vec!["second"]);
        first.stop(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn dropping_the_handle_kills_the_process() {
        let (launcher, _) = launcher("sleep", Duration::from_secs(5));
        let process = launcher.start(&strings(&["30"])).await.unwrap();
        let mut exits = process.exit_events();
        drop(process);

        let event = tokio::time::timeout(Duration::from_secs(5), wait_exit(&mut exits))
            .await
            .unwrap()
            .unwrap();
        assert!(!event.requested);
    }
}
