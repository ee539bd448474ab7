use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::JobId;

use super::encoder::EncoderInvocation;
use super::error::{PackagerError, PackagerResult};

const STDERR_TAIL_LINES: usize = 20;
const OUTPUT_DRAIN_LIMIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn tag(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Terminal state of one supervised encoder run.
#[derive(Debug)]
pub struct ProcessOutcome {
    pub status: ExitStatus,
    /// True when the run ended because the arena asked it to stop.
    pub terminated: bool,
    pub stderr_tail: Vec<String>,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        !self.terminated && self.status.success()
    }
}

struct ArenaEntry {
    cancel: CancellationToken,
    running: watch::Sender<bool>,
}

/// Owns every encoder process spawned for packaging, keyed by job id. The
/// admission queue only ever sees `terminate(job_id)`.
#[derive(Clone, Default)]
pub struct ProcessArena {
    entries: Arc<Mutex<HashMap<JobId, ArenaEntry>>>,
}

impl std::fmt::Debug for ProcessArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessArena")
            .field("jobs", &self.entries.lock().len())
            .field("live", &self.live_processes())
            .finish()
    }
}

impl ProcessArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_id: JobId) -> CancellationToken {
        let mut entries = self.entries.lock();
        let entry = entries.entry(job_id).or_insert_with(|| ArenaEntry {
            cancel: CancellationToken::new(),
            running: watch::channel(false).0,
        });
        entry.cancel.clone()
    }

    /// Requests graceful teardown of the job's process. Returns false when the
    /// job is unknown.
    pub fn terminate(&self, job_id: JobId) -> bool {
        let entries = self.entries.lock();
        match entries.get(&job_id) {
            Some(entry) => {
                info!(job_id = %job_id, running = *entry.running.borrow(), "terminating encoder");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn release(&self, job_id: JobId) {
        self.entries.lock().remove(&job_id);
    }

    pub fn live_processes(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| *entry.running.borrow())
            .count()
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.entries
            .lock()
            .get(&job_id)
            .map(|entry| *entry.running.borrow())
            .unwrap_or(false)
    }

    /// Waits until the job has no live process, bounded by `limit`. Returns
    /// whether the process is known to be gone.
    pub async fn wait_stopped(&self, job_id: JobId, limit: Duration) -> bool {
        let receiver = {
            let entries = self.entries.lock();
            match entries.get(&job_id) {
                Some(entry) => entry.running.subscribe(),
                None => return true,
            }
        };
        let mut receiver = receiver;
        let stopped = tokio::time::timeout(limit, receiver.wait_for(|running| !*running)).await;
        match stopped {
            Ok(Ok(_)) => true,
            // Sender dropped with the entry; nothing left to wait for.
            Ok(Err(_)) => true,
            Err(_) => {
                warn!(job_id = %job_id, limit_ms = limit.as_millis() as u64, "encoder still running after teardown window");
                false
            }
        }
    }

    /// Spawns the encoder under a supervisor task that outlives the caller's
    /// future, so a dropped job still gets its graceful teardown.
    pub async fn run(
        &self,
        job_id: JobId,
        invocation: &EncoderInvocation,
        log_path: &Path,
        kill_grace: Duration,
    ) -> PackagerResult<ProcessOutcome> {
        let (cancel, running) = {
            let entries = self.entries.lock();
            let entry = entries
                .get(&job_id)
                .ok_or_else(|| PackagerError::Validation(format!("job {job_id} is not registered")))?;
            (entry.cancel.clone(), entry.running.clone())
        };
        if cancel.is_cancelled() {
            return Err(PackagerError::Terminated);
        }

        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| PackagerError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
        }
        let log_file = fs::File::create(log_path)
            .await
            .map_err(|source| PackagerError::Io {
                source,
                path: log_path.to_path_buf(),
            })?;

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(PackagerError::Spawn)?;
        running.send_replace(true);
        info!(job_id = %job_id, pid = ?child.id(), command = %invocation.display_command(), "encoder started");

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let collector = spawn_output_capture(&mut child, log_file, Arc::clone(&tail));

        let supervisor = tokio::spawn(async move {
            let result = supervise(child, cancel, kill_grace, job_id).await;
            running.send_replace(false);
            if tokio::time::timeout(OUTPUT_DRAIN_LIMIT, collector).await.is_err() {
                debug!(job_id = %job_id, "output capture still open after exit");
            }
            result
        });

        let (status, terminated) = supervisor
            .await
            .map_err(|err| PackagerError::Spawn(std::io::Error::other(err)))?
            .map_err(PackagerError::Spawn)?;
        let stderr_tail: Vec<String> = tail.lock().iter().cloned().collect();
        debug!(job_id = %job_id, status = ?status.code(), terminated, "encoder exited");
        Ok(ProcessOutcome {
            status,
            terminated,
            stderr_tail,
        })
    }
}

async fn supervise(
    mut child: Child,
    cancel: CancellationToken,
    kill_grace: Duration,
    job_id: JobId,
) -> std::io::Result<(ExitStatus, bool)> {
    tokio::select! {
        status = child.wait() => status.map(|status| (status, false)),
        _ = cancel.cancelled() => {
            interrupt(&mut child, job_id);
            match tokio::time::timeout(kill_grace, child.wait()).await {
                Ok(status) => status.map(|status| (status, true)),
                Err(_) => {
                    warn!(job_id = %job_id, grace_ms = kill_grace.as_millis() as u64, "encoder ignored interrupt; killing");
                    child.kill().await?;
                    child.wait().await.map(|status| (status, true))
                }
            }
        }
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child, job_id: JobId) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        warn!(job_id = %job_id, pid, error = %err, "failed to interrupt encoder");
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child, job_id: JobId) {
    if let Err(err) = child.start_kill() {
        warn!(job_id = %job_id, error = %err, "failed to stop encoder");
    }
}

fn spawn_output_capture(
    child: &mut Child,
    mut log_file: fs::File,
    tail: Arc<Mutex<VecDeque<String>>>,
) -> tokio::task::JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(OutputStream, String)>();
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, OutputStream::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, OutputStream::Stderr, tx.clone());
    }
    drop(tx);

    tokio::spawn(async move {
        while let Some((stream, line)) = rx.recv().await {
            if stream == OutputStream::Stderr {
                let mut tail = tail.lock();
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.clone());
            }
            let entry = format!("[{}] {}\n", stream.tag(), line);
            if let Err(err) = log_file.write_all(entry.as_bytes()).await {
                warn!(error = %err, "failed to write encoder log");
            }
        }
        if let Err(err) = log_file.flush().await {
            warn!(error = %err, "failed to flush encoder log");
        }
    })
}

fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<(OutputStream, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send((stream, line)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(stream = stream.tag(), error = %err, "encoder output closed");
                    break;
                }
            }
        }
    });
}
