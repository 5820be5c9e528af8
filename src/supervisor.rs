//! Runs game-tool processes, keeps their logs and classifies failures.

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{debug, info, warn};

use crate::error::{QuestForgeError, Result};
use crate::tool::Invocation;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogKind {
    LastPlay,
    Install,
    Update,
    Other(String),
}

impl LogKind {
    pub fn file_name(&self, game_id: &str) -> String {
        match self {
            LogKind::LastPlay => format!("{}-lastPlay.log", game_id),
            LogKind::Install | LogKind::Update => format!("{}.log", game_id),
            LogKind::Other(op) => format!("{}-{}.log", game_id, op),
        }
    }

    /// Transfers log stdout too; the progress source reads it back.
    fn logs_stdout(&self) -> bool {
        matches!(self, LogKind::Install | LogKind::Update)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    DiskSpace,
    OutOfDate,
    LaunchError,
    Unknown,
}

struct FailurePattern {
    needle: &'static str,
    kind: FailureKind,
    launch_only: bool,
}

/// Checked in order; the first match wins.
const FAILURE_PATTERNS: &[FailurePattern] = &[
    FailurePattern {
        needle: "Not enough available disk space",
        kind: FailureKind::DiskSpace,
        launch_only: false,
    },
    FailurePattern {
        needle: "ERROR: Game is out of date",
        kind: FailureKind::OutOfDate,
        launch_only: false,
    },
    FailurePattern {
        needle: "Errno",
        kind: FailureKind::LaunchError,
        launch_only: true,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(i32),
    /// Stopped through [`Supervisor::terminate`].
    Terminated,
    SpawnFailed,
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit: ExitOutcome,
    pub stdout: String,
    pub stderr: String,
    pub failure: Option<FailureKind>,
    pub log_path: PathBuf,
}

impl ProcessOutcome {
    /// Outcome for an operation stopped before its process was started.
    fn canceled(log_path: PathBuf) -> Self {
        Self {
            exit: ExitOutcome::Terminated,
            stdout: String::new(),
            stderr: String::new(),
            failure: None,
            log_path,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit == ExitOutcome::Exited(0) && self.failure.is_none()
    }

    pub fn was_terminated(&self) -> bool {
        self.exit == ExitOutcome::Terminated
    }
}

pub fn classify_failure(kind: &LogKind, exit: ExitOutcome, output: &str) -> Option<FailureKind> {
    if exit == ExitOutcome::Terminated {
        return None;
    }

    let matched = FAILURE_PATTERNS
        .iter()
        .filter(|pattern| !pattern.launch_only || *kind == LogKind::LastPlay)
        .find(|pattern| output.contains(pattern.needle))
        .map(|pattern| pattern.kind);

    match (matched, exit) {
        (Some(kind), _) => Some(kind),
        (None, ExitOutcome::Exited(0)) => None,
        (None, _) => Some(FailureKind::Unknown),
    }
}

#[derive(Default)]
struct Control {
    pid: Option<i32>,
    terminating: bool,
    finished: bool,
}

struct Entry {
    control: Mutex<Control>,
    exited: watch::Receiver<bool>,
}

/// A game's claim on the supervisor, held for a whole operation.
///
/// The claim exists before the process does, so a terminate request that
/// arrives while settings are still being resolved is not lost: the process
/// is then never started, or is signalled right after spawning. Dropping the
/// slot releases the claim and wakes pending [`Supervisor::terminate`] calls.
pub struct ProcessSlot {
    game_id: String,
    entry: Arc<Entry>,
    running: Arc<Mutex<HashMap<String, Arc<Entry>>>>,
    exited: watch::Sender<bool>,
}

impl ProcessSlot {
    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    pub fn terminate_requested(&self) -> bool {
        self.entry.control.lock().terminating
    }
}

impl Drop for ProcessSlot {
    fn drop(&mut self) {
        {
            let mut running = self.running.lock();
            if running
                .get(&self.game_id)
                .is_some_and(|entry| Arc::ptr_eq(entry, &self.entry))
            {
                running.remove(&self.game_id);
            }
        }
        let _ = self.exited.send(true);
    }
}

#[derive(Clone)]
pub struct Supervisor {
    logs_dir: PathBuf,
    grace_period: Duration,
    running: Arc<Mutex<HashMap<String, Arc<Entry>>>>,
}

impl Supervisor {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            grace_period: DEFAULT_GRACE_PERIOD,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn log_path(&self, game_id: &str, kind: &LogKind) -> PathBuf {
        self.logs_dir.join(kind.file_name(game_id))
    }

    /// Claims `game_id`; `None` while another slot for it is alive.
    pub fn claim(&self, game_id: &str) -> Option<ProcessSlot> {
        let mut running = self.running.lock();
        if running.contains_key(game_id) {
            return None;
        }

        let (exited_tx, exited_rx) = watch::channel(false);
        let entry = Arc::new(Entry {
            control: Mutex::new(Control::default()),
            exited: exited_rx,
        });
        running.insert(game_id.to_string(), Arc::clone(&entry));

        Some(ProcessSlot {
            game_id: game_id.to_string(),
            entry,
            running: Arc::clone(&self.running),
            exited: exited_tx,
        })
    }

    /// True while the game's process is spawned and not yet reaped.
    pub fn is_running(&self, game_id: &str) -> bool {
        self.running.lock().get(game_id).is_some_and(|entry| {
            let control = entry.control.lock();
            control.pid.is_some() && !control.finished
        })
    }

    pub async fn read_log(&self, game_id: &str, kind: &LogKind) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.log_path(game_id, kind)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs `invocation` to completion, replacing the game's log for `kind`.
    ///
    /// Non-zero exits and recognised failures are reported through
    /// [`ProcessOutcome::failure`]; only log I/O problems are errors.
    pub async fn run(
        &self,
        slot: &ProcessSlot,
        kind: LogKind,
        invocation: &Invocation,
    ) -> Result<ProcessOutcome> {
        let game_id = slot.game_id();
        let log_path = self.log_path(game_id, &kind);
        if slot.terminate_requested() {
            info!("{} was stopped before it started", game_id);
            return Ok(ProcessOutcome::canceled(log_path));
        }

        tokio::fs::create_dir_all(&self.logs_dir).await?;
        let log = AsyncMutex::new(File::create(&log_path).await?);

        info!("Running for {}: {}", game_id, invocation.command_line());

        let mut cmd = invocation.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let stderr = format!("Failed to start {}: {}\n", invocation.program, e);
                warn!("{}", stderr.trim_end());
                log.lock().await.write_all(stderr.as_bytes()).await?;

                let failure = match kind {
                    LogKind::LastPlay => FailureKind::LaunchError,
                    _ => FailureKind::Unknown,
                };
                return Ok(ProcessOutcome {
                    exit: ExitOutcome::SpawnFailed,
                    stdout: String::new(),
                    stderr,
                    failure: Some(failure),
                    log_path,
                });
            }
        };

        let pid = child.id().map(|pid| pid as i32);
        let stop_now = {
            let mut control = slot.entry.control.lock();
            control.pid = pid;
            control.terminating
        };
        if stop_now {
            if let Some(pid) = pid {
                info!("{} was stopped while starting", game_id);
                signal_group(pid, Signal::SIGTERM);
            }
        }

        let stdout_log = kind.logs_stdout().then_some(&log);
        let (stdout, stderr, status) = tokio::join!(
            pump(child.stdout.take(), stdout_log),
            pump(child.stderr.take(), Some(&log)),
            child.wait(),
        );

        let terminated = {
            let mut control = slot.entry.control.lock();
            control.finished = true;
            control.terminating
        };

        let status = status?;
        let exit = if terminated {
            ExitOutcome::Terminated
        } else if let Some(code) = status.code() {
            ExitOutcome::Exited(code)
        } else {
            ExitOutcome::Signaled(status.signal().unwrap_or_default())
        };

        let (stdout, stderr) = (stdout?, stderr?);
        let failure = classify_failure(&kind, exit, &format!("{}{}", stderr, stdout));
        match failure {
            Some(failure) => warn!("{} finished with {:?} ({:?})", game_id, exit, failure),
            None => debug!("{} finished with {:?}", game_id, exit),
        }

        Ok(ProcessOutcome {
            exit,
            stdout,
            stderr,
            failure,
            log_path,
        })
    }

    /// Stops the game's process group and waits until its slot is released.
    ///
    /// SIGTERM first; SIGKILL once the grace period runs out. A game whose
    /// process has already exited is `NotRunning`.
    pub async fn terminate(&self, game_id: &str) -> Result<()> {
        let not_running = || QuestForgeError::NotRunning(game_id.to_string());
        let entry = self
            .running
            .lock()
            .get(game_id)
            .cloned()
            .ok_or_else(not_running)?;

        let pid = {
            let mut control = entry.control.lock();
            if control.finished {
                return Err(not_running());
            }
            control.terminating = true;
            control.pid
        };

        match pid {
            Some(pid) => {
                info!("Stopping {} (pid {})", game_id, pid);
                signal_group(pid, Signal::SIGTERM);
            }
            None => info!("Stopping {} before its process starts", game_id),
        }

        let mut exited = entry.exited.clone();
        let stopped = tokio::time::timeout(self.grace_period, wait_exited(&mut exited)).await;
        if stopped.is_err() {
            let pid = entry.control.lock().pid;
            if let Some(pid) = pid {
                warn!("{} ignored SIGTERM, killing", game_id);
                signal_group(pid, Signal::SIGKILL);
            }
            wait_exited(&mut exited).await;
        }

        info!("{} stopped", game_id);
        Ok(())
    }
}

fn signal_group(pid: i32, signal: Signal) {
    if let Err(e) = killpg(Pid::from_raw(pid), signal) {
        debug!("{:?} to group {} failed: {}", signal, pid, e);
    }
}

async fn wait_exited(exited: &mut watch::Receiver<bool>) {
    let _ = exited.wait_for(|done| *done).await;
}

/// Collects a pipe into a string, appending each line to `log` as it arrives.
async fn pump<R>(reader: Option<R>, log: Option<&AsyncMutex<File>>) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(String::new());
    };

    let mut reader = BufReader::new(reader);
    let mut collected = String::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }

        if let Some(log) = log {
            let mut file = log.lock().await;
            file.write_all(&line).await?;
            file.flush().await?;
        }
        collected.push_str(&String::from_utf8_lossy(&line));
    }

    Ok(collected)
}
