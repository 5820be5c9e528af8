use chrono::Utc;
use futures_util::future::BoxFuture;
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::error::{QuestForgeError, Result};
use crate::session::{Progress, SessionTracker};
use crate::supervisor::LogKind;

pub trait ProgressSource: Send + Sync {
    /// Latest known progress, or `None` when nothing was reported yet.
    fn request_game_progress<'a>(&'a self, game_id: &'a str)
    -> BoxFuture<'a, Result<Option<Progress>>>;
}

pub struct LogProgressSource {
    logs_dir: PathBuf,
    percent: Regex,
    eta: Regex,
    downloaded: Regex,
    total: Regex,
}

impl LogProgressSource {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| QuestForgeError::CommandFailed(e.to_string()))
        };

        Ok(Self {
            logs_dir: logs_dir.into(),
            percent: compile(r"Progress: (\d+(?:\.\d+)?)%")?,
            eta: compile(r"ETA: (\d+:\d{2}:\d{2})")?,
            downloaded: compile(r"Downloaded: (\d+(?:\.\d+)?) MiB")?,
            total: compile(r"Download size: (\d+(?:\.\d+)?) MiB")?,
        })
    }

    /// Extracts the most recent progress report from tool output.
    pub fn parse(&self, output: &str) -> Option<Progress> {
        let last = |re: &Regex| {
            re.captures_iter(output)
                .last()
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
        };

        let percent = last(&self.percent)?.parse().ok()?;
        Some(Progress {
            percent,
            downloaded_mib: last(&self.downloaded).and_then(|v| v.parse().ok()),
            total_mib: last(&self.total).and_then(|v| v.parse().ok()),
            eta: last(&self.eta),
            observed_at: Utc::now(),
        })
    }

    async fn read_progress(&self, game_id: &str) -> Result<Option<Progress>> {
        let path = self.logs_dir.join(LogKind::Install.file_name(game_id));
        match tokio::fs::read_to_string(&path).await {
            Ok(output) => Ok(self.parse(&output)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl ProgressSource for LogProgressSource {
    fn request_game_progress<'a>(
        &'a self,
        game_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Progress>>> {
        Box::pin(self.read_progress(game_id))
    }
}

/// Polls `source` every `interval` while the game is installing or updating.
///
/// Returns as soon as the tracker reports any other status, so cancelling the
/// operation also stops the polling. Returns the number of applied samples.
pub async fn poll_progress(
    tracker: &SessionTracker,
    source: &dyn ProgressSource,
    game_id: &str,
    interval: Duration,
) -> usize {
    let mut events = tracker.subscribe();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut applied = 0;

    while tracker.status(game_id).is_transferring() {
        tokio::select! {
            _ = ticker.tick() => {
                match source.request_game_progress(game_id).await {
                    Ok(Some(progress)) => {
                        if tracker.set_progress(game_id, progress) {
                            applied += 1;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => debug!("Progress for {} unavailable: {}", game_id, e),
                }
            }
            event = events.recv() => {
                if let Err(RecvError::Closed) = event {
                    break;
                }
            }
        }
    }

    debug!("Stopped polling progress for {}", game_id);
    applied
}
