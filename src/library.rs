//! Application state shared by every front end.
//!
//! `Library` owns the settings store, the launch builder, the session
//! tracker and the process supervisor, and sequences them for each game
//! operation. An operation holds the game's supervisor slot from before it
//! enters its busy status until after it leaves it, so a stop or cancel
//! returns only once the tracker shows the final state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{QuestForgeError, Result};
use crate::graphics::DxvkInstaller;
use crate::identity::{Account, Identity};
use crate::launch::{LaunchBuilder, LaunchOptions};
use crate::progress::{self, LogProgressSource, ProgressSource};
use crate::runtime::{RuntimeEntry, RuntimeRegistry};
use crate::session::{GameStatus, SessionTracker};
use crate::settings::{GameSettings, SettingsStore, validate_id};
use crate::supervisor::{LogKind, ProcessOutcome, ProcessSlot, Supervisor};
use crate::tool::{GameTool, InstalledGame, Invocation, parse_installed_tsv};
use crate::utils::{HostTools, expand_home};

pub struct Library {
    config: Config,
    settings: SettingsStore,
    launcher: LaunchBuilder,
    tracker: Arc<SessionTracker>,
    supervisor: Supervisor,
    progress: Arc<dyn ProgressSource>,
    tool: GameTool,
    identity: Identity,
}

impl Library {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_host(config, HostTools::new())
    }

    pub fn with_host(config: Config, host: HostTools) -> Result<Self> {
        let tool = GameTool::new(&config.tool.binary);
        let identity = Identity::new(&config.paths.user_info);
        let registry = RuntimeRegistry::new(&config, host.clone());
        let logs_dir = config.paths.games_config_dir.clone();

        Ok(Self {
            settings: SettingsStore::new(&config, registry, identity.clone()),
            launcher: LaunchBuilder::new(
                tool.clone(),
                config.paths.home.clone(),
                host,
                Arc::new(DxvkInstaller::new(&config.paths.tools_dir)),
            ),
            tracker: Arc::new(SessionTracker::new()),
            supervisor: Supervisor::new(&logs_dir),
            progress: Arc::new(LogProgressSource::new(&logs_dir)?),
            tool,
            identity,
            config,
        })
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub async fn runtimes(&self) -> Vec<RuntimeEntry> {
        self.settings.registry().discover().await
    }

    pub async fn launch(&self, game_id: &str, options: LaunchOptions) -> Result<ProcessOutcome> {
        let slot = self.reserve(game_id, GameStatus::Playing)?;

        let result = async {
            let settings = self.settings.resolve(game_id).await?;
            let invocation = self.launcher.build(game_id, &settings, options).await?;
            self.supervisor
                .run(&slot, LogKind::LastPlay, &invocation)
                .await
        }
        .await;

        self.finish(slot, GameStatus::Playing, result)
    }

    /// Installs into `base_path`, or the configured default install path.
    pub async fn install(&self, game_id: &str, base_path: Option<&Path>) -> Result<ProcessOutcome> {
        let base_path = base_path.map(Path::to_path_buf);
        self.run_operation(game_id, GameStatus::Installing, LogKind::Install, |settings| {
            let base = base_path.unwrap_or_else(|| self.install_dir(settings));
            self.tool.install(game_id, &base, settings.max_workers)
        })
        .await
    }

    pub async fn update(&self, game_id: &str) -> Result<ProcessOutcome> {
        self.run_operation(game_id, GameStatus::Updating, LogKind::Update, |settings| {
            self.tool.update(game_id, settings.max_workers)
        })
        .await
    }

    pub async fn repair(&self, game_id: &str) -> Result<ProcessOutcome> {
        let kind = LogKind::Other("repair".to_string());
        self.run_operation(game_id, GameStatus::Repairing, kind, |settings| {
            self.tool.repair(game_id, settings.max_workers)
        })
        .await
    }

    pub async fn move_install(&self, game_id: &str, new_base: &Path) -> Result<ProcessOutcome> {
        let kind = LogKind::Other("move".to_string());
        self.run_operation(game_id, GameStatus::Moving, kind, |_| {
            self.tool.move_install(game_id, new_base)
        })
        .await
    }

    pub async fn uninstall(&self, game_id: &str) -> Result<ProcessOutcome> {
        let kind = LogKind::Other("uninstall".to_string());
        self.run_operation(game_id, GameStatus::Uninstalling, kind, |_| {
            self.tool.uninstall(game_id)
        })
        .await
    }

    /// Stops an install or update. Returns once the process is gone and the
    /// game shows `canceled`.
    ///
    /// `NotRunning` means the process exited on its own first; the game then
    /// finishes as `done`.
    pub async fn cancel(&self, game_id: &str) -> Result<()> {
        let status = self.tracker.status(game_id);
        if !status.is_transferring() {
            return Err(QuestForgeError::InvalidTransition {
                game_id: game_id.to_string(),
                from: status,
                to: GameStatus::Canceled,
            });
        }

        self.supervisor.terminate(game_id).await?;
        info!("Canceled {} of {}", status, game_id);
        Ok(())
    }

    /// Stops a running game. Returns once the process is gone and the game
    /// is idle again.
    pub async fn stop(&self, game_id: &str) -> Result<()> {
        let status = self.tracker.status(game_id);
        if status != GameStatus::Playing {
            return Err(QuestForgeError::InvalidTransition {
                game_id: game_id.to_string(),
                from: status,
                to: GameStatus::Done,
            });
        }

        self.supervisor.terminate(game_id).await?;
        info!("Stopped {}", game_id);
        Ok(())
    }

    /// Feeds install/update progress into the tracker until the game leaves
    /// that state.
    pub async fn poll_progress(&self, game_id: &str) -> usize {
        progress::poll_progress(
            &self.tracker,
            self.progress.as_ref(),
            game_id,
            self.config.progress_interval(),
        )
        .await
    }

    pub async fn installed(&self) -> Result<Vec<InstalledGame>> {
        let output = capture(&self.tool.list_installed()).await?;
        Ok(parse_installed_tsv(&output))
    }

    /// Ids of installed games with an update available.
    pub async fn check_updates(&self) -> Result<Vec<String>> {
        let updates: Vec<String> = self
            .installed()
            .await?
            .into_iter()
            .filter(|game| game.update_available)
            .map(|game| game.app_name)
            .collect();

        info!("{} game(s) with updates", updates.len());
        Ok(updates)
    }

    pub async fn account(&self) -> Result<Account> {
        self.identity.account().await
    }

    pub fn is_logged_in(&self) -> bool {
        self.identity.is_logged_in()
    }

    pub async fn logout(&self) -> Result<()> {
        capture(&self.tool.logout()).await?;
        if let Err(e) = capture(&self.tool.cleanup()).await {
            warn!("Cleanup after logout failed: {}", e);
        }
        info!("Logged out");
        Ok(())
    }

    pub async fn read_log(&self, game_id: &str, kind: &LogKind) -> Result<Option<String>> {
        validate_id(game_id)?;
        self.supervisor.read_log(game_id, kind).await
    }

    fn install_dir(&self, settings: &GameSettings) -> PathBuf {
        if settings.default_install_path.trim().is_empty() {
            self.config.paths.install_dir.clone()
        } else {
            expand_home(&settings.default_install_path, &self.config.paths.home)
        }
    }

    /// Claims the game's supervisor slot, then enters `status`.
    fn reserve(&self, game_id: &str, status: GameStatus) -> Result<ProcessSlot> {
        validate_id(game_id)?;
        let busy = |status| QuestForgeError::Busy {
            game_id: game_id.to_string(),
            status,
        };

        let slot = self
            .supervisor
            .claim(game_id)
            .ok_or_else(|| busy(self.tracker.status(game_id)))?;
        match self.tracker.begin(game_id, status) {
            Ok(_) => Ok(slot),
            Err(QuestForgeError::InvalidTransition { from, .. }) => Err(busy(from)),
            Err(e) => Err(e),
        }
    }

    /// Records the final state, then releases the slot.
    fn finish(
        &self,
        slot: ProcessSlot,
        status: GameStatus,
        result: Result<ProcessOutcome>,
    ) -> Result<ProcessOutcome> {
        let game_id = slot.game_id();
        if slot.terminate_requested() && status.is_transferring() {
            if let Err(e) = self.tracker.cancel(game_id) {
                warn!("Could not mark {} canceled: {}", game_id, e);
            }
        }
        let state = self.tracker.complete(game_id);
        match &result {
            Ok(outcome) if outcome.succeeded() => info!("{} finished", game_id),
            Ok(outcome) => warn!(
                "{} ended as {} ({:?}), see {}",
                game_id,
                state.status,
                outcome.exit,
                outcome.log_path.display()
            ),
            Err(e) => warn!("{} failed: {}", game_id, e),
        }
        result
    }

    async fn run_operation<F>(
        &self,
        game_id: &str,
        status: GameStatus,
        kind: LogKind,
        build: F,
    ) -> Result<ProcessOutcome>
    where
        F: FnOnce(&GameSettings) -> Invocation,
    {
        let slot = self.reserve(game_id, status)?;

        let result = async {
            let settings = self.settings.resolve(game_id).await?;
            let invocation = build(&settings);
            self.supervisor.run(&slot, kind, &invocation).await
        }
        .await;

        self.finish(slot, status, result)
    }
}

/// Runs a short tool command and returns its stdout.
async fn capture(invocation: &Invocation) -> Result<String> {
    let output = invocation.to_command().output().await.map_err(|e| {
        QuestForgeError::CommandFailed(format!("{}: {}", invocation.program, e))
    })?;

    if !output.status.success() {
        return Err(QuestForgeError::CommandFailed(format!(
            "{} exited with {}: {}",
            invocation.command_line(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
