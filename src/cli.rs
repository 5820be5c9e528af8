use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use dialoguer::Confirm;
use dialoguer::theme::ColorfulTheme;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::config::Config;
use crate::launch::LaunchOptions;
use crate::library::Library;
use crate::runtime::{self, RuntimeKind};
use crate::session::Progress;
use crate::settings::DEFAULT_ID;
use crate::supervisor::{ExitOutcome, FailureKind, LogKind, ProcessOutcome};

#[derive(Parser)]
#[command(
    name = "questforge",
    author,
    version,
    about = "QuestForge - game launcher for Wine and Proton",
    long_about = "Launches, installs and updates store games through the legendary CLI with per-game compatibility settings"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Launch a game")]
    Launch {
        #[arg(help = "Game ID")]
        game: String,

        #[arg(long, help = "Start even if an update is pending")]
        skip_version_check: bool,
    },

    #[command(about = "Install a game")]
    Install {
        #[arg(help = "Game ID")]
        game: String,

        #[arg(long, help = "Base install directory")]
        path: Option<PathBuf>,
    },

    #[command(about = "Update an installed game")]
    Update {
        #[arg(help = "Game ID")]
        game: String,
    },

    #[command(about = "Verify and repair game files")]
    Repair {
        #[arg(help = "Game ID")]
        game: String,
    },

    #[command(about = "Move a game to another directory")]
    Move {
        #[arg(help = "Game ID")]
        game: String,

        #[arg(help = "New base directory")]
        path: PathBuf,
    },

    #[command(about = "Uninstall a game")]
    Uninstall {
        #[arg(help = "Game ID")]
        game: String,
    },

    #[command(about = "List installed games with pending updates")]
    Updates,

    #[command(about = "List available Wine/Proton runtimes")]
    Runtimes,

    #[command(about = "Show or change settings")]
    Settings {
        #[command(subcommand)]
        action: SettingsCommands,
    },

    #[command(about = "Print the last log of a game")]
    Log {
        #[arg(help = "Game ID")]
        game: String,

        #[arg(long, value_enum, default_value_t = LogChoice::Play)]
        kind: LogChoice,
    },

    #[command(about = "Show the logged-in account")]
    LoginStatus,

    #[command(about = "Log out of the store account")]
    Logout,
}

#[derive(Subcommand)]
pub enum SettingsCommands {
    #[command(about = "Show effective settings")]
    Show {
        #[arg(help = "Game ID (global defaults if omitted)")]
        game: Option<String>,
    },

    #[command(about = "Change one setting")]
    Set {
        #[arg(help = "Game ID, or 'default' for the global defaults")]
        game: String,

        #[arg(help = "Setting name, e.g. showFps or wineVersion")]
        key: String,

        value: String,
    },

    #[command(about = "Create a per-game settings file from the defaults")]
    Init {
        #[arg(help = "Game ID")]
        game: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogChoice {
    Play,
    Update,
    Repair,
    Move,
    Uninstall,
}

impl From<LogChoice> for LogKind {
    fn from(choice: LogChoice) -> Self {
        match choice {
            LogChoice::Play => LogKind::LastPlay,
            LogChoice::Update => LogKind::Update,
            LogChoice::Repair => LogKind::Other("repair".to_string()),
            LogChoice::Move => LogKind::Other("move".to_string()),
            LogChoice::Uninstall => LogKind::Other("uninstall".to_string()),
        }
    }
}

#[derive(Clone)]
enum Transfer {
    Install(Option<PathBuf>),
    Update,
}

impl Cli {
    pub async fn execute(self, config: Config) -> Result<()> {
        config
            .ensure_directories()
            .context("creating QuestForge directories")?;
        let library = Arc::new(Library::new(config)?);

        match self.command {
            Commands::Launch {
                game,
                skip_version_check,
            } => handle_launch(library, game, skip_version_check).await,
            Commands::Install { game, path } => {
                let outcome = run_transfer(&library, &game, Transfer::Install(path)).await?;
                report(&game, "install", &outcome);
                Ok(())
            }
            Commands::Update { game } => {
                let outcome = run_transfer(&library, &game, Transfer::Update).await?;
                report(&game, "update", &outcome);
                Ok(())
            }
            Commands::Repair { game } => {
                println!("{} Repairing {}...", "🔧", game.bold());
                let outcome = library.repair(&game).await?;
                report(&game, "repair", &outcome);
                Ok(())
            }
            Commands::Move { game, path } => {
                println!("{} Moving {} to {}...", "📦", game.bold(), path.display());
                let outcome = library.move_install(&game, &path).await?;
                report(&game, "move", &outcome);
                Ok(())
            }
            Commands::Uninstall { game } => {
                let confirmed = Confirm::with_theme(&ColorfulTheme::default())
                    .with_prompt(format!("Uninstall {}?", game))
                    .default(false)
                    .interact()?;
                if !confirmed {
                    return Ok(());
                }
                let outcome = library.uninstall(&game).await?;
                report(&game, "uninstall", &outcome);
                Ok(())
            }
            Commands::Updates => handle_updates(&library).await,
            Commands::Runtimes => handle_runtimes(&library).await,
            Commands::Settings { action } => handle_settings_command(&library, action).await,
            Commands::Log { game, kind } => {
                match library.read_log(&game, &kind.into()).await? {
                    Some(log) => print!("{}", log),
                    None => println!("No {:?} log for {}", kind, game.yellow()),
                }
                Ok(())
            }
            Commands::LoginStatus => {
                if library.is_logged_in() {
                    let account = library.account().await?;
                    let name = account.display_name.unwrap_or(account.account_id);
                    println!("{} Logged in as {}", "✅".green(), name.bold().green());
                } else {
                    println!("{} Not logged in", "❌".red());
                }
                Ok(())
            }
            Commands::Logout => {
                library.logout().await?;
                println!("{} Logged out", "👋");
                Ok(())
            }
        }
    }
}

async fn handle_launch(library: Arc<Library>, game: String, skip_version_check: bool) -> Result<()> {
    println!("{} Launching {}...", "🚀", game.bold().green());

    let mut outcome = run_game(&library, &game, LaunchOptions { skip_version_check }).await?;

    if outcome.failure == Some(FailureKind::OutOfDate) {
        let update_first = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("{} is out of date. Update before playing?", game))
            .default(true)
            .interact()?;

        let options = if update_first {
            let update = run_transfer(&library, &game, Transfer::Update).await?;
            if !update.succeeded() {
                report(&game, "update", &update);
                return Ok(());
            }
            LaunchOptions::default()
        } else {
            LaunchOptions {
                skip_version_check: true,
            }
        };
        outcome = run_game(&library, &game, options).await?;
    }

    report(&game, "session", &outcome);
    Ok(())
}

/// Runs a launch to completion; Ctrl-C stops the game.
async fn run_game(library: &Arc<Library>, game: &str, options: LaunchOptions) -> Result<ProcessOutcome> {
    let mut task = {
        let library = Arc::clone(library);
        let game = game.to_string();
        tokio::spawn(async move { library.launch(&game, options).await })
    };

    let mut stop_requested = false;
    loop {
        tokio::select! {
            result = &mut task => return Ok(result??),
            _ = tokio::signal::ctrl_c(), if !stop_requested => {
                stop_requested = true;
                println!("{} Stopping {}...", "🛑", game.bold());
                if let Err(e) = library.stop(game).await {
                    warn!("Could not stop {}: {}", game, e);
                }
            }
        }
    }
}

/// Runs an install or update with a progress bar; Ctrl-C cancels it.
async fn run_transfer(library: &Arc<Library>, game: &str, transfer: Transfer) -> Result<ProcessOutcome> {
    let verb = match transfer {
        Transfer::Install(_) => "Installing",
        Transfer::Update => "Updating",
    };
    println!("{} {} {}...", "📥", verb, game.bold());

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );

    let mut events = library.tracker().subscribe();
    let mut task = {
        let library = Arc::clone(library);
        let game = game.to_string();
        tokio::spawn(async move {
            match transfer {
                Transfer::Install(path) => library.install(&game, path.as_deref()).await,
                Transfer::Update => library.update(&game).await,
            }
        })
    };

    let mut poller = None;
    let mut cancel_requested = false;

    let outcome = loop {
        tokio::select! {
            result = &mut task => break result??,
            event = events.recv() => {
                let state = match event {
                    Ok(state) if state.game_id == game => state,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break (&mut task).await??,
                };

                if state.status.is_transferring() && poller.is_none() {
                    let library = Arc::clone(library);
                    let game = game.to_string();
                    poller = Some(tokio::spawn(async move { library.poll_progress(&game).await }));
                }
                if let Some(progress) = &state.progress {
                    bar.set_position(progress.percent.clamp(0.0, 100.0) as u64);
                    bar.set_message(progress_message(progress));
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                bar.set_message("canceling...");
                if let Err(e) = library.cancel(game).await {
                    warn!("Could not cancel {}: {}", game, e);
                }
            }
        }
    };

    if let Some(poller) = poller {
        poller.abort();
    }
    bar.finish_and_clear();
    Ok(outcome)
}

fn progress_message(progress: &Progress) -> String {
    let mut parts = Vec::new();
    match (progress.downloaded_mib, progress.total_mib) {
        (Some(done), Some(total)) => parts.push(format!("{:.1}/{:.1} MiB", done, total)),
        (Some(done), None) => parts.push(format!("{:.1} MiB", done)),
        _ => {}
    }
    if let Some(eta) = &progress.eta {
        parts.push(format!("ETA {}", eta));
    }
    parts.join(", ")
}

/// Lines of tool stderr shown with a failure.
const STDERR_TAIL: usize = 5;

fn report(game: &str, what: &str, outcome: &ProcessOutcome) {
    if outcome.succeeded() {
        println!("{} {} {} finished", "✅".green(), game.bold(), what);
        return;
    }
    if outcome.was_terminated() {
        println!("{} {} {} canceled", "🛑", game.bold(), what);
        return;
    }

    let reason = match outcome.failure {
        Some(FailureKind::DiskSpace) => "not enough available disk space".to_string(),
        Some(FailureKind::OutOfDate) => "game is out of date".to_string(),
        Some(FailureKind::LaunchError) => "the game could not be started".to_string(),
        _ => match outcome.exit {
            ExitOutcome::Exited(code) => format!("exit code {}", code),
            ExitOutcome::Signaled(signal) => format!("killed by signal {}", signal),
            ExitOutcome::SpawnFailed => "the game tool could not be started".to_string(),
            ExitOutcome::Terminated => "terminated".to_string(),
        },
    };

    println!("{} {} {} failed: {}", "❌".red(), game.bold(), what, reason.red());
    for line in stderr_tail(&outcome.stderr) {
        println!("   {}", line.dimmed());
    }
    println!("   Log: {}", outcome.log_path.display().to_string().dimmed());
}

fn stderr_tail(stderr: &str) -> Vec<&str> {
    let lines: Vec<&str> = stderr.lines().filter(|line| !line.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(STDERR_TAIL)..].to_vec()
}

async fn handle_updates(library: &Library) -> Result<()> {
    let updates = library.check_updates().await?;

    if updates.is_empty() {
        println!("{} All games are up to date", "✅".green());
    } else {
        println!("{}", "🔄 Updates available:".bold().cyan());
        for game in updates {
            println!("  {}", game.yellow());
        }
    }
    Ok(())
}

async fn handle_runtimes(library: &Library) -> Result<()> {
    println!("{}", "🍷 Wine/Proton Runtimes:".bold().magenta());

    let runtimes = library.runtimes().await;
    if runtimes.is_empty() {
        println!("  No Wine or Proton found");
        return Ok(());
    }

    let default = runtime::default_selection(&runtimes);
    for entry in &runtimes {
        if entry.is_empty() {
            println!("  {} {}", "🍷", "Wine (not installed)".dimmed());
            continue;
        }
        let icon = match entry.kind() {
            RuntimeKind::VendorTool => "🚂",
            RuntimeKind::Standard => "🍷",
        };
        let marker = if *entry == default { " (default)".green() } else { "".normal() };
        println!("  {} {}{}", icon, entry.name.cyan(), marker);
        println!("    {}", entry.bin.dimmed());
    }
    Ok(())
}

async fn handle_settings_command(library: &Library, action: SettingsCommands) -> Result<()> {
    let settings = library.settings();

    match action {
        SettingsCommands::Show { game } => {
            let game = game.unwrap_or_else(|| DEFAULT_ID.to_string());
            let resolved = settings.resolve(&game).await?;
            let source = if settings.has_override(&game) {
                "game override"
            } else {
                "defaults"
            };

            println!("{} {} ({})", "⚙️ ", game.bold().cyan(), source.dimmed());
            println!("{}", serde_json::to_string_pretty(&resolved)?);
        }
        SettingsCommands::Set { game, key, value } => {
            let patch = settings.parse_setting(&key, &value).await?;
            settings.write(&game, &patch).await?;
            println!("{} {}: {} = {}", "✅".green(), game.bold(), key, value.yellow());
        }
        SettingsCommands::Init { game } => {
            settings.write_game_config(&game).await?;
            println!(
                "{} Settings for {} at {}",
                "✅".green(),
                game.bold(),
                settings.game_file(&game).display()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_stderr_tail_keeps_the_last_lines() {
        let stderr = "a\nb\n\nc\nd\ne\nNot enough available disk space\n";
        assert_eq!(stderr_tail(stderr), vec![
            "b",
            "c",
            "d",
            "e",
            "Not enough available disk space"
        ]);
        assert!(stderr_tail("").is_empty());
    }
}
