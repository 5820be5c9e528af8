use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub paths: PathsConfig,
    pub tool: ToolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub log_level: String,
    pub progress_interval_ms: u64,
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub home: PathBuf,
    /// Global defaults file (`{"defaultSettings": {...}}`).
    pub settings_file: PathBuf,
    /// One `<game>.json` plus its logs per game.
    pub games_config_dir: PathBuf,
    pub tools_dir: PathBuf,
    pub install_dir: PathBuf,
    pub default_prefix: PathBuf,
    /// Account record written by the game-management tool on login.
    pub user_info: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub binary: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/home/user"));
        let config_dir = dirs::config_dir().unwrap_or_else(|| home.join(".config"));
        let app_dir = config_dir.join("questforge");

        Self {
            general: GeneralConfig {
                log_level: "info".to_string(),
                progress_interval_ms: 1500,
                language: "en".to_string(),
            },
            paths: PathsConfig {
                settings_file: app_dir.join("config.json"),
                games_config_dir: app_dir.join("GamesConfig"),
                tools_dir: app_dir.join("tools"),
                install_dir: home.join("Games/QuestForge"),
                default_prefix: home.join(".wine"),
                user_info: config_dir.join("legendary/user.json"),
                home,
            },
            tool: ToolConfig {
                binary: PathBuf::from("legendary"),
            },
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::config_path);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("reading {}", config_path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("parsing {}", config_path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(config_path, contents)?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("questforge")
            .join("config.toml")
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.general.progress_interval_ms.max(100))
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.paths.games_config_dir)?;
        std::fs::create_dir_all(&self.paths.tools_dir)?;

        if let Some(parent) = self.paths.settings_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(())
    }

    /// Config rooted entirely under `root`, used by tests.
    #[cfg(test)]
    pub fn rooted_at(root: &Path) -> Self {
        let app_dir = root.join("config/questforge");
        Self {
            general: GeneralConfig {
                log_level: "debug".to_string(),
                progress_interval_ms: 100,
                language: "en".to_string(),
            },
            paths: PathsConfig {
                home: root.join("home"),
                settings_file: app_dir.join("config.json"),
                games_config_dir: app_dir.join("GamesConfig"),
                tools_dir: app_dir.join("tools"),
                install_dir: root.join("home/Games/QuestForge"),
                default_prefix: root.join("home/.wine"),
                user_info: root.join("config/legendary/user.json"),
            },
            tool: ToolConfig {
                binary: PathBuf::from("legendary"),
            },
        }
    }
}
