use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{QuestForgeError, Result};
use crate::identity::{self, Identity};
use crate::runtime::{RuntimeEntry, RuntimeRegistry};

/// Key of the global record, both as a lookup id and inside the global file.
pub const DEFAULT_ID: &str = "default";
const DEFAULT_RECORD: &str = "defaultSettings";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub epic_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSettings {
    pub wine_version: RuntimeEntry,
    pub wine_prefix: String,
    /// `KEY=VALUE` pairs added to the launch environment.
    #[serde(default)]
    pub other_options: String,
    /// Passed through to the tool after everything else.
    #[serde(default)]
    pub launcher_args: String,
    #[serde(default)]
    pub use_game_mode: bool,
    #[serde(default)]
    pub show_fps: bool,
    #[serde(default)]
    pub show_mangohud: bool,
    #[serde(default)]
    pub audio_fix: bool,
    #[serde(default)]
    pub auto_install_dxvk: bool,
    /// 0 leaves the choice to the tool.
    #[serde(default)]
    pub max_workers: u32,
    #[serde(default)]
    pub default_install_path: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub user_info: UserInfo,
}

fn default_language() -> String {
    "en".to_string()
}

/// Partial update; `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsPatch {
    pub wine_version: Option<RuntimeEntry>,
    pub wine_prefix: Option<String>,
    pub other_options: Option<String>,
    pub launcher_args: Option<String>,
    pub use_game_mode: Option<bool>,
    pub show_fps: Option<bool>,
    pub show_mangohud: Option<bool>,
    pub audio_fix: Option<bool>,
    pub auto_install_dxvk: Option<bool>,
    pub max_workers: Option<u32>,
    pub default_install_path: Option<String>,
    pub language: Option<String>,
}

impl GameSettings {
    pub fn merged(&self, patch: &SettingsPatch) -> Self {
        let mut merged = self.clone();

        if let Some(wine_version) = &patch.wine_version {
            merged.wine_version = wine_version.clone();
        }
        if let Some(wine_prefix) = &patch.wine_prefix {
            merged.wine_prefix = wine_prefix.clone();
        }
        if let Some(other_options) = &patch.other_options {
            merged.other_options = other_options.clone();
        }
        if let Some(launcher_args) = &patch.launcher_args {
            merged.launcher_args = launcher_args.clone();
        }
        if let Some(path) = &patch.default_install_path {
            merged.default_install_path = path.clone();
        }
        if let Some(language) = &patch.language {
            merged.language = language.clone();
        }
        merged.use_game_mode = patch.use_game_mode.unwrap_or(merged.use_game_mode);
        merged.show_fps = patch.show_fps.unwrap_or(merged.show_fps);
        merged.show_mangohud = patch.show_mangohud.unwrap_or(merged.show_mangohud);
        merged.audio_fix = patch.audio_fix.unwrap_or(merged.audio_fix);
        merged.auto_install_dxvk = patch.auto_install_dxvk.unwrap_or(merged.auto_install_dxvk);
        merged.max_workers = patch.max_workers.unwrap_or(merged.max_workers);

        merged
    }
}

impl SettingsPatch {
    /// Builds a single-field patch from a `key value` pair typed on the CLI.
    ///
    /// The runtime is not covered here; see [`SettingsStore::parse_setting`].
    pub fn from_key_value(key: &str, value: &str) -> std::result::Result<Self, String> {
        fn flag(value: &str) -> std::result::Result<bool, String> {
            value
                .parse()
                .map_err(|_| format!("expected true or false, got {:?}", value))
        }

        let mut patch = Self::default();
        match key {
            "winePrefix" | "wine_prefix" => patch.wine_prefix = Some(value.to_string()),
            "otherOptions" | "other_options" => patch.other_options = Some(value.to_string()),
            "launcherArgs" | "launcher_args" => patch.launcher_args = Some(value.to_string()),
            "useGameMode" | "use_game_mode" => patch.use_game_mode = Some(flag(value)?),
            "showFps" | "show_fps" => patch.show_fps = Some(flag(value)?),
            "showMangohud" | "show_mangohud" => patch.show_mangohud = Some(flag(value)?),
            "audioFix" | "audio_fix" => patch.audio_fix = Some(flag(value)?),
            "autoInstallDxvk" | "auto_install_dxvk" => patch.auto_install_dxvk = Some(flag(value)?),
            "maxWorkers" | "max_workers" => {
                patch.max_workers = Some(
                    value
                        .parse()
                        .map_err(|_| format!("expected a number, got {:?}", value))?,
                )
            }
            "defaultInstallPath" | "default_install_path" => {
                patch.default_install_path = Some(value.to_string())
            }
            "language" => patch.language = Some(value.to_string()),
            _ => return Err(format!("unknown setting {:?}", key)),
        }

        Ok(patch)
    }
}

type WriteLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// One key's write lock. The map entry is dropped with its last holder.
struct KeyGuard<'a> {
    locks: &'a WriteLocks,
    key: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        self.guard.take();
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

#[derive(Debug, Clone)]
struct Seed {
    install_dir: PathBuf,
    prefix: PathBuf,
    language: String,
}

/// One global defaults file plus an optional override file per game.
///
/// A per-game file, when present, is authoritative for that game. Without
/// one, the global record is returned. Anything that does not parse into
/// [`GameSettings`] is [`QuestForgeError::ConfigCorrupt`], never replaced
/// with defaults.
pub struct SettingsStore {
    settings_file: PathBuf,
    games_dir: PathBuf,
    seed: Seed,
    registry: RuntimeRegistry,
    identity: Identity,
    write_locks: WriteLocks,
    files_written: AtomicUsize,
}

impl SettingsStore {
    pub fn new(config: &Config, registry: RuntimeRegistry, identity: Identity) -> Self {
        Self {
            settings_file: config.paths.settings_file.clone(),
            games_dir: config.paths.games_config_dir.clone(),
            seed: Seed {
                install_dir: config.paths.install_dir.clone(),
                prefix: config.paths.default_prefix.clone(),
                language: config.general.language.clone(),
            },
            registry,
            identity,
            write_locks: Mutex::new(HashMap::new()),
            files_written: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &RuntimeRegistry {
        &self.registry
    }

    /// Number of settings files this store has written since creation.
    #[cfg(test)]
    pub fn files_written(&self) -> usize {
        self.files_written.load(Ordering::Relaxed)
    }

    pub fn game_file(&self, game_id: &str) -> PathBuf {
        self.games_dir.join(format!("{}.json", game_id))
    }

    pub fn has_override(&self, game_id: &str) -> bool {
        game_id != DEFAULT_ID && self.game_file(game_id).exists()
    }

    pub async fn resolve(&self, game_id: &str) -> Result<GameSettings> {
        validate_id(game_id)?;

        if self.has_override(game_id) {
            return read_record(&self.game_file(game_id), game_id).await;
        }

        if !self.settings_file.exists() {
            self.write_default_config().await?;
        }

        read_record(&self.settings_file, DEFAULT_RECORD).await
    }

    /// Merges `patch` into the game's record (or the defaults for a game
    /// without one) and persists the result.
    pub async fn write(&self, game_id: &str, patch: &SettingsPatch) -> Result<GameSettings> {
        validate_id(game_id)?;

        if game_id == DEFAULT_ID {
            self.write_default_config().await?;
            let _guard = self.lock_key(DEFAULT_ID).await;

            let current = read_record(&self.settings_file, DEFAULT_RECORD).await?;
            let merged = current.merged(patch);
            self.persist(&self.settings_file, DEFAULT_RECORD, &merged).await?;
            return Ok(merged);
        }

        // Resolve outside the per-game lock; initializing defaults takes the
        // global one.
        let fallback = self.resolve(DEFAULT_ID).await?;
        let _guard = self.lock_key(game_id).await;

        let game_file = self.game_file(game_id);
        let current = if game_file.exists() {
            read_record(&game_file, game_id).await?
        } else {
            fallback
        };

        let merged = current.merged(patch);
        self.persist(&game_file, game_id, &merged).await?;
        info!("Updated settings for {}", game_id);
        Ok(merged)
    }

    /// Seeds the global defaults file. Never overwrites an existing one.
    pub async fn write_default_config(&self) -> Result<()> {
        let _guard = self.lock_key(DEFAULT_ID).await;

        if !self.settings_file.exists() {
            let account = self.identity.account().await?;
            let wine_version = self.registry.default_selection().await;

            let defaults = GameSettings {
                wine_version,
                wine_prefix: self.seed.prefix.to_string_lossy().into_owned(),
                other_options: String::new(),
                launcher_args: String::new(),
                use_game_mode: false,
                show_fps: false,
                show_mangohud: false,
                audio_fix: false,
                auto_install_dxvk: false,
                max_workers: 0,
                default_install_path: self.seed.install_dir.to_string_lossy().into_owned(),
                language: self.seed.language.clone(),
                user_info: UserInfo {
                    name: identity::os_user_name(),
                    epic_id: account.account_id,
                },
            };

            self.persist(&self.settings_file, DEFAULT_RECORD, &defaults)
                .await?;
            info!(
                "Wrote default settings to {} (runtime: {})",
                self.settings_file.display(),
                defaults.wine_version
            );
        }

        tokio::fs::create_dir_all(&self.games_dir).await?;
        Ok(())
    }

    /// Materializes a per-game file from the current defaults.
    pub async fn write_game_config(&self, game_id: &str) -> Result<()> {
        validate_id(game_id)?;
        if game_id == DEFAULT_ID {
            return self.write_default_config().await;
        }

        let defaults = self.resolve(DEFAULT_ID).await?;
        let _guard = self.lock_key(game_id).await;

        let game_file = self.game_file(game_id);
        if game_file.exists() {
            debug!("{} already exists", game_file.display());
            return Ok(());
        }

        self.persist(&game_file, game_id, &defaults).await
    }

    /// Parses a `key value` pair typed by the user. `wineVersion` takes a
    /// runtime name as listed by discovery.
    pub async fn parse_setting(&self, key: &str, value: &str) -> Result<SettingsPatch> {
        match key {
            "wineVersion" | "wine_version" => Ok(SettingsPatch {
                wine_version: Some(self.find_runtime(value).await?),
                ..SettingsPatch::default()
            }),
            _ => SettingsPatch::from_key_value(key, value).map_err(QuestForgeError::InvalidSetting),
        }
    }

    pub async fn find_runtime(&self, name: &str) -> Result<RuntimeEntry> {
        self.registry
            .discover()
            .await
            .into_iter()
            .find(|entry| !entry.is_empty() && entry.name == name)
            .ok_or_else(|| QuestForgeError::RuntimeMissing(format!("no runtime named {:?}", name)))
    }

    async fn lock_key(&self, key: &str) -> KeyGuard<'_> {
        let lock = Arc::clone(self.write_locks.lock().entry(key.to_string()).or_default());
        KeyGuard {
            locks: &self.write_locks,
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn persist(&self, path: &Path, record: &str, settings: &GameSettings) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut document = serde_json::Map::new();
        document.insert(record.to_string(), serde_json::to_value(settings)?);
        let contents = serde_json::to_string_pretty(&Value::Object(document))?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;

        self.files_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

pub(crate) fn validate_id(game_id: &str) -> Result<()> {
    let invalid = game_id.is_empty()
        || game_id.starts_with('.')
        || game_id.contains(['/', '\\', '\0']);

    if invalid {
        Err(QuestForgeError::InvalidGameId(game_id.to_string()))
    } else {
        Ok(())
    }
}

async fn read_record(path: &Path, record: &str) -> Result<GameSettings> {
    let contents = tokio::fs::read_to_string(path).await?;
    let corrupt = |reason: String| QuestForgeError::ConfigCorrupt {
        path: path.to_path_buf(),
        reason,
    };

    let mut document: HashMap<String, Value> =
        serde_json::from_str(&contents).map_err(|e| corrupt(e.to_string()))?;
    let value = document
        .remove(record)
        .ok_or_else(|| corrupt(format!("missing record {:?}", record)))?;

    serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))
}
