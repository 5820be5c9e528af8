use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{QuestForgeError, Result};
use crate::graphics::TranslationLayerInstaller;
use crate::runtime::{RuntimeEntry, RuntimeKind};
use crate::settings::GameSettings;
use crate::tool::{GameTool, Invocation};
use crate::utils::{HostTools, expand_home};

/// Where a vendor compatibility tool keeps its per-game data.
pub const VENDOR_DATA_PATH_ENV: &str = "STEAM_COMPAT_DATA_PATH";
pub const GAME_MODE_DAEMON: &str = "gamemoderun";

/// Feature flags that each contribute one environment variable when set.
const FEATURE_ENV: &[(fn(&GameSettings) -> bool, &str, &str)] = &[
    (|s| s.show_fps, "DXVK_HUD", "fps"),
    (|s| s.audio_fix, "PULSE_LATENCY_MSEC", "60"),
    (|s| s.show_mangohud, "MANGOHUD", "1"),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct LaunchOptions {
    /// Start an out-of-date game without updating it first.
    pub skip_version_check: bool,
}

pub struct LaunchBuilder {
    tool: GameTool,
    home: PathBuf,
    host: HostTools,
    installer: Arc<dyn TranslationLayerInstaller>,
}

impl LaunchBuilder {
    pub fn new(
        tool: GameTool,
        home: PathBuf,
        host: HostTools,
        installer: Arc<dyn TranslationLayerInstaller>,
    ) -> Self {
        Self {
            tool,
            home,
            host,
            installer,
        }
    }

    pub async fn build(
        &self,
        game_id: &str,
        settings: &GameSettings,
        options: LaunchOptions,
    ) -> Result<Invocation> {
        let runtime = &settings.wine_version;
        let bin = validate_runtime(runtime)?;
        let prefix = expand_home(&settings.wine_prefix, &self.home);
        let kind = runtime.kind();

        let mut invocation = self.tool.launch(game_id);

        match kind {
            RuntimeKind::VendorTool => {
                info!("Using vendor compatibility tool {}", runtime.name);
                invocation.env.insert(
                    VENDOR_DATA_PATH_ENV.to_string(),
                    prefix.to_string_lossy().into_owned(),
                );
                invocation = invocation.args([
                    "--no-wine".to_string(),
                    "--wrapper".to_string(),
                    format!("{} run", bin.display()),
                ]);
            }
            RuntimeKind::Standard => {
                if !prefix.exists() {
                    info!("Creating prefix {}", prefix.display());
                    tokio::fs::create_dir_all(&prefix).await?;
                }

                if settings.auto_install_dxvk {
                    if let Err(e) = self.installer.install(&prefix, runtime).await {
                        warn!("DXVK install into {} failed: {}", prefix.display(), e);
                    }
                }

                invocation = invocation
                    .arg("--wine")
                    .arg(bin.to_string_lossy().into_owned())
                    .arg("--wine-prefix")
                    .arg(prefix.to_string_lossy().into_owned());
            }
        }

        for (enabled, key, value) in FEATURE_ENV {
            if enabled(settings) {
                invocation.env.insert(key.to_string(), value.to_string());
            }
        }
        for (key, value) in parse_env_options(&settings.other_options) {
            invocation.env.insert(key, value);
        }

        if settings.use_game_mode {
            match self.host.find(GAME_MODE_DAEMON) {
                Some(daemon) => invocation.wrapper = vec![daemon.to_string_lossy().into_owned()],
                None => info!("GameMode not installed, launching without it"),
            }
        }

        if options.skip_version_check {
            invocation = invocation.arg("--skip-version-check");
        }
        invocation = invocation.args(settings.launcher_args.split_whitespace());

        info!("Launch command: {}", invocation.command_line());
        Ok(invocation)
    }
}

fn validate_runtime(runtime: &RuntimeEntry) -> Result<PathBuf> {
    if runtime.bin.trim().is_empty() {
        return Err(QuestForgeError::RuntimeMissing(
            "no compatibility runtime selected".to_string(),
        ));
    }

    let bin = runtime.bin_path();
    if !Path::new(&bin).exists() {
        return Err(QuestForgeError::RuntimeMissing(format!(
            "{} does not exist",
            bin.display()
        )));
    }

    Ok(bin)
}

/// Splits `KEY=VALUE KEY2=VALUE2`; tokens without `=` are ignored.
pub fn parse_env_options(options: &str) -> Vec<(String, String)> {
    options
        .split_whitespace()
        .filter_map(|token| match token.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                Some((key.to_string(), value.trim_matches(['\'', '"']).to_string()))
            }
            _ => {
                warn!("Ignoring malformed environment option {:?}", token);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeEntry;
    use crate::settings::UserInfo;
    use crate::utils::write_executable;
    use futures_util::future::BoxFuture;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingInstaller {
        calls: AtomicUsize,
        fail: bool,
    }

    impl TranslationLayerInstaller for CountingInstaller {
        fn install<'a>(
            &'a self,
            _prefix: &'a Path,
            _runtime: &'a RuntimeEntry,
        ) -> BoxFuture<'a, Result<()>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    Err(QuestForgeError::GraphicsLayer("download failed".to_string()))
                } else {
                    Ok(())
                }
            })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        installer: Arc<CountingInstaller>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_installer(CountingInstaller::default())
        }

        fn with_installer(installer: CountingInstaller) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            std::fs::create_dir_all(root.join("home")).unwrap();
            std::fs::create_dir_all(root.join("bin")).unwrap();
            Self {
                _dir: dir,
                root,
                installer: Arc::new(installer),
            }
        }

        fn builder(&self) -> LaunchBuilder {
            LaunchBuilder::new(
                GameTool::new("legendary"),
                self.root.join("home"),
                HostTools::with_search_path(self.root.join("bin")),
                self.installer.clone(),
            )
        }

        fn runtime(&self, name: &str, rel_bin: &str) -> RuntimeEntry {
            let bin = self.root.join(rel_bin);
            write_executable(&bin, "#!/bin/sh\nexit 0\n");
            RuntimeEntry {
                name: name.to_string(),
                bin: bin.to_string_lossy().into_owned(),
            }
        }

        fn home(&self, rel: &str) -> String {
            self.root.join("home").join(rel).to_string_lossy().into_owned()
        }

        fn installs(&self) -> usize {
            self.installer.calls.load(Ordering::SeqCst)
        }
    }

    fn settings(runtime: RuntimeEntry) -> GameSettings {
        GameSettings {
            wine_version: runtime,
            wine_prefix: "~/.wine".to_string(),
            other_options: String::new(),
            launcher_args: String::new(),
            use_game_mode: false,
            show_fps: false,
            show_mangohud: false,
            audio_fix: false,
            auto_install_dxvk: false,
            max_workers: 0,
            default_install_path: String::new(),
            language: "en".to_string(),
            user_info: UserInfo::default(),
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    #[tokio::test]
    async fn test_wine_runtime_passes_binary_and_prefix() {
        let fixture = Fixture::new();
        let runtime = fixture.runtime("Wine - Wine 7.0", "usr/bin/wine");
        let bin = runtime.bin.clone();

        let invocation = fixture
            .builder()
            .build("X", &settings(runtime), LaunchOptions::default())
            .await
            .unwrap();

        assert_eq!(invocation.argv(), vec![
            "legendary".to_string(),
            "launch".to_string(),
            "X".to_string(),
            "--wine".to_string(),
            bin,
            "--wine-prefix".to_string(),
            fixture.home(".wine"),
        ]);
        assert!(invocation.env.is_empty());
        assert!(fixture.root.join("home/.wine").is_dir());
        assert_eq!(fixture.installs(), 0);
    }

    #[tokio::test]
    async fn test_proton_runtime_uses_wrapper_and_compat_data_path() {
        let fixture = Fixture::new();
        let runtime = fixture.runtime("Proton - Proton 7.0", "steam/Proton 7.0/proton");
        let bin = runtime.bin.clone();
        let mut settings = settings(runtime);
        settings.auto_install_dxvk = true;

        let invocation = fixture
            .builder()
            .build("X", &settings, LaunchOptions::default())
            .await
            .unwrap();

        assert!(has_pair(&invocation.args, "--wrapper", &format!("{} run", bin)));
        assert!(invocation.args.contains(&"--no-wine".to_string()));
        assert!(!invocation.args.contains(&"--wine-prefix".to_string()));
        assert!(!invocation.args.contains(&"--wine".to_string()));
        assert_eq!(
            invocation.env.get(VENDOR_DATA_PATH_ENV),
            Some(&fixture.home(".wine"))
        );
        // Vendor tools set up their own prefix and bundle DXVK.
        assert!(!fixture.root.join("home/.wine").exists());
        assert_eq!(fixture.installs(), 0);
    }

    #[tokio::test]
    async fn test_steam_prefixed_runtime_is_vendor_tool() {
        let fixture = Fixture::new();
        let runtime = fixture.runtime("Steam Linux Runtime - soldier", "steam/soldier/run");

        let invocation = fixture
            .builder()
            .build("X", &settings(runtime), LaunchOptions::default())
            .await
            .unwrap();

        assert!(invocation.env.contains_key(VENDOR_DATA_PATH_ENV));
        assert!(!invocation.args.contains(&"--wine-prefix".to_string()));
    }

    #[tokio::test]
    async fn test_auto_install_dxvk_for_wine_only() {
        let fixture = Fixture::new();
        let mut settings = settings(fixture.runtime("Wine - Wine 7.0", "usr/bin/wine"));
        settings.auto_install_dxvk = true;

        fixture
            .builder()
            .build("X", &settings, LaunchOptions::default())
            .await
            .unwrap();
        assert_eq!(fixture.installs(), 1);
    }

    #[tokio::test]
    async fn test_dxvk_failure_does_not_abort_launch() {
        let fixture = Fixture::with_installer(CountingInstaller {
            fail: true,
            ..Default::default()
        });
        let mut settings = settings(fixture.runtime("Wine - Wine 7.0", "usr/bin/wine"));
        settings.auto_install_dxvk = true;

        let invocation = fixture
            .builder()
            .build("X", &settings, LaunchOptions::default())
            .await
            .unwrap();
        assert_eq!(fixture.installs(), 1);
        assert!(invocation.args.contains(&"--wine-prefix".to_string()));
    }

    #[tokio::test]
    async fn test_feature_flags_only_add_set_variables() {
        let fixture = Fixture::new();
        let mut settings = settings(fixture.runtime("Wine - Wine 7.0", "usr/bin/wine"));
        settings.show_fps = true;
        settings.audio_fix = true;
        settings.other_options = "DXVK_ASYNC=1 junk RADV_PERFTEST='gpl'".to_string();

        let invocation = fixture
            .builder()
            .build("X", &settings, LaunchOptions::default())
            .await
            .unwrap();

        let env: Vec<(&str, &str)> = invocation
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(env, vec![
            ("DXVK_ASYNC", "1"),
            ("DXVK_HUD", "fps"),
            ("PULSE_LATENCY_MSEC", "60"),
            ("RADV_PERFTEST", "gpl"),
        ]);
        assert!(!invocation.env.contains_key("MANGOHUD"));
    }

    #[tokio::test]
    async fn test_game_mode_wraps_when_available() {
        let fixture = Fixture::new();
        let daemon = fixture.root.join("bin").join(GAME_MODE_DAEMON);
        write_executable(&daemon, "#!/bin/sh\nexec \"$@\"\n");
        let mut settings = settings(fixture.runtime("Wine - Wine 7.0", "usr/bin/wine"));
        settings.use_game_mode = true;

        let invocation = fixture
            .builder()
            .build("X", &settings, LaunchOptions::default())
            .await
            .unwrap();

        assert_eq!(invocation.argv()[0], daemon.to_string_lossy());
        assert_eq!(invocation.argv()[1], "legendary");
    }

    #[tokio::test]
    async fn test_game_mode_missing_is_not_fatal() {
        let fixture = Fixture::new();
        let mut settings = settings(fixture.runtime("Wine - Wine 7.0", "usr/bin/wine"));
        settings.use_game_mode = true;

        let invocation = fixture
            .builder()
            .build("X", &settings, LaunchOptions::default())
            .await
            .unwrap();

        assert!(invocation.wrapper.is_empty());
        assert_eq!(invocation.argv()[0], "legendary");
    }

    #[tokio::test]
    async fn test_argv_order_and_passthrough() {
        let fixture = Fixture::new();
        let runtime = fixture.runtime("Wine - Wine 7.0", "usr/bin/wine");
        let mut settings = settings(runtime);
        settings.wine_prefix = "'~/Games/x prefix'".to_string();
        settings.launcher_args = "-windowed  -nosplash".to_string();

        let invocation = fixture
            .builder()
            .build("X", &settings, LaunchOptions {
                skip_version_check: true,
            })
            .await
            .unwrap();

        let args = &invocation.args;
        assert_eq!(&args[..2], ["launch", "X"]);
        // The flag travels with the passthrough tokens, after the runtime args.
        assert_eq!(&args[args.len() - 3..], [
            "--skip-version-check",
            "-windowed",
            "-nosplash"
        ]);
        assert!(has_pair(args, "--wine-prefix", &fixture.home("Games/x prefix")));
        assert!(invocation.command_line().contains("x prefix\""));
    }

    #[tokio::test]
    async fn test_missing_runtime_is_an_error() {
        let fixture = Fixture::new();
        let builder = fixture.builder();

        let empty = settings(RuntimeEntry::default());
        assert!(matches!(
            builder.build("X", &empty, LaunchOptions::default()).await,
            Err(QuestForgeError::RuntimeMissing(_))
        ));

        let gone = settings(RuntimeEntry {
            name: "Wine - gone".to_string(),
            bin: fixture.root.join("nope/wine").to_string_lossy().into_owned(),
        });
        assert!(matches!(
            builder.build("X", &gone, LaunchOptions::default()).await,
            Err(QuestForgeError::RuntimeMissing(_))
        ));
    }

    #[test]
    fn test_parse_env_options() {
        assert_eq!(parse_env_options("A=1 B= =x C"), vec![
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), String::new()),
        ]);
        assert!(parse_env_options("").is_empty());
    }
}
