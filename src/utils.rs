use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;
use which::{which, which_in};

/// Presence checks for optional host binaries (`wine`, `gamemoderun`).
///
/// A missing binary is never an error here; callers decide how to degrade.
#[derive(Debug, Clone, Default)]
pub struct HostTools {
    search_path: Option<OsString>,
}

impl HostTools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict lookups to an explicit `PATH`-style list.
    pub fn with_search_path(search_path: impl Into<OsString>) -> Self {
        Self {
            search_path: Some(search_path.into()),
        }
    }

    pub fn find(&self, cmd: &str) -> Option<PathBuf> {
        let found = match &self.search_path {
            Some(paths) => which_in(cmd, Some(paths), "/"),
            None => which(cmd),
        };

        match found {
            Ok(path) => Some(path),
            Err(e) => {
                debug!("{} not found on host: {}", cmd, e);
                None
            }
        }
    }

    pub fn check_command_exists(&self, cmd: &str) -> bool {
        self.find(cmd).is_some()
    }

    /// First stdout line of `<bin> --version`, if the probe succeeds.
    pub async fn version_of(&self, bin: &Path) -> Option<String> {
        let output = match Command::new(bin).arg("--version").output().await {
            Ok(output) => output,
            Err(e) => {
                debug!("{} --version failed: {}", bin.display(), e);
                return None;
            }
        };

        if !output.status.success() {
            return None;
        }

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
    }
}

/// Expands the `~` shorthand and drops the single quotes older configs
/// wrapped around paths.
pub fn expand_home(path: &str, home: &Path) -> PathBuf {
    let cleaned = path.replace('\'', "");
    let trimmed = cleaned.trim();

    if trimmed == "~" {
        home.to_path_buf()
    } else if let Some(rest) = trimmed.strip_prefix("~/") {
        home.join(rest)
    } else {
        PathBuf::from(trimmed)
    }
}

/// Marks a file as executable, for fake binaries in tests.
#[cfg(test)]
pub fn write_executable(path: &Path, contents: &str) {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_home() {
        let home = Path::new("/home/player");

        assert_eq!(expand_home("~/.wine", home), PathBuf::from("/home/player/.wine"));
        assert_eq!(expand_home("~", home), PathBuf::from("/home/player"));
        assert_eq!(
            expand_home("'~/Games/prefix'", home),
            PathBuf::from("/home/player/Games/prefix")
        );
        assert_eq!(expand_home("/opt/prefix", home), PathBuf::from("/opt/prefix"));
    }

    #[test]
    fn test_find_respects_search_path() {
        let dir = tempfile::tempdir().unwrap();
        write_executable(&dir.path().join("gamemoderun"), "#!/bin/sh\nexit 0\n");

        let host = HostTools::with_search_path(dir.path());
        assert_eq!(host.find("gamemoderun"), Some(dir.path().join("gamemoderun")));
        assert!(!host.check_command_exists("definitely-not-here"));
    }

    #[tokio::test]
    async fn test_version_of_reads_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let wine = dir.path().join("wine");
        write_executable(&wine, "#!/bin/sh\necho wine-7.0\necho extra\n");

        let host = HostTools::with_search_path(dir.path());
        assert_eq!(host.version_of(&wine).await.as_deref(), Some("wine-7.0"));
        assert_eq!(host.version_of(&dir.path().join("missing")).await, None);
    }
}
