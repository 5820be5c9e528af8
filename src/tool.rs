use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// A fully resolved external process invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub env: BTreeMap<String, String>,
    /// Optional wrapper (e.g. `gamemoderun`) placed before the program.
    pub wrapper: Vec<String>,
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Wrapper, program and arguments, in execution order.
    pub fn argv(&self) -> Vec<String> {
        self.wrapper
            .iter()
            .chain(std::iter::once(&self.program))
            .chain(self.args.iter())
            .cloned()
            .collect()
    }

    /// Single-line `KEY=VALUE … argv…` rendering for logs.
    pub fn command_line(&self) -> String {
        let argv = self.argv();
        let tokens: Vec<String> = self
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, quote(value)))
            .chain(argv.iter().map(|token| quote(token)))
            .collect();
        tokens.join(" ")
    }

    pub fn to_command(&self) -> Command {
        let argv = self.argv();
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.envs(&self.env);
        cmd
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

fn quote(token: &str) -> String {
    if token.is_empty() || token.contains(char::is_whitespace) {
        format!("\"{}\"", token)
    } else {
        token.to_string()
    }
}

/// Row of `list-installed --tsv`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledGame {
    pub app_name: String,
    pub title: String,
    pub update_available: bool,
    pub install_path: Option<PathBuf>,
}

/// Argument vectors for the external game-management CLI.
///
/// Launch vectors are completed by [`crate::launch::LaunchBuilder`].
#[derive(Debug, Clone)]
pub struct GameTool {
    binary: PathBuf,
}

impl GameTool {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn invocation(&self) -> Invocation {
        Invocation::new(self.binary.to_string_lossy().into_owned())
    }

    pub fn list_installed(&self) -> Invocation {
        self.invocation()
            .args(["list-installed", "--check-updates", "--tsv"])
    }

    pub fn launch(&self, game_id: &str) -> Invocation {
        self.invocation().args(["launch", game_id])
    }

    pub fn install(&self, game_id: &str, base_path: &Path, max_workers: u32) -> Invocation {
        self.invocation()
            .args(["install", game_id, "--base-path"])
            .arg(base_path.to_string_lossy().into_owned())
            .args(workers(max_workers))
            .arg("-y")
    }

    pub fn update(&self, game_id: &str, max_workers: u32) -> Invocation {
        self.invocation()
            .args(["update", game_id])
            .args(workers(max_workers))
            .arg("-y")
    }

    pub fn repair(&self, game_id: &str, max_workers: u32) -> Invocation {
        self.invocation()
            .args(["repair", game_id])
            .args(workers(max_workers))
            .arg("-y")
    }

    pub fn move_install(&self, game_id: &str, new_base: &Path) -> Invocation {
        self.invocation()
            .args(["move", game_id])
            .arg(new_base.to_string_lossy().into_owned())
            .arg("-y")
    }

    pub fn uninstall(&self, game_id: &str) -> Invocation {
        self.invocation().args(["uninstall", game_id, "-y"])
    }

    pub fn logout(&self) -> Invocation {
        self.invocation().args(["auth", "--delete"])
    }

    pub fn cleanup(&self) -> Invocation {
        self.invocation().arg("cleanup")
    }
}

fn workers(max_workers: u32) -> Vec<String> {
    if max_workers == 0 {
        Vec::new()
    } else {
        vec!["--max-workers".to_string(), max_workers.to_string()]
    }
}

/// Parses `list-installed --check-updates --tsv` output.
///
/// Columns are located through the header row when there is one; without a
/// header the first column is the app name and any `True` field marks an
/// update.
pub fn parse_installed_tsv(output: &str) -> Vec<InstalledGame> {
    let mut lines = output.lines().filter(|line| !line.trim().is_empty()).peekable();

    let header: Option<Vec<String>> = lines
        .peek()
        .filter(|line| line.to_lowercase().starts_with("app name"))
        .map(|line| line.split('\t').map(|col| col.trim().to_lowercase()).collect());
    if header.is_some() {
        lines.next();
    }

    let column = |name: &str| {
        header
            .as_ref()
            .and_then(|cols| cols.iter().position(|col| col == name))
    };
    let title_col = column("app title");
    let update_col = column("update available");
    let path_col = column("install path");

    lines
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
            let app_name = fields.first().filter(|name| !name.is_empty())?.to_string();

            let update_available = match update_col {
                Some(col) => fields.get(col).is_some_and(|field| *field == "True"),
                None => fields.iter().skip(1).any(|field| *field == "True"),
            };

            Some(InstalledGame {
                app_name,
                title: title_col
                    .and_then(|col| fields.get(col))
                    .map(|title| title.to_string())
                    .unwrap_or_default(),
                update_available,
                install_path: path_col
                    .and_then(|col| fields.get(col))
                    .filter(|path| !path.is_empty())
                    .map(PathBuf::from),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_command_line_quotes_tokens_with_spaces() {
        let mut invocation = Invocation::new("legendary").args([
            "launch",
            "Sugar",
            "--no-wine",
            "--wrapper",
            "/steam/Proton 7.0/proton run",
        ]);
        invocation
            .env
            .insert("STEAM_COMPAT_DATA_PATH".to_string(), "/home/p/.wine".to_string());
        invocation.wrapper = vec!["/usr/bin/gamemoderun".to_string()];

        assert_eq!(
            invocation.command_line(),
            "STEAM_COMPAT_DATA_PATH=/home/p/.wine /usr/bin/gamemoderun legendary launch Sugar \
             --no-wine --wrapper \"/steam/Proton 7.0/proton run\""
        );
        assert_eq!(invocation.argv()[0], "/usr/bin/gamemoderun");
    }

    #[test]
    fn test_verbs() {
        let tool = GameTool::new("legendary");

        assert_eq!(tool.update("Sugar", 0).argv(), vec!["legendary", "update", "Sugar", "-y"]);
        assert_eq!(
            tool.repair("Sugar", 8).argv(),
            vec!["legendary", "repair", "Sugar", "--max-workers", "8", "-y"]
        );
        assert_eq!(
            tool.install("Sugar", Path::new("/games"), 0).argv(),
            vec!["legendary", "install", "Sugar", "--base-path", "/games", "-y"]
        );
        assert_eq!(
            tool.list_installed().argv(),
            vec!["legendary", "list-installed", "--check-updates", "--tsv"]
        );
    }

    #[test]
    fn test_parse_tsv_with_header() {
        let output = "App name\tApp title\tInstalled version\tAvailable version\tUpdate available\tInstall path\tInstall size\n\
                      Sugar\tSugar Rush\t1.0\t1.1\tTrue\t/games/Sugar\t1024\n\
                      Quail\tQuail Hunt\t2.0\t2.0\tFalse\t/games/Quail\t2048\n";

        let games = parse_installed_tsv(output);
        assert_eq!(games, vec![
            InstalledGame {
                app_name: "Sugar".to_string(),
                title: "Sugar Rush".to_string(),
                update_available: true,
                install_path: Some(PathBuf::from("/games/Sugar")),
            },
            InstalledGame {
                app_name: "Quail".to_string(),
                title: "Quail Hunt".to_string(),
                update_available: false,
                install_path: Some(PathBuf::from("/games/Quail")),
            },
        ]);
    }

    #[test]
    fn test_parse_tsv_without_header() {
        let output = "Sugar\tSugar Rush\tTrue\nQuail\tQuail Hunt\tFalse\n\n";
        let updates: Vec<String> = parse_installed_tsv(output)
            .into_iter()
            .filter(|game| game.update_available)
            .map(|game| game.app_name)
            .collect();

        assert_eq!(updates, vec!["Sugar"]);
    }
}
