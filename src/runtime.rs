use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::utils::HostTools;

/// Display-name prefixes that mark a vendor compatibility tool.
pub const VENDOR_TOOL_PREFIXES: &[&str] = &["Proton", "Steam"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    /// Manages its own data path and is invoked through its `run` verb.
    VendorTool,
    /// Plain Wine, passed to the tool together with an explicit prefix.
    Standard,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeEntry {
    pub name: String,
    pub bin: String,
}

impl RuntimeEntry {
    fn new(name: String, bin: &Path) -> Self {
        Self {
            name,
            bin: bin.to_string_lossy().into_owned(),
        }
    }

    /// The native slot when no host `wine` was found.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.bin.is_empty()
    }

    pub fn kind(&self) -> RuntimeKind {
        classify(&self.name)
    }

    /// Binary path without the quoting older configs stored.
    pub fn bin_path(&self) -> PathBuf {
        PathBuf::from(self.bin.replace('\'', "").trim())
    }
}

impl fmt::Display for RuntimeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "(not installed)")
        } else {
            write!(f, "{} ({})", self.name, self.bin)
        }
    }
}

pub fn classify(name: &str) -> RuntimeKind {
    if VENDOR_TOOL_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        RuntimeKind::VendorTool
    } else {
        RuntimeKind::Standard
    }
}

/// Discovery never fails; unreadable roots are skipped and logged.
#[derive(Debug, Clone)]
pub struct RuntimeRegistry {
    tools_dir: PathBuf,
    steam_roots: Vec<PathBuf>,
    lutris_wine_dir: PathBuf,
    host: HostTools,
}

impl RuntimeRegistry {
    pub fn new(config: &Config, host: HostTools) -> Self {
        let home = &config.paths.home;
        Self::with_roots(
            config.paths.tools_dir.clone(),
            vec![
                home.join(".local/share/Steam"),
                home.join(".var/app/com.valvesoftware.Steam/.local/share/Steam"),
                PathBuf::from("/usr/share/steam"),
            ],
            home.join(".local/share/lutris/runners/wine"),
            host,
        )
    }

    pub fn with_roots(
        tools_dir: PathBuf,
        steam_roots: Vec<PathBuf>,
        lutris_wine_dir: PathBuf,
        host: HostTools,
    ) -> Self {
        Self {
            tools_dir,
            steam_roots,
            lutris_wine_dir,
            host,
        }
    }

    /// Native default first, then user-installed Wine builds, then vendor tools.
    pub async fn discover(&self) -> Vec<RuntimeEntry> {
        let managed_wine = self.tools_dir.join("wine");
        let managed_proton = self.tools_dir.join("proton");

        for dir in [&managed_wine, &managed_proton] {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                warn!("Could not create {}: {}", dir.display(), e);
            }
        }

        let native = self.detect_native().await;

        let mut alt_wine = Vec::new();
        for root in [&self.lutris_wine_dir, &managed_wine] {
            for version in list_subdirs(root).await {
                let bin = root.join(&version).join("bin/wine64");
                alt_wine.push(RuntimeEntry::new(format!("Wine - {}", version), &bin));
            }
        }

        let mut proton_roots = vec![managed_proton];
        for steam in self.steam_roots.iter().filter(|root| root.exists()) {
            proton_roots.push(steam.join("steamapps/common"));
            proton_roots.push(steam.join("compatibilitytools.d"));
        }

        let mut proton = Vec::new();
        for root in &proton_roots {
            for version in list_subdirs(root).await {
                if version.to_lowercase().starts_with("proton") {
                    let bin = root.join(&version).join("proton");
                    proton.push(RuntimeEntry::new(format!("Proton - {}", version), &bin));
                }
            }
        }

        let mut seen = HashSet::new();
        let entries: Vec<RuntimeEntry> = std::iter::once(native)
            .chain(alt_wine)
            .chain(proton)
            .filter(|entry| seen.insert(entry.clone()))
            .collect();

        info!("Discovered {} compatibility runtime(s)", entries.len());
        entries
    }

    pub async fn default_selection(&self) -> RuntimeEntry {
        default_selection(&self.discover().await)
    }

    async fn detect_native(&self) -> RuntimeEntry {
        let Some(bin) = self.host.find("wine") else {
            info!("Wine not installed");
            return RuntimeEntry::default();
        };

        let version = self
            .host
            .version_of(&bin)
            .await
            .unwrap_or_else(|| "Default".to_string());

        debug!("Native wine at {} ({})", bin.display(), version);
        RuntimeEntry::new(format!("Wine - {}", version), &bin)
    }
}

/// First usable entry in discovery order; the empty native slot otherwise.
pub fn default_selection(entries: &[RuntimeEntry]) -> RuntimeEntry {
    entries
        .iter()
        .find(|entry| !entry.is_empty())
        .or_else(|| entries.first())
        .cloned()
        .unwrap_or_default()
}

async fn list_subdirs(root: &Path) -> Vec<String> {
    let mut names = Vec::new();

    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(_) => return names,
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_dir = entry
            .file_type()
            .await
            .map(|file_type| file_type.is_dir() || file_type.is_symlink())
            .unwrap_or(false);
        if is_dir {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    names.sort();
    names
}
