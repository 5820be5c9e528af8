use futures_util::future::BoxFuture;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{QuestForgeError, Result};
use crate::runtime::RuntimeEntry;

const VERSION_MARKER: &str = "dxvk.version";
const DLL_OVERRIDES: &[&str] = &["d3d9", "d3d10core", "d3d11", "dxgi"];

pub trait TranslationLayerInstaller: Send + Sync {
    fn install<'a>(
        &'a self,
        prefix: &'a Path,
        runtime: &'a RuntimeEntry,
    ) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Clone)]
pub struct GraphicsLayer {
    pub version: String,
    pub path: PathBuf,
}

/// Installs DXVK into plain Wine prefixes. Vendor tools bundle their own.
#[derive(Debug, Clone)]
pub struct DxvkInstaller {
    pub dxvk_dir: PathBuf,
}

impl DxvkInstaller {
    pub fn new(tools_dir: &Path) -> Self {
        Self {
            dxvk_dir: tools_dir.join("dxvk"),
        }
    }

    /// Unpacked `dxvk-<version>` builds, oldest first.
    pub fn list_installed(&self) -> Vec<GraphicsLayer> {
        let mut installed: Vec<GraphicsLayer> = WalkDir::new(&self.dxvk_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?;
                let version = name.strip_prefix("dxvk-")?.to_string();
                Some(GraphicsLayer {
                    version,
                    path: entry.path().to_path_buf(),
                })
            })
            .collect();

        installed.sort_by_key(|layer| version_key(&layer.version));
        installed
    }

    pub fn latest(&self) -> Option<GraphicsLayer> {
        self.list_installed().pop()
    }

    async fn install_to_prefix(&self, prefix: &Path, runtime: &RuntimeEntry) -> Result<()> {
        let layer = self.latest().ok_or_else(|| {
            QuestForgeError::GraphicsLayer(format!(
                "no DXVK build under {}",
                self.dxvk_dir.display()
            ))
        })?;

        let marker = prefix.join(VERSION_MARKER);
        if let Ok(current) = tokio::fs::read_to_string(&marker).await {
            if current.trim() == layer.version {
                debug!("DXVK {} already in {}", layer.version, prefix.display());
                return Ok(());
            }
        }

        info!("Installing DXVK {} to prefix: {}", layer.version, prefix.display());

        // 64-bit DLLs live in system32 and 32-bit ones in syswow64 on a win64 prefix.
        for (arch, target) in [("x64", "system32"), ("x32", "syswow64")] {
            let target_dir = prefix.join("drive_c/windows").join(target);
            tokio::fs::create_dir_all(&target_dir).await?;

            for dll in dlls_in(&layer.path.join(arch)) {
                if let Some(file_name) = dll.file_name() {
                    tokio::fs::copy(&dll, target_dir.join(file_name)).await?;
                }
            }
        }

        self.set_dll_overrides(prefix, runtime).await;
        tokio::fs::write(&marker, &layer.version).await?;

        Ok(())
    }

    async fn set_dll_overrides(&self, prefix: &Path, runtime: &RuntimeEntry) {
        let wine = runtime.bin_path();

        for &dll in DLL_OVERRIDES {
            let result = Command::new(&wine)
                .env("WINEPREFIX", prefix)
                .args([
                    "reg",
                    "add",
                    "HKEY_CURRENT_USER\\Software\\Wine\\DllOverrides",
                    "/v",
                    dll,
                    "/d",
                    "native",
                    "/f",
                ])
                .output()
                .await;

            match result {
                Ok(output) if output.status.success() => debug!("Set {} override to native", dll),
                Ok(output) => warn!(
                    "Setting {} override failed: {}",
                    dll,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(e) => warn!("Could not run {}: {}", wine.display(), e),
            }
        }
    }
}

impl TranslationLayerInstaller for DxvkInstaller {
    fn install<'a>(
        &'a self,
        prefix: &'a Path,
        runtime: &'a RuntimeEntry,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.install_to_prefix(prefix, runtime))
    }
}

fn version_key(version: &str) -> Vec<u64> {
    version
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|part| part.parse().ok())
        .collect()
}

fn dlls_in(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "dll"))
        .collect()
}
