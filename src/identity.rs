use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{QuestForgeError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub account_id: String,
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
}

/// Account record written by the game-management tool on login.
#[derive(Debug, Clone)]
pub struct Identity {
    path: PathBuf,
}

impl Identity {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn is_logged_in(&self) -> bool {
        self.path.exists()
    }

    /// Missing file means "not logged in" and yields an empty account.
    pub async fn account(&self) -> Result<Account> {
        if !self.is_logged_in() {
            return Ok(Account::default());
        }

        let contents = tokio::fs::read_to_string(&self.path).await?;
        serde_json::from_str(&contents).map_err(|e| QuestForgeError::ConfigCorrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }
}

/// Name of the user running the launcher.
pub fn os_user_name() -> String {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|user| user.name)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_default()
}
