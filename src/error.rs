use std::path::PathBuf;
use thiserror::Error;

use crate::session::GameStatus;

#[derive(Error, Debug)]
pub enum QuestForgeError {
    #[error("Settings file {} is corrupt: {reason}", path.display())]
    ConfigCorrupt { path: PathBuf, reason: String },

    #[error("Invalid game id: {0:?}")]
    InvalidGameId(String),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Compatibility runtime not available: {0}")]
    RuntimeMissing(String),

    #[error("Game {game_id} is busy ({status})")]
    Busy { game_id: String, status: GameStatus },

    #[error("Invalid transition for {game_id}: {from} -> {to}")]
    InvalidTransition {
        game_id: String,
        from: GameStatus,
        to: GameStatus,
    },

    #[error("No running process for {0}")]
    NotRunning(String),

    #[error("Graphics layer error: {0}")]
    GraphicsLayer(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("System command failed: {0}")]
    CommandFailed(String),
}

pub type Result<T> = std::result::Result<T, QuestForgeError>;
