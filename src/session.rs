//! Per-game lifecycle state.
//!
//! The tracker only stores state and announces changes. Callers decide when
//! an operation starts and finishes; the tracker rejects transitions that
//! the state machine does not allow.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{QuestForgeError, Result};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    /// Idle; the previous operation (if any) finished.
    Done,
    Installing,
    Updating,
    Playing,
    Uninstalling,
    Repairing,
    Moving,
    Canceled,
}

impl GameStatus {
    pub fn is_idle(self) -> bool {
        matches!(self, GameStatus::Done | GameStatus::Canceled)
    }

    /// Statuses that report download progress and can be canceled.
    pub fn is_transferring(self) -> bool {
        matches!(self, GameStatus::Installing | GameStatus::Updating)
    }

    pub fn can_transition_to(self, next: GameStatus) -> bool {
        use GameStatus::*;

        match (self, next) {
            (from, Installing | Updating | Repairing | Moving | Uninstalling | Playing) => {
                from.is_idle()
            }
            (Installing | Updating, Canceled) => true,
            (_, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GameStatus::Done => "done",
            GameStatus::Installing => "installing",
            GameStatus::Updating => "updating",
            GameStatus::Playing => "playing",
            GameStatus::Uninstalling => "uninstalling",
            GameStatus::Repairing => "repairing",
            GameStatus::Moving => "moving",
            GameStatus::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub percent: f64,
    pub downloaded_mib: Option<f64>,
    pub total_mib: Option<f64>,
    pub eta: Option<String>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub game_id: String,
    pub status: GameStatus,
    pub progress: Option<Progress>,
}

impl SessionState {
    fn idle(game_id: &str) -> Self {
        Self {
            game_id: game_id.to_string(),
            status: GameStatus::Done,
            progress: None,
        }
    }
}

pub struct SessionTracker {
    states: RwLock<HashMap<String, SessionState>>,
    events: broadcast::Sender<SessionState>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            states: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.events.subscribe()
    }

    pub fn get(&self, game_id: &str) -> SessionState {
        self.states
            .read()
            .get(game_id)
            .cloned()
            .unwrap_or_else(|| SessionState::idle(game_id))
    }

    pub fn status(&self, game_id: &str) -> GameStatus {
        self.states
            .read()
            .get(game_id)
            .map(|state| state.status)
            .unwrap_or(GameStatus::Done)
    }

    pub fn is_busy(&self, game_id: &str) -> bool {
        !self.status(game_id).is_idle()
    }

    /// Every game that has ever had a state, sorted by id.
    pub fn snapshot(&self) -> Vec<SessionState> {
        let mut states: Vec<SessionState> = self.states.read().values().cloned().collect();
        states.sort_by(|a, b| a.game_id.cmp(&b.game_id));
        states
    }

    /// Starts an operation on an idle game.
    pub fn begin(&self, game_id: &str, status: GameStatus) -> Result<SessionState> {
        if status.is_idle() {
            return Err(QuestForgeError::InvalidTransition {
                game_id: game_id.to_string(),
                from: self.status(game_id),
                to: status,
            });
        }
        self.transition(game_id, status)
    }

    pub fn cancel(&self, game_id: &str) -> Result<SessionState> {
        self.transition(game_id, GameStatus::Canceled)
    }

    /// The operation's process finished; callers re-read derived state.
    ///
    /// A canceled game stays canceled.
    pub fn complete(&self, game_id: &str) -> SessionState {
        if self.status(game_id).is_idle() {
            return self.get(game_id);
        }

        match self.transition(game_id, GameStatus::Done) {
            Ok(state) => state,
            Err(_) => self.get(game_id),
        }
    }

    /// Records progress; ignored unless the game is installing or updating.
    pub fn set_progress(&self, game_id: &str, progress: Progress) -> bool {
        let updated = {
            let mut states = self.states.write();
            match states.get_mut(game_id) {
                Some(state) if state.status.is_transferring() => {
                    state.progress = Some(progress);
                    Some(state.clone())
                }
                _ => None,
            }
        };

        match updated {
            Some(state) => {
                let _ = self.events.send(state);
                true
            }
            None => false,
        }
    }

    fn transition(&self, game_id: &str, next: GameStatus) -> Result<SessionState> {
        let state = {
            let mut states = self.states.write();
            let current = states
                .entry(game_id.to_string())
                .or_insert_with(|| SessionState::idle(game_id));

            if !current.status.can_transition_to(next) {
                return Err(QuestForgeError::InvalidTransition {
                    game_id: game_id.to_string(),
                    from: current.status,
                    to: next,
                });
            }

            debug!("{}: {} -> {}", game_id, current.status, next);
            current.status = next;
            current.progress = None;
            current.clone()
        };

        let _ = self.events.send(state.clone());
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use GameStatus::*;

    const ALL: [GameStatus; 8] = [
        Done,
        Installing,
        Updating,
        Playing,
        Uninstalling,
        Repairing,
        Moving,
        Canceled,
    ];

    fn progress(percent: f64) -> Progress {
        Progress {
            percent,
            downloaded_mib: None,
            total_mib: None,
            eta: None,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_from_idle_only_operations_are_reachable() {
        let reachable: Vec<GameStatus> = ALL
            .into_iter()
            .filter(|next| *next != Done && Done.can_transition_to(*next))
            .collect();

        assert_eq!(reachable, vec![
            Installing,
            Updating,
            Playing,
            Uninstalling,
            Repairing,
            Moving,
        ]);
    }

    #[test]
    fn test_cancel_only_from_transfers() {
        for from in ALL {
            assert_eq!(from.can_transition_to(Canceled), from.is_transferring(), "{}", from);
        }
    }

    #[test]
    fn test_playing_only_reaches_done() {
        for next in ALL {
            assert_eq!(Playing.can_transition_to(next), next == Done, "{}", next);
        }
    }

    #[test]
    fn test_every_busy_state_completes() {
        for from in ALL.into_iter().filter(|status| !status.is_idle()) {
            let tracker = SessionTracker::new();
            if from != Done {
                tracker.begin("Sugar", from).ok();
            }
            if tracker.status("Sugar") != from {
                // Canceled is only reachable through a transfer.
                continue;
            }
            assert_eq!(tracker.complete("Sugar").status, Done);
        }
    }

    #[test]
    fn test_second_operation_is_rejected_while_busy() {
        let tracker = SessionTracker::new();
        tracker.begin("Sugar", Installing).unwrap();

        let err = tracker.begin("Sugar", Playing).unwrap_err();
        assert!(matches!(err, QuestForgeError::InvalidTransition {
            from: Installing,
            to: Playing,
            ..
        }));

        // Other games are independent.
        tracker.begin("Quail", Playing).unwrap();
        assert!(tracker.is_busy("Quail"));
    }

    #[test]
    fn test_cancel_then_next_operation() {
        let tracker = SessionTracker::new();
        tracker.begin("Sugar", Updating).unwrap();
        tracker.set_progress("Sugar", progress(12.5));

        let state = tracker.cancel("Sugar").unwrap();
        assert_eq!(state.status, Canceled);
        assert_eq!(state.progress, None);
        assert!(!tracker.is_busy("Sugar"));
        assert_eq!(tracker.complete("Sugar").status, Canceled);

        tracker.begin("Sugar", Updating).unwrap();
    }

    #[test]
    fn test_progress_only_while_transferring() {
        let tracker = SessionTracker::new();
        assert!(!tracker.set_progress("Sugar", progress(1.0)));

        tracker.begin("Sugar", Playing).unwrap();
        assert!(!tracker.set_progress("Sugar", progress(1.0)));
        tracker.complete("Sugar");

        tracker.begin("Sugar", Installing).unwrap();
        assert!(tracker.set_progress("Sugar", progress(42.0)));
        assert_eq!(tracker.get("Sugar").progress.unwrap().percent, 42.0);

        tracker.complete("Sugar");
        assert_eq!(tracker.get("Sugar").progress, None);
    }

    #[test]
    fn test_begin_rejects_idle_targets() {
        let tracker = SessionTracker::new();
        assert!(tracker.begin("Sugar", Done).is_err());
        assert!(tracker.begin("Sugar", Canceled).is_err());
        assert!(tracker.cancel("Sugar").is_err());
    }

    #[tokio::test]
    async fn test_changes_are_broadcast() {
        let tracker = SessionTracker::new();
        let mut events = tracker.subscribe();

        tracker.begin("Sugar", Repairing).unwrap();
        tracker.complete("Sugar");

        assert_eq!(events.recv().await.unwrap().status, Repairing);
        assert_eq!(events.recv().await.unwrap().status, Done);
        assert_eq!(tracker.snapshot().len(), 1);
    }
}
