use crate::players::{AuthInfo, PlayerRegistry};
use log::{debug, info};
use serde::Serialize;
use shared::{FlagAction, GameEvent, InfoMap, PlayerId, Team};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Delay after a `ShutdownGame` line before players still listed are dropped
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Lifecycle changes signalled to the owning session by an applied event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A new map started (`InitGame`)
    GameStarted,
    /// The server is going down (`ShutdownGame`)
    GameShutdown,
}

/// Round or capture scores of the two playing teams
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scores(BTreeMap<Team, u32>);

impl Scores {
    pub fn new() -> Self {
        let mut scores = Scores(BTreeMap::new());
        scores.reset();
        scores
    }

    pub fn reset(&mut self) {
        self.0.clear();
        self.0.insert(Team::Red, 0);
        self.0.insert(Team::Blue, 0);
    }

    /// Adds a point to `team`. Returns false for teams that do not keep a score.
    pub fn increment(&mut self, team: Team) -> bool {
        match self.0.get_mut(&team) {
            Some(score) => {
                *score += 1;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, team: Team) -> u32 {
        self.0.get(&team).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Team, u32)> + '_ {
        self.0.iter().map(|(team, score)| (*team, *score))
    }
}

impl Default for Scores {
    fn default() -> Self {
        Self::new()
    }
}

/// Game state tracked for one server: players, scores, server info and the
/// shutdown grace timer
#[derive(Debug)]
pub struct GameState {
    pub players: PlayerRegistry,
    pub scores: Scores,
    pub server_info: InfoMap,
    pub shutdown_at: Option<Instant>,
    pub default_level: u32,
}

impl GameState {
    pub fn new(default_level: u32) -> Self {
        Self {
            players: PlayerRegistry::new(),
            scores: Scores::new(),
            server_info: InfoMap::new(),
            shutdown_at: None,
            default_level,
        }
    }

    /// Applies one parsed event to the state
    pub fn apply(&mut self, event: &GameEvent, now: Instant) -> Option<Transition> {
        match event {
            GameEvent::ClientConnect { id } => {
                self.players.connect(*id, self.default_level);
            }
            GameEvent::ClientDisconnect { id } => {
                self.players.remove(*id);
            }
            GameEvent::ClientUserinfo { id, info } => {
                self.players.merge_userinfo(*id, info, self.default_level);
            }
            GameEvent::ClientUserinfoChanged { id, info } => {
                if !self.players.apply_change(*id, info) {
                    debug!("Userinfo change for unknown client {}", id);
                }
            }
            GameEvent::ClientBegin { id } => {
                if self.players.begin(*id) {
                    debug!("Client has begun: {}", id);
                }
            }
            GameEvent::InitRound { info } => {
                debug!("New round started");
                self.apply_init(info, false);
            }
            GameEvent::InitGame { info } => {
                info!(
                    "New map started: {}",
                    info.get("mapname").map(String::as_str).unwrap_or("unknown")
                );
                self.apply_init(info, true);
                return Some(Transition::GameStarted);
            }
            GameEvent::SurvivorWinner { team, token } => {
                debug!("Round ended, winner: {}", token);
                if let Some(team) = team {
                    self.scores.increment(*team);
                }
            }
            GameEvent::ShutdownGame => {
                debug!("The server is going down");
                self.shutdown_at = Some(now);
                return Some(Transition::GameShutdown);
            }
            GameEvent::Flag {
                player,
                action: FlagAction::Captured,
                ..
            } => {
                if let Some(team) = self.players.get(*player).map(|p| p.team) {
                    self.scores.increment(team);
                }
            }
            GameEvent::AccountValidated {
                id,
                login,
                rcon_level,
                notoriety,
            } => {
                self.players.set_auth(
                    *id,
                    AuthInfo {
                        login: login.clone(),
                        rcon_level: *rcon_level,
                        notoriety: notoriety.clone(),
                    },
                );
            }
            _ => {}
        }
        None
    }

    /// Shared handling of `InitRound` and `InitGame`
    ///
    /// Both merge the announced server info over the current one. A new game
    /// additionally cancels the shutdown timer and resets the scores.
    fn apply_init(&mut self, info: &InfoMap, new_game: bool) {
        if new_game {
            self.shutdown_at = None;
            self.scores.reset();
        }
        self.server_info
            .extend(info.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Stops the shutdown timer once the grace period has elapsed
    ///
    /// Returns the ids of every player still known, which the caller reports
    /// as disconnected and then removes. None while the timer is not running
    /// or has not expired yet.
    pub fn expire_shutdown(&mut self, now: Instant) -> Option<Vec<PlayerId>> {
        let started = self.shutdown_at?;
        if now.saturating_duration_since(started) < SHUTDOWN_GRACE {
            return None;
        }

        self.shutdown_at = None;
        let ids = self.players.ids();
        if !ids.is_empty() {
            debug!("Shutdown grace expired with {} players left", ids.len());
        }
        Some(ids)
    }

    /// Forgets players, scores and server info
    pub fn reset(&mut self) {
        self.players.clear();
        self.scores.reset();
        self.server_info.clear();
        self.shutdown_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::parse_info;

    fn connect_player(state: &mut GameState, id: PlayerId, team: &str, now: Instant) {
        state.apply(&GameEvent::ClientConnect { id }, now);
        state.apply(
            &GameEvent::ClientUserinfoChanged {
                id,
                info: parse_info(&format!("n\\Player{id}\\t\\{team}")),
            },
            now,
        );
    }

    #[test]
    fn test_scores_start_at_zero() {
        let scores = Scores::new();
        assert_eq!(scores.get(Team::Red), 0);
        assert_eq!(scores.get(Team::Blue), 0);
        assert_eq!(scores.iter().count(), 2);
    }

    #[test]
    fn test_scores_ignore_non_playing_teams() {
        let mut scores = Scores::new();
        assert!(scores.increment(Team::Red));
        assert!(!scores.increment(Team::Spectator));
        assert!(!scores.increment(Team::Free));
        assert_eq!(scores.get(Team::Red), 1);
        assert_eq!(scores.get(Team::Spectator), 0);
    }

    #[test]
    fn test_connect_creates_spectator() {
        let mut state = GameState::new(10);
        let now = Instant::now();

        state.apply(&GameEvent::ClientConnect { id: 3 }, now);

        let player = state.players.get(3).unwrap();
        assert_eq!(player.team, Team::Spectator);
        assert_eq!(player.level, 10);
        assert!(!player.begun);
    }

    #[test]
    fn test_begin_and_disconnect() {
        let mut state = GameState::new(0);
        let now = Instant::now();

        state.apply(&GameEvent::ClientConnect { id: 1 }, now);
        state.apply(&GameEvent::ClientBegin { id: 1 }, now);
        assert!(state.players.get(1).unwrap().begun);

        state.apply(&GameEvent::ClientDisconnect { id: 1 }, now);
        assert!(state.players.is_empty());
    }

    #[test]
    fn test_init_game_resets_scores_and_merges_info() {
        let mut state = GameState::new(0);
        let now = Instant::now();
        state.server_info.insert("sv_hostname".to_string(), "Old".to_string());
        state.scores.increment(Team::Blue);
        state.shutdown_at = Some(now);

        let transition = state.apply(
            &GameEvent::InitGame {
                info: parse_info("\\mapname\\ut4_casa\\g_gametype\\4"),
            },
            now,
        );

        assert_eq!(transition, Some(Transition::GameStarted));
        assert_eq!(state.scores, Scores::new());
        assert!(state.shutdown_at.is_none());
        assert_eq!(state.server_info.get("sv_hostname").map(String::as_str), Some("Old"));
        assert_eq!(state.server_info.get("mapname").map(String::as_str), Some("ut4_casa"));
    }

    #[test]
    fn test_init_round_keeps_scores() {
        let mut state = GameState::new(0);
        let now = Instant::now();
        state.scores.increment(Team::Red);

        let transition = state.apply(
            &GameEvent::InitRound {
                info: parse_info("\\mapname\\ut4_abbey"),
            },
            now,
        );

        assert_eq!(transition, None);
        assert_eq!(state.scores.get(Team::Red), 1);
        assert_eq!(state.server_info.get("mapname").map(String::as_str), Some("ut4_abbey"));
    }

    #[test]
    fn test_survivor_winner_scores() {
        let mut state = GameState::new(0);
        let now = Instant::now();

        state.apply(
            &GameEvent::SurvivorWinner {
                team: Some(Team::Red),
                token: "Red".to_string(),
            },
            now,
        );
        state.apply(
            &GameEvent::SurvivorWinner {
                team: None,
                token: "Draw".to_string(),
            },
            now,
        );

        assert_eq!(state.scores.get(Team::Red), 1);
        assert_eq!(state.scores.get(Team::Blue), 0);
    }

    #[test]
    fn test_flag_capture_scores_for_player_team() {
        let mut state = GameState::new(0);
        let now = Instant::now();
        connect_player(&mut state, 0, "2", now);

        state.apply(
            &GameEvent::Flag {
                player: 0,
                action: FlagAction::Captured,
                flag: "team_CTF_redflag".to_string(),
            },
            now,
        );
        state.apply(
            &GameEvent::Flag {
                player: 0,
                action: FlagAction::Dropped,
                flag: "team_CTF_redflag".to_string(),
            },
            now,
        );

        assert_eq!(state.scores.get(Team::Blue), 1);
        assert_eq!(state.scores.get(Team::Red), 0);
    }

    #[test]
    fn test_account_validated_sets_auth() {
        let mut state = GameState::new(0);
        let now = Instant::now();
        state.apply(&GameEvent::ClientConnect { id: 4 }, now);

        state.apply(
            &GameEvent::AccountValidated {
                id: 4,
                login: "bob".to_string(),
                rcon_level: 2,
                notoriety: "serious".to_string(),
            },
            now,
        );

        let auth = state.players.get(4).unwrap().auth.clone().unwrap();
        assert_eq!(auth.login, "bob");
        assert_eq!(auth.rcon_level, 2);
        assert_eq!(auth.notoriety, "serious");
    }

    #[test]
    fn test_shutdown_grace_period() {
        let mut state = GameState::new(0);
        let start = Instant::now();
        connect_player(&mut state, 1, "1", start);
        connect_player(&mut state, 2, "2", start);

        assert_eq!(state.apply(&GameEvent::ShutdownGame, start), Some(Transition::GameShutdown));
        assert_eq!(state.expire_shutdown(start + Duration::from_secs(9)), None);
        assert_eq!(state.players.len(), 2);

        let expired = state.expire_shutdown(start + SHUTDOWN_GRACE).unwrap();
        assert_eq!(expired, vec![1, 2]);
        assert_eq!(state.players.len(), 2);
        assert!(state.shutdown_at.is_none());
        assert_eq!(state.expire_shutdown(start + Duration::from_secs(20)), None);
    }

    #[test]
    fn test_init_game_cancels_shutdown_wipe() {
        let mut state = GameState::new(0);
        let start = Instant::now();
        connect_player(&mut state, 1, "1", start);

        state.apply(&GameEvent::ShutdownGame, start);
        state.apply(&GameEvent::InitGame { info: InfoMap::new() }, start + Duration::from_secs(2));

        assert_eq!(state.expire_shutdown(start + Duration::from_secs(15)), None);
        assert_eq!(state.players.len(), 1);
    }
}
