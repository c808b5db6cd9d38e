//! Connected player tracking for a game server session
//!
//! This module keeps the per-slot state of every player the session knows about:
//! - Player creation on connection, removal on disconnection
//! - Userinfo merging (address, GUID, bot detection, display name)
//! - Team and name updates from userinfo changes
//! - Account data reported by the server's auth system
//!
//! Slots are reused by the game server, so every player also receives a
//! session-unique UUID that survives slot reuse.

use log::{debug, info};
use serde::Serialize;
use shared::{strip_name_digit, InfoMap, PlayerId, Team, BOT_USERINFO_KEY};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::SystemTime;
use uuid::Uuid;

/// Account data attached to a player by an `AccountValidated` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthInfo {
    pub login: String,
    pub rcon_level: u32,
    pub notoriety: String,
}

/// A player connected to the game server
#[derive(Debug, Clone, Serialize)]
pub struct Player {
    /// Slot number on the server
    pub id: PlayerId,
    /// Display name, leading digit stripped
    pub name: String,
    /// Access level for bot commands
    pub level: u32,
    pub team: Team,
    pub is_bot: bool,
    /// Remote address, absent for bots
    pub addr: Option<String>,
    pub port: Option<u16>,
    pub guid: Option<String>,
    pub joined_at: SystemTime,
    /// Whether the player has entered the game
    pub begun: bool,
    /// Stable identity for this connection, unlike the slot id
    pub uuid: Uuid,
    /// Raw userinfo key/values merged over the player's lifetime
    pub other: InfoMap,
    pub auth: Option<AuthInfo>,
}

impl Player {
    /// Creates a freshly connected player
    ///
    /// New players start as spectators who have not begun yet.
    pub fn new(id: PlayerId, level: u32) -> Self {
        Self {
            id,
            name: String::new(),
            level,
            team: Team::Spectator,
            is_bot: false,
            addr: None,
            port: None,
            guid: None,
            joined_at: SystemTime::now(),
            begun: false,
            uuid: Uuid::new_v4(),
            other: InfoMap::new(),
            auth: None,
        }
    }

    /// The player's IP address. Always reflects `addr`.
    pub fn ip(&self) -> Option<&str> {
        self.addr.as_deref()
    }

    /// Merges a full userinfo string into the player
    ///
    /// Bots are recognised by their bot-only userinfo key and never carry
    /// network identity. For humans, the `ip` field is split into address and
    /// port. Keys missing from `info` leave the current values untouched.
    pub fn merge_userinfo(&mut self, info: &InfoMap) {
        if info.contains_key(BOT_USERINFO_KEY) {
            self.is_bot = true;
            self.addr = None;
            self.port = None;
            self.guid = None;
        } else {
            self.is_bot = false;
            if let Some(ip) = info.get("ip") {
                let (addr, port) = split_address(ip);
                self.addr = Some(addr);
                if port.is_some() {
                    self.port = port;
                }
            }
            if let Some(guid) = info.get("cl_guid") {
                self.guid = Some(guid.clone());
            }
        }

        if let Some(name) = info.get("name") {
            self.name = strip_name_digit(name).to_string();
        }

        self.other
            .extend(info.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Applies a `ClientUserinfoChanged` info-string (short keys `n`, `t`, `a0`..)
    pub fn apply_change(&mut self, info: &InfoMap) {
        if let Some(team) = info.get("t").and_then(|t| Team::from_token(t)) {
            self.team = team;
        }

        if let (Some(a0), Some(a1), Some(a2)) = (info.get("a0"), info.get("a1"), info.get("a2")) {
            self.other
                .insert("cg_rgb".to_string(), format!("{a0} {a1} {a2}"));
        }

        if let Some(name) = info.get("n") {
            self.name = strip_name_digit(name).to_string();
        }
    }
}

/// Splits `a.b.c.d:port` into its address and port parts.
fn split_address(raw: &str) -> (String, Option<u16>) {
    match raw.rsplit_once(':') {
        Some((addr, port)) => match port.parse::<u16>() {
            Ok(port) => (addr.to_string(), Some(port)),
            Err(_) => (raw.to_string(), None),
        },
        None => (raw.to_string(), None),
    }
}

/// Keyed store of the players connected to one game server
#[derive(Debug, Default)]
pub struct PlayerRegistry {
    /// Players indexed by their slot id
    players: BTreeMap<PlayerId, Player>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a player connecting on `id`
    ///
    /// A player still registered on the same slot is replaced, the slot
    /// having been reused by the server.
    pub fn connect(&mut self, id: PlayerId, level: u32) -> &mut Player {
        info!("Client connected: {}", id);
        match self.players.entry(id) {
            Entry::Occupied(mut slot) => {
                debug!("Slot {} reused, replacing previous player", id);
                slot.insert(Player::new(id, level));
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(Player::new(id, level)),
        }
    }

    /// Inserts a fully built player, used when synchronising with a running server
    pub fn insert(&mut self, player: Player) {
        self.players.insert(player.id, player);
    }

    /// Removes a player, returning it if it was registered
    pub fn remove(&mut self, id: PlayerId) -> Option<Player> {
        let removed = self.players.remove(&id);
        if removed.is_some() {
            info!("Client disconnected: {}", id);
        }
        removed
    }

    /// Merges userinfo into a player, creating it if the slot is unknown
    pub fn merge_userinfo(&mut self, id: PlayerId, info: &InfoMap, default_level: u32) {
        let player = self
            .players
            .entry(id)
            .or_insert_with(|| Player::new(id, default_level));
        player.merge_userinfo(info);
        debug!(
            "Client {} userinfo: name={} bot={} guid={:?}",
            id, player.name, player.is_bot, player.guid
        );
    }

    /// Applies a userinfo change. Returns false if the slot is unknown.
    pub fn apply_change(&mut self, id: PlayerId, info: &InfoMap) -> bool {
        match self.players.get_mut(&id) {
            Some(player) => {
                player.apply_change(info);
                debug!("Client {} changed: name={} team={}", id, player.name, player.team);
                true
            }
            None => false,
        }
    }

    /// Marks a player as having entered the game. Returns false if the slot is unknown.
    pub fn begin(&mut self, id: PlayerId) -> bool {
        match self.players.get_mut(&id) {
            Some(player) => {
                player.begun = true;
                true
            }
            None => false,
        }
    }

    /// Stores account data on a player. Returns false if the slot is unknown.
    pub fn set_auth(&mut self, id: PlayerId, auth: AuthInfo) -> bool {
        match self.players.get_mut(&id) {
            Some(player) => {
                player.auth = Some(auth);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: PlayerId) -> Option<&Player> {
        self.players.get(&id)
    }

    pub fn get_mut(&mut self, id: PlayerId) -> Option<&mut Player> {
        self.players.get_mut(&id)
    }

    /// Finds a player by display name, ignoring case
    pub fn find_by_name(&self, name: &str) -> Option<&Player> {
        self.players
            .values()
            .find(|player| player.name.eq_ignore_ascii_case(name))
    }

    /// Slot ids of every registered player, in ascending order
    pub fn ids(&self) -> Vec<PlayerId> {
        self.players.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    /// Drops every player
    pub fn clear(&mut self) {
        self.players.clear();
    }

    /// Returns the number of registered players
    pub fn len(&self) -> usize {
        self.players.len()
    }

    /// Returns true if no player is registered
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::parse_info;

    #[test]
    fn test_player_creation() {
        let player = Player::new(3, 5);

        assert_eq!(player.id, 3);
        assert_eq!(player.level, 5);
        assert_eq!(player.team, Team::Spectator);
        assert!(!player.begun);
        assert!(!player.is_bot);
        assert!(player.addr.is_none());
        assert!(player.other.is_empty());
    }

    #[test]
    fn test_player_uuids_are_unique() {
        let a = Player::new(1, 0);
        let b = Player::new(1, 0);
        assert_ne!(a.uuid, b.uuid);
    }

    #[test]
    fn test_merge_human_userinfo() {
        let mut player = Player::new(0, 0);
        let info = parse_info("\\ip\\192.168.1.20:27960\\name\\1Bob\\cl_guid\\ABC123\\rate\\25000");

        player.merge_userinfo(&info);

        assert!(!player.is_bot);
        assert_eq!(player.name, "Bob");
        assert_eq!(player.addr.as_deref(), Some("192.168.1.20"));
        assert_eq!(player.port, Some(27960));
        assert_eq!(player.guid.as_deref(), Some("ABC123"));
        assert_eq!(player.other.get("rate").map(String::as_str), Some("25000"));
    }

    #[test]
    fn test_merge_bot_userinfo() {
        let mut player = Player::new(1, 0);
        let info = parse_info("\\name\\Boa\\characterfile\\bots/boa_c.c\\skill\\3");

        player.merge_userinfo(&info);

        assert!(player.is_bot);
        assert_eq!(player.name, "Boa");
        assert!(player.addr.is_none());
        assert!(player.guid.is_none());
    }

    #[test]
    fn test_merge_keeps_previous_values() {
        let mut player = Player::new(2, 0);
        player.merge_userinfo(&parse_info("\\ip\\10.0.0.1:1234\\name\\Bob\\cl_guid\\X"));
        player.merge_userinfo(&parse_info("\\name\\Robert\\funred\\hat"));

        assert_eq!(player.name, "Robert");
        assert_eq!(player.guid.as_deref(), Some("X"));
        assert_eq!(player.other.get("ip").map(String::as_str), Some("10.0.0.1:1234"));
        assert_eq!(player.other.get("funred").map(String::as_str), Some("hat"));
    }

    #[test]
    fn test_ip_follows_addr() {
        let mut player = Player::new(2, 0);
        assert_eq!(player.ip(), None);

        player.merge_userinfo(&parse_info("\\ip\\10.0.0.1:1234"));
        assert_eq!(player.ip(), Some("10.0.0.1"));

        player.merge_userinfo(&parse_info("\\ip\\10.0.0.2:1234"));
        assert_eq!(player.ip(), Some("10.0.0.2"));
    }

    #[test]
    fn test_apply_change() {
        let mut player = Player::new(4, 0);
        let info = parse_info("n\\2Joe\\t\\1\\r\\0\\a0\\255\\a1\\0\\a2\\128");

        player.apply_change(&info);

        assert_eq!(player.name, "Joe");
        assert_eq!(player.team, Team::Red);
        assert_eq!(player.other.get("cg_rgb").map(String::as_str), Some("255 0 128"));
    }

    #[test]
    fn test_apply_change_unknown_team_keeps_team() {
        let mut player = Player::new(4, 0);
        player.apply_change(&parse_info("n\\Joe\\t\\9"));
        assert_eq!(player.team, Team::Spectator);
    }

    #[test]
    fn test_registry_connect_and_remove() {
        let mut registry = PlayerRegistry::new();
        assert!(registry.is_empty());

        registry.connect(3, 0);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(3).is_some());

        assert!(registry.remove(3).is_some());
        assert!(registry.remove(3).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_slot_reuse_replaces_player() {
        let mut registry = PlayerRegistry::new();
        let first = registry.connect(3, 0).uuid;
        registry.begin(3);

        let second = registry.connect(3, 0).uuid;

        assert_ne!(first, second);
        assert!(!registry.get(3).unwrap().begun);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_merge_creates_unknown_player() {
        let mut registry = PlayerRegistry::new();
        registry.merge_userinfo(7, &parse_info("\\name\\Ghost"), 20);

        let player = registry.get(7).unwrap();
        assert_eq!(player.name, "Ghost");
        assert_eq!(player.level, 20);
    }

    #[test]
    fn test_registry_updates_on_unknown_slots() {
        let mut registry = PlayerRegistry::new();

        assert!(!registry.begin(1));
        assert!(!registry.apply_change(1, &parse_info("n\\Bob\\t\\2")));
        assert!(!registry.set_auth(
            1,
            AuthInfo {
                login: "bob".to_string(),
                rcon_level: 0,
                notoriety: "serious".to_string(),
            }
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_find_by_name() {
        let mut registry = PlayerRegistry::new();
        registry.merge_userinfo(1, &parse_info("\\name\\Bob"), 0);
        registry.merge_userinfo(2, &parse_info("\\name\\Alice"), 0);

        assert_eq!(registry.find_by_name("alice").map(|p| p.id), Some(2));
        assert!(registry.find_by_name("carol").is_none());
    }

    #[test]
    fn test_registry_ids_sorted() {
        let mut registry = PlayerRegistry::new();
        registry.connect(5, 0);
        registry.connect(1, 0);
        registry.connect(3, 0);

        assert_eq!(registry.ids(), vec![1, 3, 5]);

        registry.clear();
        assert!(registry.ids().is_empty());
    }
}
