use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Slot number of a player on a game server. Slots are reused after a disconnect.
pub type PlayerId = u32;

/// Decoded `\key\value` info-string.
pub type InfoMap = BTreeMap<String, String>;

/// Key only present in the userinfo of bots.
pub const BOT_USERINFO_KEY: &str = "characterfile";

/// Teams as numbered by the game server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Team {
    Free,
    Red,
    Blue,
    Spectator,
}

impl Team {
    pub fn from_number(number: i64) -> Option<Team> {
        match number {
            0 => Some(Team::Free),
            1 => Some(Team::Red),
            2 => Some(Team::Blue),
            3 => Some(Team::Spectator),
            _ => None,
        }
    }

    pub fn number(self) -> u32 {
        match self {
            Team::Free => 0,
            Team::Red => 1,
            Team::Blue => 2,
            Team::Spectator => 3,
        }
    }

    /// Resolves a team token as written in the game log or typed by a player.
    ///
    /// Accepts team names in any case (`red`, `Blue`, `SPECTATOR`, ...) and
    /// team numbers. Returns None for anything else.
    pub fn from_token(token: &str) -> Option<Team> {
        let token = token.trim();
        if let Ok(number) = token.parse::<i64>() {
            return Team::from_number(number);
        }

        match token.to_ascii_lowercase().as_str() {
            "free" => Some(Team::Free),
            "red" => Some(Team::Red),
            "blue" => Some(Team::Blue),
            "spec" | "spectator" => Some(Team::Spectator),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Team::Free => "free",
            Team::Red => "red",
            Team::Blue => "blue",
            Team::Spectator => "spectator",
        }
    }
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What happened to a flag in a `Flag` log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlagAction {
    Dropped,
    Returned,
    Captured,
    Other(u32),
}

impl FlagAction {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => FlagAction::Dropped,
            1 => FlagAction::Returned,
            2 => FlagAction::Captured,
            other => FlagAction::Other(other),
        }
    }
}

/// Every event a server session can report to the plugin layer.
///
/// Log-derived variants carry the fields parsed from their line; lifecycle
/// variants (`StartupGame`, `HoldServer`, `EndGame`) are produced by the
/// session itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GameEvent {
    StartupGame,
    HoldServer,
    ClientConnect {
        id: PlayerId,
    },
    ClientDisconnect {
        id: PlayerId,
    },
    ClientUserinfo {
        id: PlayerId,
        info: InfoMap,
    },
    ClientUserinfoChanged {
        id: PlayerId,
        info: InfoMap,
    },
    ClientBegin {
        id: PlayerId,
    },
    InitRound {
        info: InfoMap,
    },
    InitGame {
        info: InfoMap,
    },
    Exit {
        reason: String,
    },
    SurvivorWinner {
        team: Option<Team>,
        token: String,
    },
    ShutdownGame,
    EndGame,
    Kill {
        killer: PlayerId,
        victim: PlayerId,
        /// Means of death, absent on truncated lines
        means: Option<u32>,
    },
    Hit {
        victim: PlayerId,
        attacker: PlayerId,
        location: Option<u32>,
        weapon: Option<u32>,
    },
    Item {
        player: PlayerId,
        item: String,
    },
    Hotpotato,
    Flag {
        player: PlayerId,
        action: FlagAction,
        flag: String,
    },
    Say {
        id: PlayerId,
        team_only: bool,
        author: String,
        message: String,
    },
    Callvote {
        id: PlayerId,
        vote: String,
    },
    Vote {
        id: PlayerId,
        choice: u32,
    },
    Radio {
        id: PlayerId,
        group: u32,
        message_id: u32,
        location: String,
        message: String,
    },
    AccountKick {
        id: PlayerId,
        reason: String,
    },
    AccountBan {
        id: PlayerId,
        login: String,
        days: u32,
        hours: u32,
        minutes: u32,
    },
    AccountValidated {
        id: PlayerId,
        login: String,
        rcon_level: u32,
        notoriety: String,
    },
    AccountRejected {
        id: PlayerId,
        login: String,
        reason: String,
    },
}

impl GameEvent {
    /// The event name as it appears in the game log.
    pub fn name(&self) -> &'static str {
        match self {
            GameEvent::StartupGame => "StartupGame",
            GameEvent::HoldServer => "HoldServer",
            GameEvent::ClientConnect { .. } => "ClientConnect",
            GameEvent::ClientDisconnect { .. } => "ClientDisconnect",
            GameEvent::ClientUserinfo { .. } => "ClientUserinfo",
            GameEvent::ClientUserinfoChanged { .. } => "ClientUserinfoChanged",
            GameEvent::ClientBegin { .. } => "ClientBegin",
            GameEvent::InitRound { .. } => "InitRound",
            GameEvent::InitGame { .. } => "InitGame",
            GameEvent::Exit { .. } => "Exit",
            GameEvent::SurvivorWinner { .. } => "SurvivorWinner",
            GameEvent::ShutdownGame => "ShutdownGame",
            GameEvent::EndGame => "EndGame",
            GameEvent::Kill { .. } => "Kill",
            GameEvent::Hit { .. } => "Hit",
            GameEvent::Item { .. } => "Item",
            GameEvent::Hotpotato => "Hotpotato",
            GameEvent::Flag { .. } => "Flag",
            GameEvent::Say { .. } => "Say",
            GameEvent::Callvote { .. } => "Callvote",
            GameEvent::Vote { .. } => "Vote",
            GameEvent::Radio { .. } => "Radio",
            GameEvent::AccountKick { .. } => "AccountKick",
            GameEvent::AccountBan { .. } => "AccountBan",
            GameEvent::AccountValidated { .. } => "AccountValidated",
            GameEvent::AccountRejected { .. } => "AccountRejected",
        }
    }
}

/// Decodes a `\key\value\key\value` info-string.
///
/// The leading backslash is optional. A trailing key without a value maps to
/// an empty string; empty keys are skipped.
pub fn parse_info(infostring: &str) -> InfoMap {
    let trimmed = infostring.trim();
    let body = trimmed.strip_prefix('\\').unwrap_or(trimmed);

    let mut info = InfoMap::new();
    if body.is_empty() {
        return info;
    }

    let mut parts = body.split('\\');
    while let Some(key) = parts.next() {
        let value = parts.next().unwrap_or("");
        if !key.is_empty() {
            info.insert(key.to_string(), value.to_string());
        }
    }
    info
}

/// Strips the single leading digit that the game prepends to some names.
pub fn strip_name_digit(name: &str) -> &str {
    match name.chars().next() {
        Some(c) if c.is_ascii_digit() => &name[1..],
        _ => name,
    }
}

/// Human readable name of an Urban Terror `g_gametype` value.
pub fn gametype_name(code: &str) -> &'static str {
    match code.trim() {
        "0" => "Free For All",
        "1" => "Last Man Standing",
        "2" => "Single Player",
        "3" => "Team Deathmatch",
        "4" => "Team Survivor",
        "5" => "Follow The Leader",
        "6" => "Capture And Hold",
        "7" => "Capture The Flag",
        "8" => "Bomb Mode",
        "9" => "Jump",
        "10" => "Freeze Tag",
        "11" => "Gun Game",
        _ => "Unknown",
    }
}
