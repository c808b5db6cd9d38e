//! Game log line parser
//!
//! Turns one line of the game server log into a typed [`GameEvent`]. Lines are
//! written as `TIMESTAMP EventName: fields`, where the field grammar depends on
//! the event. Parsing is pure: applying the event to the session state is done
//! by [`crate::game::GameState`].
//!
//! Unknown event names yield `Ok(None)` so that newer server builds do not
//! break the session. A line whose required fields cannot be read yields a
//! [`ProtocolError`]; the caller logs it and moves on to the next line.

use shared::{parse_info, FlagAction, GameEvent, PlayerId, Team};
use thiserror::Error;

/// Prefix marking a chat message as a bot command
pub const COMMAND_PREFIX: char = '!';

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed {event} line: {reason}")]
pub struct ProtocolError {
    pub event: String,
    pub reason: String,
}

impl ProtocolError {
    fn new(event: &str, reason: impl Into<String>) -> Self {
        Self {
            event: event.to_string(),
            reason: reason.into(),
        }
    }
}

/// A chat command extracted from a `say` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatCommand {
    pub name: String,
    pub args: Vec<String>,
}

/// Removes the leading `M:SS` timestamp written in front of every log line.
///
/// The timestamp is the first whitespace separated token when it is made only
/// of digits and colons. Lines without one are returned trimmed of leading
/// whitespace.
pub fn strip_timestamp(line: &str) -> &str {
    let trimmed = line.trim_start();
    match trimmed.split_once(char::is_whitespace) {
        Some((head, rest))
            if !head.is_empty() && head.chars().all(|c| c.is_ascii_digit() || c == ':') =>
        {
            rest.trim_start()
        }
        _ => trimmed,
    }
}

/// Parses a raw log line, timestamp included
pub fn parse_line(line: &str) -> Result<Option<GameEvent>, ProtocolError> {
    parse_event(strip_timestamp(line))
}

/// Parses a log line whose timestamp has already been removed
pub fn parse_event(line: &str) -> Result<Option<GameEvent>, ProtocolError> {
    let Some((name, rest)) = line.split_once(':') else {
        return Ok(None);
    };
    let rest = rest.trim();

    let event = match name.trim() {
        "ClientConnect" => GameEvent::ClientConnect {
            id: parse_id(name, rest)?,
        },
        "ClientDisconnect" => GameEvent::ClientDisconnect {
            id: parse_id(name, rest)?,
        },
        "ClientUserinfo" => {
            let (id, info) = split_id_info(name, rest)?;
            GameEvent::ClientUserinfo { id, info }
        }
        "ClientUserinfoChanged" => {
            let (id, info) = split_id_info(name, rest)?;
            GameEvent::ClientUserinfoChanged { id, info }
        }
        "ClientBegin" => GameEvent::ClientBegin {
            id: parse_id(name, rest)?,
        },
        "InitRound" => GameEvent::InitRound {
            info: parse_info(rest),
        },
        "InitGame" => GameEvent::InitGame {
            info: parse_info(rest),
        },
        "Exit" => GameEvent::Exit {
            reason: rest.to_string(),
        },
        "SurvivorWinner" => GameEvent::SurvivorWinner {
            team: Team::from_token(rest),
            token: rest.to_string(),
        },
        "ShutdownGame" => GameEvent::ShutdownGame,
        "Kill" => parse_kill(rest)?,
        "Hit" => parse_hit(rest)?,
        "Item" => parse_item(rest)?,
        "Hotpotato" => GameEvent::Hotpotato,
        "Flag" => parse_flag(rest)?,
        "say" => parse_say(rest, false)?,
        "sayteam" => parse_say(rest, true)?,
        "Callvote" => parse_callvote(rest)?,
        "Vote" => parse_vote(rest)?,
        "Radio" => parse_radio(rest)?,
        "AccountKick" => parse_account_kick(rest)?,
        "AccountBan" => parse_account_ban(rest)?,
        "AccountValidated" => parse_account_validated(rest)?,
        "AccountRejected" => parse_account_rejected(rest)?,
        _ => return Ok(None),
    };

    Ok(Some(event))
}

/// Extracts a command from a chat message starting with [`COMMAND_PREFIX`]
pub fn parse_command(message: &str) -> Option<ChatCommand> {
    let body = message.strip_prefix(COMMAND_PREFIX)?;
    let mut words = body.split_whitespace();
    let name = words.next()?.to_string();
    Some(ChatCommand {
        name,
        args: words.map(str::to_string).collect(),
    })
}

fn parse_id(event: &str, field: &str) -> Result<PlayerId, ProtocolError> {
    field
        .trim()
        .parse()
        .map_err(|_| ProtocolError::new(event, format!("invalid player id {:?}", field.trim())))
}

fn parse_number(event: &str, what: &str, field: &str) -> Result<u32, ProtocolError> {
    field
        .trim()
        .parse()
        .map_err(|_| ProtocolError::new(event, format!("invalid {what} {:?}", field.trim())))
}

fn split_id_info(event: &str, rest: &str) -> Result<(PlayerId, shared::InfoMap), ProtocolError> {
    let (id, info) = rest.split_once(' ').unwrap_or((rest, ""));
    Ok((parse_id(event, id)?, parse_info(info)))
}

/// Numeric fields written before the first colon, e.g. `0 1 10` in `0 1 10: A killed B`
fn leading_fields(rest: &str) -> Vec<&str> {
    let head = rest.split(':').next().unwrap_or("");
    head.split_whitespace().collect()
}

/// Text found between the first pair of double quotes
fn quoted<'a>(event: &str, field: &'a str) -> Result<&'a str, ProtocolError> {
    field
        .split('"')
        .nth(1)
        .ok_or_else(|| ProtocolError::new(event, format!("expected quoted text in {:?}", field.trim())))
}

/// Splits a ` - ` delimited field list into at most `limit` trimmed parts
fn dashed(rest: &str, limit: usize) -> Vec<&str> {
    rest.splitn(limit, '-').map(str::trim).collect()
}

fn require<'a>(event: &str, fields: &[&'a str], index: usize, what: &str) -> Result<&'a str, ProtocolError> {
    fields
        .get(index)
        .copied()
        .ok_or_else(|| ProtocolError::new(event, format!("missing {what}")))
}

fn parse_kill(rest: &str) -> Result<GameEvent, ProtocolError> {
    let fields = leading_fields(rest);
    Ok(GameEvent::Kill {
        killer: parse_id("Kill", require("Kill", &fields, 0, "killer")?)?,
        victim: parse_id("Kill", require("Kill", &fields, 1, "victim")?)?,
        means: fields.get(2).and_then(|f| f.parse().ok()),
    })
}

fn parse_hit(rest: &str) -> Result<GameEvent, ProtocolError> {
    let fields = leading_fields(rest);
    Ok(GameEvent::Hit {
        victim: parse_id("Hit", require("Hit", &fields, 0, "victim")?)?,
        attacker: parse_id("Hit", require("Hit", &fields, 1, "attacker")?)?,
        location: fields.get(2).and_then(|f| f.parse().ok()),
        weapon: fields.get(3).and_then(|f| f.parse().ok()),
    })
}

fn parse_item(rest: &str) -> Result<GameEvent, ProtocolError> {
    let fields: Vec<&str> = rest.split_whitespace().collect();
    Ok(GameEvent::Item {
        player: parse_id("Item", require("Item", &fields, 0, "player")?)?,
        item: fields.get(1).map(|item| item.to_string()).unwrap_or_default(),
    })
}

fn parse_flag(rest: &str) -> Result<GameEvent, ProtocolError> {
    let fields = leading_fields(rest);
    let flag = rest
        .split_once(':')
        .map(|(_, flag)| flag.trim().to_string())
        .unwrap_or_default();
    Ok(GameEvent::Flag {
        player: parse_id("Flag", require("Flag", &fields, 0, "player")?)?,
        action: FlagAction::from_code(parse_number("Flag", "action", require("Flag", &fields, 1, "action")?)?),
        flag,
    })
}

/// `id author: message`. The message keeps everything after the author's colon
/// minus the single separating space.
fn parse_say(rest: &str, team_only: bool) -> Result<GameEvent, ProtocolError> {
    let event = if team_only { "sayteam" } else { "say" };
    let (id, body) = rest
        .split_once(' ')
        .ok_or_else(|| ProtocolError::new(event, "missing message"))?;
    let (author, message) = body
        .split_once(':')
        .ok_or_else(|| ProtocolError::new(event, "missing author separator"))?;
    let message = message.strip_prefix(' ').unwrap_or(message);

    Ok(GameEvent::Say {
        id: parse_id(event, id)?,
        team_only,
        author: author.trim().to_string(),
        message: message.to_string(),
    })
}

fn parse_callvote(rest: &str) -> Result<GameEvent, ProtocolError> {
    let fields = dashed(rest, 2);
    Ok(GameEvent::Callvote {
        id: parse_id("Callvote", require("Callvote", &fields, 0, "player")?)?,
        vote: quoted("Callvote", require("Callvote", &fields, 1, "vote")?)?.to_string(),
    })
}

fn parse_vote(rest: &str) -> Result<GameEvent, ProtocolError> {
    let fields = dashed(rest, 2);
    Ok(GameEvent::Vote {
        id: parse_id("Vote", require("Vote", &fields, 0, "player")?)?,
        choice: parse_number("Vote", "choice", require("Vote", &fields, 1, "choice")?)?,
    })
}

/// `id - group - message id - "location" - "message"`
fn parse_radio(rest: &str) -> Result<GameEvent, ProtocolError> {
    let fields = dashed(rest, 5);
    Ok(GameEvent::Radio {
        id: parse_id("Radio", require("Radio", &fields, 0, "player")?)?,
        group: parse_number("Radio", "group", require("Radio", &fields, 1, "group")?)?,
        message_id: parse_number("Radio", "message id", require("Radio", &fields, 2, "message id")?)?,
        location: quoted("Radio", require("Radio", &fields, 3, "location")?)?.to_string(),
        message: quoted("Radio", require("Radio", &fields, 4, "message")?)?.to_string(),
    })
}

/// `id - login rejected: reason`
fn parse_account_kick(rest: &str) -> Result<GameEvent, ProtocolError> {
    let fields = dashed(rest, 2);
    let reason = fields
        .get(1)
        .and_then(|tail| tail.split_once(':'))
        .map(|(_, reason)| reason.trim().to_string())
        .unwrap_or_default();
    Ok(GameEvent::AccountKick {
        id: parse_id("AccountKick", require("AccountKick", &fields, 0, "player")?)?,
        reason,
    })
}

/// `id - login - [days]d - [hours]h - [mins]m`. Missing durations count as zero.
fn parse_account_ban(rest: &str) -> Result<GameEvent, ProtocolError> {
    let fields = dashed(rest, 5);
    let duration = |index: usize, unit: char| -> u32 {
        fields
            .get(index)
            .map(|field| field.trim_end_matches(unit).trim())
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    };
    Ok(GameEvent::AccountBan {
        id: parse_id("AccountBan", require("AccountBan", &fields, 0, "player")?)?,
        login: require("AccountBan", &fields, 1, "login")?.to_string(),
        days: duration(2, 'd'),
        hours: duration(3, 'h'),
        minutes: duration(4, 'm'),
    })
}

/// `id - login - rcon level - "notoriety"`. Logins may contain hyphens, so
/// fields are separated on ` - ` here.
fn parse_account_validated(rest: &str) -> Result<GameEvent, ProtocolError> {
    let fields: Vec<&str> = rest.splitn(4, " - ").map(str::trim).collect();
    Ok(GameEvent::AccountValidated {
        id: parse_id("AccountValidated", require("AccountValidated", &fields, 0, "player")?)?,
        login: require("AccountValidated", &fields, 1, "login")?.to_string(),
        rcon_level: fields.get(2).and_then(|f| f.parse().ok()).unwrap_or(0),
        notoriety: fields
            .get(3)
            .and_then(|f| f.split('"').nth(1))
            .unwrap_or_default()
            .to_string(),
    })
}

/// `id - login - "reason"`
fn parse_account_rejected(rest: &str) -> Result<GameEvent, ProtocolError> {
    let fields = dashed(rest, 3);
    Ok(GameEvent::AccountRejected {
        id: parse_id("AccountRejected", require("AccountRejected", &fields, 0, "player")?)?,
        login: require("AccountRejected", &fields, 1, "login")?.to_string(),
        reason: quoted("AccountRejected", require("AccountRejected", &fields, 2, "reason")?)?.to_string(),
    })
}
