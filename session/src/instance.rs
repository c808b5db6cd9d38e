//! Per-server session
//!
//! A [`ServerSession`] ties together everything needed to follow one game
//! server: the RCon channel, the game log, the game state, and the plugin
//! sink receiving what happens. It is driven by calling [`ServerSession::step`]
//! once per tick from a single task.
//!
//! Lifecycle:
//! - **Disabled**: nothing happens on step. Sessions start here and return
//!   here on `disable()` or `disconnect()`.
//! - **Enabled**: the log is read on every step.
//! - **Held**: the log is read at most once per second, chat commands are
//!   ignored and RCon is not polled. A new map (`InitGame`) re-enables the
//!   session.

use crate::config::{validate_address, validate_name, validate_port, ConfigError, ServerConfig};
use crate::error::SessionError;
use crate::game::{GameState, Scores, Transition};
use crate::host::HostMessage;
use crate::logsource::{LineBuffer, LogSource, StartAt};
use crate::parser::{parse_command, parse_line};
use crate::players::PlayerRegistry;
use crate::rcon::{RconNotice, RconSession, RconTransport, ResendPolicy};
use crate::sink::{EventSink, SessionView};
use log::{debug, info, warn};
use shared::{gametype_name, GameEvent, InfoMap, PlayerId, Team};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Minimum delay between two log reads while held
pub const HOLD_READ_INTERVAL: Duration = Duration::from_secs(1);

/// What a single step did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// True when the step returned early (disabled, or held and throttled)
    pub skipped: bool,
    pub lines: usize,
    pub events: usize,
    /// Recoverable problems met during the step
    pub warnings: Vec<String>,
}

impl StepReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

pub struct ServerSession<R: RconTransport> {
    name: String,
    address: String,
    port: u16,
    config: ServerConfig,
    disabled: bool,
    hold: bool,
    auto_hold: bool,
    /// Set once plugins have been told about the server, cleared by `disconnect`
    started: bool,
    last_read_at: Option<Instant>,
    game: GameState,
    log: LogSource,
    lines: LineBuffer,
    reopen_log: bool,
    rcon: RconSession<R>,
    host: Option<mpsc::UnboundedSender<HostMessage>>,
}

impl<R: RconTransport> ServerSession<R> {
    /// Creates a disabled session for the server described by `config`
    pub fn new(config: ServerConfig, transport: R) -> Self {
        let log = LogSource::from_location(&config.logfile);
        Self::with_log_source(config, transport, log)
    }

    /// Creates a disabled session reading its log from `log`
    pub fn with_log_source(config: ServerConfig, transport: R, log: LogSource) -> Self {
        Self {
            name: config.name.clone(),
            address: config.address.clone(),
            port: config.port,
            disabled: true,
            hold: false,
            auto_hold: config.auto_hold,
            started: false,
            last_read_at: None,
            game: GameState::new(config.default_level),
            log,
            lines: LineBuffer::new(),
            reopen_log: false,
            rcon: RconSession::new(transport),
            host: None,
            config,
        }
    }

    /// Registers the channel used to ask the host to release this session
    pub fn attach_host(&mut self, host: mpsc::UnboundedSender<HostMessage>) {
        self.host = Some(host);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the session. Invalid names are rejected and the name is kept.
    pub fn set_name(&mut self, name: &str) -> Result<(), ConfigError> {
        validate_name(name)?;
        self.name = name.to_string();
        Ok(())
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Changes the server address and/or port
    ///
    /// Both values are validated before either is applied, so a rejected
    /// call leaves the session untouched.
    pub fn set_address(&mut self, address: Option<&str>, port: Option<i64>) -> Result<(), ConfigError> {
        if let Some(address) = address {
            validate_address(address, &self.name)?;
        }
        let port = port.map(|port| validate_port(port, &self.name)).transpose()?;

        if let Some(address) = address {
            self.address = address.to_string();
        }
        if let Some(port) = port {
            self.port = port;
        }
        Ok(())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn set_auto_hold(&mut self, auto_hold: bool) {
        self.auto_hold = auto_hold;
    }

    pub fn enable(&mut self) {
        if self.disabled || self.hold {
            debug!("[{}] Enabled", self.name);
        }
        self.disabled = false;
        self.hold = false;
    }

    /// Stops the session immediately, closing the log. Plugins are not told.
    pub fn disable(&mut self) {
        debug!("[{}] Disabled", self.name);
        self.disabled = true;
        self.log.close();
    }

    /// Puts the session on hold and tells plugins about it
    pub fn hold(&mut self, sink: &mut dyn EventSink) {
        debug!("[{}] Held", self.name);
        self.hold = true;
        sink.server_event(&self.view(), &GameEvent::HoldServer);
    }

    pub fn is_enabled(&self) -> bool {
        !self.disabled && !self.hold
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn is_held(&self) -> bool {
        self.hold
    }

    pub fn players(&self) -> &PlayerRegistry {
        &self.game.players
    }

    pub fn scores(&self) -> &Scores {
        &self.game.scores
    }

    pub fn server_info(&self) -> &InfoMap {
        &self.game.server_info
    }

    pub fn game(&self) -> &GameState {
        &self.game
    }

    pub fn shutdown_at(&self) -> Option<Instant> {
        self.game.shutdown_at
    }

    pub fn last_read_at(&self) -> Option<Instant> {
        self.last_read_at
    }

    pub fn log_source(&self) -> &LogSource {
        &self.log
    }

    pub fn log_source_mut(&mut self) -> &mut LogSource {
        &mut self.log
    }

    pub fn rcon(&self) -> &RconSession<R> {
        &self.rcon
    }

    pub fn rcon_mut(&mut self) -> &mut RconSession<R> {
        &mut self.rcon
    }

    /// Read-only view handed to the sink
    pub fn view(&self) -> SessionView<'_> {
        SessionView {
            name: &self.name,
            players: &self.game.players,
            scores: &self.game.scores,
            server_info: &self.game.server_info,
            plugins: self.config.plugins(),
            enabled: self.is_enabled(),
            held: self.hold,
        }
    }

    fn emit(&self, sink: &mut dyn EventSink, event: &GameEvent) {
        sink.server_event(&self.view(), event);
    }

    /// Reports each player as disconnected, then forgets it
    fn drop_players(&mut self, sink: &mut dyn EventSink, ids: Vec<PlayerId>) {
        for id in ids {
            self.emit(sink, &GameEvent::ClientDisconnect { id });
            self.game.players.remove(id);
        }
    }

    /// Synchronises with the running server and starts following its log
    ///
    /// Plugins receive the events a bot present since the map start would
    /// have seen: `StartupGame`, a connection per player, team changes and
    /// `InitGame`. The session is enabled on success.
    pub fn connect(&mut self, sink: &mut dyn EventSink) -> Result<(), SessionError> {
        info!("[{}] Connecting to server...", self.name);
        self.rcon.configure(
            &self.address,
            self.port,
            &self.config.rcon_password,
            self.config.recover_password.as_deref(),
            self.config.rcon_send_interval,
            ResendPolicy::from_flag(self.config.resend_on_rotation),
        );
        self.rcon.connect_test()?;

        let stale = self.game.players.ids();
        if !stale.is_empty() {
            debug!("[{}] Dropping {} players from the previous connection", self.name, stale.len());
            self.drop_players(sink, stale);
        }

        self.started = true;
        self.emit(sink, &GameEvent::StartupGame);

        info!("[{}] Gathering server info...", self.name);
        let server_info = self.rcon.transport_mut().server_info().ok_or_else(|| {
            SessionError::Transport(format!("cannot gather server info: {}", self.rcon_error()))
        })?;

        info!("[{}] Gathering server players...", self.name);
        let status = self.rcon.transport_mut().status().ok_or_else(|| {
            SessionError::Transport(format!("cannot gather server players: {}", self.rcon_error()))
        })?;

        self.game.shutdown_at = None;
        for entry in &status {
            info!("[{}] Gathering info for player {} (slot {})...", self.name, entry.name, entry.id);
            let Some(mut info) = self.rcon.transport_mut().dump_user(entry.id) else {
                warn!("[{}] Cannot retrieve info for player {}", self.name, entry.name);
                continue;
            };
            if !info.contains_key(shared::BOT_USERINFO_KEY) {
                info.insert("ip".to_string(), entry.address.clone());
            }

            self.game.players.connect(entry.id, self.config.default_level);
            self.emit(sink, &GameEvent::ClientConnect { id: entry.id });
            self.game
                .players
                .merge_userinfo(entry.id, &info, self.config.default_level);
            self.emit(sink, &GameEvent::ClientUserinfo { id: entry.id, info });
        }

        if !self.game.players.is_empty() {
            info!("[{}] Gathering teams...", self.name);
            let red = self.rcon.transport_mut().red_team_list();
            self.sync_team(sink, Team::Red, red);
            let blue = self.rcon.transport_mut().blue_team_list();
            self.sync_team(sink, Team::Blue, blue);

            let spectators: Vec<PlayerId> = self
                .game
                .players
                .iter()
                .filter(|player| player.team == Team::Spectator)
                .map(|player| player.id)
                .collect();
            for id in spectators {
                self.emit(sink, &GameEvent::ClientBegin { id });
            }
        }

        self.game.scores.reset();
        self.game.server_info = server_info.clone();
        self.emit(sink, &GameEvent::InitGame { info: server_info });

        self.lines.clear();
        self.reopen_log = false;
        self.log.open(StartAt::End)?;

        self.enable();
        self.log_status();
        Ok(())
    }

    fn rcon_error(&self) -> String {
        self.rcon
            .transport()
            .last_error()
            .map_or_else(|| "unknown error".to_string(), |error| error.to_string())
    }

    /// Applies a team list fetched during `connect`. A failed fetch counts as an empty team.
    fn sync_team(&mut self, sink: &mut dyn EventSink, team: Team, members: Option<Vec<PlayerId>>) {
        let Some(members) = members else {
            warn!("[{}] Cannot retrieve {} team list", self.name, team);
            return;
        };

        for id in members {
            let Some(player) = self.game.players.get_mut(id) else {
                debug!("[{}] Team list names unknown slot {}", self.name, id);
                continue;
            };
            player.team = team;
            player.begun = true;

            let mut info = InfoMap::new();
            info.insert("team".to_string(), team.name().to_string());
            info.insert("t".to_string(), team.number().to_string());
            info.insert("n".to_string(), player.name.clone());

            self.emit(sink, &GameEvent::ClientUserinfoChanged { id, info });
            self.emit(sink, &GameEvent::ClientBegin { id });
        }
    }

    fn log_status(&self) {
        let info = &self.game.server_info;
        let field = |key: &str| info.get(key).map(String::as_str).unwrap_or("unknown");
        let matchmode = info
            .get("g_matchmode")
            .is_some_and(|value| value != "0" && !value.is_empty());

        info!("[{}] Current server status:", self.name);
        info!("    Server name: {}", field("sv_hostname"));
        info!("    Gametype: {}", gametype_name(field("g_gametype")));
        info!("    Map: {}", field("mapname"));
        info!("    Number of players: {}", self.game.players.len());
        info!("    Server version: {}", field("version"));
        info!("    Matchmode: {}", if matchmode { "On" } else { "Off" });
    }

    /// Tears the session down, simulating the end of the game for plugins
    ///
    /// Safe to call at any time and more than once: plugins only hear about
    /// the disconnection once.
    pub fn disconnect(&mut self, sink: &mut dyn EventSink) {
        if self.started {
            info!("[{}] Disconnecting from server", self.name);
            debug!("[{}] Sending ClientDisconnect events to plugins", self.name);
            let ids = self.game.players.ids();
            self.drop_players(sink, ids);
            self.emit(sink, &GameEvent::ShutdownGame);
            self.emit(sink, &GameEvent::EndGame);
            self.started = false;

            if let Some(host) = &self.host {
                if host.send(HostMessage::Release { name: self.name.clone() }).is_err() {
                    debug!("[{}] Host is gone, nothing to release", self.name);
                }
            }
        }

        self.game.reset();
        self.lines.clear();
        self.log.close();
        self.disabled = true;
        self.hold = false;
    }

    /// Runs one tick at the current time
    pub fn step(&mut self, sink: &mut dyn EventSink) -> StepReport {
        self.step_at(Instant::now(), sink)
    }

    /// Runs one tick: reads new log lines, applies and forwards their events,
    /// polls RCon, then runs the plugin routines
    pub fn step_at(&mut self, now: Instant, sink: &mut dyn EventSink) -> StepReport {
        if self.disabled {
            return StepReport::skipped();
        }
        if self.hold {
            if let Some(last) = self.last_read_at {
                if now.saturating_duration_since(last) < HOLD_READ_INTERVAL {
                    return StepReport::skipped();
                }
            }
        }

        let mut report = StepReport::default();

        if let Some(ids) = self.game.expire_shutdown(now) {
            self.drop_players(sink, ids);
        }

        self.read_log(now, sink, &mut report);

        if !self.hold {
            match self.rcon.poll(now) {
                Some(RconNotice::Reply(reply)) => debug!("[{}] RCon: {}", self.name, reply),
                Some(RconNotice::PasswordRotated { resent }) => {
                    info!("[{}] RCon password rotated (last command resent: {})", self.name, resent)
                }
                Some(RconNotice::RecoveryRequested) => {
                    report.warn(format!("[{}] RCon password rejected, recovery requested", self.name))
                }
                Some(RconNotice::Error(error)) => report.warn(format!("[{}] RCon error: {}", self.name, error)),
                None => {}
            }
        }

        sink.run_routines(&self.view());
        report
    }

    fn read_log(&mut self, now: Instant, sink: &mut dyn EventSink, report: &mut StepReport) {
        if self.reopen_log {
            match self.log.reopen() {
                Ok(()) => {
                    info!("[{}] Log reopened", self.name);
                    self.reopen_log = false;
                }
                Err(error) => {
                    report.warn(format!("[{}] Cannot reopen log: {}", self.name, error));
                    return;
                }
            }
        }

        self.last_read_at = Some(now);
        let data = match self.log.read() {
            Ok(data) => data,
            Err(error) => {
                report.warn(format!("[{}] Cannot read log: {}", self.name, error));
                self.reopen_log = true;
                return;
            }
        };

        for line in self.lines.push(&data) {
            report.lines += 1;
            debug!("[{}] {}", self.name, line);
            match parse_line(&line) {
                Ok(Some(event)) => {
                    report.events += 1;
                    self.handle_event(event, now, sink);
                }
                Ok(None) => {}
                Err(error) => report.warn(format!("[{}] {}", self.name, error)),
            }
        }
    }

    /// Forwards an event to the sink and applies it to the game state
    ///
    /// Plugins see the state as it was before the event, except for
    /// `ClientConnect` where the player already exists.
    pub fn handle_event(&mut self, event: GameEvent, now: Instant, sink: &mut dyn EventSink) {
        let transition = if let GameEvent::ClientConnect { .. } = event {
            let transition = self.game.apply(&event, now);
            self.emit(sink, &event);
            transition
        } else {
            self.emit(sink, &event);
            self.game.apply(&event, now)
        };

        match transition {
            Some(Transition::GameStarted) => self.enable(),
            Some(Transition::GameShutdown) if self.auto_hold => self.hold(sink),
            _ => {}
        }

        if let GameEvent::Say { id, message, .. } = &event {
            if self.hold {
                return;
            }
            if let Some(command) = parse_command(message) {
                debug!("[{}] Command caught: !{}", self.name, command.name);
                sink.command(&self.view(), &command.name, *id, &command.args);
            }
        }
    }
}
