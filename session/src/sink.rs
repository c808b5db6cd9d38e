//! Plugin layer boundary
//!
//! Sessions report everything they observe to an [`EventSink`]: typed game
//! events, chat commands and a periodic routine hook. Each call carries a
//! read-only [`SessionView`] of the session it comes from, so a single sink
//! can serve several servers.

use crate::game::Scores;
use crate::players::PlayerRegistry;
use log::{debug, info};
use shared::{GameEvent, InfoMap, PlayerId};

/// Read-only snapshot of a session handed to the sink
#[derive(Debug, Clone, Copy)]
pub struct SessionView<'a> {
    pub name: &'a str,
    pub players: &'a PlayerRegistry,
    pub scores: &'a Scores,
    pub server_info: &'a InfoMap,
    /// Plugins enabled for this server, None meaning all of them
    pub plugins: Option<&'a [String]>,
    pub enabled: bool,
    pub held: bool,
}

impl SessionView<'_> {
    /// Whether `plugin` should receive calls for this server
    pub fn uses_plugin(&self, plugin: &str) -> bool {
        self.plugins
            .map_or(true, |plugins| plugins.iter().any(|p| p == plugin))
    }
}

/// Receiver of everything a session reports
pub trait EventSink {
    fn server_event(&mut self, session: &SessionView<'_>, event: &GameEvent);

    /// A chat command typed by `player`, prefix stripped
    fn command(&mut self, session: &SessionView<'_>, command: &str, player: PlayerId, args: &[String]);

    /// Called once at the end of every tick
    fn run_routines(&mut self, session: &SessionView<'_>);
}

/// Sink that only logs what it receives
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn server_event(&mut self, session: &SessionView<'_>, event: &GameEvent) {
        debug!("[{}] event {:?}", session.name, event);
    }

    fn command(&mut self, session: &SessionView<'_>, command: &str, player: PlayerId, args: &[String]) {
        info!("[{}] command !{} from {} {:?}", session.name, command, player, args);
    }

    fn run_routines(&mut self, _session: &SessionView<'_>) {}
}

/// A call received by a [`RecordingSink`]
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Event(GameEvent),
    Command {
        name: String,
        player: PlayerId,
        args: Vec<String>,
    },
    Routines,
}

/// Sink keeping every call it receives, in order
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub calls: Vec<Recorded>,
    /// Player count seen by each event, in the same order as the events
    pub player_counts: Vec<usize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<&GameEvent> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Recorded::Event(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    /// Names of the received events, in order
    pub fn event_names(&self) -> Vec<&'static str> {
        self.events().into_iter().map(GameEvent::name).collect()
    }

    pub fn commands(&self) -> Vec<(&str, PlayerId, &[String])> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Recorded::Command { name, player, args } => Some((name.as_str(), *player, args.as_slice())),
                _ => None,
            })
            .collect()
    }

    pub fn routine_runs(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, Recorded::Routines))
            .count()
    }

    pub fn clear(&mut self) {
        self.calls.clear();
        self.player_counts.clear();
    }
}

impl EventSink for RecordingSink {
    fn server_event(&mut self, session: &SessionView<'_>, event: &GameEvent) {
        self.calls.push(Recorded::Event(event.clone()));
        self.player_counts.push(session.players.len());
    }

    fn command(&mut self, _session: &SessionView<'_>, command: &str, player: PlayerId, args: &[String]) {
        self.calls.push(Recorded::Command {
            name: command.to_string(),
            player,
            args: args.to_vec(),
        });
    }

    fn run_routines(&mut self, _session: &SessionView<'_>) {
        self.calls.push(Recorded::Routines);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uses_plugin() {
        let players = PlayerRegistry::new();
        let scores = Scores::new();
        let info = InfoMap::new();
        let plugins = vec!["stats".to_string(), "core".to_string()];
        let mut view = SessionView {
            name: "main",
            players: &players,
            scores: &scores,
            server_info: &info,
            plugins: None,
            enabled: true,
            held: false,
        };

        assert!(view.uses_plugin("anything"));

        view.plugins = Some(&plugins);
        assert!(view.uses_plugin("core"));
        assert!(!view.uses_plugin("warns"));
    }

    #[test]
    fn test_recording_sink_keeps_order() {
        let players = PlayerRegistry::new();
        let scores = Scores::new();
        let info = InfoMap::new();
        let view = SessionView {
            name: "main",
            players: &players,
            scores: &scores,
            server_info: &info,
            plugins: None,
            enabled: true,
            held: false,
        };
        let mut sink = RecordingSink::new();

        sink.server_event(&view, &GameEvent::StartupGame);
        sink.command(&view, "help", 2, &["me".to_string()]);
        sink.run_routines(&view);

        assert_eq!(sink.event_names(), vec!["StartupGame"]);
        assert_eq!(sink.commands(), vec![("help", 2, &["me".to_string()][..])]);
        assert_eq!(sink.routine_runs(), 1);
        assert_eq!(sink.player_counts, vec![0]);

        sink.clear();
        assert!(sink.calls.is_empty());
    }
}
