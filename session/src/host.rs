//! Multi-server driver
//!
//! The [`Host`] owns one [`ServerSession`] per game server and steps all of
//! them on a fixed tick. Sessions never share state: each one is stepped in
//! turn from the host's task. A session that disconnects asks the host to
//! release it through a [`HostMessage`].

use crate::config::ConfigError;
use crate::error::SessionError;
use crate::instance::{ServerSession, StepReport};
use crate::rcon::RconTransport;
use crate::sink::EventSink;
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Messages sent from sessions to their host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMessage {
    /// The named session disconnected and can be dropped
    Release { name: String },
}

pub struct Host<R: RconTransport, S: EventSink> {
    sessions: BTreeMap<String, ServerSession<R>>,
    sink: S,
    tick_interval: Duration,
    host_tx: mpsc::UnboundedSender<HostMessage>,
    host_rx: mpsc::UnboundedReceiver<HostMessage>,
}

impl<R: RconTransport, S: EventSink> Host<R, S> {
    pub fn new(sink: S, tick_interval: Duration) -> Self {
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        Self {
            sessions: BTreeMap::new(),
            sink,
            tick_interval,
            host_tx,
            host_rx,
        }
    }

    /// Adds a session. Names must be unique within a host.
    pub fn add_session(&mut self, mut session: ServerSession<R>) -> Result<(), ConfigError> {
        let name = session.name().to_string();
        if self.sessions.contains_key(&name) {
            return Err(ConfigError::DuplicateServer(name));
        }
        session.attach_host(self.host_tx.clone());
        self.sessions.insert(name, session);
        Ok(())
    }

    pub fn session(&self, name: &str) -> Option<&ServerSession<R>> {
        self.sessions.get(name)
    }

    pub fn session_mut(&mut self, name: &str) -> Option<&mut ServerSession<R>> {
        self.sessions.get_mut(name)
    }

    pub fn session_names(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Connects every session, returning the failures
    ///
    /// Sessions that fail to connect stay registered but disabled.
    pub fn connect_all(&mut self) -> Vec<(String, SessionError)> {
        let mut failures = Vec::new();
        for (name, session) in self.sessions.iter_mut() {
            match session.connect(&mut self.sink) {
                Ok(()) => info!("[{}] Connected", name),
                Err(e) => {
                    error!("[{}] Can't connect: {}", name, e);
                    failures.push((name.clone(), e));
                }
            }
        }
        failures
    }

    /// Disconnects a session and drops it
    pub fn unload(&mut self, name: &str) -> bool {
        match self.sessions.get_mut(name) {
            Some(session) => {
                session.disconnect(&mut self.sink);
                self.drain_releases();
                self.sessions.remove(name);
                true
            }
            None => false,
        }
    }

    fn drain_releases(&mut self) {
        while let Ok(message) = self.host_rx.try_recv() {
            match message {
                HostMessage::Release { name } => {
                    if self.sessions.remove(&name).is_some() {
                        info!("Released server {}", name);
                    }
                }
            }
        }
    }

    /// Steps every session once
    pub fn tick(&mut self, now: Instant) -> BTreeMap<String, StepReport> {
        self.drain_releases();

        let mut reports = BTreeMap::new();
        for (name, session) in self.sessions.iter_mut() {
            let report = session.step_at(now, &mut self.sink);
            if !report.warnings.is_empty() {
                debug!("[{}] Step finished with {} warnings", name, report.warnings.len());
            }
            reports.insert(name.clone(), report);
        }

        self.drain_releases();
        reports
    }

    /// Disconnects every session
    pub fn shutdown(&mut self) {
        for session in self.sessions.values_mut() {
            session.disconnect(&mut self.sink);
        }
        self.drain_releases();
    }

    /// Ticks until `shutdown` resolves or every session has been released
    pub async fn run<F: Future<Output = ()>>(&mut self, shutdown: F) {
        let mut tick_interval = interval(self.tick_interval);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("Host started with {} servers", self.sessions.len());

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down...");
                    break;
                }
                _ = tick_interval.tick() => {
                    self.tick(Instant::now());
                    if self.sessions.is_empty() {
                        warn!("No server left, stopping");
                        break;
                    }
                }
            }
        }

        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogLocation, ServerConfig};
    use crate::rcon::testing::ScriptedTransport;
    use crate::sink::RecordingSink;
    use tempfile::NamedTempFile;

    fn session(name: &str, log: &NamedTempFile, password: &str) -> ServerSession<ScriptedTransport> {
        let config = ServerConfig {
            name: name.to_string(),
            address: "127.0.0.1".to_string(),
            port: 27960,
            rcon_password: "pw".to_string(),
            recover_password: None,
            rcon_send_interval: false,
            resend_on_rotation: true,
            logfile: LogLocation::Local(log.path().to_path_buf()),
            plugins: None,
            default_level: 0,
            auto_hold: false,
        };
        ServerSession::new(config, ScriptedTransport::new(password))
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let log = NamedTempFile::new().unwrap();
        let mut host = Host::new(RecordingSink::new(), Duration::from_millis(50));

        host.add_session(session("main", &log, "pw")).unwrap();
        let result = host.add_session(session("main", &log, "pw"));

        assert!(matches!(result, Err(ConfigError::DuplicateServer(name)) if name == "main"));
        assert_eq!(host.len(), 1);
    }

    #[test]
    fn test_connect_all_reports_failures() {
        let log = NamedTempFile::new().unwrap();
        let mut host = Host::new(RecordingSink::new(), Duration::from_millis(50));
        host.add_session(session("good", &log, "pw")).unwrap();
        host.add_session(session("bad", &log, "other")).unwrap();

        let failures = host.connect_all();

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "bad");
        assert!(host.session("good").unwrap().is_enabled());
        assert!(host.session("bad").unwrap().is_disabled());
    }

    #[test]
    fn test_tick_steps_enabled_sessions() {
        let log = NamedTempFile::new().unwrap();
        let mut host = Host::new(RecordingSink::new(), Duration::from_millis(50));
        host.add_session(session("good", &log, "pw")).unwrap();
        host.add_session(session("bad", &log, "other")).unwrap();
        host.connect_all();

        let reports = host.tick(Instant::now());

        assert!(!reports["good"].skipped);
        assert!(reports["bad"].skipped);
        assert_eq!(host.sink().routine_runs(), 1);
    }

    #[test]
    fn test_disconnected_session_is_released() {
        let log = NamedTempFile::new().unwrap();
        let mut host = Host::new(RecordingSink::new(), Duration::from_millis(50));
        host.add_session(session("main", &log, "pw")).unwrap();
        host.add_session(session("other", &log, "pw")).unwrap();
        host.connect_all();

        let sink = &mut RecordingSink::new();
        if let Some(session) = host.session_mut("main") {
            session.disconnect(sink);
        }
        host.tick(Instant::now());

        assert_eq!(host.session_names(), vec!["other".to_string()]);
    }

    #[test]
    fn test_unload() {
        let log = NamedTempFile::new().unwrap();
        let mut host = Host::new(RecordingSink::new(), Duration::from_millis(50));
        host.add_session(session("main", &log, "pw")).unwrap();
        host.connect_all();

        assert!(host.unload("main"));
        assert!(!host.unload("main"));
        assert!(host.is_empty());
        assert!(host.sink().event_names().ends_with(&["ShutdownGame", "EndGame"]));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_signal() {
        let log = NamedTempFile::new().unwrap();
        let mut host = Host::new(RecordingSink::new(), Duration::from_millis(5));
        host.add_session(session("main", &log, "pw")).unwrap();
        host.connect_all();

        host.run(tokio::time::sleep(Duration::from_millis(40))).await;

        assert!(host.sink().routine_runs() >= 1);
        assert!(host.is_empty());
        assert!(host.sink().event_names().contains(&"EndGame"));
    }

    #[tokio::test]
    async fn test_run_stops_when_no_server_left() {
        let mut host: Host<ScriptedTransport, RecordingSink> =
            Host::new(RecordingSink::new(), Duration::from_millis(5));

        tokio_test::assert_ok!(
            tokio::time::timeout(Duration::from_secs(1), host.run(std::future::pending())).await
        );
    }
}
