//! Remote console handling
//!
//! [`RconTransport`] is the command channel to a game server. Sending
//! commands and decoding query replies is left to the transport; the
//! [`RconSession`] wrapping it adds what a long running session needs on top:
//!
//! - password recovery when the server rejects the configured password,
//! - pickup of password rotations announced by the server,
//! - rate-limited polling for unsolicited replies.

use crate::error::SessionError;
use log::{debug, info, warn};
use serde::Serialize;
use shared::{InfoMap, PlayerId};
use std::fmt;
use std::time::{Duration, Instant};

/// Command asking the server for a new RCon password
pub const RECOVERY_COMMAND: &str = "rconRecovery";

/// Prefix of server replies announcing a new RCon password
pub const PASSWORD_MARKER: &str = "rconPassword";

/// How long a recovery request waits for its reply
pub const RECOVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Minimum delay between two polls for unsolicited replies
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RconErrorKind {
    /// The server rejected the password
    BadAuth,
    /// Nothing came back before the timeout
    NoReply,
    Other(String),
}

impl fmt::Display for RconErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RconErrorKind::BadAuth => f.write_str("bad RCon password"),
            RconErrorKind::NoReply => f.write_str("no reply from server"),
            RconErrorKind::Other(reason) => f.write_str(reason),
        }
    }
}

/// One row of the server's `status` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub id: PlayerId,
    pub name: String,
    /// `ip:port`, or `bot` for bots
    pub address: String,
    pub ping: u32,
    pub score: i32,
}

/// Command channel to a game server
///
/// Query helpers return None when the query failed; [`last_error`] then
/// tells why.
///
/// [`last_error`]: RconTransport::last_error
pub trait RconTransport {
    fn set_server(&mut self, address: &str, port: u16);
    fn set_password(&mut self, password: &str);
    /// Enables spacing out commands to stay under the server's flood limit
    fn set_send_interval(&mut self, enabled: bool);

    /// Checks that the server answers and accepts the password
    fn test(&mut self) -> bool;
    fn send(&mut self, command: &str, expect_reply: bool) -> bool;
    /// Waits at most `timeout` for a reply. A zero timeout only drains what already arrived.
    fn get_reply(&mut self, timeout: Duration) -> Option<String>;
    fn last_error(&self) -> Option<RconErrorKind>;
    /// Sends the last command again
    fn resend(&mut self) -> bool;

    fn server_info(&mut self) -> Option<InfoMap>;
    fn status(&mut self) -> Option<Vec<StatusEntry>>;
    fn dump_user(&mut self, id: PlayerId) -> Option<InfoMap>;
    fn red_team_list(&mut self) -> Option<Vec<PlayerId>>;
    fn blue_team_list(&mut self) -> Option<Vec<PlayerId>>;
}

/// What to do with the last command when the server rotates the password
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendPolicy {
    /// Send it again with the new password. A command the server did run
    /// before rotating is run twice.
    Resend,
    /// Forget it. A command the server rejected is lost.
    Drop,
}

impl ResendPolicy {
    pub fn from_flag(resend: bool) -> Self {
        if resend {
            ResendPolicy::Resend
        } else {
            ResendPolicy::Drop
        }
    }
}

/// Outcome of a reply poll worth reporting to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RconNotice {
    /// Unsolicited reply text
    Reply(String),
    /// The server handed out a new password, now installed
    PasswordRotated { resent: bool },
    /// The password was rejected and a recovery request has been sent
    RecoveryRequested,
    Error(RconErrorKind),
}

/// Extracts the password from a `rconPassword <new password>` reply
pub fn parse_rotation(reply: &str) -> Option<&str> {
    let password = reply.strip_prefix(PASSWORD_MARKER)?.trim();
    if password.is_empty() {
        None
    } else {
        Some(password)
    }
}

pub struct RconSession<R: RconTransport> {
    transport: R,
    password: String,
    recover_password: Option<String>,
    policy: ResendPolicy,
    last_poll: Option<Instant>,
    /// A recovery request went out and no password or success came back yet
    recovery_pending: bool,
}

impl<R: RconTransport> RconSession<R> {
    pub fn new(transport: R) -> Self {
        Self {
            transport,
            password: String::new(),
            recover_password: None,
            policy: ResendPolicy::Resend,
            last_poll: None,
            recovery_pending: false,
        }
    }

    /// Points the transport at a server with the given credentials
    pub fn configure(
        &mut self,
        address: &str,
        port: u16,
        password: &str,
        recover_password: Option<&str>,
        send_interval: bool,
        policy: ResendPolicy,
    ) {
        self.transport.set_server(address, port);
        self.install_password(password);
        self.transport.set_send_interval(send_interval);
        self.recover_password = recover_password
            .filter(|pw| !pw.is_empty())
            .map(str::to_string);
        self.policy = policy;
        self.recovery_pending = false;
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn policy(&self) -> ResendPolicy {
        self.policy
    }

    pub fn transport(&self) -> &R {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut R {
        &mut self.transport
    }

    pub fn is_recovery_pending(&self) -> bool {
        self.recovery_pending
    }

    fn install_password(&mut self, password: &str) {
        self.recovery_pending = false;
        self.password = password.to_string();
        self.transport.set_password(password);
    }

    /// Tests the channel, recovering the password once if the server rejects it
    ///
    /// At most one recovery request is sent and at most one test retried.
    pub fn connect_test(&mut self) -> Result<(), SessionError> {
        if self.transport.test() {
            self.recovery_pending = false;
            return Ok(());
        }

        match self.transport.last_error() {
            Some(RconErrorKind::BadAuth) => {
                if self.recover_password.is_none() {
                    return Err(SessionError::Auth(RconErrorKind::BadAuth.to_string()));
                }
                warn!("Bad RCon password, trying to recover");
                if !self.recover() {
                    return Err(SessionError::Auth("password recovery failed".to_string()));
                }
                if self.transport.test() {
                    Ok(())
                } else {
                    let reason = self
                        .transport
                        .last_error()
                        .map_or_else(|| "test failed".to_string(), |e| e.to_string());
                    Err(SessionError::Auth(format!("still failing after recovery: {reason}")))
                }
            }
            Some(error) => Err(SessionError::Transport(error.to_string())),
            None => Err(SessionError::Transport("test failed".to_string())),
        }
    }

    /// Sends the recovery request and installs the password it yields
    fn recover(&mut self) -> bool {
        let Some(recover_password) = self.recover_password.clone() else {
            return false;
        };

        self.transport
            .send(&format!("{RECOVERY_COMMAND} {recover_password}"), false);
        let Some(reply) = self.transport.get_reply(RECOVERY_TIMEOUT) else {
            return false;
        };

        match parse_rotation(&reply) {
            Some(password) => {
                let password = password.to_string();
                self.install_password(&password);
                info!("Updated RCon password");
                true
            }
            None => {
                debug!("Unexpected recovery reply: {}", reply);
                false
            }
        }
    }

    /// Drains unsolicited replies, at most once per [`POLL_INTERVAL`]
    ///
    /// A rejected password triggers one recovery request. Until a new password
    /// arrives or a call succeeds, later rejections are reported as errors.
    pub fn poll(&mut self, now: Instant) -> Option<RconNotice> {
        if let Some(last) = self.last_poll {
            if now.saturating_duration_since(last) < POLL_INTERVAL {
                return None;
            }
        }
        self.last_poll = Some(now);

        match self.transport.get_reply(Duration::ZERO) {
            Some(reply) if !reply.is_empty() => {
                debug!("RCon data received: {}", reply);
                match parse_rotation(&reply) {
                    Some(password) => {
                        let password = password.to_string();
                        self.install_password(&password);
                        info!("Updated RCon password");
                        let resent = match self.policy {
                            ResendPolicy::Resend => self.transport.resend(),
                            ResendPolicy::Drop => false,
                        };
                        Some(RconNotice::PasswordRotated { resent })
                    }
                    None => Some(RconNotice::Reply(reply)),
                }
            }
            Some(_) => None,
            None => match self.transport.last_error() {
                None => {
                    self.recovery_pending = false;
                    None
                }
                Some(RconErrorKind::NoReply) => None,
                Some(RconErrorKind::BadAuth) => match self.recover_password.clone() {
                    Some(recover_password) if !self.recovery_pending => {
                        warn!("RCon password rejected, requesting a new one");
                        self.transport
                            .send(&format!("{RECOVERY_COMMAND} {recover_password}"), false);
                        self.recovery_pending = true;
                        Some(RconNotice::RecoveryRequested)
                    }
                    _ => Some(RconNotice::Error(RconErrorKind::BadAuth)),
                },
                Some(error) => Some(RconNotice::Error(error)),
            },
        }
    }
}

/// In-memory transport answering from scripted data
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::collections::{HashMap, VecDeque};

    #[derive(Debug, Default)]
    pub struct ScriptedTransport {
        /// Password the server accepts
        pub accepted_password: String,
        pub reachable: bool,
        /// Reply to a recovery request, if any
        pub recovery_reply: Option<String>,
        pub replies: VecDeque<String>,
        pub error: Option<RconErrorKind>,
        pub server_info: Option<InfoMap>,
        pub status: Option<Vec<StatusEntry>>,
        pub dumps: HashMap<PlayerId, InfoMap>,
        pub red_team: Option<Vec<PlayerId>>,
        pub blue_team: Option<Vec<PlayerId>>,

        pub server: Option<(String, u16)>,
        pub password: String,
        pub send_interval: bool,
        pub sent: Vec<String>,
        pub test_calls: usize,
        pub resend_calls: usize,
    }

    impl ScriptedTransport {
        /// A reachable server accepting `password`, with no players
        pub fn new(password: &str) -> Self {
            Self {
                accepted_password: password.to_string(),
                reachable: true,
                server_info: Some(InfoMap::new()),
                status: Some(Vec::new()),
                red_team: Some(Vec::new()),
                blue_team: Some(Vec::new()),
                ..Self::default()
            }
        }

        pub fn recovery_requests(&self) -> usize {
            self.sent
                .iter()
                .filter(|command| command.starts_with(RECOVERY_COMMAND))
                .count()
        }
    }

    impl RconTransport for ScriptedTransport {
        fn set_server(&mut self, address: &str, port: u16) {
            self.server = Some((address.to_string(), port));
        }

        fn set_password(&mut self, password: &str) {
            self.password = password.to_string();
        }

        fn set_send_interval(&mut self, enabled: bool) {
            self.send_interval = enabled;
        }

        fn test(&mut self) -> bool {
            self.test_calls += 1;
            if !self.reachable {
                self.error = Some(RconErrorKind::NoReply);
                false
            } else if self.password != self.accepted_password {
                self.error = Some(RconErrorKind::BadAuth);
                false
            } else {
                self.error = None;
                true
            }
        }

        fn send(&mut self, command: &str, _expect_reply: bool) -> bool {
            self.sent.push(command.to_string());
            if command.starts_with(RECOVERY_COMMAND) {
                if let Some(reply) = self.recovery_reply.clone() {
                    self.replies.push_back(reply);
                }
            }
            self.reachable
        }

        fn get_reply(&mut self, _timeout: Duration) -> Option<String> {
            let reply = self.replies.pop_front();
            if reply.is_none() && self.error.is_none() {
                self.error = Some(RconErrorKind::NoReply);
            }
            reply
        }

        fn last_error(&self) -> Option<RconErrorKind> {
            self.error.clone()
        }

        fn resend(&mut self) -> bool {
            self.resend_calls += 1;
            match self.sent.last().cloned() {
                Some(command) => {
                    self.sent.push(command);
                    true
                }
                None => false,
            }
        }

        fn server_info(&mut self) -> Option<InfoMap> {
            self.server_info.clone()
        }

        fn status(&mut self) -> Option<Vec<StatusEntry>> {
            self.status.clone()
        }

        fn dump_user(&mut self, id: PlayerId) -> Option<InfoMap> {
            self.dumps.get(&id).cloned()
        }

        fn red_team_list(&mut self) -> Option<Vec<PlayerId>> {
            self.red_team.clone()
        }

        fn blue_team_list(&mut self) -> Option<Vec<PlayerId>> {
            self.blue_team.clone()
        }
    }
}
