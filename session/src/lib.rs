//! # Game Server Session Library
//!
//! This library follows Quake 3 family game servers (Urban Terror and
//! friends) on behalf of an administration bot. For every server it keeps a
//! live session that tails the game log, turns log lines into typed events,
//! tracks the connected players and talks to the server over RCon.
//!
//! ## Core Responsibilities
//!
//! ### Log Tailing
//! The game log is read incrementally, either from a local file or from a
//! remote host over FTP. Remote downloads run off the session's task and are
//! polled, so one slow server never delays the others.
//!
//! ### Event Translation
//! Each log line is parsed into a [`shared::GameEvent`] and applied to the
//! session's game state (players, scores, server info). Events and chat
//! commands are forwarded to an [`sink::EventSink`], the boundary with the
//! plugin layer.
//!
//! ### RCon Handling
//! The RCon channel is tested on connection, with a one-shot password
//! recovery when the server rejects the configured password. Password
//! rotations announced by the server are picked up while running.
//!
//! ## Module Organization
//!
//! - `config`: per-server configuration and TOML loading
//! - `error`: error types
//! - `players`: connected players and userinfo merging
//! - `game`: game state updated from events
//! - `parser`: log line parser
//! - `logsource`: local and FTP log access
//! - `rcon`: RCon transport boundary and session logic
//! - `sink`: plugin layer boundary
//! - `instance`: the per-server session and its step loop
//! - `host`: drives several sessions on a fixed tick
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use session::config::BotConfig;
//! use session::host::Host;
//! use session::instance::ServerSession;
//! use session::rcon::RconTransport;
//! use session::sink::LogSink;
//! use std::path::Path;
//!
//! async fn run<R: RconTransport>(transport: impl Fn() -> R) -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BotConfig::load(Path::new("bot.toml")).await?;
//!     let mut host = Host::new(LogSink, config.tick_interval);
//!
//!     for server in config.servers {
//!         host.add_session(ServerSession::new(server, transport()))?;
//!     }
//!     host.connect_all();
//!     host.run(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod game;
pub mod host;
pub mod instance;
pub mod logsource;
pub mod parser;
pub mod players;
pub mod rcon;
pub mod sink;
