//! Game log access
//!
//! A [`LogSource`] hands out the bytes appended to the game log since the
//! previous read. Two kinds of logs are supported:
//!
//! - Local files, tailed directly. All available bytes are drained on each read.
//! - Remote files reached over FTP, downloaded incrementally. Each download runs
//!   on tokio's blocking pool and is polled from [`LogSource::read`], so a slow
//!   FTP server never stalls the caller's tick. Reconnections after a failure
//!   take the same path.
//!
//! For remote logs, `origin_pointer + buffer_pointer` is the offset of the next
//! byte to download. It only moves forward, except when the remote file is
//! found truncated on reopen, in which case reading restarts at byte 0.

use crate::config::{FtpLocation, LogLocation};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::FtpStream;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// Once this many consumed bytes sit at the head of the remote buffer, they are dropped
pub const COMPACT_THRESHOLD: usize = 64 * 1024;

const READ_CHUNK: usize = 1024;
const FTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum LogError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("remote fetch failed: {0}")]
    FetchFailed(String),

    #[error("remote fetch needs a tokio runtime")]
    NoRuntime,

    #[error("a remote fetch is in progress")]
    Busy,

    #[error("log source is not open")]
    NotOpen,
}

/// Where a freshly opened log starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
    /// Replay the whole log
    Beginning,
    /// Tail: only bytes written after opening
    End,
}

/// File access on the host holding a remote log
///
/// Implementations are blocking; [`LogSource`] moves them to tokio's blocking
/// pool for incremental fetches.
pub trait RemoteFetcher: Send {
    /// Size of a remote file, or None when the server cannot report it
    fn size(&mut self, path: &str) -> Result<Option<u64>, LogError>;

    /// Downloads a remote file starting at `offset`
    fn fetch_from(&mut self, path: &str, offset: u64) -> Result<Vec<u8>, LogError>;

    fn fetch_all(&mut self, path: &str) -> Result<Vec<u8>, LogError> {
        self.fetch_from(path, 0)
    }

    /// Uploads `bytes` to a remote file, replacing it
    fn store(&mut self, path: &str, bytes: &[u8]) -> Result<(), LogError>;

    fn close(&mut self) {}
}

/// Opens new connections to a remote log host
///
/// Called from tokio's blocking pool when a connection is made while the log
/// is being followed.
pub type Connector = Arc<dyn Fn() -> Result<Box<dyn RemoteFetcher>, LogError> + Send + Sync>;

/// [`RemoteFetcher`] over an FTP control connection
pub struct FtpFetcher {
    stream: FtpStream,
}

fn ftp_error(error: suppaftp::FtpError) -> LogError {
    LogError::Remote(error.to_string())
}

impl FtpFetcher {
    /// Connects and logs in, switching the session to binary transfers
    pub fn connect(location: &FtpLocation) -> Result<Self, LogError> {
        let addr = (location.host.as_str(), location.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| LogError::Remote(format!("cannot resolve {}", location.host)))?;

        debug!("Connecting to FTP server {}", addr);
        let mut stream = FtpStream::connect_timeout(addr, FTP_TIMEOUT).map_err(ftp_error)?;
        stream.get_ref().set_read_timeout(Some(FTP_TIMEOUT))?;
        stream
            .login(location.login.as_str(), location.password.as_str())
            .map_err(ftp_error)?;
        stream.transfer_type(FileType::Binary).map_err(ftp_error)?;

        Ok(Self { stream })
    }
}

impl RemoteFetcher for FtpFetcher {
    fn size(&mut self, path: &str) -> Result<Option<u64>, LogError> {
        match self.stream.size(path) {
            Ok(size) => Ok(Some(size as u64)),
            Err(suppaftp::FtpError::UnexpectedResponse(response)) => {
                debug!("SIZE unsupported: {:?}", response.status);
                Ok(None)
            }
            Err(error) => Err(ftp_error(error)),
        }
    }

    fn fetch_from(&mut self, path: &str, offset: u64) -> Result<Vec<u8>, LogError> {
        if let Some(size) = self.size(path)? {
            if size == offset {
                return Ok(Vec::new());
            }
            if size < offset {
                return Err(LogError::Remote(format!(
                    "{path} shrank below offset {offset} (now {size} bytes)"
                )));
            }
        }

        if offset > 0 {
            self.stream
                .resume_transfer(offset as usize)
                .map_err(ftp_error)?;
        }
        let cursor = self.stream.retr_as_buffer(path).map_err(ftp_error)?;
        Ok(cursor.into_inner())
    }

    fn store(&mut self, path: &str, bytes: &[u8]) -> Result<(), LogError> {
        let mut reader = Cursor::new(bytes);
        self.stream.put_file(path, &mut reader).map_err(ftp_error)?;
        Ok(())
    }

    fn close(&mut self) {
        if let Err(error) = self.stream.quit() {
            debug!("FTP quit failed: {}", error);
        }
    }
}

/// Tail of a file on the local filesystem
pub struct LocalLog {
    path: PathBuf,
    file: Option<File>,
    position: u64,
}

impl LocalLog {
    fn open(&mut self, start: StartAt) -> Result<(), LogError> {
        let mut file = File::open(&self.path)?;
        self.position = match start {
            StartAt::Beginning => 0,
            StartAt::End => file.seek(SeekFrom::End(0))?,
        };
        self.file = Some(file);
        Ok(())
    }

    fn reopen(&mut self) -> Result<(), LogError> {
        let mut file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        if len < self.position {
            info!("Log file {} was truncated, reading from start", self.path.display());
            self.position = 0;
        }
        file.seek(SeekFrom::Start(self.position))?;
        self.file = Some(file);
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<u8>, LogError> {
        let file = self.file.as_mut().ok_or(LogError::NotOpen)?;

        if file.metadata()?.len() < self.position {
            info!("Log file {} was truncated, reading from start", self.path.display());
            self.position = file.seek(SeekFrom::Start(0))?;
        }

        let mut data = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let read = file.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..read]);
        }
        self.position += data.len() as u64;
        Ok(data)
    }
}

type FetchOutcome = (Option<Box<dyn RemoteFetcher>>, Result<Vec<u8>, LogError>);

/// A fresh connection and the remote size seen through it
type ReconnectOutcome = Result<(Box<dyn RemoteFetcher>, Option<u64>), LogError>;

enum FetchState {
    Closed,
    Ready,
    Reconnecting(oneshot::Receiver<ReconnectOutcome>),
    Fetching(oneshot::Receiver<FetchOutcome>),
    Failed(String),
}

/// Incrementally downloaded remote log
pub struct RemoteLog {
    path: String,
    connector: Connector,
    fetcher: Option<Box<dyn RemoteFetcher>>,
    buffer: Vec<u8>,
    buffer_pointer: usize,
    origin_pointer: u64,
    state: FetchState,
}

impl RemoteLog {
    fn next_offset(&self) -> u64 {
        self.origin_pointer + self.buffer_pointer as u64
    }

    fn fetcher(&mut self) -> Result<&mut Box<dyn RemoteFetcher>, LogError> {
        if self.fetcher.is_none() {
            self.fetcher = Some((self.connector)()?);
        }
        self.fetcher.as_mut().ok_or(LogError::NotOpen)
    }

    fn disconnect(&mut self) {
        if let Some(mut fetcher) = self.fetcher.take() {
            match Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn_blocking(move || fetcher.close());
                }
                Err(_) => fetcher.close(),
            }
        }
    }

    fn open(&mut self, start: StartAt) -> Result<(), LogError> {
        self.disconnect();
        self.buffer.clear();
        self.buffer_pointer = 0;
        self.origin_pointer = 0;
        self.state = FetchState::Closed;

        let path = self.path.clone();
        let fetcher = self.fetcher()?;
        let origin = match start {
            StartAt::Beginning => 0,
            StartAt::End => match fetcher.size(&path)? {
                Some(size) => size,
                None => {
                    debug!("Remote size unavailable, downloading {} to find its end", path);
                    fetcher.fetch_all(&path)?.len() as u64
                }
            },
        };
        self.origin_pointer = origin;

        debug!("Remote log {} opened at offset {}", path, self.origin_pointer);
        self.state = FetchState::Ready;
        Ok(())
    }

    /// Starts reconnecting in the background; [`RemoteLog::read`] picks up the result
    fn reopen(&mut self) -> Result<(), LogError> {
        let runtime = Handle::try_current().map_err(|_| LogError::NoRuntime)?;
        self.disconnect();
        self.state = FetchState::Closed;
        // Unread bytes are downloaded again from the resume offset
        self.buffer.truncate(self.buffer_pointer);

        let connector = Arc::clone(&self.connector);
        let path = self.path.clone();
        let (sender, receiver) = oneshot::channel();
        runtime.spawn_blocking(move || {
            let outcome = connector().and_then(|mut fetcher| {
                let size = fetcher.size(&path)?;
                Ok((fetcher, size))
            });
            let _ = sender.send(outcome);
        });

        debug!("Reconnecting to remote log {}", self.path);
        self.state = FetchState::Reconnecting(receiver);
        Ok(())
    }

    fn resume(&mut self, fetcher: Box<dyn RemoteFetcher>, size: Option<u64>) {
        self.fetcher = Some(fetcher);
        if size.is_some_and(|size| size < self.next_offset()) {
            info!("Remote log {} was truncated, reading from start", self.path);
            self.buffer.clear();
            self.buffer_pointer = 0;
            self.origin_pointer = 0;
        }
        debug!("Remote log {} resumed at offset {}", self.path, self.next_offset());
        self.state = FetchState::Ready;
    }

    fn read(&mut self) -> Result<Vec<u8>, LogError> {
        match std::mem::replace(&mut self.state, FetchState::Closed) {
            FetchState::Closed => Err(LogError::NotOpen),
            FetchState::Failed(reason) => {
                self.state = FetchState::Failed(reason.clone());
                Err(LogError::FetchFailed(reason))
            }
            FetchState::Reconnecting(mut receiver) => match receiver.try_recv() {
                Ok(Ok((fetcher, size))) => {
                    self.resume(fetcher, size);
                    self.read_ready()
                }
                Ok(Err(error)) => self.fail(error.to_string()),
                Err(oneshot::error::TryRecvError::Empty) => {
                    self.state = FetchState::Reconnecting(receiver);
                    Ok(Vec::new())
                }
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.fail("reconnect task ended without a result".to_string())
                }
            },
            FetchState::Fetching(mut receiver) => match receiver.try_recv() {
                Ok((fetcher, Ok(bytes))) => {
                    self.fetcher = fetcher;
                    self.state = FetchState::Ready;
                    if bytes.is_empty() {
                        return Ok(Vec::new());
                    }
                    self.buffer.extend_from_slice(&bytes);
                    self.read_ready()
                }
                Ok((fetcher, Err(error))) => {
                    self.fetcher = fetcher;
                    self.fail(error.to_string())
                }
                Err(oneshot::error::TryRecvError::Empty) => {
                    self.state = FetchState::Fetching(receiver);
                    Ok(Vec::new())
                }
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.fail("fetch task ended without a result".to_string())
                }
            },
            FetchState::Ready => {
                self.state = FetchState::Ready;
                self.read_ready()
            }
        }
    }

    fn fail(&mut self, reason: String) -> Result<Vec<u8>, LogError> {
        warn!("Fetching remote log {} failed: {}", self.path, reason);
        self.state = FetchState::Failed(reason.clone());
        Err(LogError::FetchFailed(reason))
    }

    fn read_ready(&mut self) -> Result<Vec<u8>, LogError> {
        if self.buffer.len() > self.buffer_pointer {
            let data = self.buffer[self.buffer_pointer..].to_vec();
            self.buffer_pointer = self.buffer.len();
            self.compact();
            return Ok(data);
        }

        self.start_fetch()?;
        Ok(Vec::new())
    }

    fn compact(&mut self) {
        if self.buffer_pointer > COMPACT_THRESHOLD {
            self.buffer.drain(..self.buffer_pointer);
            self.origin_pointer += self.buffer_pointer as u64;
            self.buffer_pointer = 0;
        }
    }

    fn start_fetch(&mut self) -> Result<(), LogError> {
        let runtime = Handle::try_current().map_err(|_| LogError::NoRuntime)?;
        let fetcher = self.fetcher.take();
        let connector = Arc::clone(&self.connector);

        let path = self.path.clone();
        let offset = self.next_offset();
        let (sender, receiver) = oneshot::channel();
        runtime.spawn_blocking(move || {
            let connected = match fetcher {
                Some(fetcher) => Ok(fetcher),
                None => connector(),
            };
            let mut fetcher = match connected {
                Ok(fetcher) => fetcher,
                Err(error) => {
                    let _ = sender.send((None, Err(error)));
                    return;
                }
            };
            let result = fetcher.fetch_from(&path, offset);
            let _ = sender.send((Some(fetcher), result));
        });

        self.state = FetchState::Fetching(receiver);
        Ok(())
    }

    fn idle_fetcher(&mut self) -> Result<&mut Box<dyn RemoteFetcher>, LogError> {
        if matches!(self.state, FetchState::Fetching(_) | FetchState::Reconnecting(_)) {
            return Err(LogError::Busy);
        }
        self.fetcher()
    }
}

/// Source of new game log bytes
pub enum LogSource {
    Local(LocalLog),
    Remote(RemoteLog),
}

impl LogSource {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        LogSource::Local(LocalLog {
            path: path.into(),
            file: None,
            position: 0,
        })
    }

    /// A remote log reached through connections made by `connector`
    pub fn remote(path: impl Into<String>, connector: Connector) -> Self {
        LogSource::Remote(RemoteLog {
            path: path.into(),
            connector,
            fetcher: None,
            buffer: Vec::new(),
            buffer_pointer: 0,
            origin_pointer: 0,
            state: FetchState::Closed,
        })
    }

    pub fn from_location(location: &LogLocation) -> Self {
        match location {
            LogLocation::Local(path) => LogSource::local(path.clone()),
            LogLocation::Ftp(ftp) => {
                let ftp = ftp.clone();
                let path = ftp.path.clone();
                LogSource::remote(
                    path,
                    Arc::new(move || {
                        FtpFetcher::connect(&ftp).map(|f| Box::new(f) as Box<dyn RemoteFetcher>)
                    }),
                )
            }
        }
    }

    /// Opens the log afresh, forgetting any previous position
    pub fn open(&mut self, start: StartAt) -> Result<(), LogError> {
        match self {
            LogSource::Local(log) => log.open(start),
            LogSource::Remote(log) => log.open(start),
        }
    }

    /// Opens the log again, resuming at the position reached before
    ///
    /// Remote logs reconnect in the background and need a tokio runtime.
    pub fn reopen(&mut self) -> Result<(), LogError> {
        match self {
            LogSource::Local(log) => log.reopen(),
            LogSource::Remote(log) => log.reopen(),
        }
    }

    /// Returns the bytes appended since the previous read, possibly none
    pub fn read(&mut self) -> Result<Vec<u8>, LogError> {
        match self {
            LogSource::Local(log) => log.read(),
            LogSource::Remote(log) => log.read(),
        }
    }

    /// Closes the file and any remote connection. Safe to call at any time.
    pub fn close(&mut self) {
        match self {
            LogSource::Local(log) => log.file = None,
            LogSource::Remote(log) => {
                log.disconnect();
                log.state = FetchState::Closed;
            }
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            LogSource::Local(log) => log.file.is_some(),
            LogSource::Remote(log) => !matches!(log.state, FetchState::Closed),
        }
    }

    /// True while a remote download or reconnection is in flight
    pub fn is_fetching(&self) -> bool {
        matches!(
            self,
            LogSource::Remote(RemoteLog {
                state: FetchState::Fetching(_) | FetchState::Reconnecting(_),
                ..
            })
        )
    }

    /// True once a remote fetch failed; the source must be reopened
    pub fn is_failed(&self) -> bool {
        matches!(self, LogSource::Remote(RemoteLog { state: FetchState::Failed(_), .. }))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, LogSource::Remote(_))
    }

    pub fn origin_pointer(&self) -> u64 {
        match self {
            LogSource::Local(_) => 0,
            LogSource::Remote(log) => log.origin_pointer,
        }
    }

    pub fn buffer_pointer(&self) -> usize {
        match self {
            LogSource::Local(_) => 0,
            LogSource::Remote(log) => log.buffer_pointer,
        }
    }

    /// Offset of the next byte this source will read
    pub fn next_offset(&self) -> u64 {
        match self {
            LogSource::Local(log) => log.position,
            LogSource::Remote(log) => log.next_offset(),
        }
    }

    /// Reads a whole file on the host holding the log
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>, LogError> {
        match self {
            LogSource::Local(_) => Ok(std::fs::read(Path::new(path))?),
            LogSource::Remote(log) => log.idle_fetcher()?.fetch_all(path),
        }
    }

    /// Writes a whole file on the host holding the log
    pub fn write_file(&mut self, path: &str, bytes: &[u8]) -> Result<(), LogError> {
        match self {
            LogSource::Local(_) => Ok(std::fs::write(Path::new(path), bytes)?),
            LogSource::Remote(log) => log.idle_fetcher()?.store(path, bytes),
        }
    }
}

/// Reassembles lines from byte chunks that may end mid-line
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every line completed by them
    ///
    /// Empty lines are skipped and trailing `\r` removed. Invalid UTF-8 is
    /// replaced rather than rejected.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let complete: Vec<u8> = self.pending.drain(..=last_newline).collect();
        complete
            .split(|&b| b == b'\n')
            .map(|line| String::from_utf8_lossy(line).trim_end_matches('\r').to_string())
            .filter(|line| !line.trim().is_empty())
            .collect()
    }

    /// Returns the unterminated tail, if any, emptying the buffer
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).trim_end_matches('\r').to_string();
        self.pending.clear();
        Some(line)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
