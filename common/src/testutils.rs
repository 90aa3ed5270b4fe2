//! In-memory transport and log capture for tests
//!
//! [`MockTransport`] keeps one [`MockRemote`] per hostname. Tests script connect failures,
//! command replies and transfer faults on it, then inspect what the code under test did.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};

use crate::host::HostDescriptor;
use crate::result::ExecOutput;
use crate::transport::{FileChannel, RemoteEntry, Session, Transport};

#[derive(Debug, Clone, Default)]
pub struct MockReply {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// fail at the transport level instead of returning an exit code
    pub fault: Option<String>,
}

/// Scripted state of one fake host
#[derive(Debug, Default)]
pub struct MockRemote {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    failing_transfers: BTreeSet<String>,
    failing_listings: BTreeSet<String>,
    replies: HashMap<String, MockReply>,
    /// reply for commands without a scripted one
    pub default_reply: MockReply,
    /// number of upcoming connect attempts that fail
    pub connect_failures: usize,
    pub connect_attempts: usize,
    pub sessions_opened: usize,
    pub sessions_closed: usize,
    pub fail_close: bool,
    pub exec_delay: std::time::Duration,
    pub commands: Vec<String>,
}

impl MockRemote {
    pub fn reply(&mut self, command: &str, reply: MockReply) {
        self.replies.insert(command.to_string(), reply);
    }

    /// Add a file, creating its parent directories
    pub fn add_file(&mut self, path: &str, content: &[u8]) {
        let mut parent = std::path::Path::new(path).parent();
        while let Some(dir) = parent {
            let dir_str = dir.to_string_lossy().into_owned();
            if !dir_str.is_empty() && dir_str != "/" {
                self.dirs.insert(dir_str);
            }
            parent = dir.parent();
        }
        self.files.insert(path.to_string(), content.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        path == "/" || path.is_empty() || self.dirs.contains(path)
    }

    /// Make every put/get of `path` fail
    pub fn fail_transfer(&mut self, path: &str) {
        self.failing_transfers.insert(path.to_string());
    }

    /// Make listing the directory `path` fail
    pub fn fail_listing(&mut self, path: &str) {
        self.failing_listings.insert(path.to_string());
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions_opened - self.sessions_closed
    }

    fn parent_exists(&self, path: &str) -> bool {
        match std::path::Path::new(path).parent() {
            Some(parent) => self.is_dir(&parent.to_string_lossy()),
            None => true,
        }
    }

    fn check_transfer(&self, path: &str) -> anyhow::Result<()> {
        if self.failing_transfers.contains(path) {
            return Err(anyhow!("permission denied: {}", path));
        }
        Ok(())
    }
}

type SharedRemote = Arc<Mutex<MockRemote>>;

fn lock(remote: &SharedRemote) -> std::sync::MutexGuard<'_, MockRemote> {
    // a test that panicked while holding the lock already failed
    remote.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tracks how many exec calls are running at the same time
#[derive(Debug, Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Debug, Default)]
pub struct MockTransport {
    remotes: Mutex<HashMap<String, SharedRemote>>,
    in_flight: Arc<InFlight>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// State of `hostname`, created on first use
    pub fn remote(&self, hostname: &str) -> SharedRemote {
        let mut remotes = self
            .remotes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        remotes.entry(hostname.to_string()).or_default().clone()
    }

    /// Make `hostname` refuse every connection attempt
    pub fn unreachable(&self, hostname: &str) {
        lock(&self.remote(hostname)).connect_failures = usize::MAX;
    }

    /// Highest number of concurrently running exec calls seen so far
    pub fn peak_in_flight(&self) -> usize {
        self.in_flight.peak.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    type Session = MockSession;

    async fn connect(
        &self,
        host: &HostDescriptor,
        _timeout: Option<std::time::Duration>,
    ) -> anyhow::Result<MockSession> {
        let remote = self.remote(host.identity());
        {
            let mut state = lock(&remote);
            state.connect_attempts += 1;
            if state.connect_failures > 0 {
                state.connect_failures = state.connect_failures.saturating_sub(1);
                return Err(anyhow!("connection refused by {}", host.hostname));
            }
            state.sessions_opened += 1;
        }
        Ok(MockSession {
            remote,
            in_flight: self.in_flight.clone(),
            closed: false,
        })
    }
}

pub struct MockSession {
    remote: SharedRemote,
    in_flight: Arc<InFlight>,
    closed: bool,
}

impl Session for MockSession {
    type FileChannel = MockFileChannel;

    async fn exec(&mut self, command: &str) -> anyhow::Result<ExecOutput> {
        let (reply, delay) = {
            let mut state = lock(&self.remote);
            state.commands.push(command.to_string());
            let reply = state
                .replies
                .get(command)
                .cloned()
                .unwrap_or_else(|| state.default_reply.clone());
            (reply, state.exec_delay)
        };
        let running = self.in_flight.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.in_flight.peak.fetch_max(running, Ordering::SeqCst);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.current.fetch_sub(1, Ordering::SeqCst);
        if let Some(fault) = reply.fault {
            return Err(anyhow!(fault));
        }
        Ok(ExecOutput {
            exit_code: reply.exit_code,
            stdout: reply.stdout.into_bytes(),
            stderr: reply.stderr.into_bytes(),
        })
    }

    async fn open_file_channel(&mut self) -> anyhow::Result<MockFileChannel> {
        Ok(MockFileChannel {
            remote: self.remote.clone(),
        })
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if self.closed {
            return Ok(());
        }
        let mut state = lock(&self.remote);
        if state.fail_close {
            return Err(anyhow!("session already torn down"));
        }
        self.closed = true;
        state.sessions_closed += 1;
        Ok(())
    }
}

pub struct MockFileChannel {
    remote: SharedRemote,
}

impl FileChannel for MockFileChannel {
    async fn put(&mut self, local: &std::path::Path, remote: &str) -> anyhow::Result<()> {
        lock(&self.remote).check_transfer(remote)?;
        let content = tokio::fs::read(local)
            .await
            .with_context(|| format!("failed reading {:?}", local))?;
        let mut state = lock(&self.remote);
        if !state.parent_exists(remote) {
            return Err(anyhow!("no such directory for {}", remote));
        }
        state.files.insert(remote.to_string(), content);
        Ok(())
    }

    async fn get(&mut self, remote: &str, local: &std::path::Path) -> anyhow::Result<()> {
        let content = {
            let state = lock(&self.remote);
            state.check_transfer(remote)?;
            state
                .files
                .get(remote)
                .cloned()
                .with_context(|| format!("no such file: {}", remote))?
        };
        tokio::fs::write(local, content)
            .await
            .with_context(|| format!("failed writing {:?}", local))
    }

    async fn stat(&mut self, path: &str) -> anyhow::Result<Option<u64>> {
        let state = lock(&self.remote);
        if let Some(content) = state.files.get(path) {
            return Ok(Some(content.len() as u64));
        }
        Ok(state.is_dir(path).then_some(0))
    }

    async fn mkdir(&mut self, path: &str) -> anyhow::Result<()> {
        let mut state = lock(&self.remote);
        if state.is_dir(path) || state.files.contains_key(path) {
            return Err(anyhow!("{} already exists", path));
        }
        if !state.parent_exists(path) {
            return Err(anyhow!("no such directory for {}", path));
        }
        state.dirs.insert(path.to_string());
        Ok(())
    }

    async fn list_entries(&mut self, path: &str) -> anyhow::Result<Vec<RemoteEntry>> {
        let state = lock(&self.remote);
        if state.failing_listings.contains(path) {
            return Err(anyhow!("permission denied: {}", path));
        }
        if !state.is_dir(path) {
            return Err(anyhow!("no such directory: {}", path));
        }
        let is_child = |candidate: &str| {
            std::path::Path::new(candidate).parent() == Some(std::path::Path::new(path))
        };
        let dirs = state.dirs.iter().filter(|d| is_child(d)).map(|d| RemoteEntry {
            name: file_name(d),
            is_dir: true,
            size: 0,
        });
        let files = state
            .files
            .iter()
            .filter(|(f, _)| is_child(f))
            .map(|(f, content)| RemoteEntry {
                name: file_name(f),
                is_dir: false,
                size: content.len() as u64,
            });
        Ok(dirs.chain(files).collect())
    }
}

fn file_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Log sink that a test can read back
#[derive(Debug, Clone, Default)]
pub struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    /// Dispatch writing every event at DEBUG and above into this buffer
    pub fn dispatch(&self) -> tracing::Dispatch {
        let logs = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || logs.clone())
            .finish();
        tracing::Dispatch::new(subscriber)
    }

    pub fn contents(&self) -> String {
        let buffer = self
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
