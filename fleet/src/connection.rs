//! One authenticated session to one host
//!
//! Every operation measures its own wall time and reports faults as a failed
//! [`OperationResult`], so callers never have to handle errors per host.

use anyhow::{Context, anyhow};
use std::collections::BTreeMap;
use tracing::instrument;

use common::transport::{FileChannel, Session, Transport};
use common::{
    Direction, DirectorySyncEngine, ExecOutput, HostDescriptor, OperationResult, SyncCounters,
    SyncSettings,
};

/// A connection only exists once its session is established, the `Connecting` phase is the
/// [`Connection::open`] future itself.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

pub struct Connection<S: Session> {
    host: HostDescriptor,
    session: S,
    state: ConnectionState,
}

/// Prefix `command` with `KEY='VALUE'` assignments
///
/// Values are wrapped in single quotes without escaping, a value containing `'` breaks the
/// command line.
pub fn with_env(command: &str, env: &BTreeMap<String, String>) -> String {
    if env.is_empty() {
        return command.to_string();
    }
    let assignments: Vec<String> = env
        .iter()
        .map(|(key, value)| format!("{}='{}'", key, value))
        .collect();
    format!("{} {}", assignments.join(" "), command)
}

impl<S: Session> Connection<S> {
    /// Make a single attempt to establish a session, retries are up to the caller
    #[instrument(skip(transport, host), fields(host = %host))]
    pub async fn open<T: Transport<Session = S>>(
        transport: &T,
        host: HostDescriptor,
        timeout: Option<std::time::Duration>,
    ) -> anyhow::Result<Self> {
        let session = transport.connect(&host, timeout).await?;
        tracing::debug!("connected");
        Ok(Self {
            host,
            session,
            state: ConnectionState::Open,
        })
    }

    pub fn host(&self) -> &HostDescriptor {
        &self.host
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(anyhow!("connection to {} is closed", self.host.hostname));
        }
        Ok(())
    }

    fn finish(&self, what: &str, result: OperationResult) -> OperationResult {
        tracing::debug!("{} on {}: {}", what, self.host.display_name(), result.short());
        result
    }

    async fn try_exec(
        &mut self,
        command: &str,
        timeout: Option<std::time::Duration>,
    ) -> anyhow::Result<ExecOutput> {
        self.ensure_open()?;
        tracing::debug!("exec on {}: {}", self.host.display_name(), command);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.session.exec(command))
                .await
                .map_err(|_| {
                    anyhow!(
                        "command timed out after {}",
                        humantime::format_duration(limit)
                    )
                })?,
            None => self.session.exec(command).await,
        }
    }

    /// Run `command` remotely with `env` prepended, bounded by `timeout`
    pub async fn exec(
        &mut self,
        command: &str,
        timeout: Option<std::time::Duration>,
        env: &BTreeMap<String, String>,
    ) -> OperationResult {
        let start = std::time::Instant::now();
        let result = match self.try_exec(&with_env(command, env), timeout).await {
            Ok(output) => OperationResult::from_exit(output, start.elapsed()),
            Err(error) => OperationResult::fault(format!("{:#}", error), start.elapsed()),
        };
        self.finish("exec", result)
    }

    async fn try_put(&mut self, local: &std::path::Path, remote: &str) -> anyhow::Result<()> {
        self.ensure_open()?;
        let mut channel = self.session.open_file_channel().await?;
        channel.put(local, remote).await
    }

    /// Upload a single file
    pub async fn put(&mut self, local: &std::path::Path, remote: &str) -> OperationResult {
        let start = std::time::Instant::now();
        let result = match self.try_put(local, remote).await {
            Ok(()) => OperationResult::done(start.elapsed()),
            Err(error) => OperationResult::fault(format!("{:#}", error), start.elapsed()),
        };
        self.finish("put", result)
    }

    async fn try_get(&mut self, remote: &str, local: &std::path::Path) -> anyhow::Result<()> {
        self.ensure_open()?;
        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed creating local directory {:?}", parent))?;
        }
        let mut channel = self.session.open_file_channel().await?;
        channel.get(remote, local).await
    }

    /// Download a single file, creating the local parent directory first
    pub async fn get(&mut self, remote: &str, local: &std::path::Path) -> OperationResult {
        let start = std::time::Instant::now();
        let result = match self.try_get(remote, local).await {
            Ok(()) => OperationResult::done(start.elapsed()),
            Err(error) => OperationResult::fault(format!("{:#}", error), start.elapsed()),
        };
        self.finish("get", result)
    }

    async fn try_put_tree(
        &mut self,
        local_dir: &std::path::Path,
        remote_dir: &str,
        settings: &SyncSettings,
    ) -> anyhow::Result<SyncCounters> {
        self.ensure_open()?;
        let mut channel = self.session.open_file_channel().await?;
        DirectorySyncEngine::new(&mut channel, settings)
            .put_tree(local_dir, remote_dir)
            .await
    }

    /// Mirror a local directory tree onto the host
    pub async fn put_tree(
        &mut self,
        local_dir: &std::path::Path,
        remote_dir: &str,
        settings: &SyncSettings,
    ) -> OperationResult {
        let start = std::time::Instant::now();
        let result = match self.try_put_tree(local_dir, remote_dir, settings).await {
            Ok(counters) => counters.into_result(Direction::Upload, start.elapsed()),
            Err(error) => OperationResult::fault(format!("{:#}", error), start.elapsed()),
        };
        self.finish("put_tree", result)
    }

    async fn try_get_tree(
        &mut self,
        remote_dir: &str,
        local_dir: &std::path::Path,
        settings: &SyncSettings,
    ) -> anyhow::Result<SyncCounters> {
        self.ensure_open()?;
        let mut channel = self.session.open_file_channel().await?;
        DirectorySyncEngine::new(&mut channel, settings)
            .get_tree(remote_dir, local_dir)
            .await
    }

    /// Mirror a remote directory tree into a local directory
    pub async fn get_tree(
        &mut self,
        remote_dir: &str,
        local_dir: &std::path::Path,
        settings: &SyncSettings,
    ) -> OperationResult {
        let start = std::time::Instant::now();
        let result = match self.try_get_tree(remote_dir, local_dir, settings).await {
            Ok(counters) => counters.into_result(Direction::Download, start.elapsed()),
            Err(error) => OperationResult::fault(format!("{:#}", error), start.elapsed()),
        };
        self.finish("get_tree", result)
    }

    /// Close the session, faults are logged and swallowed
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        if let Err(error) = self.session.close().await {
            tracing::warn!(
                "failed to close connection to {}: {:#}",
                self.host.display_name(),
                error
            );
        }
    }
}
