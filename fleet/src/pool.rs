//! A set of hosts treated as one execution target
//!
//! Hosts are connected one after another when the pool is built. Any host that still
//! fails after the retry budget aborts construction and every connection opened so far is
//! closed. Operations fan out over all connections and return one result per host.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument::WithSubscriber;

use common::transport::Transport;
use common::{HostDescriptor, HostResults, SyncSettings};

use crate::connection::Connection;
use crate::error::ConnectionError;
use crate::fanout::FanOutExecutor;

/// Upper bound of the default worker count
pub const DEFAULT_MAX_WORKERS: usize = 12;
pub const DEFAULT_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// A connection shared between the pool and the task currently using it
pub type SharedConnection<S> = Arc<tokio::sync::Mutex<Connection<S>>>;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// fan-out width, never above the host count or [`DEFAULT_MAX_WORKERS`]
    pub max_workers: Option<usize>,
    pub connect_timeout: Option<std::time::Duration>,
    /// extra connection attempts per host
    pub retry: u32,
    /// the n-th retry waits `2^n` units
    pub retry_backoff_unit: std::time::Duration,
    /// log destination, defaults to the dispatcher current when the pool is built
    pub dispatch: Option<tracing::Dispatch>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_workers: None,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            retry: 0,
            retry_backoff_unit: std::time::Duration::from_secs(1),
            dispatch: None,
        }
    }
}

impl PoolSettings {
    /// `min(host_count, max_workers, DEFAULT_MAX_WORKERS)`, at least 1
    fn workers_for(&self, host_count: usize) -> usize {
        self.max_workers
            .unwrap_or(DEFAULT_MAX_WORKERS)
            .min(host_count)
            .min(DEFAULT_MAX_WORKERS)
            .max(1)
    }

    fn backoff(&self, attempt: u32) -> std::time::Duration {
        self.retry_backoff_unit
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

pub struct ConnectionPool<T: Transport> {
    transport: Arc<T>,
    hosts: Vec<HostDescriptor>,
    connections: BTreeMap<String, SharedConnection<T::Session>>,
    settings: PoolSettings,
    dispatch: tracing::Dispatch,
    closed: bool,
}

async fn close_all<S: common::transport::Session>(
    connections: impl IntoIterator<Item = SharedConnection<S>>,
) {
    for connection in connections {
        connection.lock().await.close().await;
    }
}

async fn connect_with_retry<T: Transport>(
    transport: &T,
    host: &HostDescriptor,
    settings: &PoolSettings,
) -> Result<Connection<T::Session>, ConnectionError> {
    let mut attempt = 0;
    loop {
        match Connection::open(transport, host.clone(), settings.connect_timeout).await {
            Ok(connection) => return Ok(connection),
            Err(error) if attempt < settings.retry => {
                attempt += 1;
                let delay = settings.backoff(attempt);
                tracing::warn!(
                    "connecting to {} failed: {:#}, retry {}/{} in {}",
                    host,
                    error,
                    attempt,
                    settings.retry,
                    humantime::format_duration(delay)
                );
                tokio::time::sleep(delay).await;
            }
            Err(source) => {
                return Err(ConnectionError {
                    host: host.hostname.clone(),
                    attempts: attempt + 1,
                    source,
                });
            }
        }
    }
}

/// Connect every host in order, closing whatever was opened if one of them fails
async fn connect_all<T: Transport>(
    transport: &T,
    hosts: &[HostDescriptor],
    settings: &PoolSettings,
) -> Result<BTreeMap<String, SharedConnection<T::Session>>, ConnectionError> {
    let mut connections = BTreeMap::new();
    for host in hosts {
        let connection = match connect_with_retry(transport, host, settings).await {
            Ok(connection) => connection,
            Err(error) => {
                tracing::error!("{}: {:#}", error, error.source);
                close_all(connections.into_values()).await;
                return Err(error);
            }
        };
        let shared = Arc::new(tokio::sync::Mutex::new(connection));
        if let Some(replaced) = connections.insert(host.identity().to_string(), shared) {
            tracing::warn!(
                "host {} listed more than once, the last entry replaces the earlier connection",
                host.identity()
            );
            close_all([replaced]).await;
        }
    }
    Ok(connections)
}

impl<T: Transport> ConnectionPool<T> {
    /// Connect to every host in `hosts`
    pub async fn connect(
        transport: Arc<T>,
        hosts: Vec<HostDescriptor>,
        settings: PoolSettings,
    ) -> Result<Self, ConnectionError> {
        let dispatch = settings
            .dispatch
            .clone()
            .unwrap_or_else(|| tracing::dispatcher::get_default(|current| current.clone()));
        let connections = async {
            tracing::info!("connecting to {} host(s)", hosts.len());
            connect_all(transport.as_ref(), &hosts, &settings).await
        }
        .with_subscriber(dispatch.clone())
        .await?;
        Ok(Self {
            transport,
            hosts,
            connections,
            settings,
            dispatch,
            closed: false,
        })
    }

    /// Hosts in the order they were configured
    pub fn hosts(&self) -> &[HostDescriptor] {
        &self.hosts
    }

    /// Number of distinct host identities
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn max_workers(&self) -> usize {
        self.settings.workers_for(self.connections.len())
    }

    /// Connection of a single host for direct use
    pub fn connection(&self, hostname: &str) -> Option<SharedConnection<T::Session>> {
        self.connections.get(hostname).cloned()
    }

    fn executor(&self) -> FanOutExecutor {
        FanOutExecutor::new(self.max_workers(), self.dispatch.clone())
    }

    /// Fan `operation` out over every connection, one task per host
    ///
    /// The building block of the bulk operations, also usable for per-host variations such
    /// as host-specific destination paths.
    pub async fn for_each_host<F, Fut>(&self, operation: F) -> HostResults
    where
        F: Fn(&str, SharedConnection<T::Session>) -> Fut,
        Fut: std::future::Future<Output = common::OperationResult> + Send + 'static,
    {
        let tasks = self
            .connections
            .iter()
            .map(|(host, connection)| (host.clone(), operation(host, connection.clone())));
        self.executor().run(tasks).await
    }

    /// Run `command` on every host
    pub async fn run(
        &self,
        command: &str,
        timeout: Option<std::time::Duration>,
        env: &BTreeMap<String, String>,
    ) -> HostResults {
        tracing::dispatcher::with_default(&self.dispatch, || {
            tracing::info!("running {:?} on {} host(s)", command, self.len());
        });
        let command: Arc<str> = command.into();
        let env = Arc::new(env.clone());
        self.for_each_host(|_, connection| {
            let command = command.clone();
            let env = env.clone();
            async move {
                connection
                    .lock()
                    .await
                    .exec(&command, timeout, &env)
                    .await
            }
        })
        .await
    }

    /// Upload one file to every host
    pub async fn put(&self, local: &std::path::Path, remote: &str) -> HostResults {
        let local: Arc<std::path::Path> = local.into();
        let remote: Arc<str> = remote.into();
        self.for_each_host(|_, connection| {
            let local = local.clone();
            let remote = remote.clone();
            async move { connection.lock().await.put(&local, &remote).await }
        })
        .await
    }

    /// Download one file from every host
    ///
    /// Every host writes to the same `local` path, the result that lands last wins. Use
    /// [`ConnectionPool::connection`] for per-host destinations.
    pub async fn get(&self, remote: &str, local: &std::path::Path) -> HostResults {
        let local: Arc<std::path::Path> = local.into();
        let remote: Arc<str> = remote.into();
        self.for_each_host(|_, connection| {
            let local = local.clone();
            let remote = remote.clone();
            async move { connection.lock().await.get(&remote, &local).await }
        })
        .await
    }

    /// Mirror a local tree onto every host
    pub async fn put_tree(
        &self,
        local_dir: &std::path::Path,
        remote_dir: &str,
        settings: &SyncSettings,
    ) -> HostResults {
        let local_dir: Arc<std::path::Path> = local_dir.into();
        let remote_dir: Arc<str> = remote_dir.into();
        let settings = Arc::new(settings.clone());
        self.for_each_host(|_, connection| {
            let local_dir = local_dir.clone();
            let remote_dir = remote_dir.clone();
            let settings = settings.clone();
            async move {
                connection
                    .lock()
                    .await
                    .put_tree(&local_dir, &remote_dir, &settings)
                    .await
            }
        })
        .await
    }

    /// Mirror a remote tree of every host into `local_dir`
    pub async fn get_tree(
        &self,
        remote_dir: &str,
        local_dir: &std::path::Path,
        settings: &SyncSettings,
    ) -> HostResults {
        let local_dir: Arc<std::path::Path> = local_dir.into();
        let remote_dir: Arc<str> = remote_dir.into();
        let settings = Arc::new(settings.clone());
        self.for_each_host(|_, connection| {
            let local_dir = local_dir.clone();
            let remote_dir = remote_dir.clone();
            let settings = settings.clone();
            async move {
                connection
                    .lock()
                    .await
                    .get_tree(&remote_dir, &local_dir, &settings)
                    .await
            }
        })
        .await
    }

    /// Add `host` and reconnect every host of the pool
    ///
    /// All or nothing: on failure the pool keeps its previous hosts and connections.
    pub async fn add_host(&mut self, host: HostDescriptor) -> Result<(), ConnectionError> {
        let mut hosts = self.hosts.clone();
        hosts.push(host);
        let transport = self.transport.clone();
        let settings = self.settings.clone();
        let connections = async {
            tracing::info!("refreshing {} host(s)", hosts.len());
            connect_all(transport.as_ref(), &hosts, &settings).await
        }
        .with_subscriber(self.dispatch.clone())
        .await?;
        let previous = std::mem::replace(&mut self.connections, connections);
        self.hosts = hosts;
        self.closed = false;
        close_all(previous.into_values())
            .with_subscriber(self.dispatch.clone())
            .await;
        Ok(())
    }

    /// Close every connection, idempotent
    pub async fn close(&mut self) {
        self.closed = true;
        close_all(self.connections.values().cloned())
            .with_subscriber(self.dispatch.clone())
            .await;
    }
}

impl<T: Transport> Drop for ConnectionPool<T> {
    fn drop(&mut self) {
        if self.closed || self.connections.is_empty() {
            return;
        }
        let connections: Vec<_> = std::mem::take(&mut self.connections).into_values().collect();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(close_all(connections).with_subscriber(self.dispatch.clone()));
            }
            Err(_) => {
                tracing::dispatcher::with_default(&self.dispatch, || {
                    tracing::debug!("pool dropped outside a runtime, sessions released on drop");
                });
            }
        }
    }
}
