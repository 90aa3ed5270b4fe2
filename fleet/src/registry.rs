//! Named connection pools sharing one transport
//!
//! Multi-cluster operations visit the selected clusters one after another and fan out
//! within each of them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::instrument::WithSubscriber;

use common::transport::Transport;
use common::{HostDescriptor, HostResults};

use crate::error::RegistryError;
use crate::pool::{ConnectionPool, PoolSettings};

/// Results of a multi-cluster call keyed by cluster name
pub type ClusterResults = BTreeMap<String, HostResults>;

pub struct ClusterRegistry<T: Transport> {
    transport: Arc<T>,
    clusters: HashMap<String, ConnectionPool<T>>,
    dispatch: tracing::Dispatch,
}

impl<T: Transport> ClusterRegistry<T> {
    /// Registry logging through the dispatcher that is current now
    pub fn new(transport: T) -> Self {
        Self::with_dispatch(
            transport,
            tracing::dispatcher::get_default(|current| current.clone()),
        )
    }

    pub fn with_dispatch(transport: T, dispatch: tracing::Dispatch) -> Self {
        Self {
            transport: Arc::new(transport),
            clusters: HashMap::new(),
            dispatch,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn log(&self, event: impl FnOnce()) {
        tracing::dispatcher::with_default(&self.dispatch, event);
    }

    /// Build a pool for `hosts` and register it as `name`
    ///
    /// An existing cluster of the same name is replaced and closed only once the new pool
    /// is connected, a failed build leaves it in place.
    pub async fn create_cluster(
        &mut self,
        name: &str,
        hosts: Vec<HostDescriptor>,
        mut settings: PoolSettings,
    ) -> Result<(), RegistryError> {
        if settings.dispatch.is_none() {
            settings.dispatch = Some(self.dispatch.clone());
        }
        let pool = ConnectionPool::connect(self.transport.clone(), hosts, settings).await?;
        self.log(|| tracing::info!("cluster '{}' ready with {} host(s)", name, pool.len()));
        if let Some(mut replaced) = self.clusters.insert(name.to_string(), pool) {
            self.log(|| tracing::warn!("cluster '{}' already existed, replacing it", name));
            replaced.close().await;
        }
        Ok(())
    }

    /// Add `host` to cluster `name`, reconnecting every host of that cluster
    pub async fn add_host(
        &mut self,
        name: &str,
        host: HostDescriptor,
    ) -> Result<(), RegistryError> {
        let pool = self
            .clusters
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownCluster(name.to_string()))?;
        pool.add_host(host).await?;
        Ok(())
    }

    /// Close and forget cluster `name`
    pub async fn remove_cluster(&mut self, name: &str) {
        match self.clusters.remove(name) {
            Some(mut pool) => {
                pool.close().await;
                self.log(|| tracing::info!("cluster '{}' removed", name));
            }
            None => self.log(|| tracing::warn!("cluster '{}' does not exist", name)),
        }
    }

    /// Cluster names, sorted
    pub fn list_clusters(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn cluster(&self, name: &str) -> Option<&ConnectionPool<T>> {
        self.clusters.get(name)
    }

    /// Resolve `names` (all clusters when `None` or empty) before anything runs
    fn select(
        &self,
        names: Option<&[&str]>,
    ) -> Result<Vec<(String, &ConnectionPool<T>)>, RegistryError> {
        let names = match names {
            Some(names) if !names.is_empty() => {
                names.iter().map(|name| name.to_string()).collect()
            }
            _ => self.list_clusters(),
        };
        names
            .into_iter()
            .map(|name| match self.clusters.get(&name) {
                Some(pool) => Ok((name, pool)),
                None => Err(RegistryError::UnknownCluster(name)),
            })
            .collect()
    }

    pub async fn run_on_clusters(
        &self,
        command: &str,
        timeout: Option<std::time::Duration>,
        env: &BTreeMap<String, String>,
        names: Option<&[&str]>,
    ) -> Result<ClusterResults, RegistryError> {
        let mut results = ClusterResults::new();
        for (name, pool) in self.select(names)? {
            let host_results = pool.run(command, timeout, env).await;
            results.insert(name, host_results);
        }
        Ok(results)
    }

    pub async fn put_on_clusters(
        &self,
        local: &std::path::Path,
        remote: &str,
        names: Option<&[&str]>,
    ) -> Result<ClusterResults, RegistryError> {
        let mut results = ClusterResults::new();
        for (name, pool) in self.select(names)? {
            let host_results = pool.put(local, remote).await;
            results.insert(name, host_results);
        }
        Ok(results)
    }

    pub async fn get_on_clusters(
        &self,
        remote: &str,
        local: &std::path::Path,
        names: Option<&[&str]>,
    ) -> Result<ClusterResults, RegistryError> {
        let mut results = ClusterResults::new();
        for (name, pool) in self.select(names)? {
            let host_results = pool.get(remote, local).await;
            results.insert(name, host_results);
        }
        Ok(results)
    }

    /// Close every cluster, the registry stays usable for new clusters
    pub async fn close(&mut self) {
        let dispatch = self.dispatch.clone();
        let clusters = std::mem::take(&mut self.clusters);
        async move {
            for (name, mut pool) in clusters {
                tracing::debug!("closing cluster '{}'", name);
                pool.close().await;
            }
        }
        .with_subscriber(dispatch)
        .await;
    }
}
