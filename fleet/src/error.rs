/// A host could not be connected after all retry attempts
///
/// Aborts pool construction or a pool refresh. Every other per-host fault is reported as a
/// failed [`common::OperationResult`] instead.
#[derive(Debug, thiserror::Error)]
#[error("failed to connect to {host} after {attempts} attempt(s)")]
pub struct ConnectionError {
    pub host: String,
    pub attempts: u32,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("cluster '{0}' does not exist")]
    UnknownCluster(String),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
