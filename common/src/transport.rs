//! Remote-shell capability consumed by the orchestration core
//!
//! The wire protocol (authentication, encryption, channel multiplexing) lives behind these
//! traits. The `remote` crate implements them on top of the system OpenSSH client and
//! `testutils::MockTransport` implements them in memory.

use std::future::Future;

use crate::host::HostDescriptor;
use crate::result::ExecOutput;

/// Establishes sessions to hosts
pub trait Transport: Send + Sync + 'static {
    type Session: Session;

    /// Make a single connection attempt
    fn connect(
        &self,
        host: &HostDescriptor,
        timeout: Option<std::time::Duration>,
    ) -> impl Future<Output = anyhow::Result<Self::Session>> + Send;
}

/// One authenticated session to a host
pub trait Session: Send + 'static {
    type FileChannel: FileChannel;

    /// Run `command` through the remote shell and buffer its output
    fn exec(&mut self, command: &str) -> impl Future<Output = anyhow::Result<ExecOutput>> + Send;

    /// Open a file-transfer sub-channel
    fn open_file_channel(
        &mut self,
    ) -> impl Future<Output = anyhow::Result<Self::FileChannel>> + Send;

    fn close(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Entry returned by [`FileChannel::list_entries`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Whole-file transfer and remote filesystem primitives
pub trait FileChannel: Send {
    fn put(
        &mut self,
        local: &std::path::Path,
        remote: &str,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn get(
        &mut self,
        remote: &str,
        local: &std::path::Path,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Size of the remote entry, `None` if it does not exist
    fn stat(&mut self, path: &str) -> impl Future<Output = anyhow::Result<Option<u64>>> + Send;

    fn mkdir(&mut self, path: &str) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn list_entries(
        &mut self,
        path: &str,
    ) -> impl Future<Output = anyhow::Result<Vec<RemoteEntry>>> + Send;
}

/// Join a remote directory and an entry name with `/`
pub fn remote_join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), name)
}
