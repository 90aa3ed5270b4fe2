//! OpenSSH-backed implementation of the `common::transport` traits
//!
//! Sessions are multiplexed over a ControlMaster connection of the system `ssh` client, so
//! authentication follows the user's ssh configuration and agent. File transfer runs plain
//! POSIX tools (`cat`, `stat`, `mkdir`, `find`) over that connection, see [`channel`].

use anyhow::{Context, anyhow};
use std::sync::Arc;
use tracing::instrument;

use common::host::{Credential, HostDescriptor};
use common::result::ExecOutput;

pub mod channel;

pub use channel::SshFileChannel;

/// How unknown or changed host keys are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// refuse hosts missing from known_hosts
    Strict,
    /// add new hosts to known_hosts, refuse changed keys
    Add,
    /// accept any host key
    #[default]
    Accept,
}

impl HostKeyPolicy {
    fn known_hosts(self) -> openssh::KnownHosts {
        match self {
            HostKeyPolicy::Strict => openssh::KnownHosts::Strict,
            HostKeyPolicy::Add => openssh::KnownHosts::Add,
            HostKeyPolicy::Accept => openssh::KnownHosts::Accept,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    pub host_keys: HostKeyPolicy,
    /// where ControlMaster sockets are created, defaults to the system temp dir
    pub control_dir: Option<std::path::PathBuf>,
}

impl SshTransport {
    pub fn new(host_keys: HostKeyPolicy) -> Self {
        Self {
            host_keys,
            control_dir: None,
        }
    }

    fn builder(
        &self,
        host: &HostDescriptor,
        timeout: Option<std::time::Duration>,
    ) -> anyhow::Result<openssh::SessionBuilder> {
        let mut builder = openssh::SessionBuilder::default();
        builder
            .user(host.username.clone())
            .port(host.port)
            .known_hosts_check(self.host_keys.known_hosts())
            .control_directory(
                self.control_dir
                    .clone()
                    .unwrap_or_else(std::env::temp_dir),
            );
        match &host.credential {
            Credential::Password(_) => {
                return Err(anyhow!(
                    "password authentication is not supported by the OpenSSH transport, \
                    use a key file or an ssh agent for {}",
                    host.hostname
                ));
            }
            Credential::KeyFile(path) => {
                builder.keyfile(path);
            }
            Credential::Default => {}
        }
        if let Some(timeout) = timeout {
            builder.connect_timeout(timeout);
        }
        Ok(builder)
    }
}

impl common::transport::Transport for SshTransport {
    type Session = SshSession;

    #[instrument(skip(self, host), fields(host = %host))]
    async fn connect(
        &self,
        host: &HostDescriptor,
        timeout: Option<std::time::Duration>,
    ) -> anyhow::Result<SshSession> {
        let builder = self.builder(host, timeout)?;
        tracing::debug!("connecting over ssh");
        let session = builder
            .connect(&host.hostname)
            .await
            .with_context(|| format!("failed to establish SSH connection to {}", host))?;
        Ok(SshSession {
            hostname: host.hostname.clone(),
            session: Some(Arc::new(session)),
        })
    }
}

pub struct SshSession {
    hostname: String,
    /// shared with the file channels opened on this session
    session: Option<Arc<openssh::Session>>,
}

impl SshSession {
    fn session(&self) -> anyhow::Result<&Arc<openssh::Session>> {
        self.session
            .as_ref()
            .ok_or_else(|| anyhow!("ssh session to {} is closed", self.hostname))
    }
}

impl common::transport::Session for SshSession {
    type FileChannel = SshFileChannel;

    async fn exec(&mut self, command: &str) -> anyhow::Result<ExecOutput> {
        let session = self.session()?;
        let output = session
            .raw_command(command)
            .output()
            .await
            .with_context(|| format!("failed to run command on {}", self.hostname))?;
        let exit_code = output.status.code().with_context(|| {
            format!(
                "command on {} terminated without an exit status",
                self.hostname
            )
        })?;
        Ok(ExecOutput {
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn open_file_channel(&mut self) -> anyhow::Result<SshFileChannel> {
        let session = self.session()?.clone();
        Ok(SshFileChannel::new(session))
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        match Arc::try_unwrap(session) {
            Ok(session) => session
                .close()
                .await
                .with_context(|| format!("failed to close ssh session to {}", self.hostname)),
            Err(_) => {
                // a file channel still holds the master connection, it goes away with it
                tracing::debug!(
                    "ssh session to {} still shared, closing on last drop",
                    self.hostname
                );
                Ok(())
            }
        }
    }
}
