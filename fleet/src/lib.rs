//! Treat a pool of SSH hosts as one execution target
//!
//! A [`ConnectionPool`] connects to every host up front and then fans each operation out
//! across all of them with a bounded number of concurrent tasks. Every call returns one
//! [`common::OperationResult`] per host, a failing host never aborts the others.
//!
//! - [`connection`]: a single host's session with exec, file transfer and tree sync
//! - [`fanout`]: the bounded task set used by every bulk operation
//! - [`pool`]: connect-all with retry and backoff, bulk operations, session refresh
//! - [`registry`]: named pools and multi-cluster operations
//! - [`report`]: rendering results for the `sshfleet` command line
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> anyhow::Result<()> {
//! use std::sync::Arc;
//!
//! let hosts = common::host::load_hosts(std::path::Path::new("hosts.json")).await?;
//! let transport = Arc::new(remote::SshTransport::default());
//! let mut pool = fleet::ConnectionPool::connect(transport, hosts, Default::default()).await?;
//! for (host, result) in pool.run("uptime", None, &Default::default()).await {
//!     println!("{}: {}", host, result.short());
//! }
//! pool.close().await;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod fanout;
pub mod pool;
pub mod registry;
pub mod report;

pub use connection::{Connection, ConnectionState};
pub use error::{ConnectionError, RegistryError};
pub use fanout::FanOutExecutor;
pub use pool::{ConnectionPool, PoolSettings};
pub use registry::ClusterRegistry;
pub use report::Summary;
