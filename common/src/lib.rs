//! Shared building blocks of the sshfleet tools
//!
//! - [`host`]: host descriptors and host-file loading
//! - [`transport`]: the remote-shell capability the orchestration core consumes
//! - [`result`]: the uniform per-host outcome record
//! - [`sync`]: directory synchronization with a fixed skip policy
//! - [`filter`]: skip patterns
//! - [`config`]: runtime and output configuration
//! - `testutils`: in-memory transport and log capture used by tests (`testutils` feature)

pub mod config;
pub mod filter;
pub mod host;
pub mod result;
pub mod sync;
#[cfg(any(test, feature = "testutils"))]
pub mod testutils;
pub mod transport;

pub use config::{OutputConfig, RuntimeConfig};
pub use host::{Credential, HostDescriptor};
pub use result::{ExecOutput, HostResults, OperationResult};
pub use sync::{Direction, DirectorySyncEngine, SkipReason, SyncCounters, SyncSettings};

/// Install the global fmt subscriber for a binary
///
/// `RUST_LOG` takes precedence over the verbosity derived from `output`.
pub fn init_logging(output: &OutputConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.filter_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Build a tokio runtime from `runtime` and drive `func` to completion on it
///
/// Errors are logged (unless quiet) and turned into `None`, so callers only decide on an
/// exit code.
pub fn run<Fut, Summary>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    init_logging(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to start tokio runtime: {error}");
            }
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{}", &summary);
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{:#}", error);
            }
            None
        }
    }
}
