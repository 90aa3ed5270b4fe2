use anyhow::{Context, anyhow};
use clap::Parser;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

use fleet::report;
use fleet::{ConnectionPool, PoolSettings};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sshfleet",
    version,
    about = "Run commands and transfer files on many SSH hosts at once",
    long_about = "`sshfleet` connects to every host listed in a JSON host file and fans each \
operation out across all of them.

EXAMPLE:
    # Run a command everywhere
    sshfleet --hosts hosts.json run -- uptime

    # Mirror a directory, skipping logs and anything over 100MB
    sshfleet --hosts hosts.json put-tree ./site /srv/site --skip-pattern '*.log' --skip-size-mb 100

The host file is a JSON array of objects with the fields hostname, username and the optional \
port, key_filename and label.

Exit status is 0 when every host succeeded, 1 when at least one host failed and 2 when the \
hosts could not be loaded or connected."
)]
struct Args {
    /// JSON file listing the hosts
    #[arg(long, value_name = "FILE", help_heading = "Hosts")]
    hosts: std::path::PathBuf,

    // Pool options
    /// Maximum number of hosts worked on at the same time, never more than the host count or 12
    #[arg(long, value_name = "N", help_heading = "Pool options")]
    max_workers: Option<usize>,

    /// Timeout of a single connection attempt, e.g. "10s", "1min"
    #[arg(long, default_value = "10s", value_name = "DURATION", value_parser = humantime::parse_duration, help_heading = "Pool options")]
    connect_timeout: std::time::Duration,

    /// Extra connection attempts per host, the n-th retry waits 2^n seconds
    #[arg(long, default_value = "0", value_name = "N", help_heading = "Pool options")]
    retry: u32,

    // Progress & output
    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    /// Print per-host results as JSON
    #[arg(long, help_heading = "Progress & output")]
    json: bool,

    // Advanced settings
    /// Number of runtime worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_runtime_threads: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug, Clone)]
enum Command {
    /// Run a shell command on every host
    Run {
        /// Kill the wait for a host after this long, e.g. "30s"
        #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
        timeout: Option<std::time::Duration>,

        /// Environment variable for the command (can be specified multiple times)
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env, action = clap::ArgAction::Append)]
        env: Vec<(String, String)>,

        /// Command line, joined with spaces
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Upload a file to every host
    Put {
        local: std::path::PathBuf,
        remote: String,
    },
    /// Download a file from every host into LOCAL_DIR/<hostname>/
    Get {
        remote: String,
        local_dir: std::path::PathBuf,
    },
    /// Mirror a local directory onto every host
    PutTree {
        local_dir: std::path::PathBuf,
        remote_dir: String,
        #[command(flatten)]
        sync: SyncArgs,
    },
    /// Mirror a remote directory of every host into LOCAL_DIR/<hostname>/
    GetTree {
        remote_dir: String,
        local_dir: std::path::PathBuf,
        #[command(flatten)]
        sync: SyncArgs,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct SyncArgs {
    /// Skip files larger than this many MiB, 0 disables the limit
    #[arg(long, value_name = "MB", help_heading = "Sync options")]
    skip_size_mb: Option<f64>,

    /// Skip files whose path relative to the sync root matches this glob
    ///
    /// Patterns use glob syntax: * matches anything except /, ** matches anything including
    /// /, ? matches a single char, [...] for character classes. Patterns without / match the
    /// file name, a leading / anchors the pattern to the sync root.
    #[arg(long, value_name = "PATTERN", help_heading = "Sync options")]
    skip_pattern: Option<common::filter::SkipPattern>,

    /// Transfer files even if the destination has one of the same size
    #[arg(long, help_heading = "Sync options")]
    overwrite: bool,

    /// Log per-file decisions at DEBUG instead of INFO
    #[arg(long, help_heading = "Sync options")]
    no_progress: bool,
}

impl SyncArgs {
    fn settings(&self) -> common::SyncSettings {
        common::SyncSettings {
            skip_size_mb: self.skip_size_mb,
            skip_pattern: self.skip_pattern.clone(),
            overwrite: self.overwrite,
            show_progress: !self.no_progress,
        }
    }
}

fn parse_env(value: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = value
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got {:?}", value))?;
    if key.is_empty() {
        return Err(anyhow!("environment variable name is empty"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Destination of `name` fetched from `host`
fn host_destination(local_dir: &std::path::Path, host: &str, name: &str) -> std::path::PathBuf {
    let dir = local_dir.join(host);
    if name.is_empty() {
        dir
    } else {
        dir.join(name)
    }
}

fn remote_file_name(remote: &str) -> anyhow::Result<String> {
    std::path::Path::new(remote)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("remote path {:?} does not name a file", remote))
}

#[instrument(skip(args))]
async fn async_main(args: Args) -> anyhow::Result<fleet::Summary> {
    let hosts = common::host::load_hosts(&args.hosts).await?;
    if hosts.is_empty() {
        return Err(anyhow!("host file {:?} lists no hosts", args.hosts));
    }
    let download_name = match &args.command {
        Command::Get { remote, .. } => remote_file_name(remote)?,
        _ => String::new(),
    };
    let settings = PoolSettings {
        max_workers: args.max_workers,
        connect_timeout: Some(args.connect_timeout),
        retry: args.retry,
        ..Default::default()
    };
    let transport = Arc::new(remote::SshTransport::default());
    let mut pool = ConnectionPool::connect(transport, hosts, settings).await?;
    let results = match &args.command {
        Command::Run {
            timeout,
            env,
            command,
        } => {
            let env: BTreeMap<String, String> = env.iter().cloned().collect();
            pool.run(&command.join(" "), *timeout, &env).await
        }
        Command::Put { local, remote } => pool.put(local, remote).await,
        Command::Get { remote, local_dir } => {
            let remote: Arc<str> = remote.as_str().into();
            pool.for_each_host(|host, connection| {
                let remote = remote.clone();
                let destination = host_destination(local_dir, host, &download_name);
                async move { connection.lock().await.get(&remote, &destination).await }
            })
            .await
        }
        Command::PutTree {
            local_dir,
            remote_dir,
            sync,
        } => pool.put_tree(local_dir, remote_dir, &sync.settings()).await,
        Command::GetTree {
            remote_dir,
            local_dir,
            sync,
        } => {
            let settings = Arc::new(sync.settings());
            let remote_dir: Arc<str> = remote_dir.as_str().into();
            pool.for_each_host(|host, connection| {
                let settings = settings.clone();
                let remote_dir = remote_dir.clone();
                let destination = host_destination(local_dir, host, "");
                async move {
                    connection
                        .lock()
                        .await
                        .get_tree(&remote_dir, &destination, &settings)
                        .await
                }
            })
            .await
        }
    };
    pool.close().await;
    if args.json {
        println!("{}", report::render_json(&results)?);
    } else {
        print!("{}", report::render_text(&results));
        eprint!("{}", report::render_stderr(&results));
    }
    Ok(fleet::Summary::from_results(&results))
}

fn main() {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_runtime_threads,
        max_blocking_threads: 0,
    };
    match common::run(output, runtime, func) {
        None => std::process::exit(2),
        Some(summary) if !summary.all_succeeded() => std::process::exit(1),
        Some(_) => {}
    }
}
