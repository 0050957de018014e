//! CLI for remote stores speaking the legacy serve protocol.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod archive;

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use sshstore::{
    BuildResult, BuildSettings, ClosureOptions, Config, DerivedPath, PathInfo, SshStore, Store,
    StorePath,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "sshstore", version, about = "Talk to a remote store over ssh")]
struct Cli {
    /// Remote store URI (e.g., ssh://builder?max-connections=2).
    #[arg(long)]
    store: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the negotiated protocol version and remote greeting.
    Info,

    /// Show metadata of store paths.
    PathInfo {
        /// Store paths to query.
        #[arg(required = true, num_args = 1..)]
        paths: Vec<String>,
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Print the subset of paths the remote holds.
    Valid {
        /// Store paths to check.
        #[arg(required = true, num_args = 1..)]
        paths: Vec<String>,
        /// Let the remote substitute missing paths.
        #[arg(long)]
        substitute: bool,
    },

    /// Print the closure of store paths.
    Closure {
        /// Root store paths.
        #[arg(required = true, num_args = 1..)]
        paths: Vec<String>,
        /// Include outputs of derivations.
        #[arg(long)]
        include_outputs: bool,
        /// Include derivers of paths.
        #[arg(long)]
        include_derivers: bool,
    },

    /// Write the archive of a store path.
    Export(archive::ExportArgs),

    /// Import an archive under a store path.
    Import(archive::ImportArgs),

    /// Build derivations or fetch paths on the remote.
    ///
    /// Targets are store paths or `<drv>!<outputs>` with `*` for all outputs.
    Build {
        /// Targets to build.
        #[arg(required = true, num_args = 1..)]
        targets: Vec<String>,
        /// Seconds without output before the build is killed.
        #[arg(long, default_value_t = 0)]
        max_silent_time: u64,
        /// Seconds before the build is killed.
        #[arg(long, default_value_t = 0)]
        timeout: u64,
        /// Keep the build directory of failed builds.
        #[arg(long)]
        keep_failed: bool,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for queries.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = Cli::parse().dispatch().await {
        eprintln!("sshstore: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        if let Command::Completion { shell } = self.command {
            clap_complete::generate(shell, &mut Self::command(), "sshstore", &mut std::io::stdout());
            return Ok(());
        }

        let config = Config::from_uri(&self.store).context("invalid store URI")?;
        let store = SshStore::open(config);
        let result = match self.command {
            Command::Info => info(&store).await,
            Command::PathInfo { paths, format } => path_info(&store, &paths, format).await,
            Command::Valid { paths, substitute } => valid(&store, &paths, substitute).await,
            Command::Closure {
                paths,
                include_outputs,
                include_derivers,
            } => {
                let mut options = ClosureOptions::default();
                options.include_outputs = include_outputs;
                options.include_derivers = include_derivers;
                closure(&store, &paths, options).await
            }
            Command::Export(args) => archive::export(&store, args).await,
            Command::Import(args) => archive::import(&store, args).await,
            Command::Build {
                targets,
                max_silent_time,
                timeout,
                keep_failed,
            } => {
                let mut settings = BuildSettings::default();
                settings.max_silent_time = max_silent_time;
                settings.build_timeout = timeout;
                settings.keep_failed = keep_failed;
                store.set_build_settings(settings);
                build(&store, &targets).await
            }
            Command::Completion { .. } => Ok(()),
        };
        store.close();
        result
    }
}

/// Parses store paths given on the command line.
pub(crate) fn parse_paths(store: &SshStore, paths: &[String]) -> Result<BTreeSet<StorePath>> {
    paths
        .iter()
        .map(|p| {
            store
                .store_dir()
                .parse(p)
                .with_context(|| format!("bad store path '{p}'"))
        })
        .collect()
}

async fn info(store: &SshStore) -> Result<()> {
    let session = store.pool().acquire().await?;
    println!("store:    {}", store.uri());
    println!("protocol: {}", session.version());
    if !session.greeting().is_empty() {
        println!("greeting: {}", session.greeting());
    }
    println!("trusted:  {:?}", store.is_trusted_client());
    Ok(())
}

async fn path_info(store: &SshStore, paths: &[String], format: OutputFormat) -> Result<()> {
    let dir = store.store_dir();
    let mut infos = Vec::new();
    let mut missing = Vec::new();
    for path in parse_paths(store, paths)? {
        match store.query_path_info(&path).await? {
            Some(info) => infos.push(info),
            None => missing.push(dir.print(&path)),
        }
    }

    if matches!(format, OutputFormat::Json) {
        let list: Vec<_> = infos.iter().map(|i| info_json(store, i)).collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
    } else {
        for info in &infos {
            let hash = info.nar_hash.map(|h| h.to_string()).unwrap_or_default();
            println!("{:<70} {:>10}  {hash}", dir.print(&info.path), info.nar_size);
        }
    }

    if !missing.is_empty() {
        anyhow::bail!("not valid on the remote: {}", missing.join(", "));
    }
    Ok(())
}

fn info_json(store: &SshStore, info: &PathInfo) -> serde_json::Value {
    let dir = store.store_dir();
    serde_json::json!({
        "path": dir.print(&info.path),
        "deriver": info.deriver.as_ref().map(|d| dir.print(d)),
        "references": info.references.iter().map(|r| dir.print(r)).collect::<Vec<_>>(),
        "narSize": info.nar_size,
        "narHash": info.nar_hash.map(|h| h.to_string()),
        "ca": info.content_address,
        "signatures": info.signatures,
    })
}

async fn valid(store: &SshStore, paths: &[String], substitute: bool) -> Result<()> {
    let ids = parse_paths(store, paths)?;
    for path in store.query_valid_paths(&ids, substitute).await? {
        println!("{}", store.store_dir().print(&path));
    }
    Ok(())
}

async fn closure(store: &SshStore, paths: &[String], options: ClosureOptions) -> Result<()> {
    let roots = parse_paths(store, paths)?;
    for path in store.compute_closure(&roots, options).await? {
        println!("{}", store.store_dir().print(&path));
    }
    Ok(())
}

async fn build(store: &SshStore, targets: &[String]) -> Result<()> {
    let parsed = targets
        .iter()
        .map(|t| DerivedPath::parse(store.store_dir(), t))
        .collect::<sshstore::Result<Vec<_>>>()?;
    check_build(&store.build_paths(&parsed).await?)?;
    for target in targets {
        println!("{target}");
    }
    Ok(())
}

/// Turns a failed aggregate build status into an error.
fn check_build(result: &BuildResult) -> Result<()> {
    if !result.success() {
        let msg = result.error_msg.as_deref().unwrap_or("no message");
        anyhow::bail!("build failed ({}): {msg}", result.status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use sshstore::BuildStatus;

    use super::*;

    #[test]
    fn build_failure_carries_the_remote_message() {
        assert!(check_build(&BuildResult::new(BuildStatus::AlreadyValid)).is_ok());

        let mut failed = BuildResult::new(BuildStatus::MiscFailure);
        failed.error_msg = Some("builder for foo.drv failed".to_owned());
        let err = check_build(&failed).unwrap_err();
        assert_eq!(
            err.to_string(),
            "build failed (MiscFailure): builder for foo.drv failed"
        );
        assert!(
            check_build(&BuildResult::new(BuildStatus::TimedOut))
                .unwrap_err()
                .to_string()
                .ends_with("no message")
        );
    }
}
