//! fezz-local - run a folder of Fezz functions behind a local invoke API.

use anyhow::Context;
use clap::Parser;
use fezz_local::runtime::{default_max_workers, ApiServer, Dispatcher, RuntimeConfig};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fezz-local")]
#[command(about = "Run Fezz functions locally in pooled worker processes")]
#[command(version)]
struct Cli {
    /// Folder holding one directory per function
    #[arg(env = "FEZZ_FOLDER")]
    directory: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "FEZZ_PORT", default_value_t = 3033)]
    port: u16,

    /// Address to bind
    #[arg(long, env = "FEZZ_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Maximum worker processes (defaults to twice the CPU count)
    #[arg(short, long, env = "FEZZ_WORKERS")]
    workers: Option<usize>,

    /// Concurrent invocations per worker process
    #[arg(long = "perprocess", env = "FEZZ_PER_PROCESS", default_value_t = 1)]
    per_process: usize,

    /// Regex stripped from requested function names
    #[arg(long, env = "FEZZ_PREFIX")]
    prefix: Option<String>,

    /// One worker, no deadlines, a fresh process per invocation
    #[arg(short, long, env = "FEZZ_DEBUG")]
    debug: bool,

    /// Verbosity 0-4; 2 forwards worker stderr, 3 worker stdout
    #[arg(short, long = "verbose", env = "FEZZ_VERBOSE", default_value_t = 4,
          value_parser = clap::value_parser!(u8).range(0..=4))]
    verbosity: u8,

    /// Worker executable (defaults to fezz-worker next to this binary)
    #[arg(long, env = "FEZZ_WORKER")]
    worker: Option<PathBuf>,

    /// Do not reload when function sources change
    #[arg(long)]
    no_watch: bool,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<RuntimeConfig> {
        let folder = match self.directory {
            Some(dir) => dir,
            None => std::env::current_dir().context("Failed to read current directory")?,
        };
        let mut config = RuntimeConfig::new()
            .folder(folder)
            .host(self.host)
            .port(self.port)
            .max_workers(self.workers.unwrap_or_else(default_max_workers))
            .max_per_process(self.per_process)
            .verbosity(self.verbosity)
            .debug(self.debug);
        if let Some(prefix) = self.prefix {
            config = config.prefix(prefix);
        }
        if let Some(worker) = self.worker {
            config = config.worker_program(worker);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbosity == 0 { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let watch = !cli.no_watch;
    let config = cli.into_config()?;
    let addr = config.bind_addr();

    info!("Starting fezz-local...");
    let dispatcher = Dispatcher::new(config).context("Failed to start dispatcher")?;
    info!(
        folder = %dispatcher.config().folder.display(),
        functions = dispatcher.list_functions().len(),
        workers = dispatcher.config().effective_max_workers(),
        per_process = dispatcher.config().max_per_process,
        "Loaded functions"
    );
    if watch {
        dispatcher.watch();
    }

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Try: curl -X POST -d '{{}}' http://{}/2014-11-13/functions/<name>/invoke-async/", addr);

    let server = ApiServer::new(dispatcher.clone());
    if let Err(err) = server.serve(listener, shutdown_signal()).await {
        error!(error = %err, "HTTP server failed");
    }

    dispatcher.drain().await;
    dispatcher.shutdown();
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C");
        }
        () = terminate => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_maps_onto_config() {
        let cli = Cli::parse_from([
            "fezz-local", "-p", "4000", "-w", "3", "--perprocess", "5", "--prefix", "^dev-", "-v",
            "2", "fns",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.max_per_process, 5);
        assert_eq!(config.prefix.as_deref(), Some("^dev-"));
        assert_eq!(config.verbosity, 2);
        assert_eq!(config.folder, PathBuf::from("fns"));
    }

    #[test]
    fn test_debug_flag_forces_one_worker() {
        let cli = Cli::parse_from(["fezz-local", "-d", "-w", "8", "fns"]);
        let config = cli.into_config().unwrap();
        assert!(config.debug);
        assert_eq!(config.max_workers, 1);
    }

    #[test]
    fn test_verbosity_is_bounded() {
        assert!(Cli::try_parse_from(["fezz-local", "-v", "5"]).is_err());
    }
}
