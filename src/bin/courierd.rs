//! `courierd` – Courier command dispatch daemon.

use anyhow::Context;
use clap::Parser;
use courier::dispatch::DispatchTable;
use courier::{Server, ServerConfig, Service};
use std::io::{self, BufWriter};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "courierd")]
#[command(about = "Newline-delimited JSON command dispatch daemon", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen on TCP ADDR (overrides the config file)
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Communicate over stdin/stdout instead of TCP
    #[arg(long, conflicts_with = "listen")]
    stdio: bool,

    /// Maximum number of concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum request line size in bytes
    #[arg(long)]
    max_frame_bytes: Option<usize>,

    /// Close connections idle for this many seconds
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,
}

impl Cli {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(max_connections) = self.max_connections {
            config.max_connections = max_connections;
        }
        if let Some(max_frame_bytes) = self.max_frame_bytes {
            config.max_frame_bytes = max_frame_bytes;
        }
        if let Some(idle_timeout) = self.idle_timeout {
            config.idle_timeout_secs = Some(idle_timeout);
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so the stdio transport keeps stdout for responses.
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.server_config()?;
    let table = DispatchTable::builder()
        .with_builtins()
        .context("registering built-in commands")?
        .build();

    if cli.stdio {
        return run_stdio(Service::from_config(table, &config));
    }

    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(run_tcp(config, table))
}

fn run_stdio(service: Service) -> anyhow::Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let reader = stdin.lock();
    let writer = BufWriter::new(stdout.lock());

    let summary = service.handle(reader, writer)?;
    tracing::info!(responses = summary.responses, "stdio session finished");
    Ok(())
}

async fn run_tcp(
    config: ServerConfig,
    table: std::sync::Arc<DispatchTable>,
) -> anyhow::Result<()> {
    let server = Server::bind(&config, table).await?;
    let registry = server.registry();

    server
        .serve_with_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            tracing::info!("received ctrl-c");
        })
        .await?;

    tracing::info!(
        connections = registry.total_connections(),
        responses = registry.total_responses(),
        "courierd stopped"
    );
    Ok(())
}
