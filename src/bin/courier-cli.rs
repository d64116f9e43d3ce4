//! Courier CLI - send commands to a running `courierd`

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use courier::client::Client;
use courier::envelope::Arguments;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Send commands to a Courier daemon", long_about = None)]
struct Cli {
    /// Daemon address
    #[arg(short, long, default_value = "127.0.0.1:7878")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke a command by name
    Call {
        /// Command name
        name: String,

        /// Argument as KEY=VALUE; VALUE is parsed as JSON, falling back to a string
        #[arg(short = 'a', long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,
    },

    /// Heartbeat round trip
    Ping,

    /// List the commands the daemon exposes
    Help,
}

fn parse_arguments(pairs: &[String]) -> anyhow::Result<Arguments> {
    let mut arguments = Arguments::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("argument '{pair}' is not KEY=VALUE");
        };
        if key.is_empty() {
            bail!("argument '{pair}' has an empty key");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        arguments.insert(key.to_string(), value);
    }
    Ok(arguments)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let mut client =
        Client::connect_tcp(&cli.addr).with_context(|| format!("connecting to {}", cli.addr))?;

    let result = match cli.command {
        Commands::Call { name, args } => client.call(&name, parse_arguments(&args)?)?,
        Commands::Ping => client.ping()?,
        Commands::Help => client.help()?,
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
