use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use rsh_core::settings::{self, Endpoint, Settings, DEFAULT_HOST};
use rsh_telemetry::{LogFormat, TelemetryConfig};
use tokio_util::sync::CancellationToken;

mod client;

#[derive(Parser)]
#[command(name = "rsh", version, about = "Remote command shell over a unix or TCP socket")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept connections and run their commands
    Server {
        #[command(flatten)]
        endpoint: EndpointArgs,

        /// Log line encoding (json or pretty)
        #[arg(long)]
        log_format: Option<LogFormat>,
    },
    /// Connect to a server and send commands
    Client {
        #[command(flatten)]
        endpoint: EndpointArgs,

        /// Run a single command and exit
        #[arg(short = 'c', long, conflicts_with = "script")]
        command: Option<String>,

        /// File with one command per line
        script: Option<PathBuf>,
    },
}

#[derive(Args)]
struct EndpointArgs {
    /// Unix socket path
    #[arg(short = 'u', long = "socket", conflicts_with = "port")]
    socket: Option<PathBuf>,

    /// TCP port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// TCP host or address
    #[arg(short = 'i', long)]
    host: Option<String>,

    /// Settings file (default: ~/.rsh/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,
}

impl EndpointArgs {
    fn load_settings(&self) -> anyhow::Result<Settings> {
        match &self.config {
            Some(path) => settings::load_settings_from_path(path)
                .with_context(|| format!("loading settings from {}", path.display())),
            None => settings::load_settings().context("loading settings"),
        }
    }

    /// Flags override whatever endpoint the settings chose.
    fn resolve(&self, base: &Endpoint) -> Endpoint {
        if let Some(port) = self.port {
            let host = match (&self.host, base) {
                (Some(host), _) => host.clone(),
                (None, Endpoint::Tcp { host, .. }) => host.clone(),
                (None, Endpoint::Unix { .. }) => DEFAULT_HOST.to_string(),
            };
            return Endpoint::tcp(host, port);
        }
        if let Some(path) = &self.socket {
            return Endpoint::unix(path);
        }
        match (&self.host, base) {
            (Some(host), Endpoint::Tcp { port, .. }) => Endpoint::tcp(host.clone(), *port),
            _ => base.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Server { endpoint, log_format } => run_server(&endpoint, log_format).await,
        Command::Client {
            endpoint,
            command,
            script,
        } => run_client(&endpoint, command, script).await,
    }
}

async fn run_server(args: &EndpointArgs, log_format: Option<LogFormat>) -> anyhow::Result<()> {
    let mut settings = args.load_settings()?.server;
    settings.endpoint = args.resolve(&settings.endpoint);

    let mut telemetry = TelemetryConfig::server(&settings.log_level)?;
    if let Some(format) = log_format {
        telemetry.format = format;
    }
    rsh_telemetry::init_telemetry(&telemetry)?;

    let halt = CancellationToken::new();
    let server = rsh_server::start(&settings, halt.clone())
        .await
        .context("starting server")?;

    let on_interrupt = halt.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = on_interrupt.cancelled() => {}
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => tracing::info!("interrupt received, halting"),
                    Err(err) => tracing::warn!(error = %err, "cannot listen for interrupt, halting"),
                }
                on_interrupt.cancel();
            }
        }
    });

    server.wait().await?;
    tracing::info!("server stopped");
    Ok(())
}

async fn run_client(args: &EndpointArgs, command: Option<String>, script: Option<PathBuf>) -> anyhow::Result<()> {
    let mut settings = args.load_settings()?.client;
    settings.endpoint = args.resolve(&settings.endpoint);
    rsh_telemetry::init_telemetry(&TelemetryConfig::client(&settings.log_level)?)?;

    let source = match (command, script) {
        (Some(line), _) => client::LineSource::command(line),
        (None, Some(path)) => client::LineSource::script(&path)?,
        (None, None) => client::LineSource::stdin(),
    };
    let exit = client::run(&settings, source).await?;
    tracing::debug!(?exit, "client finished");
    Ok(())
}
