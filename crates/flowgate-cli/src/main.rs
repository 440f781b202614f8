use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};

use flowgate_gateway::{config, Gateway, GatewayClient};
use flowgate_types::config::GatewayConfig;
use flowgate_types::request::{
    PeaSpawnRequest, PodSpawnRequest, Request, SpawnBody, SpawnStatus,
};

#[derive(Parser)]
#[command(name = "flowgate", version, about = "Flowgate — streaming gateway in front of a worker fabric")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway until interrupted
    Serve(ServeArgs),
    /// Bridge NDJSON requests read from stdin through a running gateway
    Call {
        #[arg(long, default_value = "127.0.0.1:55555")]
        gateway: String,
    },
    /// Ask a running gateway to start a pea or pod and stream its logs
    Spawn {
        #[arg(long, default_value = "127.0.0.1:55555")]
        gateway: String,
        #[command(subcommand)]
        target: SpawnTarget,
    },
    /// Show the effective configuration
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SpawnTarget {
    Pea {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    Pod {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// Config file to use instead of ~/.flowgate/gateway.toml
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    max_message_size: Option<usize>,
    /// Accept spawn requests from remote clients
    #[arg(long)]
    allow_spawn: bool,
    /// Keep http(s)_proxy variables from the environment
    #[arg(long)]
    proxy: bool,
    #[arg(long)]
    sleep_ms: Option<u64>,
    #[arg(long)]
    identity: Option<String>,
    #[arg(long)]
    fabric_host: Option<String>,
    #[arg(long)]
    fabric_port: Option<u16>,
    /// Worker program launched for spawned peas
    #[arg(long)]
    worker: Option<String>,
}

impl ServeArgs {
    fn apply(self, cfg: &mut GatewayConfig) {
        if let Some(name) = self.name {
            cfg.name = name;
        }
        if let Some(host) = self.host {
            cfg.host = host;
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(size) = self.max_message_size {
            cfg.max_message_size = size;
        }
        cfg.allow_spawn |= self.allow_spawn;
        cfg.proxy |= self.proxy;
        if let Some(ms) = self.sleep_ms {
            cfg.sleep_ms = ms;
        }
        if let Some(identity) = self.identity {
            cfg.identity = identity;
        }
        if let Some(host) = self.fabric_host {
            cfg.fabric.host = host;
        }
        if let Some(port) = self.fabric_port {
            cfg.fabric.port = port;
        }
        if let Some(worker) = self.worker {
            cfg.worker.program = worker;
        }
    }
}

fn load(path: Option<&PathBuf>) -> Result<GatewayConfig> {
    match path {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    }
}

fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let mut cfg = load(args.config.as_ref())?;
            args.apply(&mut cfg);
            init_tracing(&cfg.log_level);
            // Environment edits are only sound while this is the only thread.
            if !cfg.proxy {
                flowgate_gateway::scrub_proxy_env();
            }

            runtime()?.block_on(async {
                let gateway = Gateway::start(cfg).await?;
                gateway.join().await;
                gateway.stop();
                Ok(())
            })
        }
        Commands::Call { gateway } => {
            init_tracing("warn");
            runtime()?.block_on(call(gateway))
        }
        Commands::Spawn { gateway, target } => {
            init_tracing("warn");
            runtime()?.block_on(spawn(gateway, target))
        }
        Commands::Config { config: path } => {
            let cfg = load(path.as_ref())?;
            let shown = match path {
                Some(path) => path,
                None => config::config_path()?,
            };
            println!("Config: {}", shown.display());
            println!();
            print!("{}", toml::to_string_pretty(&cfg).context("Failed to render config")?);
            Ok(())
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")
}

async fn call(gateway: String) -> Result<()> {
    let mut requests = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = serde_json::from_str(&line)
            .with_context(|| format!("Invalid request: {line}"))?;
        requests.push(request);
    }

    let mut responses = GatewayClient::new(gateway).call(requests).await?;
    while let Some(response) = responses.next().await {
        println!("{}", serde_json::to_string(&response?)?);
    }
    Ok(())
}

async fn spawn(gateway: String, target: SpawnTarget) -> Result<()> {
    let body = match target {
        SpawnTarget::Pea { args } => SpawnBody::Pea(PeaSpawnRequest { args }),
        SpawnTarget::Pod { args } => SpawnBody::Pod(PodSpawnRequest { args }),
    };

    let mut responses = GatewayClient::new(gateway).spawn(Request::spawn(body)).await?;
    while let Some(response) = responses.next().await {
        let response = response?;
        let Some(spawn) = response.as_spawn() else {
            continue;
        };
        let log = spawn.log_record.as_deref().unwrap_or_default();
        if spawn.status == SpawnStatus::ErrorNotAllowed {
            anyhow::bail!("{log}");
        }
        println!("{log}");
    }
    Ok(())
}
