use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use log::{error, info};
use std::sync::Arc;
use tailgate::config::{AUTH_KEY_ENV, Credential, DEFAULT_LISTEN_ADDR, ProxyConfig};
use tailgate::logging;
use tailgate::proxy::ProxyServer;
use tailgate::transport::{Socks5Transport, Transport};
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "Forward HTTP/HTTPS proxy into a private overlay network"
)]
struct Args {
    #[clap(short, long, value_name = "ADDR", help = "Listen address (default: 127.0.0.1:8384)")]
    listen: Option<String>,

    #[clap(short, long, value_name = "NAME", help = "Node name on the overlay network (default: tailgate)")]
    name: Option<String>,

    #[clap(short, long, help = "Enable debug logging")]
    verbose: bool,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "ADDR", help = "SOCKS5 address of the overlay gateway")]
    gateway: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Timeout for dialing through the overlay")]
    dial_timeout: Option<u64>,

    #[clap(long, value_name = "BYTES", help = "Maximum HTTP request head size in bytes")]
    max_header_size: Option<usize>,

    #[clap(long, value_name = "FORMAT", help = "Log output format: text or json")]
    log_format: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_from(normalize_args(std::env::args()));

    if let Some(config_file) = &args.generate_config {
        ProxyConfig::default()
            .to_file(config_file)
            .with_context(|| format!("writing sample configuration to {}", config_file))?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let config = build_config(&args)?;
    logging::init(config.verbose, config.log_format).context("initializing logger")?;

    if let Err(e) = run(Arc::new(config)).await {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(config: Arc<ProxyConfig>) -> Result<()> {
    let credential = Credential::from_env()
        .with_context(|| format!("an overlay auth key is required in {}", AUTH_KEY_ENV))?;

    info!("Starting node '{}' via overlay gateway {}", config.node_name, config.gateway_addr);
    let transport: Arc<dyn Transport> = Arc::new(Socks5Transport::new(
        config.gateway_addr,
        config.node_name.clone(),
        credential,
        config.dial_timeout(),
    ));
    transport.bring_up().await.context("bringing up the overlay node")?;

    let server = match ProxyServer::bind(config.clone(), transport.clone()).await {
        Ok(server) => server,
        Err(e) => {
            transport.tear_down().await;
            return Err(e).with_context(|| format!("binding {}", config.listen_addr));
        }
    };

    let result = server.run_until(shutdown_signal()).await;
    transport.tear_down().await;
    result?;

    info!("Proxy stopped");
    Ok(())
}

/// Rewrites single-dash long flags (`-listen`, `-name=office`) into the
/// double-dash form clap expects. Short flags and anything after `--` pass
/// through untouched.
fn normalize_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let command = Args::command();
    let longs: Vec<&str> = command.get_arguments().filter_map(|arg| arg.get_long()).collect();

    let mut passthrough = false;
    args.into_iter()
        .map(|arg| {
            if passthrough || arg.starts_with("--") || !arg.starts_with('-') {
                passthrough |= arg == "--";
                return arg;
            }
            let name = arg[1..].split('=').next().unwrap_or("");
            if name.len() > 1 && longs.contains(&name) {
                format!("-{}", arg)
            } else {
                arg
            }
        })
        .collect()
}

fn build_config(args: &Args) -> Result<ProxyConfig> {
    let mut config = match &args.config {
        Some(path) => ProxyConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => ProxyConfig::default(),
    };

    if let Some(listen) = &args.listen {
        config.listen_addr = listen
            .parse()
            .with_context(|| format!("invalid listen address '{}' (expected e.g. {})", listen, DEFAULT_LISTEN_ADDR))?;
    }
    if let Some(name) = &args.name {
        config.node_name = name.clone();
    }
    if args.verbose {
        config.verbose = true;
    }
    if let Some(gateway) = &args.gateway {
        config.gateway_addr = gateway
            .parse()
            .with_context(|| format!("invalid gateway address '{}'", gateway))?;
    }
    if let Some(secs) = args.dial_timeout {
        config.dial_timeout_secs = secs;
    }
    if let Some(limit) = args.max_header_size {
        config.max_header_size = limit;
    }
    if let Some(format) = &args.log_format {
        config.log_format = format.parse()?;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
