mod cli;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::{Cli, Commands};
use skyrelay_core::config::{is_valid_port, MAX_PORT, MIN_PORT};
use skyrelay_core::{Config, ConfigLoader, ConfigValidator, SkyRelayError};
use skyrelay_gateway::RelayServer;
use skyrelay_store::StoreClient;

#[tokio::main]
async fn main() -> Result<(), SkyRelayError> {
    // Parse CLI arguments
    let cli = Cli::parse();

    let dev = matches!(cli.command, Commands::Serve { dev: true, .. });
    init_tracing(dev);

    match cli.command {
        Commands::ConfigSample { output } => {
            let path = output.unwrap_or_else(|| PathBuf::from("./skyrelay.sample.yaml"));
            Config::sample().save(&path)?;
            println!("Sample configuration written to {:?}", path);
            Ok(())
        }
        Commands::Serve {
            host,
            port,
            store_endpoint,
            dev,
        } => {
            let mut config = ConfigLoader::load_or_default(cli.config_path.as_deref())?;
            if let Some(host) = host {
                config.relay.host = host;
            }
            if let Some(port) = port {
                config.relay.port = resolve_port(port).await?;
            }
            if let Some(endpoint) = store_endpoint {
                config.store.endpoint = endpoint;
            }
            handle_serve(config, dev).await
        }
    }
}

fn init_tracing(dev: bool) {
    let env_filter = if dev {
        EnvFilter::new("skyrelay=debug,skyrelay_gateway=debug,skyrelay_store=debug,warn")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("skyrelay=info,skyrelay_gateway=info,warn"))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();
}

async fn handle_serve(config: Config, dev: bool) -> Result<(), SkyRelayError> {
    ConfigValidator::validate(&config)?;

    println!("SkyRelay starting...");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("  Host:  {}", config.relay.host);
    println!("  Port:  {}", config.relay.port);
    println!("  Store: {}", config.store.endpoint);
    println!("  Mode:  {}", if dev { "development" } else { "production" });
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let store = StoreClient::new(
        config.store.endpoint.clone(),
        Duration::from_secs(config.store.request_timeout_secs),
    );
    info!(
        "Store client targets {} ({}s timeout)",
        store.endpoint(),
        config.store.request_timeout_secs
    );
    let server = RelayServer::new(config.relay.clone(), Arc::new(store));

    tokio::select! {
        result = server.start() => {
            result.map_err(|e| SkyRelayError::Other(format!("Relay error: {:#}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested, stopping relay");
        }
    }

    Ok(())
}

/// Accept `port` if it is in range, otherwise keep asking on stdin
async fn resolve_port(port: u16) -> Result<u16, SkyRelayError> {
    if is_valid_port(port) {
        return Ok(port);
    }

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let prompt = format!(
            "Invalid port. Enter a port between {} and {}: ",
            MIN_PORT, MAX_PORT
        );
        stdout.write_all(prompt.as_bytes()).await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            return Err(SkyRelayError::config_invalid(
                "relay.port",
                "No valid port entered before end of input",
            ));
        };
        if let Some(port) = parse_port(&line) {
            return Ok(port);
        }
    }
}

fn parse_port(input: &str) -> Option<u16> {
    input
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|port| is_valid_port(*port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_bounds() {
        assert_eq!(parse_port("3000"), Some(3000));
        assert_eq!(parse_port(" 1024\n"), Some(1024));
        assert_eq!(parse_port("49151"), Some(49151));
        assert_eq!(parse_port("1023"), None);
        assert_eq!(parse_port("49152"), None);
        assert_eq!(parse_port("http"), None);
        assert_eq!(parse_port(""), None);
    }

    #[test]
    fn test_valid_port_skips_prompt() {
        let port = tokio_test::block_on(resolve_port(8080)).unwrap();
        assert_eq!(port, 8080);
    }

    #[test]
    fn test_cli_parses_serve_overrides() {
        let cli = Cli::parse_from([
            "skyrelay",
            "-c",
            "relay.yaml",
            "serve",
            "--port",
            "4000",
            "--store-endpoint",
            "http://store.local/api.php",
            "--dev",
        ]);
        assert_eq!(cli.config_path.as_deref(), Some("relay.yaml"));
        match cli.command {
            Commands::Serve {
                port,
                store_endpoint,
                dev,
                host,
            } => {
                assert_eq!(port, Some(4000));
                assert_eq!(store_endpoint.as_deref(), Some("http://store.local/api.php"));
                assert!(dev);
                assert!(host.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
