// src/main.rs

//! The `hublink` command-line client. Connects to the hub named in the configuration
//! file, then performs a single call or listens for server invocations.

use anyhow::{Context, Result, anyhow};
use futures::StreamExt;
use hublink::config::HubConfig;
use hublink::core::transport::TcpConnectionFactory;
use hublink::{HubConnection, HubConnectionBuilder, SessionState};
use serde_json::Value;
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, prelude::*};

const USAGE: &str = "Usage: hublink [--config path] (--invoke METHOD [ARGS] | --send METHOD [ARGS] | --stream METHOD [ARGS] | --listen METHOD)
  ARGS is a JSON array of arguments, or a single JSON value.";

enum Command {
    Invoke(String, Vec<Value>),
    Send(String, Vec<Value>),
    Stream(String, Vec<Value>),
    Listen(String),
}

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("hublink version {VERSION}");
        return Ok(());
    }

    // Defaults to "hublink.toml" in the working directory.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("hublink.toml");

    let config = match HubConfig::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level.
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::registry()
        .with(EnvFilter::new(log_level))
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();

    let factory = Arc::new(TcpConnectionFactory::new().with_tls(config.tls_enabled));
    let connection = HubConnectionBuilder::from_config(&config, factory).build();
    register_lifecycle_logging(&connection);

    // Handlers must be in place before the first message can arrive.
    if let Command::Listen(method) = &command {
        let method_name = method.clone();
        connection.on(method, Vec::new(), move |arguments| {
            let method_name = method_name.clone();
            async move {
                println!("{method_name}: {}", Value::Array(arguments));
                Ok(())
            }
        });
    }

    info!("Connecting to {}", config.url);
    connection
        .start()
        .await
        .with_context(|| format!("Failed to connect to '{}'", config.url))?;

    let outcome = run_command(&connection, command).await;
    if let Err(e) = &outcome {
        error!("Command failed: {:#}", e);
    }
    connection.dispose().await?;
    outcome
}

fn parse_command(args: &[String]) -> Result<Command> {
    for (i, arg) in args.iter().enumerate() {
        let flag = arg.as_str();
        if !matches!(flag, "--invoke" | "--send" | "--stream" | "--listen") {
            continue;
        }
        let method = args
            .get(i + 1)
            .filter(|m| !m.starts_with("--"))
            .ok_or_else(|| anyhow!("{flag} flag requires a method name"))?
            .clone();
        if flag == "--listen" {
            return Ok(Command::Listen(method));
        }
        let arguments = match args.get(i + 2) {
            Some(raw) if !raw.starts_with("--") => parse_arguments(raw)?,
            _ => Vec::new(),
        };
        return Ok(match flag {
            "--invoke" => Command::Invoke(method, arguments),
            "--send" => Command::Send(method, arguments),
            _ => Command::Stream(method, arguments),
        });
    }
    Err(anyhow!("No command given"))
}

fn parse_arguments(raw: &str) -> Result<Vec<Value>> {
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("Invalid JSON arguments: {raw}"))?;
    Ok(match value {
        Value::Array(items) => items,
        other => vec![other],
    })
}

fn register_lifecycle_logging(connection: &HubConnection) {
    connection.on_reconnecting(|error| async move {
        match error {
            Some(e) => warn!("Connection lost ({}). Reconnecting...", e),
            None => warn!("Connection lost. Reconnecting..."),
        }
        Ok(())
    });
    connection.on_reconnected(|connection_id| async move {
        info!("Reconnected with connection id {:?}", connection_id);
        Ok(())
    });
    connection.on_closed(|error| async move {
        match error {
            Some(e) => warn!("Connection closed: {}", e),
            None => info!("Connection closed."),
        }
        Ok(())
    });
}

async fn run_command(connection: &HubConnection, command: Command) -> Result<()> {
    match command {
        Command::Invoke(method, arguments) => {
            let result: Value = connection.invoke(&method, arguments).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Send(method, arguments) => {
            connection.send(&method, arguments).await?;
            info!("Sent '{}'.", method);
        }
        Command::Stream(method, arguments) => {
            let mut items = connection.stream::<Value>(&method, arguments).await?;
            while let Some(item) = items.next().await {
                println!("{}", item?);
            }
        }
        Command::Listen(method) => {
            info!("Listening for '{}'. Press Ctrl-C to stop.", method);
            let mut states = connection.state_changes();
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    info!("Interrupted.");
                }
                _ = states.wait_for(|state| *state == SessionState::Disconnected) => {
                    warn!("The connection closed.");
                }
            }
        }
    }
    Ok(())
}
