use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use console::style;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use socket_hub::config::Config;
use socket_hub::error::{HubError, Result};
use socket_hub::providers::websocket::WsConnector;
use socket_hub::services::connection::{Connection, ConnectionEvent, SendOptions};
use socket_hub::{ConnectionSettings, MessageType, SERVER};

#[derive(Parser, Debug)]
#[command(name = "socket-hub")]
#[command(about = "Socket hub client")]
struct Cli {
    #[arg(long, env = "SOCKET_HUB_URL", default_value = "ws://127.0.0.1:7979/ws")]
    url: String,

    #[arg(long, env = "SOCKET_HUB_TOKEN")]
    token: Option<String>,

    /// JSON config file providing timeout and heartbeat settings.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Send one message and print the outcome.
    Send {
        #[arg(long, default_value = SERVER)]
        to: String,

        /// JSON payload; plain text is sent as a string.
        #[arg(long, default_value = "null")]
        content: String,

        #[arg(long = "async", default_value_t = false)]
        request: bool,

        /// Seconds to wait for a response.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Print inbound messages and echo async requests back.
    Listen,
}

fn endpoint(url: &str, token: Option<&str>) -> String {
    match token.map(str::trim).filter(|token| !token.is_empty()) {
        Some(token) => {
            let separator = if url.contains('?') { '&' } else { '?' };
            format!("{url}{separator}token={}", urlencoding::encode(token))
        }
        None => url.to_string(),
    }
}

fn parse_content(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn open(cli: &Cli) -> Result<std::sync::Arc<Connection>> {
    let settings = match &cli.config {
        Some(path) => Config::from_file(path)?.connection_settings()?,
        None => ConnectionSettings::default(),
    };
    let url = endpoint(&cli.url, cli.token.as_deref());
    let connection = Connection::connect(&WsConnector, &url, settings).await?;
    let identity = tokio::time::timeout(settings.timeout, connection.ready())
        .await
        .ok()
        .flatten()
        .ok_or_else(|| HubError::Protocol("hub never assigned an identity".to_string()))?;
    println!("{} {}", style("connected as").color256(250), style(&identity).bold());
    Ok(connection)
}

async fn send(cli: &Cli, to: &str, content: &str, request: bool, timeout: Option<u64>) -> Result<()> {
    let connection = open(cli).await?;
    let kind = if request {
        MessageType::Async
    } else {
        MessageType::Default
    };
    let mut options = SendOptions::new(kind).to(to).content(parse_content(content));
    if let Some(seconds) = timeout {
        options = options.timeout(Duration::from_secs(seconds.max(1)));
    }

    let outcome = connection.send(options)?.await;
    match outcome {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default()),
        Err(rejection) => {
            eprintln!("{} {}", style("rejected:").red().bold(), rejection);
            let content = rejection.content();
            if !content.is_null() {
                eprintln!("{}", serde_json::to_string_pretty(&content).unwrap_or_default());
            }
        }
    }
    connection.close().await;
    Ok(())
}

async fn listen(cli: &Cli) -> Result<()> {
    let connection = open(cli).await?;
    let mut events = connection.subscribe_channel();
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Message(message) => {
                println!(
                    "{} {} {}",
                    style(message.kind()).color256(214),
                    style(message.from()).color256(45),
                    message.content()
                );
                if message.kind() == MessageType::Async {
                    if let Err(err) = message.respond(message.content().clone()) {
                        tracing::warn!(uuid = %message.uuid(), error = %err, "echo failed");
                    }
                }
            }
            ConnectionEvent::Error(error) => eprintln!("{} {}", style("error:").red(), error),
            ConnectionEvent::Closed => break,
            _ => {}
        }
    }
    println!("{}", style("connection closed").color256(250));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,socket_hub=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Send {
            to,
            content,
            request,
            timeout,
        } => send(&cli, to, content, *request, *timeout).await,
        Commands::Listen => listen(&cli).await,
    }
}
