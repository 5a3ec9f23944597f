use std::path::PathBuf;

use clap::Parser;
use socket_hub::config::{Config, ServerConfig};
use socket_hub::daemon;
use socket_hub::error::Result;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "socket-hubd")]
#[command(about = "Socket hub daemon")]
struct Cli {
    /// JSON config file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Shared secret for HTTP and WebSocket clients. An empty token disables auth.
    #[arg(long, env = "SOCKET_HUB_TOKEN")]
    token: Option<String>,

    #[arg(long)]
    path: Option<String>,
}

impl Cli {
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        let server = config.server.get_or_insert_with(ServerConfig::default);
        if let Some(host) = self.host {
            server.host = Some(host);
        }
        if let Some(port) = self.port {
            server.port = Some(port);
        }
        if let Some(token) = self.token {
            server.token = Some(token);
        }
        if let Some(path) = self.path {
            server.path = Some(path);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,socket_hub=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let config = Cli::parse().into_config()?;

    daemon::run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
