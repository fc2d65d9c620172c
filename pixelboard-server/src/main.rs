//! Pixelboard server: hosts one live board over WebSocket.
//!
//! Configuration is a JSON file (see `ServerConfig`) given as the first
//! argument or through `PIXELBOARD_CONFIG`. Without one, defaults apply.
//! Logging is controlled with `RUST_LOG` (default `info`).

use log::info;
use std::path::PathBuf;

use pixelboard_live::server::{BoardServer, ServerConfig};
use pixelboard_live::ConfigError;

const CONFIG_ENV: &str = "PIXELBOARD_CONFIG";

fn load_config() -> Result<ServerConfig, ConfigError> {
    let path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os(CONFIG_ENV))
        .map(PathBuf::from);

    match path {
        Some(path) => {
            info!("Loading config from {}", path.display());
            ServerConfig::from_json_file(&path)
        }
        None => {
            info!("No config given, using defaults");
            Ok(ServerConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting Pixelboard server...");

    let config = load_config()?;
    log::debug!("Effective config: {}", serde_json::to_string(&config)?);

    let server = BoardServer::new(config)?;
    let listener = tokio::net::TcpListener::bind(server.bind_addr()).await?;

    server
        .serve_until(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Pixelboard server stopped");
    Ok(())
}
