//! Inkwell collaboration server.
//!
//! Configuration comes from the environment:
//!
//! - `INKWELL_BIND` — listen address (default `127.0.0.1:9090`)
//! - `INKWELL_STORAGE` — RocksDB directory; unset keeps documents in memory
//! - `INKWELL_PERSIST_INTERVAL_SECS` — periodic save interval
//! - `INKWELL_PERSIST_EVERY_OPS` — save after this many operations
//! - `INKWELL_HEARTBEAT_SECS` — WebSocket ping interval, 0 disables
//!
//! Log output is controlled by `RUST_LOG`.

use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use inkwell_collab::{CollabServer, ServerConfig};
use log::info;

type BoxError = Box<dyn Error + Send + Sync>;

/// Parse an optional numeric variable, naming it in the error.
fn env_number<T>(name: &str) -> Result<Option<T>, BoxError>
where
    T: FromStr,
    T::Err: Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| format!("invalid {name}={raw:?}: {e}").into()),
        Err(_) => Ok(None),
    }
}

fn config_from_env() -> Result<ServerConfig, BoxError> {
    let mut config = ServerConfig::default();
    if let Ok(addr) = env::var("INKWELL_BIND") {
        config.bind_addr = addr;
    }
    if let Ok(path) = env::var("INKWELL_STORAGE") {
        config.storage_path = Some(PathBuf::from(path));
    }
    if let Some(secs) = env_number::<u64>("INKWELL_PERSIST_INTERVAL_SECS")? {
        config.session.persist_interval = Duration::from_secs(secs.max(1));
    }
    if let Some(ops) = env_number::<u64>("INKWELL_PERSIST_EVERY_OPS")? {
        config.session.persist_every_ops = ops.max(1);
    }
    if let Some(secs) = env_number::<u64>("INKWELL_HEARTBEAT_SECS")? {
        config.heartbeat_interval_secs = secs;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let config = config_from_env()?;
    info!(
        "Starting Inkwell on {} ({})",
        config.bind_addr,
        match &config.storage_path {
            Some(path) => format!("storage at {}", path.display()),
            None => "in-memory".to_string(),
        }
    );

    let server = CollabServer::new(config)?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    let saved = server.flush().await;
    info!("Saved {saved} document(s), exiting");
    Ok(())
}
