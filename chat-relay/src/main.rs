use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use chat_relay::{RelayServer, ServerConfig, StoreConfig};

/// Realtime chat relay.
#[derive(Debug, Parser)]
#[command(name = "chat-relay", version, about)]
struct Args {
    /// Interface to listen on
    #[arg(long, env = "RELAY_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Directory of the persistent message log; omit to keep messages in memory
    #[arg(long, env = "RELAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// fsync every appended message
    #[arg(long, env = "RELAY_SYNC_WRITES")]
    sync_writes: bool,

    /// Largest accepted message, in bytes
    #[arg(long, env = "RELAY_MAX_MESSAGE_BYTES", default_value_t = 64 * 1024)]
    max_message_bytes: usize,

    /// Milliseconds between recovery attempts after a failed backlog read
    #[arg(long, env = "RELAY_RECOVERY_RETRY_MS", default_value_t = 5000)]
    recovery_retry_ms: u64,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let storage = self.data_dir.map(|path| StoreConfig {
            path,
            sync_writes: self.sync_writes,
            ..StoreConfig::default()
        });
        ServerConfig {
            bind_addr: format!("{}:{}", self.bind, self.port),
            storage,
            max_message_bytes: self.max_message_bytes,
            recovery_retry: Duration::from_millis(self.recovery_retry_ms),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    info!("Starting chat relay on {}...", config.bind_addr);

    let server = match RelayServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    ExitCode::SUCCESS
}
