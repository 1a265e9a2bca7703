//! echo-server: a TCP echo server
//!
//! Every chunk of bytes a client sends is written straight back to it.
//!
//! Features:
//! - One concurrent task per connection
//! - Optional cap on concurrently served connections
//! - Graceful stop on SIGINT/SIGTERM
//! - Configuration via CLI arguments or TOML file

mod config;
mod connection;
mod logging;
mod server;

use config::Config;
use server::Server;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(config.log_level);

    let server = Server::new(&config);
    match server.start().await {
        Ok(()) => ExitCode::SUCCESS,
        // Already logged by the server
        Err(_) => ExitCode::FAILURE,
    }
}
