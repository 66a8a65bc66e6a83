//! duet: relay and headless demo for the collaborative editor core.
//!
//! Uses `clap` for arguments and `env_logger` for logs (`RUST_LOG=info`).

mod cli;
mod demo;

use clap::Parser;
use duet_collab::server::SyncServer;
use log::{error, info};

use cli::{CliArgs, Command};

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = CliArgs::parse();
    let result = match &args.command {
        Command::Relay { .. } => match args.command.server_config() {
            Some(config) => {
                info!("Starting relay on {}...", config.bind_addr);
                SyncServer::new(config).run().await
            }
            None => Ok(()),
        },
        Command::Demo { server, room } => demo::run(server, room.clone())
            .await
            .map_err(|e| e.to_string().into()),
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}
