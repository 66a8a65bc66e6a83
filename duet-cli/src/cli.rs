//! Command-line argument parsing for the `duet` binary
//!
//! Supports:
//! - Running the relay
//! - A headless two-editor demo against a running relay

use clap::{Parser, Subcommand};
use duet_collab::server::ServerConfig;

/// Collaborative rich-text relay and demo
#[derive(Parser, Debug)]
#[command(name = "duet", version, about = "Collaborative rich-text relay and demo")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the WebSocket relay
    Relay {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:9090")]
        bind: String,

        /// Maximum peers per room
        #[arg(long, value_name = "N", default_value_t = 100)]
        max_peers: usize,

        /// Broadcast buffer per room, in messages
        #[arg(long, value_name = "N", default_value_t = 256)]
        capacity: usize,
    },

    /// Connect two headless editors to a relay and edit one room
    Demo {
        /// Relay URL
        #[arg(long, default_value = "ws://127.0.0.1:9090")]
        server: String,

        /// Room name (random when omitted)
        #[arg(long)]
        room: Option<String>,
    },
}

impl Command {
    /// Relay configuration for `duet relay`.
    pub fn server_config(&self) -> Option<ServerConfig> {
        match self {
            Command::Relay {
                bind,
                max_peers,
                capacity,
            } => Some(ServerConfig {
                bind_addr: bind.clone(),
                max_peers_per_room: *max_peers,
                broadcast_capacity: *capacity,
            }),
            Command::Demo { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_defaults_match_server_config() {
        let args = CliArgs::try_parse_from(["duet", "relay"]).unwrap();
        let config = args.command.server_config().unwrap();
        let defaults = ServerConfig::default();
        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.max_peers_per_room, defaults.max_peers_per_room);
        assert_eq!(config.broadcast_capacity, defaults.broadcast_capacity);
    }

    #[test]
    fn test_relay_overrides() {
        let args = CliArgs::try_parse_from([
            "duet", "relay", "--bind", "0.0.0.0:8080", "--max-peers", "4", "--capacity", "32",
        ])
        .unwrap();
        let config = args.command.server_config().unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.max_peers_per_room, 4);
        assert_eq!(config.broadcast_capacity, 32);
    }

    #[test]
    fn test_demo_args() {
        let args = CliArgs::try_parse_from(["duet", "demo", "--room", "lobby"]).unwrap();
        assert_eq!(
            args.command,
            Command::Demo {
                server: "ws://127.0.0.1:9090".to_string(),
                room: Some("lobby".to_string()),
            }
        );
        assert!(args.command.server_config().is_none());
    }

    #[test]
    fn test_subcommand_required() {
        assert!(CliArgs::try_parse_from(["duet"]).is_err());
    }
}
