//! Command line definitions

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "peerlink", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging (written to stderr)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run two in-process nodes over the virtual medium and print their events
    Demo {
        /// ATT payload size of the virtual BLE link
        #[arg(long)]
        mtu: Option<usize>,

        /// Bytes sent from the discovering node to the advertising one
        #[arg(long, default_value_t = 3)]
        payload_size: usize,
    },

    /// Drive one node from line commands on stdin, printing events as JSON lines
    Session {
        /// Backend to run the node on
        #[arg(long, value_enum, default_value_t = SessionBackend::Virtual)]
        backend: SessionBackend,

        /// Display name used for advertising
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBackend {
    /// In-memory medium with an echo peer advertising on it
    Virtual,
    /// Host Bluetooth adapter (needs the `native` feature)
    Ble,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_arguments() {
        let cli = Cli::parse_from(["peerlink", "-v", "demo", "--mtu", "14", "--payload-size", "40"]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Demo { mtu, payload_size } => {
                assert_eq!(mtu, Some(14));
                assert_eq!(payload_size, 40);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_session_defaults_to_virtual() {
        let cli = Cli::parse_from(["peerlink", "session", "--name", "Bob", "--config", "p.toml"]);
        assert_eq!(cli.config.as_deref(), Some("p.toml"));
        match cli.command {
            Commands::Session { backend, name } => {
                assert_eq!(backend, SessionBackend::Virtual);
                assert_eq!(name.as_deref(), Some("Bob"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(Cli::try_parse_from(["peerlink", "session", "--backend", "wifi"]).is_err());
    }
}
