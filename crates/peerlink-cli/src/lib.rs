//! peerlink CLI library
//!
//! Components behind the `peerlink` binary: argument parsing, the TOML
//! configuration, the two-node demo and the line-driven session.

pub mod cli;
pub mod config;
pub mod demo;
pub mod error;
pub mod output;
pub mod session;

pub use cli::{Cli, Commands, SessionBackend};
pub use config::CliConfig;
pub use demo::{demo_payload, run_demo, DemoReport};
pub use error::{CliError, Result};
pub use session::{run_session, SessionCommand};
