//! RCE Daemon library
//!
//! Building blocks of `rced`:
//! - node lifecycle (notifications, workflow controllers, execution service)
//! - configuration loading
//! - the `im` instance management commands

#![deny(unsafe_code)]

pub mod cli;
pub mod commands;
pub mod config;
pub mod console;
pub mod error;
pub mod node;

pub use cli::{Cli, Command, ImCommand};
pub use commands::run_im_command;
pub use config::DaemonConfig;
pub use console::ConsoleOutputReceiver;
pub use error::{DaemonError, DaemonResult};
pub use node::{
    lock_profile, resolve_node_id, shutdown_requested, shutdown_signal, Node, STARTUP_MARKER,
};
