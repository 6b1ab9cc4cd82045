use std::net::SocketAddr;

use clap::{Parser, Subcommand};

use crate::config::{
    DEFAULT_MAX_CLIENTS, DEFAULT_MAX_MESSAGE, DEFAULT_QUEUE_DEPTH, DEFAULT_WRITE_TIMEOUT_MS,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the chat server
    Serve(Serve),
    /// Join a chat server from the terminal
    Chat(Chat),
}

#[derive(Parser, Clone, Debug)]
pub struct Serve {
    /// TCP listen address
    #[arg(long, default_value = "0.0.0.0:13000")]
    pub host: SocketAddr,

    /// Maximum number of connected clients
    #[arg(long, default_value_t = DEFAULT_MAX_CLIENTS)]
    pub max_clients: usize,

    /// Pending messages held before producers block
    #[arg(long, default_value_t = DEFAULT_QUEUE_DEPTH)]
    pub queue_depth: usize,

    /// Largest message frame in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE)]
    pub max_message: usize,

    /// Per-client write timeout in milliseconds (0 = none)
    #[arg(long, default_value_t = DEFAULT_WRITE_TIMEOUT_MS)]
    pub write_timeout_ms: u64,

    /// Seconds between throughput log lines (0 = off)
    #[arg(long, default_value_t = 5)]
    pub stats_interval: u64,
}

#[derive(Parser, Clone, Debug)]
pub struct Chat {
    /// Server address
    #[arg(long, default_value = "127.0.0.1:13000")]
    pub host: SocketAddr,

    /// Name prefixed to every line you send
    #[arg(long, default_value = "CLIENT")]
    pub username: String,
}
