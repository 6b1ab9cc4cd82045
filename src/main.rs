mod cli;
mod client;
mod config;
mod message;
mod metrics;
mod net;
mod queue;
mod registry;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::client::run_chat;
use crate::net::server::run_serve;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init()
        .ok();
}

fn main() {
    let cli = Cli::parse();
    let result: Result<()> = match cli.command {
        Some(Commands::Serve(serve)) => {
            init_logging();
            run_serve(serve)
        }
        // The chat UI owns the terminal, so no log output there
        Some(Commands::Chat(chat)) => run_chat(chat),
        None => {
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(err) = result {
        // Map to stable exit codes
        let code = exit_code_for_error(&err);
        eprintln!("error: {err:?}");
        std::process::exit(code);
    }
}

pub(crate) fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    // 2: invalid config, 4: bind failure, 5: connect failure, 1: other
    for cause in err.chain() {
        if cause.is::<crate::config::ConfigError>() {
            return 2;
        }
        if let Some(ioe) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind::*;
            return match ioe.kind() {
                AddrInUse | AddrNotAvailable | PermissionDenied => 4,
                ConnectionRefused | TimedOut => 5,
                _ => 1,
            };
        }
    }
    1
}
