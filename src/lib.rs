//! Screenwatch: periodically captures a screen region, asks a local vision
//! model about it, keeps a history of the answers and raises alerts.
//!
//! The pipeline has two execution contexts. The display-owning thread runs
//! [`capture::CaptureHost`]; the scheduler runs on a tokio task and asks the
//! host for one capture per cycle, waiting at most the configured timeout.

pub mod ai;
pub mod capture;
pub mod cli;
pub mod config;
pub mod events;
pub mod history;
pub mod pipeline;
pub mod state;

use clap::Parser;

pub fn run() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = cli::Cli::parse();
    if let Err(e) = cli::execute(cli) {
        log::error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
