#[macro_use]
extern crate log;

use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

use phstat_broker::server::run_broker;

/// Session broker for a shared chemostat rig.
///
/// Owns the pH meter and the pump controller and arbitrates access among
/// stations. Start exactly one broker per rig.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Station configuration describing the device ports
    #[arg(long, default_value = "config.yml")]
    config: PathBuf,

    /// TCP port to listen on
    #[arg(long)]
    port: Option<u16>,
}

#[quit::main]
fn main() {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    std::env::set_var("RUST_LOG", level.clone());

    pretty_env_logger::formatted_builder()
        .parse_filters(&level)
        .filter_module("polling", LevelFilter::Off)
        .format_timestamp_secs()
        .init();

    let args = Args::parse();
    match run_broker(&args.config, args.port) {
        Ok(_) => {}
        Err(e) => {
            error!("{e}");
            quit::with_code(1);
        }
    }
}
