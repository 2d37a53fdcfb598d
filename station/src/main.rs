#[macro_use]
extern crate log;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::LevelFilter;

use phstat::cli::Cli;
use phstat_broker::server::run_broker;
use phstat_core::clock::{Clock, SystemClock};
use phstat_core::config::Config;
use phstat_core::error::TypedResult;
use phstat_core::facade::LocalSystems;
use phstat_core::net::RemoteSystems;

/// Operator station for multi-vessel closed-loop pH control.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Station configuration
    #[arg(long, default_value = "config.yml")]
    config: PathBuf,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand)]
enum Mode {
    /// Drive the rig in-process over the local serial ports (the default).
    /// Use this when only one protocol runs on the rig at a time.
    Run,

    /// Start the session broker that owns the devices. Start exactly one
    /// broker per rig.
    Broker {
        /// TCP port to listen on
        #[arg(long)]
        port: Option<u16>,
    },

    /// Connect to a running broker. Several clients can share one rig this
    /// way; the broker needs to be started first.
    Client {
        /// Broker address
        #[arg(long, default_value = "127.0.0.1:5555")]
        broker: String,
    },
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
    match run_station(args) {
        Ok(_) => {}
        Err(e) => {
            error!("{e}");
            quit::with_code(1);
        }
    }
}

fn run_station(args: Args) -> TypedResult<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match args.mode.unwrap_or(Mode::Run) {
        Mode::Run => {
            let config = Config::load(&args.config)?;
            let systems = LocalSystems::new(config.clone(), clock.clone());
            Cli::new(config, systems, clock).run()
        }
        Mode::Broker { port } => run_broker(&args.config, port),
        Mode::Client { broker } => {
            let config = Config::load(&args.config)?;
            let print_messages = config
                .networking
                .as_ref()
                .is_some_and(|n| n.print_messages);
            let systems = RemoteSystems::new(broker, print_messages);
            Cli::new(config, systems, clock).run()
        }
    }
}
