use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

mod config;
mod dump;
mod fields;
mod run;

use crate::config::ProbeConfig;

#[derive(Parser)]
#[command(author, version, about = "Exercise the sluice datagram transport over loopback", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file or a .env file
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ping-pong between two loopback interfaces (default)
    Run {
        /// Round trips to perform
        #[arg(long, default_value_t = 1000)]
        count: u32,
        /// Payload bytes per message
        #[arg(long, default_value_t = 64)]
        size: usize,
    },
    /// Print the effective configuration
    DumpConfig {
        /// Precede each variable with its documentation
        #[arg(long)]
        docs: bool,
        /// Render as TOML instead of environment variables
        #[arg(long)]
        toml: bool,
    },
    /// Print interface limits and the performance estimate
    Query,
}

fn main() -> ExitCode {
    let filter = std::env::var("SLUICE_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let cfg = match ProbeConfig::new(cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("config load failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    let command = cli.command.unwrap_or(Commands::Run {
        count: 1000,
        size: 64,
    });
    match command {
        Commands::Run { count, size } => match run::ping_pong(&cfg, count, size) {
            Ok(summary) => {
                info!(
                    round_trips = summary.round_trips,
                    elapsed = ?summary.elapsed,
                    "ping-pong complete"
                );
                println!(
                    "{} round trips, mean {:?}",
                    summary.round_trips,
                    summary.mean_round_trip()
                );
                for (name, value) in summary.counters {
                    println!("{name}={value}");
                }
            }
            Err(err) => {
                error!("{err}");
                return ExitCode::FAILURE;
            }
        },
        Commands::DumpConfig { docs, toml } => {
            let rendered = if toml {
                dump::render_toml(&cfg)
            } else {
                dump::render_env(&cfg, docs)
            };
            match rendered {
                Ok(text) => print!("{text}"),
                Err(err) => {
                    error!("config dump failed: {err}");
                    return ExitCode::FAILURE;
                }
            }
        }
        Commands::Query => match run::query(&cfg) {
            Ok((attr, perf)) => {
                println!("max_short={}", attr.max_short);
                println!("max_bcopy={}", attr.max_bcopy);
                println!("max_zcopy={}", attr.max_zcopy);
                println!("max_iov={}", attr.max_iov);
                println!("max_hdr={}", attr.max_hdr);
                println!("max_put_short={}", attr.max_put_short);
                println!("device_addr_len={}", attr.device_addr_len);
                println!("iface_addr_len={}", attr.iface_addr_len);
                println!("ep_addr_len={}", attr.ep_addr_len);
                println!("peer_addr_len={}", attr.peer_addr_len);
                println!("max_window={}", attr.max_window);
                println!("ordered_send_completions={}", attr.ordered_send_completions);
                println!("events={}", attr.events);
                println!("overhead={:e}", attr.overhead);
                println!("bandwidth={:e}", perf.bandwidth);
                println!("send_pre_overhead={:e}", perf.send_pre_overhead);
                println!("send_post_overhead={:e}", perf.send_post_overhead);
                println!("recv_overhead={:e}", perf.recv_overhead);
                println!("max_inflight_eps={}", perf.max_inflight_eps);
            }
            Err(err) => {
                error!("{err}");
                return ExitCode::FAILURE;
            }
        },
    }
    ExitCode::SUCCESS
}
