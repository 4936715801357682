//! Command-line entry point.
//!
//! The host process is expected to pass two pipe descriptors: one the
//! bridge reads control envelopes from, one it writes dispatch lines to.
//! Both must be pipe ends and stay open for the life of the process.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ferry-gateway", version, about = "Discord Gateway session bridge over host pipes")]
struct Args {
    /// Bot token used to identify with the gateway.
    #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true)]
    token: String,

    /// Intent bitmask declared at identify time.
    #[arg(long, default_value_t = 0)]
    intents: u64,

    /// Shard index claimed by this process.
    #[arg(long, default_value_t = 0)]
    shard_index: u32,

    /// Total shard count.
    #[arg(long, default_value_t = 1)]
    shard_count: u32,

    /// Descriptor of the pipe carrying host control envelopes.
    #[arg(long, default_value_t = 0)]
    in_fd: i32,

    /// Descriptor of the pipe receiving dispatched event lines.
    #[arg(long, default_value_t = 1)]
    out_fd: i32,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let code = ferry_gateway::gateway(
        args.token,
        args.intents,
        args.shard_index,
        args.shard_count,
        args.in_fd,
        args.out_fd,
    );
    std::process::exit(code);
}
