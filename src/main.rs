use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};

use wirebound::config::Config;
use wirebound::{isl, jobcenter, lrcp, speed};


#[derive(Parser)]
struct Args {
    #[clap(long)]
    lrcp_port: Option<u16>,
    #[clap(long)]
    speed_port: Option<u16>,
    #[clap(long)]
    isl_port: Option<u16>,
    #[clap(long)]
    job_port: Option<u16>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = Config::new();
    if let Some(port) = args.lrcp_port {
        config.lrcp_port = port;
    }
    if let Some(port) = args.speed_port {
        config.speed_port = port;
    }
    if let Some(port) = args.isl_port {
        config.isl_port = port;
    }
    if let Some(port) = args.job_port {
        config.job_port = port;
    }
    let config = Arc::new(config);

    info!("starting all servers");

    // none of these return unless their listening socket cannot be bound
    tokio::try_join!(
        lrcp::run(config.clone()),
        speed::run(config.clone()),
        isl::run(config.clone()),
        jobcenter::run(config.clone()),
    )?;

    Ok(())
}
