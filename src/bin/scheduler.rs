use clap::Parser;
use log::Level;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use swirl::error::SwirlError;
use swirl::scheduler::Scheduler;

/// The WALS factorization scheduler daemon.
#[derive(Parser)]
#[command(version, about = "wals scheduler")]
struct Opts {
    /// IP address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    scheduler_ip: String,
    /// Port to listen on
    #[arg(long, default_value_t = 8900)]
    scheduler_port: u16,
}

#[tokio::main]
async fn main() -> Result<(), SwirlError> {
    let opts = Opts::parse();
    simple_logger::init_with_level(Level::Info).unwrap();

    let terminate = Arc::new(AtomicBool::new(false));
    swirl::watch_termination(terminate.clone());

    let scheduler = Scheduler::bind(&opts.scheduler_ip, opts.scheduler_port, terminate).await?;
    scheduler.run().await
}
