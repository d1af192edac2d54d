use clap::Parser;
use log::{error, info, Level};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swirl::error::SwirlError;
use swirl::labor::Labor;

/// A WALS factorization worker node.
#[derive(Parser)]
#[command(version, about = "wals labor")]
struct Opts {
    /// Scheduler IP address
    #[arg(long, default_value = "127.0.0.1")]
    scheduler_ip: String,
    /// Scheduler port
    #[arg(long, default_value_t = 8900)]
    scheduler_port: u16,
}

#[tokio::main]
async fn main() -> Result<(), SwirlError> {
    let opts = Opts::parse();
    simple_logger::init_with_level(Level::Info).unwrap();

    let terminate = Arc::new(AtomicBool::new(false));
    swirl::watch_termination(terminate.clone());

    // a terminal error tears the replica down; reattach with clean state
    while !terminate.load(Ordering::Relaxed) {
        match Labor::connect(&opts.scheduler_ip, opts.scheduler_port, terminate.clone()).await {
            Ok(mut labor) => match labor.run().await {
                Ok(()) => break,
                Err(e) => error!("labor event loop failed: {}", e),
            },
            Err(e) => error!(
                "connect to {}:{} failed: {}",
                opts.scheduler_ip, opts.scheduler_port, e
            ),
        }
        if terminate.load(Ordering::Relaxed) {
            break;
        }
        info!("reattaching in 5s");
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    Ok(())
}
