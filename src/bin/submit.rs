use clap::Parser;
use log::{error, info, Level};
use std::process::ExitCode;

/// Submit a task descriptor to a running scheduler.
#[derive(Parser)]
#[command(version, about = "wals task submitter")]
struct Opts {
    /// Scheduler address
    addr: String,
    /// Scheduler port
    port: u16,
    /// Path to the task descriptor file, as seen by the scheduler
    task_file: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let opts = Opts::parse();
    simple_logger::init_with_level(Level::Info).unwrap();

    match swirl::submit::submit_task(&opts.addr, opts.port, &opts.task_file).await {
        Ok(true) => {
            info!("submit task OK");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            error!("submit task rejected");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("submit task failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
