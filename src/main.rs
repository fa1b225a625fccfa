use std::path::PathBuf;
use std::process::ExitCode;

use chrono::Local;
use clap::Parser;
use log::{error, info};

use clockin::config::Config;
use clockin::orchestrator::Orchestrator;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Account identifier on the unified identity platform.
    #[clap(value_parser)]
    username: String,

    /// Account password; sent only in encrypted form.
    #[clap(value_parser)]
    password: String,

    /// Deployment requires a verification code on submission.
    #[clap(long)]
    captcha: bool,

    /// Maximum number of submission trials.
    #[clap(long)]
    trials: Option<u32>,

    /// Write the derived payload as JSON to this path before submitting.
    #[clap(long, value_name = "PATH")]
    dump_payload: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::init();

    let mut config = Config::default();
    config.captcha_required = args.captcha;
    config.dump_payload = args.dump_payload;
    if let Some(trials) = args.trials {
        config.max_trials = trials.max(1);
    }

    println!(
        "[{}] daily report submission starting",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!(
        "captcha={}, trials={}, backoff={:?}",
        config.captcha_required, config.max_trials, config.retry_backoff
    );

    let orchestrator = Orchestrator::new(config);
    match orchestrator.run(&args.username, &args.password).await {
        Ok(outcome) => {
            println!("Result: {}", outcome);
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}", err);
            println!("Failed: {}", err);
            ExitCode::FAILURE
        }
    }
}
