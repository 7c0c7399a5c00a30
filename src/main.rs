//! sdv-test - behavioural test runner for vehicle software
//!
//! Injects vehicle signals, follows state machines through the logs of the
//! system under test and verifies the outcome of YAML test suites.

use clap::Parser;
use sdv_test::commands::Commands;
use sdv_test::common::{logging, paths};
use sdv_test::report::EXIT_ABORTED;
use sdv_test::{broker, cli};

#[derive(Parser)]
#[command(name = "sdv-test", about = "Behavioural test runner for vehicle software")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Broker => {
            logging::init_broker();
            broker::run(paths::socket_path()).await.map(|()| 0)
        }
        // `run` sets up logging itself once it knows the suite name
        command @ Commands::Run(_) => cli::dispatch(command).await,
        command => {
            let _guard = logging::init_cli(false, None);
            cli::dispatch(command).await
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(EXIT_ABORTED);
        }
    }
}
