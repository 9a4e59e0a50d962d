use clap::Parser;
use tracing::error;

#[tokio::main]
async fn main() {
    if let Err(e) = levsim::logging::init_tracing() {
        eprintln!("failed to initialise logging: {e}");
    }

    let cli = levsim::api::Cli::parse();
    if let Err(msg) = levsim::api::run(cli).await {
        error!("{msg}");
        std::process::exit(1);
    }
}
