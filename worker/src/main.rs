use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod args;
mod dispatcher;
mod notifier;

use args::ServeArgs;

#[derive(Parser, Debug)]
#[command(name = "keel", about = "Multi-cloud Kubernetes cluster lifecycle manager")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs the cluster-operation worker.
    Serve(ServeArgs),
}

#[tokio::main]
async fn main() {
    keel_common::init();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve(args) => serve(args).await,
    };
    if let Err(e) = result {
        keel_common::print_error(e);
        std::process::exit(1);
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        keel_common::shutdown::shutdown_signal().await;
        signal.cancel();
    });
    dispatcher::run(args, cancel).await
}
