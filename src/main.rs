use clap::Parser;
use tracing_subscriber::EnvFilter;

use stackrunway::api::{AppCli, run};

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(AppCli::parse()).await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
