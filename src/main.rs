use clap::Parser;
use impostor_server::{args::Args, run, setup_logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging();
    let args = Args::parse();
    run(args.host, args.words).await
}
