use clap::Parser;
use ultrametre_server::server;

#[derive(Parser)]
#[command(
    name = "ultrametre",
    about = "Serial bridge between an ultrametre device, live web clients and a ledger watch"
)]
struct Cli {
    #[command(flatten)]
    server: server::ServerArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    server::run(cli.server).await
}
