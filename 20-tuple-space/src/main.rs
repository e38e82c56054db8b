use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use tuple_space::{
    cli::{Cli, Command, ServerArgs},
    client,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    match Cli::parse().command {
        Command::Server(args) => run_server(args).await,
        Command::Client(args) => client::run(args).await,
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let server = Server::new(listener);
    let space = server.space();

    // Keep this line first: scripts read the bound address from its last word.
    info!("tuple space listening on {}", server.local_addr()?);
    for service in space.services().iter() {
        info!("EX service {}: {}", service.id, service.description);
    }

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("server exited with error: {err:?}");
        return Err(err);
    }

    let remaining = space.snapshot();
    info!(
        keys = remaining.entries.len(),
        waiting = space.waiting(),
        "tuple space closed\n{remaining}"
    );
    Ok(())
}
