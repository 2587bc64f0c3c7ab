use std::{error::Error, net::SocketAddr, sync::Arc};

use clap::Parser;
use log::info;
use nativewire::{
    ServerContext,
    engine::{MemoryAsyncInsertQueue, MemoryEngine, StaticUsers},
    protocol::{Server, install_shutdown_handler},
    settings::ServerSettings,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for new connections at address
    #[arg(default_value = "127.0.0.1:9000")]
    address: SocketAddr,

    /// Rows buffered per table before an asynchronous insert batch is written
    #[arg(long, default_value_t = 100_000)]
    async_insert_max_rows: usize,

    #[command(flatten)]
    settings: ServerSettings,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let engine = Arc::new(MemoryEngine::new());
    let users = Arc::new(StaticUsers::new(&cli.settings.users));
    let queue = Arc::new(MemoryAsyncInsertQueue::new(
        Arc::clone(&engine),
        cli.async_insert_max_rows,
    ));
    let context = ServerContext::new(cli.settings, users, engine).with_async_inserts(queue);

    let server = Server::bind(cli.address, context)?;
    install_shutdown_handler(server.shutdown_handle())?;
    server.listen()?;

    info!("bye");
    Ok(())
}
