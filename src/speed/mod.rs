pub mod connection;
pub mod dispatcher;
pub mod wire;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::Config;
use crate::util::random::RngRandom;
use dispatcher::CentralDispatcher;


/// TCP front door: accepts connections and hands each one to its own
///  handler task. The central dispatcher actor is shared by all of them.
pub async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.speed_port)).await?;
    info!("speed daemon listening on port {}/tcp", config.speed_port);

    let (commands, command_rx) = mpsc::channel(config.dispatcher_channel_capacity);
    tokio::spawn(CentralDispatcher::<RngRandom>::new().run(command_rx));

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                error!("error accepting connection: {}", e);
                continue;
            }
        };
        tokio::spawn(connection::handle(stream, peer, commands.clone(), config.clone()));
    }
}
