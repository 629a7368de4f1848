use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::speed::dispatcher::Command;
use crate::speed::wire::{self, ClientMessage, DecodeError, ServerMessage};


enum Identity {
    Unknown,
    Camera { road: u16, mile: u16 },
    Dispatcher { id: Uuid, roads: Vec<u16> },
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Per-connection read loop. All writes to the socket go through a
///  dedicated writer task, so tickets from the central dispatcher,
///  heartbeats and error replies never interleave mid-frame.
pub async fn handle(
    stream: TcpStream,
    peer: SocketAddr,
    commands: mpsc::Sender<Command>,
    config: Arc<Config>,
) {
    debug!("handling connection from {}", peer);
    let (mut read, write) = stream.into_split();

    let (out_tx, out_rx) = mpsc::channel(config.outbound_channel_capacity);
    let writer = tokio::spawn(write_loop(write, out_rx, peer));

    let mut connection = Connection {
        peer,
        commands,
        out: out_tx,
        identity: Identity::Unknown,
        heartbeat_requested: false,
        heartbeat_task: None,
    };

    let mut buffer = BytesMut::with_capacity(1024);
    'outer: loop {
        match read.read_buf(&mut buffer).await {
            Ok(0) => {
                debug!("{} disconnected", peer);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("read error from {}: {}", peer, e);
                break;
            }
        }

        loop {
            match wire::extract(&mut buffer) {
                Ok(Some(message)) => {
                    if connection.on_message(message).await == Flow::Close {
                        break 'outer;
                    }
                }
                Ok(None) | Err(DecodeError::Incomplete) => break,
                Err(DecodeError::Invalid(reason)) => {
                    connection.protocol_error(reason).await;
                    break 'outer;
                }
            }
        }
    }

    connection.shut_down().await;
    drop(connection);
    // the writer flushes whatever is still queued, then follows the channel
    let _ = writer.await;
}

async fn write_loop(mut write: OwnedWriteHalf, mut rx: mpsc::Receiver<ServerMessage>, peer: SocketAddr) {
    let mut buf = BytesMut::with_capacity(256);
    while let Some(message) = rx.recv().await {
        buf.clear();
        message.encode(&mut buf);
        if let Err(e) = write.write_all(&buf).await {
            debug!("write to {} failed: {}", peer, e);
            return;
        }
    }
}

struct Connection {
    peer: SocketAddr,
    commands: mpsc::Sender<Command>,
    out: mpsc::Sender<ServerMessage>,
    identity: Identity,
    heartbeat_requested: bool,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl Connection {
    async fn on_message(&mut self, message: ClientMessage) -> Flow {
        trace!("message from {}: {:?}", self.peer, message);
        match message {
            ClientMessage::IAmCamera { road, mile, limit } => {
                if !matches!(self.identity, Identity::Unknown) {
                    return self.protocol_error("client is already identified").await;
                }
                self.identity = Identity::Camera { road, mile };
                self.send_command(Command::RegisterCamera { road, limit }).await
            }
            ClientMessage::IAmDispatcher { roads } => {
                if !matches!(self.identity, Identity::Unknown) {
                    return self.protocol_error("client is already identified").await;
                }
                let id = Uuid::new_v4();
                self.identity = Identity::Dispatcher { id, roads: roads.clone() };
                self.send_command(Command::RegisterDispatcher { id, roads, out: self.out.clone() })
                    .await
            }
            ClientMessage::Plate { plate, timestamp } => match &self.identity {
                Identity::Camera { road, mile } => {
                    let (road, mile) = (*road, *mile);
                    self.send_command(Command::Observation { road, plate, mile, timestamp }).await
                }
                _ => self.protocol_error("only cameras report plates").await,
            },
            ClientMessage::WantHeartbeat { interval } => {
                // a second request is an error even if the first disabled it
                if self.heartbeat_requested {
                    return self.protocol_error("heartbeat was already requested").await;
                }
                self.heartbeat_requested = true;
                if interval > 0 {
                    self.heartbeat_task =
                        Some(tokio::spawn(heartbeat_loop(self.out.clone(), interval)));
                }
                Flow::Continue
            }
        }
    }

    async fn send_command(&self, command: Command) -> Flow {
        if self.commands.send(command).await.is_err() {
            warn!("central dispatcher is gone, dropping {}", self.peer);
            return Flow::Close;
        }
        Flow::Continue
    }

    async fn protocol_error(&self, reason: &str) -> Flow {
        debug!("protocol error from {}: {}", self.peer, reason);
        let _ = self.out.send(ServerMessage::Error { message: reason.to_string() }).await;
        Flow::Close
    }

    async fn shut_down(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
        if let Identity::Dispatcher { id, roads } = &self.identity {
            let _ = self
                .commands
                .send(Command::UnregisterDispatcher { id: *id, roads: roads.clone() })
                .await;
        }
    }
}

/// one heartbeat every `interval` deciseconds until the connection goes away
async fn heartbeat_loop(out: mpsc::Sender<ServerMessage>, interval: u32) {
    let mut timer = time::interval(Duration::from_millis(interval as u64 * 100));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer.tick().await;
    loop {
        timer.tick().await;
        if out.send(ServerMessage::Heartbeat).await.is_err() {
            return;
        }
    }
}
