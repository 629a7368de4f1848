use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::net::UdpSocket;
use tracing::error;

use crate::lrcp::message::{Message, MAX_WIRE_SIZE};


/// Outbound half of the transport. Session actors reach the wire through
///  this seam only, so tests can capture what a session would have sent.
#[async_trait]
pub trait DatagramSink: Send + Sync {
    async fn send(&self, message: &Message, to: SocketAddr);
}

pub struct UdpSink {
    socket: Arc<UdpSocket>,
}

impl UdpSink {
    pub fn new(socket: Arc<UdpSocket>) -> UdpSink {
        UdpSink { socket }
    }
}

#[async_trait]
impl DatagramSink for UdpSink {
    async fn send(&self, message: &Message, to: SocketAddr) {
        let mut buf = BytesMut::with_capacity(MAX_WIRE_SIZE);
        message.encode(&mut buf);
        if let Err(e) = self.socket.send_to(&buf, to).await {
            error!("error sending datagram to {}: {}", to, e);
        }
    }
}
