use std::net::SocketAddr;
use std::sync::Arc;

use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::lrcp::message::{self, Message};
use crate::lrcp::sink::DatagramSink;


/// Instructions from the front door to a session actor. Every variant
///  carries the datagram's source address: the session follows the peer to
///  wherever it last spoke from, which keeps NAT rebinding working.
#[derive(Debug)]
pub enum SessionMsg {
    Connect { peer: SocketAddr },
    Data { position: u32, payload: Vec<u8>, peer: SocketAddr },
    Ack { length: u32, peer: SocketAddr },
    Close { peer: SocketAddr },
}

#[derive(Clone)]
pub struct SessionHandle {
    pub tx: mpsc::Sender<SessionMsg>,
}

struct PendingData {
    /// unescaped byte count in flight
    length: u32,
    /// time of the first transmission; retransmits do not move it
    sent_at: Instant,
    retransmit_at: Instant,
    message: Message,
}

/// One actor per session id. The actor owns every piece of session state;
///  the front door only decodes datagrams and forwards them as [SessionMsg].
///
/// Invariant: `last_ack <= write_position + pending.length`, and inbound
///  bytes are committed to line processing strictly in `received_position`
///  order, each byte exactly once.
pub struct Session {
    id: u32,
    peer: SocketAddr,
    sink: Arc<dyn DatagramSink>,
    config: Arc<Config>,

    /// bytes of in-order application data consumed from the peer
    received_position: u32,
    /// highest acknowledgement the peer has sent us
    last_ack: u32,
    /// highest acknowledgement the peer could legally send
    max_ack: u32,
    /// bytes of our own stream the peer has acknowledged
    write_position: u32,

    pending: Option<PendingData>,
    /// unacknowledged outbound application bytes, starting at write_position
    outgoing: Vec<u8>,
    /// in-order inbound bytes not yet terminated by a newline
    inbound: Vec<u8>,

    closed: bool,
}

const INITIAL_BUFFER_CAPACITY: usize = 64 * 1024;

impl Session {
    pub fn spawn(
        id: u32,
        peer: SocketAddr,
        sink: Arc<dyn DatagramSink>,
        config: Arc<Config>,
    ) -> SessionHandle {
        let (tx, rx) = mpsc::channel(config.session_channel_capacity);
        let session = Session {
            id,
            peer,
            sink,
            config,
            received_position: 0,
            last_ack: 0,
            max_ack: 0,
            write_position: 0,
            pending: None,
            outgoing: Vec::with_capacity(INITIAL_BUFFER_CAPACITY),
            inbound: Vec::with_capacity(INITIAL_BUFFER_CAPACITY),
            closed: false,
        };
        tokio::spawn(session.run(rx));
        SessionHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SessionMsg>) {
        while !self.closed {
            let retransmit_at = self.pending.as_ref().map(|p| p.retransmit_at);
            select! {
                _ = sleep_until_or_forever(retransmit_at) => {
                    self.on_retransmit_timer().await;
                }
                msg = rx.recv() => {
                    match msg {
                        Some(msg) => self.on_message(msg).await,
                        None => break,
                    }
                }
            }
        }
        debug!(session = self.id, "session actor exiting");
    }

    async fn on_message(&mut self, msg: SessionMsg) {
        match msg {
            SessionMsg::Connect { peer } => {
                self.peer = peer;
                self.send_ack(0).await;
            }
            SessionMsg::Data { position, payload, peer } => {
                self.peer = peer;
                self.on_data(position, payload).await;
            }
            SessionMsg::Ack { length, peer } => {
                self.peer = peer;
                self.on_ack(length).await;
            }
            SessionMsg::Close { peer } => {
                self.peer = peer;
                self.close().await;
            }
        }
    }

    async fn on_data(&mut self, position: u32, payload: Vec<u8>) {
        // data is only ever accepted at the current stream position; anything
        //  else is answered with where we actually are
        if position != self.received_position {
            trace!(
                session = self.id,
                "data at position {} while expecting {}",
                position,
                self.received_position
            );
            self.send_ack(self.received_position).await;
            return;
        }

        let unescaped = match message::unescape(&payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(session = self.id, "discarding undecodable data message: {}", e);
                return;
            }
        };

        self.received_position += unescaped.len() as u32;
        let ack = self.received_position;
        self.send_ack(ack).await;

        self.inbound.extend_from_slice(&unescaped);
        self.reverse_completed_lines();
        self.drive_send().await;
    }

    /// every full line in the inbound buffer is reversed and queued for sending
    fn reverse_completed_lines(&mut self) {
        while let Some(newline) = self.inbound.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.inbound.drain(..=newline).collect();
            line.pop();
            line.reverse();
            self.outgoing.extend_from_slice(&line);
            self.outgoing.push(b'\n');
        }
    }

    async fn on_ack(&mut self, length: u32) {
        if length < self.last_ack {
            trace!(session = self.id, "ignoring delayed ack {} below {}", length, self.last_ack);
            return;
        }
        if length > self.max_ack {
            warn!(
                session = self.id,
                "peer acknowledged {} bytes but only {} were ever sent, closing",
                length,
                self.max_ack
            );
            self.close().await;
            return;
        }
        let Some(pending) = &self.pending else {
            trace!(session = self.id, "ack {} with nothing in flight", length);
            return;
        };

        if length <= self.write_position + pending.length {
            // a partial ack releases the acknowledged prefix; the remainder
            //  is repacked from write_position by the next send
            let newly_acked = (length - self.write_position) as usize;
            self.outgoing.drain(..newly_acked);
            self.write_position = length;
            self.pending = None;
            self.last_ack = length;
            self.drive_send().await;
        }
    }

    async fn drive_send(&mut self) {
        if self.pending.is_some() || self.outgoing.is_empty() {
            return;
        }

        let (message, consumed) = message::pack_data(self.id, self.write_position, &self.outgoing);
        let now = Instant::now();
        self.max_ack = self.write_position + consumed as u32;
        self.pending = Some(PendingData {
            length: consumed as u32,
            sent_at: now,
            retransmit_at: now + self.config.retransmit_interval,
            message: message.clone(),
        });

        trace!(session = self.id, "sending {} bytes at position {}", consumed, self.write_position);
        self.sink.send(&message, self.peer).await;
    }

    async fn on_retransmit_timer(&mut self) {
        let (message, first_sent_at) = match &self.pending {
            Some(pending) => (pending.message.clone(), pending.sent_at),
            None => return,
        };

        if first_sent_at.elapsed() > self.config.session_expiry {
            warn!(
                session = self.id,
                "no ack progress within {:?}, giving up on the session",
                self.config.session_expiry
            );
            self.close().await;
            return;
        }

        if let Some(pending) = &mut self.pending {
            pending.retransmit_at = Instant::now() + self.config.retransmit_interval;
        }
        trace!(session = self.id, "retransmitting in-flight data");
        self.sink.send(&message, self.peer).await;
    }

    async fn send_ack(&self, length: u32) {
        self.sink.send(&Message::Ack { session: self.id, length }, self.peer).await;
    }

    async fn close(&mut self) {
        self.sink.send(&Message::Close { session: self.id }, self.peer).await;
        self.closed = true;
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
