use std::net::SocketAddr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace};

use crate::config::Config;
use crate::lrcp::message::Message;
use crate::lrcp::session::{Session, SessionHandle, SessionMsg};
use crate::lrcp::sink::{DatagramSink, UdpSink};


/// UDP front door: receives datagrams, decodes them, and routes them to the
///  owning session actor. Runs until the process ends.
pub async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    let socket = Arc::new(UdpSocket::bind(("0.0.0.0", config.lrcp_port)).await?);
    info!("lrcp line reversal listening on port {}/udp", config.lrcp_port);

    let sink: Arc<dyn DatagramSink> = Arc::new(UdpSink::new(socket.clone()));
    let mut registry = SessionRegistry::new(sink, config.clone());

    let mut buf = vec![0u8; config.max_datagram_size + 1];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                error!("socket error: {}", e);
                continue;
            }
        };
        if len > config.max_datagram_size {
            debug!("dropping over-long datagram ({} bytes) from {}", len, peer);
            continue;
        }
        let message = match Message::parse(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                debug!("dropping malformed datagram from {}: {}", peer, e);
                continue;
            }
        };
        registry.dispatch(message, peer).await;
    }
}

/// Owns the session id -> actor map. Single task, so no locking: all
///  routing decisions happen on the pump task.
pub struct SessionRegistry {
    sessions: FxHashMap<u32, SessionHandle>,
    sink: Arc<dyn DatagramSink>,
    config: Arc<Config>,
}

impl SessionRegistry {
    pub fn new(sink: Arc<dyn DatagramSink>, config: Arc<Config>) -> SessionRegistry {
        SessionRegistry {
            sessions: Default::default(),
            sink,
            config,
        }
    }

    pub async fn dispatch(&mut self, message: Message, peer: SocketAddr) {
        match message {
            Message::Connect { session } => self.on_connect(session, peer).await,
            Message::Data { session, position, payload } => {
                self.forward(session, SessionMsg::Data { position, payload, peer }, peer).await;
            }
            Message::Ack { session, length } => {
                self.forward(session, SessionMsg::Ack { length, peer }, peer).await;
            }
            Message::Close { session } => {
                self.forward(session, SessionMsg::Close { peer }, peer).await;
            }
        }
    }

    async fn on_connect(&mut self, session: u32, peer: SocketAddr) {
        // a session whose actor has exited counts as gone: connects for its
        //  id start over with fresh state
        let recreate = match self.sessions.get(&session) {
            Some(handle) => handle.tx.is_closed(),
            None => true,
        };
        if recreate {
            debug!("creating session {} for {}", session, peer);
            let handle = Session::spawn(session, peer, self.sink.clone(), self.config.clone());
            self.sessions.insert(session, handle);
        }
        self.forward(session, SessionMsg::Connect { peer }, peer).await;
    }

    async fn forward(&mut self, session: u32, msg: SessionMsg, peer: SocketAddr) {
        let alive = match self.sessions.get(&session) {
            Some(handle) => handle.tx.send(msg).await.is_ok(),
            None => false,
        };
        if !alive {
            trace!("no live session {}, answering {} with a close", session, peer);
            self.sessions.remove(&session);
            self.sink.send(&Message::Close { session }, peer).await;
        }
    }
}


#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time;

    use super::*;
    use crate::lrcp::sink::testing::RecordingSink;

    fn peer() -> SocketAddr {
        "10.0.0.1:30000".parse().unwrap()
    }

    fn registry() -> (SessionRegistry, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let dyn_sink: Arc<dyn DatagramSink> = sink.clone();
        (SessionRegistry::new(dyn_sink, Arc::new(Config::new())), sink)
    }

    async fn settle() {
        time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_creates_a_session_and_acks_zero() {
        let (mut registry, sink) = registry();

        registry.dispatch(Message::Connect { session: 5 }, peer()).await;
        settle().await;

        assert_eq!(sink.take(), vec![Message::Ack { session: 5, length: 0 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_packets_for_unknown_sessions_are_answered_with_close() {
        let (mut registry, sink) = registry();

        registry
            .dispatch(Message::Data { session: 7, position: 0, payload: b"x".to_vec() }, peer())
            .await;
        registry.dispatch(Message::Ack { session: 8, length: 3 }, peer()).await;
        settle().await;

        assert_eq!(sink.take(), vec![
            Message::Close { session: 7 },
            Message::Close { session: 8 },
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_sessions_are_reaped_and_reanswered_with_close() {
        let (mut registry, sink) = registry();

        registry.dispatch(Message::Connect { session: 5 }, peer()).await;
        settle().await;
        registry.dispatch(Message::Close { session: 5 }, peer()).await;
        settle().await;
        assert_eq!(sink.take(), vec![
            Message::Ack { session: 5, length: 0 },
            Message::Close { session: 5 },
        ]);

        // the actor is gone: new data for the id is refused
        registry
            .dispatch(Message::Data { session: 5, position: 0, payload: b"x\n".to_vec() }, peer())
            .await;
        settle().await;
        assert_eq!(sink.take(), vec![Message::Close { session: 5 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_after_close_starts_a_fresh_session() {
        let (mut registry, sink) = registry();

        registry.dispatch(Message::Connect { session: 5 }, peer()).await;
        settle().await;
        registry.dispatch(Message::Close { session: 5 }, peer()).await;
        settle().await;
        let _ = sink.take();

        registry.dispatch(Message::Connect { session: 5 }, peer()).await;
        settle().await;
        assert_eq!(sink.take(), vec![Message::Ack { session: 5, length: 0 }]);
    }
}
