use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::isl::application::most_copies;
use crate::isl::cipher::{Cipher, CipherError};


pub async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.isl_port)).await?;
    info!("insecure sockets layer listening on port {}/tcp", config.isl_port);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                error!("error accepting connection: {}", e);
                continue;
            }
        };
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer).await {
                debug!("connection from {} ended: {:#}", peer, e);
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
    let (mut read, mut write) = stream.into_split();

    // the cipher spec arrives first, in as many reads as it takes
    let mut buf = BytesMut::with_capacity(4096);
    let cipher = loop {
        match Cipher::parse(&buf) {
            Ok((cipher, consumed)) => {
                buf.advance(consumed);
                break cipher;
            }
            Err(CipherError::Incomplete) => {
                if read.read_buf(&mut buf).await? == 0 {
                    bail!("connection closed before the cipher spec was complete");
                }
            }
            Err(e) => return Err(e.into()),
        }
    };
    if cipher.is_noop() {
        debug!("rejecting no-op cipher from {}", peer);
        return Ok(());
    }

    let mut stream = ToyStream::new(cipher);
    loop {
        // whatever arrived beyond the spec is already stream data
        if !buf.is_empty() {
            stream.feed(&buf);
            buf.clear();
            // each reply goes out as soon as its line is complete, so a bad
            //  line never takes the replies before it down with it
            while let Some(reply) = stream.next_reply() {
                write.write_all(&reply?).await?;
            }
        }
        if read.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
    }
}

/// Decode-side framing plus the reply path. Both position counters are
///  absolute stream offsets and only ever move forward.
struct ToyStream {
    cipher: Cipher,
    inbound_position: u64,
    outbound_position: u64,
    line_buffer: Vec<u8>,
}

impl ToyStream {
    fn new(cipher: Cipher) -> ToyStream {
        ToyStream {
            cipher,
            inbound_position: 0,
            outbound_position: 0,
            line_buffer: Vec::new(),
        }
    }

    fn feed(&mut self, encoded: &[u8]) {
        let decoded = self.cipher.decode_slice(self.inbound_position, encoded);
        self.inbound_position += decoded.len() as u64;
        self.line_buffer.extend_from_slice(&decoded);
    }

    /// The encoded reply for the next complete buffered line, or None until
    ///  more bytes arrive. A malformed line is an error; the caller hangs up.
    fn next_reply(&mut self) -> Option<anyhow::Result<Vec<u8>>> {
        let newline = self.line_buffer.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.line_buffer.drain(..=newline).collect();

        let mut reply = match most_copies(&line) {
            Ok(entry) => entry.to_vec(),
            Err(e) => return Some(Err(e)),
        };
        reply.push(b'\n');

        let encoded = self.cipher.encode_slice(self.outbound_position, &reply);
        self.outbound_position += encoded.len() as u64;
        Some(Ok(encoded))
    }
}
