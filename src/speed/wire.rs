use bytes::{Buf, BufMut, BytesMut};
use num_enum::TryFromPrimitive;
use thiserror::Error;

use crate::util::buf::{BufError, BufExt};


#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Error = 0x10,
    Plate = 0x20,
    Ticket = 0x21,
    WantHeartbeat = 0x40,
    Heartbeat = 0x41,
    IAmCamera = 0x80,
    IAmDispatcher = 0x81,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// not enough bytes buffered yet; decide again after the next read
    #[error("frame is incomplete")]
    Incomplete,
    /// the peer is misbehaving; report and hang up
    #[error("invalid frame: {0}")]
    Invalid(&'static str),
}

impl From<BufError> for DecodeError {
    fn from(e: BufError) -> DecodeError {
        match e {
            BufError::Underflow => DecodeError::Incomplete,
            BufError::Malformed(reason) => DecodeError::Invalid(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Plate { plate: String, timestamp: u32 },
    WantHeartbeat { interval: u32 },
    IAmCamera { road: u16, mile: u16, limit: u16 },
    IAmDispatcher { roads: Vec<u16> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Error { message: String },
    Ticket(Ticket),
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub plate: String,
    pub road: u16,
    pub mile1: u16,
    pub timestamp1: u32,
    pub mile2: u16,
    pub timestamp2: u32,
    /// hundredths of miles per hour
    pub speed: u16,
}

impl ClientMessage {
    pub fn decode(buf: &mut impl Buf) -> Result<ClientMessage, DecodeError> {
        let type_byte = buf.try_get_u8()?;
        let message_type = MessageType::try_from_primitive(type_byte)
            .map_err(|_| DecodeError::Invalid("unknown message type"))?;

        match message_type {
            MessageType::Plate => Ok(ClientMessage::Plate {
                plate: buf.try_get_lp_string()?,
                timestamp: buf.try_get_u32()?,
            }),
            MessageType::WantHeartbeat => Ok(ClientMessage::WantHeartbeat {
                interval: buf.try_get_u32()?,
            }),
            MessageType::IAmCamera => Ok(ClientMessage::IAmCamera {
                road: buf.try_get_u16()?,
                mile: buf.try_get_u16()?,
                limit: buf.try_get_u16()?,
            }),
            MessageType::IAmDispatcher => {
                let count = buf.try_get_u8()?;
                let mut roads = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    roads.push(buf.try_get_u16()?);
                }
                Ok(ClientMessage::IAmDispatcher { roads })
            }
            MessageType::Error | MessageType::Ticket | MessageType::Heartbeat => {
                Err(DecodeError::Invalid("message type is server to client only"))
            }
        }
    }
}

/// Pops one complete frame off the front of `buffer`, or leaves it untouched
///  if the bytes read so far do not form one yet.
pub fn extract(buffer: &mut BytesMut) -> Result<Option<ClientMessage>, DecodeError> {
    let mut view: &[u8] = buffer;
    let before = view.len();
    match ClientMessage::decode(&mut view) {
        Ok(message) => {
            let consumed = before - view.len();
            buffer.advance(consumed);
            Ok(Some(message))
        }
        Err(DecodeError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

impl ServerMessage {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            ServerMessage::Error { message } => {
                buf.put_u8(MessageType::Error as u8);
                put_lp_string(buf, message);
            }
            ServerMessage::Heartbeat => {
                buf.put_u8(MessageType::Heartbeat as u8);
            }
            ServerMessage::Ticket(ticket) => {
                buf.put_u8(MessageType::Ticket as u8);
                put_lp_string(buf, &ticket.plate);
                buf.put_u16(ticket.road);
                buf.put_u16(ticket.mile1);
                buf.put_u32(ticket.timestamp1);
                buf.put_u16(ticket.mile2);
                buf.put_u32(ticket.timestamp2);
                buf.put_u16(ticket.speed);
            }
        }
    }
}

fn put_lp_string(buf: &mut BytesMut, s: &str) {
    // plates echo back client strings that were u8-length on the wire; our
    //  own error texts are short, so truncation never fires in practice
    let len = s.len().min(u8::MAX as usize);
    buf.put_u8(len as u8);
    buf.put_slice(&s.as_bytes()[..len]);
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::plate(
        b"\x20\x04UN1X\x00\x00\x03\xe8".to_vec(),
        Ok(Some(ClientMessage::Plate { plate: "UN1X".to_string(), timestamp: 1000 })),
        0
    )]
    #[case::want_heartbeat(
        b"\x40\x00\x00\x00\x0a".to_vec(),
        Ok(Some(ClientMessage::WantHeartbeat { interval: 10 })),
        0
    )]
    #[case::camera(
        b"\x80\x00\x42\x00\x64\x00\x3c".to_vec(),
        Ok(Some(ClientMessage::IAmCamera { road: 66, mile: 100, limit: 60 })),
        0
    )]
    #[case::dispatcher(
        b"\x81\x03\x00\x42\x01\x70\x13\x88".to_vec(),
        Ok(Some(ClientMessage::IAmDispatcher { roads: vec![66, 368, 5000] })),
        0
    )]
    #[case::dispatcher_no_roads(
        b"\x81\x00".to_vec(),
        Ok(Some(ClientMessage::IAmDispatcher { roads: vec![] })),
        0
    )]
    #[case::trailing_bytes_stay(
        b"\x40\x00\x00\x00\x0a\x20\x04".to_vec(),
        Ok(Some(ClientMessage::WantHeartbeat { interval: 10 })),
        2
    )]
    #[case::incomplete_header(b"\x20".to_vec(), Ok(None), 1)]
    #[case::incomplete_plate(b"\x20\x04UN".to_vec(), Ok(None), 4)]
    #[case::incomplete_road_list(b"\x81\x02\x00\x42".to_vec(), Ok(None), 4)]
    #[case::empty(b"".to_vec(), Ok(None), 0)]
    #[case::unknown_type(b"\x99\x01".to_vec(), Err(DecodeError::Invalid("unknown message type")), 2)]
    #[case::server_only_type(b"\x41".to_vec(), Err(DecodeError::Invalid("message type is server to client only")), 1)]
    fn test_extract(
        #[case] bytes: Vec<u8>,
        #[case] expected: Result<Option<ClientMessage>, DecodeError>,
        #[case] remaining: usize,
    ) {
        let mut buffer = BytesMut::from(&bytes[..]);
        assert_eq!(extract(&mut buffer), expected);
        assert_eq!(buffer.len(), remaining);
    }

    #[test]
    fn test_extract_drains_back_to_back_frames() {
        let mut buffer = BytesMut::from(&b"\x80\x00\x01\x00\x02\x00\x03\x40\x00\x00\x00\x19\x20"[..]);

        assert_eq!(
            extract(&mut buffer),
            Ok(Some(ClientMessage::IAmCamera { road: 1, mile: 2, limit: 3 }))
        );
        assert_eq!(
            extract(&mut buffer),
            Ok(Some(ClientMessage::WantHeartbeat { interval: 25 }))
        );
        // the split plate frame stays buffered for the next read
        assert_eq!(extract(&mut buffer), Ok(None));
        assert_eq!(buffer.len(), 1);
    }

    #[rstest]
    #[case::heartbeat(ServerMessage::Heartbeat, b"\x41".to_vec())]
    #[case::error(
        ServerMessage::Error { message: "bad".to_string() },
        b"\x10\x03bad".to_vec()
    )]
    #[case::ticket(
        ServerMessage::Ticket(Ticket {
            plate: "UN1X".to_string(),
            road: 66,
            mile1: 100,
            timestamp1: 123456,
            mile2: 110,
            timestamp2: 123816,
            speed: 10000,
        }),
        b"\x21\x04UN1X\x00\x42\x00\x64\x00\x01\xe2\x40\x00\x6e\x00\x01\xe3\xa8\x27\x10".to_vec()
    )]
    fn test_encode(#[case] message: ServerMessage, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        message.encode(&mut buf);
        assert_eq!(buf.to_vec(), expected);
    }
}
