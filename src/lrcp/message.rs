use std::fmt::Write as _;

use anyhow::bail;
use bytes::{BufMut, BytesMut};

/// numeric wire fields are unsigned decimal and must fit the 31-bit signed range
pub const MAX_NUMERIC: u64 = i32::MAX as u64;

/// hard bound on the wire size of a message, envelope included
pub const MAX_WIRE_SIZE: usize = 1000;

/// `/data/` plus the slash after each numeric field and the closing slash
const DATA_ENVELOPE_OVERHEAD: usize = 9;


/// A single LRCP datagram. The `Data` payload is kept in wire form, i.e.
///  still escaped; sessions unescape on receive and [pack_data] escapes on
///  send, so encoding a message is always a plain copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Connect { session: u32 },
    Data { session: u32, position: u32, payload: Vec<u8> },
    Ack { session: u32, length: u32 },
    Close { session: u32 },
}

impl Message {
    pub fn parse(raw: &[u8]) -> anyhow::Result<Message> {
        if raw.len() > MAX_WIRE_SIZE {
            bail!("message of {} bytes exceeds the {} byte envelope", raw.len(), MAX_WIRE_SIZE);
        }
        if raw.len() < 2 || raw[0] != b'/' || raw[raw.len() - 1] != b'/' {
            bail!("message must start and end with '/'");
        }

        let fields = split_fields(&raw[1..raw.len() - 1]);
        match fields[0] {
            b"connect" => {
                expect_field_count(&fields, 2)?;
                Ok(Message::Connect { session: parse_number(fields[1])? })
            }
            b"close" => {
                expect_field_count(&fields, 2)?;
                Ok(Message::Close { session: parse_number(fields[1])? })
            }
            b"ack" => {
                expect_field_count(&fields, 3)?;
                Ok(Message::Ack {
                    session: parse_number(fields[1])?,
                    length: parse_number(fields[2])?,
                })
            }
            b"data" => {
                expect_field_count(&fields, 4)?;
                let session = parse_number(fields[1])?;
                let position = parse_number(fields[2])?;
                let payload = fields[3].to_vec();
                if position as u64 + payload.len() as u64 > MAX_NUMERIC {
                    bail!("data message would extend the stream past the 31-bit range");
                }
                Ok(Message::Data { session, position, payload })
            }
            other => bail!("unknown message type {:?}", String::from_utf8_lossy(other)),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Message::Connect { session } => {
                let _ = write!(buf, "/connect/{}/", session);
            }
            Message::Ack { session, length } => {
                let _ = write!(buf, "/ack/{}/{}/", session, length);
            }
            Message::Close { session } => {
                let _ = write!(buf, "/close/{}/", session);
            }
            Message::Data { session, position, payload } => {
                let _ = write!(buf, "/data/{}/{}/", session, position);
                buf.put_slice(payload);
                buf.put_u8(b'/');
            }
        }
    }
}

/// Split on unescaped slashes only: a `\` hides the byte after it from the
///  field scanner, whatever it is. A dangling `\` at the end stays in the
///  last field and is reported by [unescape] instead.
fn split_fields(body: &[u8]) -> Vec<&[u8]> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < body.len() {
        match body[i] {
            b'/' => {
                fields.push(&body[start..i]);
                start = i + 1;
                i += 1;
            }
            b'\\' => i += 2,
            _ => i += 1,
        }
    }
    fields.push(&body[start..]);
    fields
}

fn expect_field_count(fields: &[&[u8]], expected: usize) -> anyhow::Result<()> {
    if fields.len() != expected {
        bail!(
            "{} message with {} fields instead of {}",
            String::from_utf8_lossy(fields[0]),
            fields.len(),
            expected
        );
    }
    Ok(())
}

fn parse_number(field: &[u8]) -> anyhow::Result<u32> {
    if field.is_empty() {
        bail!("empty numeric field");
    }
    if !field.iter().all(|b| b.is_ascii_digit()) {
        bail!("numeric field contains non-digit bytes");
    }
    let value: u64 = std::str::from_utf8(field)?.parse()?;
    if value > MAX_NUMERIC {
        bail!("numeric field {} exceeds the 31-bit range", value);
    }
    Ok(value as u32)
}

/// Decode `\/` and `\\` back to the application bytes. A `\` that precedes
///  nothing is a protocol error; a `\` before any other byte is passed
///  through literally.
pub fn unescape(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\\' {
            match data.get(i + 1) {
                Some(b'/') | Some(b'\\') => {
                    out.push(data[i + 1]);
                    i += 2;
                }
                Some(_) => {
                    out.push(b'\\');
                    i += 1;
                }
                None => bail!("dangling escape at the end of a data payload"),
            }
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    Ok(out)
}

pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        if b == b'/' || b == b'\\' {
            out.push(b'\\');
        }
        out.push(b);
    }
    out
}

/// Packs as much of `source` as fits one data message, escaping on the way:
///  the escaped payload plus the envelope must stay within [MAX_WIRE_SIZE].
///  Returns the message and the count of source (unescaped) bytes it carries.
pub fn pack_data(session: u32, position: u32, source: &[u8]) -> (Message, usize) {
    let budget =
        MAX_WIRE_SIZE - (DATA_ENVELOPE_OVERHEAD + decimal_digits(session) + decimal_digits(position));

    let mut payload = Vec::with_capacity(source.len().min(budget));
    let mut used = 0;
    let mut consumed = 0;
    for &b in source {
        let cost = if b == b'/' || b == b'\\' { 2 } else { 1 };
        if used + cost > budget {
            break;
        }
        if cost == 2 {
            payload.push(b'\\');
        }
        payload.push(b);
        used += cost;
        consumed += 1;
    }

    (Message::Data { session, position, payload }, consumed)
}

fn decimal_digits(mut n: u32) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::connect(b"/connect/12345/", Some(Message::Connect { session: 12345 }))]
    #[case::connect_zero(b"/connect/0/", Some(Message::Connect { session: 0 }))]
    #[case::connect_max(b"/connect/2147483647/", Some(Message::Connect { session: 2147483647 }))]
    #[case::connect_too_big(b"/connect/2147483648/", None)]
    #[case::connect_negative(b"/connect/-1/", None)]
    #[case::connect_extra_field(b"/connect/1/2/", None)]
    #[case::close(b"/close/77/", Some(Message::Close { session: 77 }))]
    #[case::ack(b"/ack/12345/6/", Some(Message::Ack { session: 12345, length: 6 }))]
    #[case::ack_missing_length(b"/ack/12345/", None)]
    #[case::ack_empty_length(b"/ack/12345//", None)]
    #[case::data(b"/data/123/0/hello/", Some(Message::Data { session: 123, position: 0, payload: b"hello".to_vec() }))]
    #[case::data_empty_payload(b"/data/123/0//", Some(Message::Data { session: 123, position: 0, payload: b"".to_vec() }))]
    #[case::data_escaped(br"/data/123/0/foo\/\/bar\/\/baz/", Some(Message::Data { session: 123, position: 0, payload: br"foo\/\/bar\/\/baz".to_vec() }))]
    #[case::data_escaped_backslash(br"/data/9/4/a\\b/", Some(Message::Data { session: 9, position: 4, payload: br"a\\b".to_vec() }))]
    #[case::data_unescaped_slash_in_payload(b"/data/123/0/fo/o/", None)]
    #[case::data_past_31_bits(b"/data/1/2147483647/x/", None)]
    #[case::data_hex_position(b"/data/1/0x12/x/", None)]
    #[case::no_leading_slash(b"connect/1/", None)]
    #[case::no_trailing_slash(b"/connect/1", None)]
    #[case::unknown_type(b"/expire/1/", None)]
    #[case::empty(b"//", None)]
    fn test_parse(#[case] raw: &[u8], #[case] expected: Option<Message>) {
        match Message::parse(raw) {
            Ok(actual) => assert_eq!(Some(actual), expected),
            Err(e) => {
                tracing::debug!("parse error: {}", e);
                assert_eq!(expected, None);
            }
        }
    }

    #[test]
    fn test_parse_rejects_oversized_messages() {
        let mut raw = b"/data/1/0/".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_WIRE_SIZE));
        raw.push(b'/');
        assert!(Message::parse(&raw).is_err());
    }

    #[rstest]
    #[case::connect(Message::Connect { session: 5 }, b"/connect/5/")]
    #[case::ack(Message::Ack { session: 12345, length: 6 }, b"/ack/12345/6/")]
    #[case::close(Message::Close { session: 2147483647 }, b"/close/2147483647/")]
    #[case::data(Message::Data { session: 123, position: 9, payload: br"ab\/c".to_vec() }, br"/data/123/9/ab\/c/")]
    fn test_encode(#[case] message: Message, #[case] expected: &[u8]) {
        let mut buf = BytesMut::new();
        message.encode(&mut buf);
        assert_eq!(&buf[..], expected);
    }

    #[rstest]
    #[case::plain(b"hello", Some(b"hello".to_vec()))]
    #[case::escaped_slash(br"foo\/bar", Some(b"foo/bar".to_vec()))]
    #[case::escaped_backslash(br"foo\\bar", Some(br"foo\bar".to_vec()))]
    #[case::spec_example(br"foo\/\/bar\/\/baz", Some(b"foo//bar//baz".to_vec()))]
    #[case::lone_backslash_mid_payload(br"a\zb", Some(br"a\zb".to_vec()))]
    #[case::dangling_escape(br"abc\", None)]
    fn test_unescape(#[case] data: &[u8], #[case] expected: Option<Vec<u8>>) {
        match unescape(data) {
            Ok(actual) => assert_eq!(Some(actual), expected),
            Err(_) => assert_eq!(expected, None),
        }
    }

    #[rstest]
    #[case(b"hello".to_vec())]
    #[case(b"with/slash".to_vec())]
    #[case(br"with\backslash".to_vec())]
    #[case(br"/\/\mixed//".to_vec())]
    #[case(b"".to_vec())]
    fn test_escape_unescape_roundtrip(#[case] data: Vec<u8>) {
        assert_eq!(unescape(&escape(&data)).unwrap(), data);
    }

    #[rstest]
    #[case::all_plain(0, 0, vec![b'a'; 2000], 989)]
    #[case::all_escaped(0, 0, vec![b'/'; 2000], 494)]
    #[case::large_header(2147483647, 2147483647, vec![b'a'; 2000], 971)]
    #[case::small_input(42, 10, b"hi\n".to_vec(), 3)]
    fn test_pack_data_consumption(
        #[case] session: u32,
        #[case] position: u32,
        #[case] source: Vec<u8>,
        #[case] expected_consumed: usize,
    ) {
        let (message, consumed) = pack_data(session, position, &source);
        assert_eq!(consumed, expected_consumed);

        let mut buf = BytesMut::new();
        message.encode(&mut buf);
        assert!(buf.len() <= MAX_WIRE_SIZE, "wire size {} exceeds the envelope", buf.len());

        // the message must survive its own grammar and carry the consumed prefix
        let reparsed = Message::parse(&buf).unwrap();
        match reparsed {
            Message::Data { payload, .. } => {
                assert_eq!(unescape(&payload).unwrap(), source[..consumed].to_vec());
            }
            other => panic!("expected a data message, got {:?}", other),
        }
    }

    #[test]
    fn test_pack_data_makes_progress_on_escaped_bytes() {
        // even at the largest possible header a single escaped byte must fit
        let (message, consumed) = pack_data(2147483647, 2147483647, br"\");
        assert_eq!(consumed, 1);
        match message {
            Message::Data { payload, .. } => assert_eq!(payload, br"\\".to_vec()),
            other => panic!("expected a data message, got {:?}", other),
        }
    }
}
