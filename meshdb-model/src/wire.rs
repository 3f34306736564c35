//! Wire codec for gossip messages
//!
//! Every message is a type byte followed by a fixed field layout:
//! integers big-endian, strings prefixed with a `u16` length, blobs
//! with a `u32` length. The membership substrate supplies the outer
//! framing, retransmission and encryption; this codec only deals with
//! application payloads.

use crate::event::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Compound framing: type byte plus `u8` message count.
pub const COMPOUND_HEADER_OVERHEAD: usize = 2;
/// Per-message overhead inside a compound: the `u16` length prefix.
pub const COMPOUND_OVERHEAD: usize = 2;

/// Maximum number of messages a single compound can carry (`u8` count).
const COMPOUND_MAX_MSGS: usize = u8::MAX as usize;

const TYPE_NETWORK_EVENT: u8 = 1;
const TYPE_TABLE_EVENT: u8 = 2;
const TYPE_PUSH_PULL: u8 = 3;
const TYPE_BULK_SYNC: u8 = 4;
const TYPE_COMPOUND: u8 = 5;
const TYPE_NODE_EVENT: u8 = 6;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("message truncated")]
    Truncated,
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("unknown event type {0}")]
    UnknownEventType(u8),
    #[error("invalid utf-8 in string field")]
    InvalidString,
}

// ==================== Encoding ====================

fn put_string(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize);
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_blob(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
}

/// Encode a message to its wire form.
pub fn encode_message(msg: &Message) -> Bytes {
    let mut buf = BytesMut::new();
    match msg {
        Message::Network(ev) => {
            buf.put_u8(TYPE_NETWORK_EVENT);
            buf.put_u8(ev.event as u8);
            put_string(&mut buf, &ev.node);
            put_string(&mut buf, &ev.network_id);
            buf.put_u64(ev.ltime);
        }
        Message::Node(ev) => {
            buf.put_u8(TYPE_NODE_EVENT);
            buf.put_u8(ev.event as u8);
            put_string(&mut buf, &ev.node);
            buf.put_u64(ev.ltime);
        }
        Message::Table(ev) => {
            buf.put_u8(TYPE_TABLE_EVENT);
            buf.put_u8(ev.event as u8);
            buf.put_u64(ev.ltime);
            put_string(&mut buf, &ev.node);
            put_string(&mut buf, &ev.network_id);
            put_string(&mut buf, &ev.table);
            put_string(&mut buf, &ev.key);
            put_blob(&mut buf, &ev.value);
            buf.put_i32(ev.residual_reap_secs);
        }
        Message::PushPull(pp) => {
            buf.put_u8(TYPE_PUSH_PULL);
            buf.put_u64(pp.ltime);
            put_string(&mut buf, &pp.node);
            buf.put_u16(pp.networks.len() as u16);
            for entry in &pp.networks {
                put_string(&mut buf, &entry.network_id);
                put_string(&mut buf, &entry.node);
                buf.put_u64(entry.ltime);
                buf.put_u8(entry.leaving as u8);
            }
        }
        Message::BulkSync(bs) => {
            buf.put_u8(TYPE_BULK_SYNC);
            buf.put_u64(bs.ltime);
            buf.put_u8(bs.unsolicited as u8);
            put_string(&mut buf, &bs.node);
            buf.put_u16(bs.networks.len() as u16);
            for nid in &bs.networks {
                put_string(&mut buf, nid);
            }
            put_blob(&mut buf, &bs.payload);
        }
        Message::Compound(msgs) => {
            buf.put_u8(TYPE_COMPOUND);
            buf.put_u8(msgs.len() as u8);
            for m in msgs {
                buf.put_u16(m.len() as u16);
                buf.put_slice(m);
            }
        }
    }
    buf.freeze()
}

/// Frame up to 255 already-encoded messages into one compound message.
pub fn make_compound(msgs: &[Bytes]) -> Bytes {
    debug_assert!(msgs.len() <= COMPOUND_MAX_MSGS);
    encode_message(&Message::Compound(msgs.to_vec()))
}

/// Frame an arbitrary number of messages as a sequence of compound
/// messages, each holding at most 255. Bulk-sync payloads concatenate
/// the chunks back to back; [`decode_compound_stream`] undoes this.
pub fn make_compound_chunks(msgs: &[Bytes]) -> Bytes {
    let mut out = BytesMut::new();
    for chunk in msgs.chunks(COMPOUND_MAX_MSGS) {
        out.put_slice(&make_compound(chunk));
    }
    out.freeze()
}

// ==================== Decoding ====================

fn take_u8(buf: &mut &[u8]) -> Result<u8, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut &[u8]) -> Result<u16, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u16())
}

fn take_u64(buf: &mut &[u8]) -> Result<u64, WireError> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u64())
}

fn take_i32(buf: &mut &[u8]) -> Result<i32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_i32())
}

fn take_string(buf: &mut &[u8]) -> Result<String, WireError> {
    let len = take_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| WireError::InvalidString)?
        .to_owned();
    buf.advance(len);
    Ok(s)
}

fn take_blob(buf: &mut &[u8]) -> Result<Bytes, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let b = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(b)
}

fn decode_compound(buf: &mut &[u8]) -> Result<Vec<Bytes>, WireError> {
    let count = take_u8(buf)? as usize;
    let mut msgs = Vec::with_capacity(count);
    for _ in 0..count {
        let len = take_u16(buf)? as usize;
        if buf.remaining() < len {
            return Err(WireError::Truncated);
        }
        msgs.push(Bytes::copy_from_slice(&buf[..len]));
        buf.advance(len);
    }
    Ok(msgs)
}

/// Decode a single wire message.
pub fn decode_message(mut buf: &[u8]) -> Result<Message, WireError> {
    let buf = &mut buf;
    match take_u8(buf)? {
        TYPE_NETWORK_EVENT => {
            let event = match take_u8(buf)? {
                0 => NetworkEventType::Join,
                1 => NetworkEventType::Leave,
                other => return Err(WireError::UnknownEventType(other)),
            };
            Ok(Message::Network(NetworkEvent {
                event,
                node: take_string(buf)?,
                network_id: take_string(buf)?,
                ltime: take_u64(buf)?,
            }))
        }
        TYPE_NODE_EVENT => {
            let event = match take_u8(buf)? {
                0 => NodeEventType::Join,
                1 => NodeEventType::Leave,
                other => return Err(WireError::UnknownEventType(other)),
            };
            Ok(Message::Node(NodeEvent {
                event,
                node: take_string(buf)?,
                ltime: take_u64(buf)?,
            }))
        }
        TYPE_TABLE_EVENT => {
            let event = match take_u8(buf)? {
                0 => TableEventType::Create,
                1 => TableEventType::Update,
                2 => TableEventType::Delete,
                other => return Err(WireError::UnknownEventType(other)),
            };
            Ok(Message::Table(TableEvent {
                event,
                ltime: take_u64(buf)?,
                node: take_string(buf)?,
                network_id: take_string(buf)?,
                table: take_string(buf)?,
                key: take_string(buf)?,
                value: take_blob(buf)?,
                residual_reap_secs: take_i32(buf)?,
            }))
        }
        TYPE_PUSH_PULL => {
            let ltime = take_u64(buf)?;
            let node = take_string(buf)?;
            let count = take_u16(buf)? as usize;
            let mut networks = Vec::with_capacity(count);
            for _ in 0..count {
                networks.push(NetworkEntry {
                    network_id: take_string(buf)?,
                    node: take_string(buf)?,
                    ltime: take_u64(buf)?,
                    leaving: take_u8(buf)? != 0,
                });
            }
            Ok(Message::PushPull(NetworkPushPull {
                ltime,
                node,
                networks,
            }))
        }
        TYPE_BULK_SYNC => {
            let ltime = take_u64(buf)?;
            let unsolicited = take_u8(buf)? != 0;
            let node = take_string(buf)?;
            let count = take_u16(buf)? as usize;
            let mut networks = Vec::with_capacity(count);
            for _ in 0..count {
                networks.push(take_string(buf)?);
            }
            Ok(Message::BulkSync(BulkSyncMessage {
                ltime,
                unsolicited,
                node,
                networks,
                payload: take_blob(buf)?,
            }))
        }
        TYPE_COMPOUND => Ok(Message::Compound(decode_compound(buf)?)),
        other => Err(WireError::UnknownMessageType(other)),
    }
}

/// Decode a concatenation of compound messages, as produced by
/// [`make_compound_chunks`], into the flat list of enclosed messages.
pub fn decode_compound_stream(mut buf: &[u8]) -> Result<Vec<Bytes>, WireError> {
    let buf = &mut buf;
    let mut out = Vec::new();
    while !buf.is_empty() {
        match take_u8(buf)? {
            TYPE_COMPOUND => out.append(&mut decode_compound(buf)?),
            other => return Err(WireError::UnknownMessageType(other)),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_event(key: &str, ltime: u64) -> TableEvent {
        TableEvent {
            event: TableEventType::Create,
            ltime,
            node: "node-a".into(),
            network_id: "net-1".into(),
            table: "endpoints".into(),
            key: key.into(),
            value: Bytes::from_static(b"payload"),
            residual_reap_secs: 0,
        }
    }

    #[test]
    fn table_event_roundtrip() {
        let ev = TableEvent {
            event: TableEventType::Delete,
            ltime: 99,
            node: "node-b".into(),
            network_id: "net-2".into(),
            table: "overlay_peers".into(),
            key: "10.0.0.3".into(),
            value: Bytes::from_static(b"mac=02:42:0a:00:00:03"),
            residual_reap_secs: 1799,
        };
        let buf = encode_message(&Message::Table(ev.clone()));
        assert_eq!(decode_message(&buf).unwrap(), Message::Table(ev));
    }

    #[test]
    fn network_and_node_event_roundtrip() {
        let nev = NetworkEvent {
            event: NetworkEventType::Leave,
            node: "node-a".into(),
            network_id: "net-1".into(),
            ltime: 7,
        };
        let buf = encode_message(&Message::Network(nev.clone()));
        assert_eq!(decode_message(&buf).unwrap(), Message::Network(nev));

        let nodev = NodeEvent {
            event: NodeEventType::Join,
            node: "node-c".into(),
            ltime: 3,
        };
        let buf = encode_message(&Message::Node(nodev.clone()));
        assert_eq!(decode_message(&buf).unwrap(), Message::Node(nodev));
    }

    #[test]
    fn bulk_sync_roundtrip() {
        let inner = encode_message(&Message::Table(table_event("k", 5)));
        let bs = BulkSyncMessage {
            ltime: 42,
            unsolicited: true,
            node: "node-a".into(),
            networks: vec!["net-1".into(), "net-2".into()],
            payload: make_compound_chunks(&[inner]),
        };
        let buf = encode_message(&Message::BulkSync(bs.clone()));
        assert_eq!(decode_message(&buf).unwrap(), Message::BulkSync(bs));
    }

    #[test]
    fn push_pull_roundtrip() {
        let pp = NetworkPushPull {
            ltime: 12,
            node: "node-a".into(),
            networks: vec![
                NetworkEntry {
                    network_id: "net-1".into(),
                    node: "node-a".into(),
                    ltime: 4,
                    leaving: false,
                },
                NetworkEntry {
                    network_id: "net-2".into(),
                    node: "node-b".into(),
                    ltime: 9,
                    leaving: true,
                },
            ],
        };
        let buf = encode_message(&Message::PushPull(pp.clone()));
        assert_eq!(decode_message(&buf).unwrap(), Message::PushPull(pp));
    }

    #[test]
    fn compound_stream_spans_chunks() {
        // 300 messages forces two compound chunks (255 + 45)
        let msgs: Vec<Bytes> = (0..300)
            .map(|i| encode_message(&Message::Table(table_event(&format!("k{i}"), i))))
            .collect();
        let stream = make_compound_chunks(&msgs);
        let decoded = decode_compound_stream(&stream).unwrap();
        assert_eq!(decoded, msgs);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let buf = encode_message(&Message::Table(table_event("k", 1)));
        assert!(matches!(
            decode_message(&buf[..buf.len() - 3]),
            Err(WireError::Truncated)
        ));
        assert!(matches!(decode_message(&[]), Err(WireError::Truncated)));
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(matches!(
            decode_message(&[0xAB, 0, 0]),
            Err(WireError::UnknownMessageType(0xAB))
        ));
    }
}
