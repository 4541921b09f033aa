use std::io::{ErrorKind, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::defs::MAX_FRAME_LEN;
use crate::errors::WireError;

/// The kind of a wire message.
///
/// Clients send REGISTER, SALE_START, SALE_END, BUY_REQUEST, LIST_ITEMS and
/// HEARTBEAT; everything else originates at the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Client registration request.
    Register,
    /// Server acknowledgment of a registration.
    Ack,
    /// Sale-start request (from a seller) or its response / broadcast.
    SaleStart,
    /// Sale-end request (from a seller) or its response / broadcast.
    SaleEnd,
    /// Purchase request from a buyer.
    BuyRequest,
    /// Server response to a purchase request.
    BuyResponse,
    /// Request for the list of open sales, and its response.
    ListItems,
    /// Inventory-change broadcast carrying the current sale snapshots.
    StockUpdate,
    /// Error notification.
    Error,
    /// Connection health check; updates the session heartbeat, no reply.
    Heartbeat,
    /// Notification to a seller that one of their sales was purchased from.
    PurchaseNotification,
}

/// A single framed message exchanged between clients and the broker.
///
/// The payload in `data` is a free-form JSON object whose keys depend on the
/// message kind. `sender_id` is the registered client id, `"server"` for
/// broker-originated frames, and absent before registration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// What kind of message this is.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Kind-specific payload.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Who sent the message, if registered.
    #[serde(default, rename = "senderId")]
    pub sender_id: Option<String>,
    /// Sender's wall clock, in milliseconds since the UNIX epoch.
    pub timestamp: u64,
}

impl Message {
    /// Builds a message stamped with the current wall clock.
    ///
    /// `data` is expected to be a JSON object (typically from the
    /// [`serde_json::json!`] macro); anything else yields an empty payload.
    pub fn new(kind: MessageKind, data: Value, sender_id: Option<String>) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            kind,
            data,
            sender_id,
            timestamp: now_millis(),
        }
    }

    /// Builds a broker-originated message with `senderId: "server"`.
    pub fn from_server(kind: MessageKind, data: Value) -> Self {
        Self::new(kind, data, Some("server".to_string()))
    }

    /// Builds an ERROR message carrying a human-readable reason.
    pub fn error_reply(reason: &str) -> Self {
        Self::from_server(MessageKind::Error, serde_json::json!({ "error": reason }))
    }

    /// Extracts a mandatory string field from the payload.
    pub fn str_field(&self, key: &'static str) -> Result<&str, WireError> {
        self.data
            .get(key)
            .and_then(Value::as_str)
            .ok_or(WireError::MissingField(key))
    }

    /// Extracts a mandatory numeric field from the payload.
    pub fn f64_field(&self, key: &'static str) -> Result<f64, WireError> {
        self.data
            .get(key)
            .and_then(Value::as_f64)
            .ok_or(WireError::MissingField(key))
    }
}

/// Current wall clock in milliseconds since the UNIX epoch.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Writes one message as a length-prefixed frame.
///
/// The envelope is serialized to JSON and preceded by its byte length as a
/// 4-byte big-endian integer. The writer is flushed so the frame hits the
/// wire immediately.
pub fn write_frame<W: Write>(writer: &mut W, message: &Message) -> Result<(), WireError> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(WireError::Oversize(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one length-prefixed frame, blocking until it is complete.
///
/// A clean end-of-stream before or between frames surfaces as
/// [`WireError::Closed`]. Intended for readers without a socket timeout;
/// session read loops use [`FrameReader`] instead.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Message, WireError> {
    let mut len_buf = [0u8; 4];
    read_exact_or_closed(reader, &mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::Oversize(len));
    }
    let mut payload = vec![0u8; len];
    read_exact_or_closed(reader, &mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}

fn read_exact_or_closed<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), WireError> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            WireError::Closed
        } else {
            WireError::Io(e)
        }
    })
}

/// Incremental frame reader for sockets with a read timeout.
///
/// A plain `read_exact` loses partial bytes when the socket times out in
/// the middle of a frame. `FrameReader` keeps its progress across timeouts:
/// [`poll_frame`](Self::poll_frame) returns `Ok(None)` on a timeout tick and
/// picks up exactly where it left off on the next call.
#[derive(Debug)]
pub struct FrameReader<R: Read> {
    inner: R,
    buf: Vec<u8>,
    filled: usize,
    /// Payload length once the prefix has been read; `None` while the
    /// 4-byte prefix itself is still incomplete.
    payload_len: Option<usize>,
}

impl<R: Read> FrameReader<R> {
    /// Wraps a readable stream. The stream's read timeout (if any) drives
    /// the polling granularity.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0u8; 4],
            filled: 0,
            payload_len: None,
        }
    }

    /// Tries to complete the next frame.
    ///
    /// Returns `Ok(Some(message))` when a full frame has been read,
    /// `Ok(None)` when the underlying read timed out first, and an error on
    /// end-of-stream ([`WireError::Closed`]), I/O failure, an oversized
    /// frame, or an undecodable payload.
    pub fn poll_frame(&mut self) -> Result<Option<Message>, WireError> {
        loop {
            let need = self.payload_len.unwrap_or(4);
            while self.filled < need {
                match self.inner.read(&mut self.buf[self.filled..need]) {
                    Ok(0) => return Err(WireError::Closed),
                    Ok(n) => self.filled += n,
                    Err(e)
                        if e.kind() == ErrorKind::WouldBlock
                            || e.kind() == ErrorKind::TimedOut =>
                    {
                        return Ok(None);
                    }
                    Err(e) => return Err(WireError::Io(e)),
                }
            }

            match self.payload_len {
                None => {
                    let len =
                        u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                            as usize;
                    if len > MAX_FRAME_LEN {
                        return Err(WireError::Oversize(len));
                    }
                    self.payload_len = Some(len);
                    self.filled = 0;
                    self.buf.resize(len.max(4), 0);
                }
                Some(len) => {
                    let message = serde_json::from_slice(&self.buf[..len])?;
                    self.payload_len = None;
                    self.filled = 0;
                    self.buf.resize(4, 0);
                    return Ok(Some(message));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn test_frame_round_trip() {
        let msg = Message::new(
            MessageKind::BuyRequest,
            json!({ "itemId": "sale_ab12cd34_1", "quantity": 12.5 }),
            Some("ab12cd34".to_string()),
        );

        let mut wire = Vec::new();
        write_frame(&mut wire, &msg).unwrap();

        let decoded = read_frame(&mut Cursor::new(wire)).unwrap();
        assert_eq!(decoded.kind, MessageKind::BuyRequest);
        assert_eq!(decoded.sender_id.as_deref(), Some("ab12cd34"));
        assert_eq!(decoded.str_field("itemId").unwrap(), "sale_ab12cd34_1");
        assert_eq!(decoded.f64_field("quantity").unwrap(), 12.5);
    }

    #[test]
    fn test_kind_uses_wire_names() {
        let msg = Message::from_server(MessageKind::PurchaseNotification, json!({}));
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains("\"PURCHASE_NOTIFICATION\""));
        assert!(encoded.contains("\"senderId\":\"server\""));
    }

    #[test]
    fn test_oversize_frame_is_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&((MAX_FRAME_LEN + 1) as u32).to_be_bytes());
        let err = read_frame(&mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, WireError::Oversize(_)));
    }

    #[test]
    fn test_eof_between_frames_is_closed() {
        let err = read_frame(&mut Cursor::new(Vec::new())).unwrap_err();
        assert!(matches!(err, WireError::Closed));
    }

    #[test]
    fn test_missing_field_is_reported() {
        let msg = Message::new(MessageKind::BuyRequest, json!({}), None);
        let err = msg.f64_field("quantity").unwrap_err();
        assert!(matches!(err, WireError::MissingField("quantity")));
    }

    #[test]
    fn test_frame_reader_handles_split_frames() {
        let msg = Message::from_server(MessageKind::Ack, json!({ "clientId": "ab12cd34" }));
        let mut wire = Vec::new();
        write_frame(&mut wire, &msg).unwrap();
        write_frame(&mut wire, &msg).unwrap();

        // Feed the bytes one at a time through a reader that reports
        // WouldBlock after each byte, the worst case for a timed socket.
        struct Trickle {
            data: Vec<u8>,
            pos: usize,
            ready: bool,
        }
        impl Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.pos >= self.data.len() {
                    return Ok(0);
                }
                if !self.ready {
                    self.ready = true;
                    return Err(std::io::Error::from(ErrorKind::WouldBlock));
                }
                self.ready = false;
                buf[0] = self.data[self.pos];
                self.pos += 1;
                Ok(1)
            }
        }

        let mut reader = FrameReader::new(Trickle {
            data: wire,
            pos: 0,
            ready: false,
        });

        let mut frames = Vec::new();
        loop {
            match reader.poll_frame() {
                Ok(Some(m)) => frames.push(m),
                Ok(None) => continue,
                Err(WireError::Closed) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind, MessageKind::Ack);
        assert_eq!(frames[1].str_field("clientId").unwrap(), "ab12cd34");
    }
}
