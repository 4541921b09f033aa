use std::collections::HashMap;
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use crate::defs::SESSION_OUTBOUND_CAPACITY;
use crate::errors::{ServerError, WireError};
use crate::message::{write_frame, Message};

/// The role a client registered as. Determines which operations it may
/// invoke and which broadcasts it receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientRole {
    /// Lists open sales and submits purchase requests.
    Buyer,
    /// Starts and ends sales drawn from a private stock ledger.
    Seller,
}

impl ClientRole {
    /// Parses the wire `clientType` value. Exact match only.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "BUYER" => Some(ClientRole::Buyer),
            "SELLER" => Some(ClientRole::Seller),
            _ => None,
        }
    }

    /// The wire name of the role.
    pub fn name(&self) -> &'static str {
        match self {
            ClientRole::Buyer => "BUYER",
            ClientRole::Seller => "SELLER",
        }
    }
}

/// The registry's view of one connected client.
///
/// Owns the session's outbound side: a bounded frame queue drained by a
/// dedicated writer thread. Responses and broadcasts all flow through the
/// same queue, so a session's outbound stream is FIFO and frames never
/// interleave on the wire.
#[derive(Debug)]
pub struct SessionHandle {
    client_id: String,
    role: ClientRole,
    stream: TcpStream,
    tx: Option<SyncSender<Message>>,
    writer: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Starts the writer thread for a registered client.
    ///
    /// Returns the handle plus a sender the session's own read loop uses
    /// for its replies.
    pub fn spawn(
        client_id: String,
        role: ClientRole,
        stream: TcpStream,
    ) -> Result<(Self, SyncSender<Message>), ServerError> {
        let write_stream = stream
            .try_clone()
            .map_err(|e| ServerError::SessionIo(WireError::Io(e)))?;
        let (tx, rx) = sync_channel(SESSION_OUTBOUND_CAPACITY);

        let id = client_id.clone();
        let writer = thread::spawn(move || writer_loop(&id, write_stream, rx));

        let handle = Self {
            client_id,
            role,
            stream,
            tx: Some(tx.clone()),
            writer: Some(writer),
        };
        Ok((handle, tx))
    }

    /// The registered client id.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The registered role.
    pub fn role(&self) -> ClientRole {
        self.role
    }

    /// Enqueues a frame without blocking.
    ///
    /// Returns `false` when the queue is full or the writer is gone; the
    /// caller treats that as a failed recipient.
    pub fn enqueue(&self, message: Message) -> bool {
        match &self.tx {
            Some(tx) => tx.try_send(message).is_ok(),
            None => false,
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        // Close the queue and unblock any in-flight socket read/write. The
        // writer thread drains what it can and exits on its own; joining
        // here would let a stalled peer block the dropping thread.
        self.tx.take();
        let _ = self.stream.shutdown(Shutdown::Both);
        self.writer.take();
    }
}

fn writer_loop(client_id: &str, mut stream: TcpStream, rx: Receiver<Message>) {
    while let Ok(message) = rx.recv() {
        if let Err(e) = write_frame(&mut stream, &message) {
            log::warn!("Failed to send frame to {}: {}", client_id, e);
            break;
        }
    }
    log::debug!("Writer thread finished for client: {}", client_id);
}

/// Which sessions a broadcast is addressed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Audience {
    /// Every connected session, buyers and sellers alike.
    All,
    /// Connected buyers only.
    Buyers,
}

/// The live-session registry, keyed by client id.
///
/// Registration and deregistration are atomic with broadcast enumeration: a
/// client registering during a broadcast may miss that broadcast but will
/// receive subsequent ones.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a registered session.
    pub fn insert(&self, handle: SessionHandle) {
        let mut sessions = self.sessions.lock().unwrap();
        let count = sessions.len() + 1;
        log::info!(
            "Client registered: {} as {} ({} connected)",
            handle.client_id(),
            handle.role().name(),
            count
        );
        sessions.insert(handle.client_id().to_string(), handle);
    }

    /// Removes a session, returning its handle (which tears down the
    /// writer when dropped).
    pub fn remove(&self, client_id: &str) -> Option<SessionHandle> {
        let removed = self.sessions.lock().unwrap().remove(client_id);
        if removed.is_some() {
            log::info!("Client removed from registry: {}", client_id);
        }
        removed
    }

    /// Number of connected sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Whether no session is connected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers a frame to one client. A recipient that cannot accept it
    /// is reaped. Returns whether the frame was enqueued.
    pub fn send_to(&self, client_id: &str, message: Message) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        let delivered = match sessions.get(client_id) {
            Some(handle) => handle.enqueue(message),
            None => return false,
        };
        if !delivered {
            log::warn!("Reaping unresponsive client: {}", client_id);
            sessions.remove(client_id);
        }
        delivered
    }

    /// Delivers a frame to every session in the audience, reaping any
    /// recipient whose queue cannot accept it. Returns the number of
    /// successful deliveries.
    pub fn broadcast(&self, audience: Audience, message: &Message) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        let mut failed: Vec<String> = Vec::new();
        let mut delivered = 0;

        for (client_id, handle) in sessions.iter() {
            let eligible = match audience {
                Audience::All => true,
                Audience::Buyers => handle.role() == ClientRole::Buyer,
            };
            if !eligible {
                continue;
            }
            if handle.enqueue(message.clone()) {
                delivered += 1;
            } else {
                failed.push(client_id.clone());
            }
        }

        for client_id in failed {
            log::warn!("Reaping unresponsive client: {}", client_id);
            sessions.remove(&client_id);
        }
        delivered
    }

    /// Drops every session, closing all connections. Used at shutdown.
    pub fn drain(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        if !sessions.is_empty() {
            log::info!("Closing {} session(s)", sessions.len());
        }
        sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{read_frame, MessageKind};
    use serde_json::json;
    use std::net::TcpListener;
    use std::time::Duration;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        (server_side, client)
    }

    #[test]
    fn test_role_parsing_is_exact() {
        assert_eq!(ClientRole::parse("BUYER"), Some(ClientRole::Buyer));
        assert_eq!(ClientRole::parse("SELLER"), Some(ClientRole::Seller));
        assert_eq!(ClientRole::parse("buyer"), None);
        assert_eq!(ClientRole::parse("ADMIN"), None);
    }

    #[test]
    fn test_enqueued_frames_reach_the_peer_in_order() {
        let (server_side, mut peer) = socket_pair();
        let (handle, _tx) =
            SessionHandle::spawn("c1".to_string(), ClientRole::Buyer, server_side).unwrap();

        for i in 0..3 {
            assert!(handle.enqueue(Message::from_server(
                MessageKind::StockUpdate,
                json!({ "seq": i }),
            )));
        }

        for i in 0..3 {
            let msg = read_frame(&mut peer).unwrap();
            assert_eq!(msg.kind, MessageKind::StockUpdate);
            assert_eq!(msg.f64_field("seq").unwrap(), f64::from(i));
        }
    }

    #[test]
    fn test_broadcast_audience_filtering() {
        let registry = SessionRegistry::new();

        let (buyer_side, mut buyer_peer) = socket_pair();
        let (seller_side, mut seller_peer) = socket_pair();
        let (buyer, _) =
            SessionHandle::spawn("b1".to_string(), ClientRole::Buyer, buyer_side).unwrap();
        let (seller, _) =
            SessionHandle::spawn("s1".to_string(), ClientRole::Seller, seller_side).unwrap();
        registry.insert(buyer);
        registry.insert(seller);

        let update = Message::from_server(MessageKind::StockUpdate, json!({ "items": [] }));
        assert_eq!(registry.broadcast(Audience::Buyers, &update), 1);

        let msg = read_frame(&mut buyer_peer).unwrap();
        assert_eq!(msg.kind, MessageKind::StockUpdate);

        let notice = Message::from_server(MessageKind::SaleStart, json!({ "itemId": "x" }));
        assert_eq!(registry.broadcast(Audience::All, &notice), 2);
        // The seller sees only the all-sessions broadcast.
        let msg = read_frame(&mut seller_peer).unwrap();
        assert_eq!(msg.kind, MessageKind::SaleStart);
    }

    #[test]
    fn test_send_to_targets_one_session() {
        let registry = SessionRegistry::new();
        let (server_side, mut peer) = socket_pair();
        let (handle, _) =
            SessionHandle::spawn("s1".to_string(), ClientRole::Seller, server_side).unwrap();
        registry.insert(handle);

        let notice = Message::from_server(
            MessageKind::PurchaseNotification,
            json!({ "itemId": "sale_s1_1", "quantity": 2.0, "buyerId": "b1" }),
        );
        assert!(registry.send_to("s1", notice));
        assert!(!registry.send_to("ghost", Message::error_reply("nope")));

        let msg = read_frame(&mut peer).unwrap();
        assert_eq!(msg.kind, MessageKind::PurchaseNotification);
        assert_eq!(msg.str_field("buyerId").unwrap(), "b1");
    }

    #[test]
    fn test_dropping_a_handle_closes_the_connection() {
        let (server_side, mut peer) = socket_pair();
        let (handle, _tx) =
            SessionHandle::spawn("c1".to_string(), ClientRole::Buyer, server_side).unwrap();
        drop(handle);

        let err = read_frame(&mut peer).unwrap_err();
        assert!(matches!(err, WireError::Closed | WireError::Io(_)));
    }
}
