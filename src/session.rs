use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;

use crate::broadcast::MarketEvent;
use crate::defs::{CLIENT_ID_LEN, CLIENT_KEEP_ALIVE_SEC, SESSION_READ_TICK_MSEC};
use crate::errors::{ServerError, WireError};
use crate::market::Market;
use crate::message::{write_frame, FrameReader, Message, MessageKind};
use crate::registry::{ClientRole, SessionHandle, SessionRegistry};

/// Runs one client connection from accept to teardown.
///
/// The first inbound frame must be a REGISTER; everything after that is
/// dispatched through the role-checked message table. The session's own
/// replies and any broadcasts fanned out to it share the per-session writer
/// queue, so its outbound stream stays FIFO.
///
/// The read loop polls with a short socket timeout so it can observe server
/// shutdown and the keep-alive deadline; a connection that stays silent
/// longer than the keep-alive window is dropped.
pub fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    market: Arc<Market>,
    registry: Arc<SessionRegistry>,
    events: SyncSender<MarketEvent>,
    running: Arc<AtomicBool>,
) -> Result<(), ServerError> {
    log::info!("[session] connected: {}", addr);

    let read_stream = stream
        .try_clone()
        .map_err(|e| ServerError::SessionIo(WireError::Io(e)))?;
    read_stream
        .set_read_timeout(Some(Duration::from_millis(SESSION_READ_TICK_MSEC)))
        .map_err(|e| ServerError::SessionIo(WireError::Io(e)))?;
    let mut reader = FrameReader::new(read_stream);

    let (client_id, role, outbound) =
        match register(stream, &mut reader, &market, &registry, &running) {
            Ok(Some(session)) => session,
            Ok(None) => {
                log::info!("[session] {} left before registering", addr);
                return Ok(());
            }
            Err(e) => {
                log::warn!("[session] registration failed for {}: {}", addr, e);
                return Err(e);
            }
        };

    let keep_alive = Duration::from_secs(CLIENT_KEEP_ALIVE_SEC);
    let mut last_heartbeat = Instant::now();

    let result = loop {
        if !running.load(Ordering::SeqCst) {
            break Ok(());
        }
        match reader.poll_frame() {
            Ok(Some(message)) => {
                last_heartbeat = Instant::now();
                if let Err(e) =
                    dispatch_message(&message, &client_id, role, &market, &outbound, &events)
                {
                    break Err(e);
                }
            }
            Ok(None) => {
                if last_heartbeat.elapsed() > keep_alive {
                    log::warn!(
                        "Client {} keep-alive timeout ({}s), disconnecting",
                        client_id,
                        CLIENT_KEEP_ALIVE_SEC
                    );
                    break Ok(());
                }
            }
            Err(WireError::Closed) => {
                log::info!("Client {} closed connection", client_id);
                break Ok(());
            }
            Err(e @ (WireError::Decode(_) | WireError::Oversize(_))) => {
                // Framing violation: tell the peer why, then close.
                let _ = outbound.send(Message::error_reply(&e.to_string()));
                break Err(ServerError::Protocol(e.to_string()));
            }
            Err(e) => break Err(ServerError::SessionIo(e)),
        }
    };

    drop(outbound);
    registry.remove(&client_id);
    log::info!("[session] disconnected: {} ({})", client_id, addr);
    result
}

/// Performs the registration handshake.
///
/// Returns `Ok(None)` when the peer disappeared or the server is shutting
/// down before any frame arrived. Protocol violations get a best-effort
/// ERROR frame before the error return closes the connection.
fn register(
    mut stream: TcpStream,
    reader: &mut FrameReader<TcpStream>,
    market: &Market,
    registry: &SessionRegistry,
    running: &AtomicBool,
) -> Result<Option<(String, ClientRole, SyncSender<Message>)>, ServerError> {
    let registration = match wait_for_first_frame(reader, running) {
        Ok(Some(message)) => message,
        Ok(None) => return Ok(None),
        Err(WireError::Closed) => return Ok(None),
        Err(e) => {
            let _ = write_frame(&mut stream, &Message::error_reply(&e.to_string()));
            return Err(ServerError::Protocol(e.to_string()));
        }
    };

    if registration.kind != MessageKind::Register {
        let reply = Message::error_reply("First message must be REGISTER");
        let _ = write_frame(&mut stream, &reply);
        return Err(ServerError::Protocol(format!(
            "first message was {:?}",
            registration.kind
        )));
    }

    let role = match registration
        .str_field("clientType")
        .ok()
        .and_then(ClientRole::parse)
    {
        Some(role) => role,
        None => {
            let reply = Message::error_reply("clientType must be BUYER or SELLER");
            let _ = write_frame(&mut stream, &reply);
            return Err(ServerError::Protocol("invalid clientType".to_string()));
        }
    };

    let client_id = generate_client_id();
    if role == ClientRole::Seller {
        market.initialize_seller_stock(&client_id);
    }

    let (handle, outbound) = SessionHandle::spawn(client_id.clone(), role, stream)?;
    registry.insert(handle);

    let ack = Message::from_server(MessageKind::Ack, json!({ "clientId": client_id }));
    if outbound.send(ack).is_err() {
        registry.remove(&client_id);
        return Err(ServerError::SessionIo(WireError::Closed));
    }

    Ok(Some((client_id, role, outbound)))
}

/// Waits for the registration frame, honoring shutdown and the keep-alive
/// window.
fn wait_for_first_frame(
    reader: &mut FrameReader<TcpStream>,
    running: &AtomicBool,
) -> Result<Option<Message>, WireError> {
    let deadline = Instant::now() + Duration::from_secs(CLIENT_KEEP_ALIVE_SEC);
    loop {
        if !running.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match reader.poll_frame()? {
            Some(message) => return Ok(Some(message)),
            None if Instant::now() >= deadline => return Ok(None),
            None => continue,
        }
    }
}

/// Routes one inbound frame by kind and role.
///
/// Only a dead writer is fatal; every domain failure turns into a reply on
/// the session's own stream.
fn dispatch_message(
    message: &Message,
    client_id: &str,
    role: ClientRole,
    market: &Market,
    outbound: &SyncSender<Message>,
    events: &SyncSender<MarketEvent>,
) -> Result<(), ServerError> {
    log::debug!("Handling {:?} from {}", message.kind, client_id);

    match (message.kind, role) {
        (MessageKind::SaleStart, ClientRole::Seller) => {
            handle_sale_start(message, client_id, market, outbound, events)
        }
        (MessageKind::SaleEnd, ClientRole::Seller) => {
            handle_sale_end(client_id, market, outbound, events)
        }
        (MessageKind::BuyRequest, ClientRole::Buyer) => {
            handle_buy_request(message, client_id, market, outbound, events)
        }
        (MessageKind::ListItems, _) => handle_list_items(market, outbound),
        (MessageKind::Heartbeat, _) => Ok(()), // the read loop already touched the timestamp
        (MessageKind::SaleStart | MessageKind::SaleEnd, ClientRole::Buyer)
        | (MessageKind::BuyRequest, ClientRole::Seller) => {
            log::warn!(
                "Role violation: {:?} from {} ({})",
                message.kind,
                client_id,
                role.name()
            );
            send_reply(
                outbound,
                Message::error_reply(&format!(
                    "Operation {:?} not permitted for role {}",
                    message.kind,
                    role.name()
                )),
            )
        }
        _ => {
            log::warn!("Unexpected message type {:?} from {}", message.kind, client_id);
            send_reply(
                outbound,
                Message::error_reply(&format!("Unexpected message type {:?}", message.kind)),
            )
        }
    }
}

fn handle_sale_start(
    message: &Message,
    client_id: &str,
    market: &Market,
    outbound: &SyncSender<Message>,
    events: &SyncSender<MarketEvent>,
) -> Result<(), ServerError> {
    let (name, quantity) = match (message.str_field("name"), message.f64_field("quantity")) {
        (Ok(name), Ok(quantity)) => (name, quantity),
        (Err(e), _) | (_, Err(e)) => {
            return send_reply(outbound, Message::error_reply(&e.to_string()));
        }
    };

    match market.start_sale(client_id, name, quantity) {
        Ok(snapshot) => {
            let sale_id = snapshot.id.clone();
            let reply = Message::from_server(
                MessageKind::SaleStart,
                json!({
                    "success": true,
                    "itemId": snapshot.id,
                    "name": snapshot.name,
                    "quantity": snapshot.quantity,
                    "remainingTime": snapshot.remaining_time_ms,
                }),
            );
            send_reply(outbound, reply)?;
            emit(
                events,
                MarketEvent::SaleStart {
                    item_id: sale_id,
                    seller_id: client_id.to_string(),
                },
            );
            emit(events, MarketEvent::StockUpdate);
            Ok(())
        }
        Err(e) => {
            log::warn!("Sale start rejected for {}: {}", client_id, e);
            send_reply(outbound, Message::error_reply(&e.to_string()))
        }
    }
}

fn handle_sale_end(
    client_id: &str,
    market: &Market,
    outbound: &SyncSender<Message>,
    events: &SyncSender<MarketEvent>,
) -> Result<(), ServerError> {
    let closed = market.end_seller_sales(client_id);
    send_reply(
        outbound,
        Message::from_server(MessageKind::SaleEnd, json!({ "success": true })),
    )?;
    if !closed.is_empty() {
        emit(events, MarketEvent::SaleEnd);
    }
    emit(events, MarketEvent::StockUpdate);
    Ok(())
}

fn handle_buy_request(
    message: &Message,
    client_id: &str,
    market: &Market,
    outbound: &SyncSender<Message>,
    events: &SyncSender<MarketEvent>,
) -> Result<(), ServerError> {
    let (item_id, quantity) = match (message.str_field("itemId"), message.f64_field("quantity")) {
        (Ok(item_id), Ok(quantity)) => (item_id, quantity),
        (Err(e), _) | (_, Err(e)) => {
            return send_reply(outbound, Message::error_reply(&e.to_string()));
        }
    };

    match market.handle_buy(item_id, quantity, client_id) {
        Ok(success) => {
            let reply = Message::from_server(
                MessageKind::BuyResponse,
                json!({ "success": success, "itemId": item_id, "quantity": quantity }),
            );
            send_reply(outbound, reply)?;
            if success {
                emit(events, MarketEvent::StockUpdate);
                if let Some(seller_id) = market.seller_for(item_id) {
                    emit(
                        events,
                        MarketEvent::Purchase {
                            item_id: item_id.to_string(),
                            quantity,
                            buyer_id: client_id.to_string(),
                            seller_id,
                        },
                    );
                }
            }
            Ok(())
        }
        Err(e) => send_reply(outbound, Message::error_reply(&e.to_string())),
    }
}

fn handle_list_items(market: &Market, outbound: &SyncSender<Message>) -> Result<(), ServerError> {
    let items = market.active_snapshots();
    send_reply(
        outbound,
        Message::from_server(MessageKind::ListItems, json!({ "items": items })),
    )
}

/// Queues a reply on the session's own writer. A closed queue means the
/// writer died; the session ends.
fn send_reply(outbound: &SyncSender<Message>, message: Message) -> Result<(), ServerError> {
    outbound
        .send(message)
        .map_err(|_| ServerError::SessionIo(WireError::Closed))
}

/// Enqueues a market event without blocking. A full queue drops the event;
/// producers never stall on broadcast fan-out.
fn emit(events: &SyncSender<MarketEvent>, event: MarketEvent) {
    if events.try_send(event).is_err() {
        log::warn!("Broadcast queue full, dropping event");
    }
}

/// A short opaque client id, collision-free with overwhelming probability.
fn generate_client_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CLIENT_ID_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{sync_channel, Receiver};

    fn test_channels() -> (
        SyncSender<Message>,
        Receiver<Message>,
        SyncSender<MarketEvent>,
        Receiver<MarketEvent>,
    ) {
        let (out_tx, out_rx) = sync_channel(16);
        let (ev_tx, ev_rx) = sync_channel(16);
        (out_tx, out_rx, ev_tx, ev_rx)
    }

    fn seller_market(seller_id: &str) -> Market {
        let market = Market::new();
        market.initialize_seller_stock(seller_id);
        market
    }

    #[test]
    fn test_client_ids_are_short_and_alphanumeric() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert_eq!(a.len(), CLIENT_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_role_violation_answers_error_and_continues() {
        let market = seller_market("s1");
        let (out_tx, out_rx, ev_tx, ev_rx) = test_channels();

        let buy = Message::new(MessageKind::BuyRequest, json!({}), Some("s1".to_string()));
        dispatch_message(&buy, "s1", ClientRole::Seller, &market, &out_tx, &ev_tx).unwrap();

        let reply = out_rx.try_recv().unwrap();
        assert_eq!(reply.kind, MessageKind::Error);
        assert!(reply.str_field("error").unwrap().contains("not permitted"));
        assert!(ev_rx.try_recv().is_err());
    }

    #[test]
    fn test_sale_start_replies_and_emits_broadcasts() {
        let market = seller_market("s1");
        let (out_tx, out_rx, ev_tx, ev_rx) = test_channels();

        let request = Message::new(
            MessageKind::SaleStart,
            json!({ "name": "flower", "quantity": 50.0 }),
            Some("s1".to_string()),
        );
        dispatch_message(&request, "s1", ClientRole::Seller, &market, &out_tx, &ev_tx).unwrap();

        let reply = out_rx.try_recv().unwrap();
        assert_eq!(reply.kind, MessageKind::SaleStart);
        assert_eq!(reply.data["success"], true);
        assert_eq!(reply.str_field("name").unwrap(), "flower");
        assert!(reply.str_field("itemId").unwrap().starts_with("sale_s1_"));

        assert!(matches!(
            ev_rx.try_recv().unwrap(),
            MarketEvent::SaleStart { .. }
        ));
        assert!(matches!(ev_rx.try_recv().unwrap(), MarketEvent::StockUpdate));
    }

    #[test]
    fn test_sale_start_with_missing_field_is_an_error_reply() {
        let market = seller_market("s1");
        let (out_tx, out_rx, ev_tx, ev_rx) = test_channels();

        let request = Message::new(
            MessageKind::SaleStart,
            json!({ "name": "flower" }),
            Some("s1".to_string()),
        );
        dispatch_message(&request, "s1", ClientRole::Seller, &market, &out_tx, &ev_tx).unwrap();

        let reply = out_rx.try_recv().unwrap();
        assert_eq!(reply.kind, MessageKind::Error);
        assert!(reply.str_field("error").unwrap().contains("quantity"));
        assert!(ev_rx.try_recv().is_err());
    }

    #[test]
    fn test_buy_failure_is_a_response_not_an_error() {
        let market = seller_market("s1");
        let (out_tx, out_rx, ev_tx, ev_rx) = test_channels();

        let request = Message::new(
            MessageKind::BuyRequest,
            json!({ "itemId": "sale_ghost_1", "quantity": 5.0 }),
            Some("b1".to_string()),
        );
        dispatch_message(&request, "b1", ClientRole::Buyer, &market, &out_tx, &ev_tx).unwrap();

        let reply = out_rx.try_recv().unwrap();
        assert_eq!(reply.kind, MessageKind::BuyResponse);
        assert_eq!(reply.data["success"], false);
        // A failed buy changes nothing, so nothing is broadcast.
        assert!(ev_rx.try_recv().is_err());
    }

    #[test]
    fn test_successful_buy_notifies_the_seller() {
        let market = seller_market("s1");
        let snapshot = market.start_sale("s1", "sugar", 10.0).unwrap();
        let (out_tx, out_rx, ev_tx, ev_rx) = test_channels();

        let request = Message::new(
            MessageKind::BuyRequest,
            json!({ "itemId": snapshot.id, "quantity": 4.0 }),
            Some("b1".to_string()),
        );
        dispatch_message(&request, "b1", ClientRole::Buyer, &market, &out_tx, &ev_tx).unwrap();

        let reply = out_rx.try_recv().unwrap();
        assert_eq!(reply.kind, MessageKind::BuyResponse);
        assert_eq!(reply.data["success"], true);

        assert!(matches!(ev_rx.try_recv().unwrap(), MarketEvent::StockUpdate));
        match ev_rx.try_recv().unwrap() {
            MarketEvent::Purchase {
                quantity,
                buyer_id,
                seller_id,
                ..
            } => {
                assert_eq!(quantity, 4.0);
                assert_eq!(buyer_id, "b1");
                assert_eq!(seller_id, "s1");
            }
            other => panic!("expected purchase event, got {other:?}"),
        }
    }

    #[test]
    fn test_list_items_returns_the_snapshot_to_either_role() {
        let market = seller_market("s1");
        market.start_sale("s1", "oil", 5.0).unwrap();
        let (out_tx, out_rx, ev_tx, _ev_rx) = test_channels();

        let request = Message::new(MessageKind::ListItems, json!({}), Some("b1".to_string()));
        dispatch_message(&request, "b1", ClientRole::Buyer, &market, &out_tx, &ev_tx).unwrap();

        let reply = out_rx.try_recv().unwrap();
        assert_eq!(reply.kind, MessageKind::ListItems);
        let items = reply.data["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["name"], "oil");
    }

    #[test]
    fn test_unexpected_kind_is_answered_with_error() {
        let market = seller_market("s1");
        let (out_tx, out_rx, ev_tx, _ev_rx) = test_channels();

        let request = Message::new(MessageKind::Register, json!({}), Some("b1".to_string()));
        dispatch_message(&request, "b1", ClientRole::Buyer, &market, &out_tx, &ev_tx).unwrap();

        let reply = out_rx.try_recv().unwrap();
        assert_eq!(reply.kind, MessageKind::Error);
    }
}
