use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use serde_json::json;

use crate::defs::BROADCAST_QUEUE_CAPACITY;
use crate::market::Market;
use crate::message::{Message, MessageKind};
use crate::registry::{Audience, SessionRegistry};

/// A state change that must be fanned out to connected clients.
///
/// Sessions and the expiry sweeper enqueue these without blocking; the
/// dispatcher turns each into wire messages for its audience. Snapshots are
/// taken when the event is dispatched, not when it is enqueued, so clients
/// always receive the freshest view.
#[derive(Clone, Debug)]
pub enum MarketEvent {
    /// Inventory changed; buyers receive the current open-sales snapshot.
    StockUpdate,
    /// A sale opened; every session learns which item and seller.
    SaleStart {
        /// Id of the new sale.
        item_id: String,
        /// The seller who opened it.
        seller_id: String,
    },
    /// One or more sales closed; every session receives a fresh snapshot.
    SaleEnd,
    /// A purchase committed; the owning seller is notified.
    Purchase {
        /// Id of the sale purchased from.
        item_id: String,
        /// Quantity bought.
        quantity: f64,
        /// The buyer.
        buyer_id: String,
        /// The seller to notify.
        seller_id: String,
    },
    /// Internal sentinel queued by [`BroadcastDispatcher::shutdown`];
    /// everything enqueued before it is still delivered.
    Shutdown,
}

/// The single background consumer of the broadcast queue.
///
/// One dispatcher thread serializes all fan-out, which keeps per-recipient
/// ordering trivially FIFO. Delivery to a recipient is a non-blocking
/// enqueue onto that session's writer queue, so one slow client never
/// stalls the others.
#[derive(Debug)]
pub struct BroadcastDispatcher {
    tx: SyncSender<MarketEvent>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BroadcastDispatcher {
    /// Spawns the dispatcher thread over a bounded event queue.
    pub fn start(market: Arc<Market>, registry: Arc<SessionRegistry>) -> Self {
        let (tx, rx) = sync_channel(BROADCAST_QUEUE_CAPACITY);
        let handle = thread::spawn(move || dispatch_loop(rx, market, registry));
        Self {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// A sender for producers (sessions, the expiry sweeper).
    pub fn sender(&self) -> SyncSender<MarketEvent> {
        self.tx.clone()
    }

    /// Drains pending events and stops the dispatcher. Idempotent.
    ///
    /// The sentinel queues behind whatever is already enqueued, so pending
    /// broadcasts are delivered before the thread exits.
    pub fn shutdown(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = self.tx.send(MarketEvent::Shutdown);
            handle.join().ok();
            log::info!("Broadcast dispatcher stopped");
        }
    }
}

impl Drop for BroadcastDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_loop(rx: Receiver<MarketEvent>, market: Arc<Market>, registry: Arc<SessionRegistry>) {
    log::debug!("Broadcast dispatcher started");
    loop {
        match rx.recv() {
            Ok(MarketEvent::Shutdown) | Err(_) => break,
            Ok(event) => dispatch(event, &market, &registry),
        }
    }
    log::debug!("Broadcast dispatcher finished");
}

fn dispatch(event: MarketEvent, market: &Market, registry: &SessionRegistry) {
    match event {
        MarketEvent::StockUpdate => {
            let items = market.active_snapshots();
            let message =
                Message::from_server(MessageKind::StockUpdate, json!({ "items": items }));
            let delivered = registry.broadcast(Audience::Buyers, &message);
            log::debug!("Stock update delivered to {} buyer(s)", delivered);
        }
        MarketEvent::SaleStart { item_id, seller_id } => {
            let message = Message::from_server(
                MessageKind::SaleStart,
                json!({ "itemId": item_id, "sellerId": seller_id }),
            );
            registry.broadcast(Audience::All, &message);
        }
        MarketEvent::SaleEnd => {
            let items = market.active_snapshots();
            let message = Message::from_server(MessageKind::SaleEnd, json!({ "items": items }));
            registry.broadcast(Audience::All, &message);
        }
        MarketEvent::Purchase {
            item_id,
            quantity,
            buyer_id,
            seller_id,
        } => {
            let message = Message::from_server(
                MessageKind::PurchaseNotification,
                json!({ "itemId": item_id, "quantity": quantity, "buyerId": buyer_id }),
            );
            if !registry.send_to(&seller_id, message) {
                log::debug!(
                    "Purchase notification for {} dropped, seller {} not connected",
                    item_id,
                    seller_id
                );
            }
        }
        MarketEvent::Shutdown => {}
    }
}
