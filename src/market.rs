use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::broadcast::MarketEvent;
use crate::catalog::ItemKind;
use crate::defs::{INITIAL_STOCK, SALE_DURATION_SECS, SWEEP_TICK_PERIOD_MSEC};
use crate::errors::MarketError;
use crate::ledger::StockLedger;
use crate::sale::{Sale, SaleSnapshot};

/// Everything the market owns, guarded by one lock.
#[derive(Debug, Default)]
struct MarketState {
    sales: HashMap<String, Sale>,
    ledger: StockLedger,
    next_sale_seq: u64,
}

/// The authoritative market state: active sales, seller ledgers, and the
/// background expiry sweeper.
///
/// All mutating operations are serialized under a single internal lock, so
/// concurrent buys, sale starts, and expiry sweeps observe a consistent
/// state and purchases against one sale are linearizable.
#[derive(Debug)]
pub struct Market {
    state: Mutex<MarketState>,

    /// Background sweeper thread.
    sweeper: Mutex<Option<JoinHandle<()>>>,
    /// Graceful shutdown flag.
    shutdown_flag: Arc<AtomicBool>,
}

impl Market {
    /// Creates an empty market. The expiry sweeper is not running until
    /// [`start`](Self::start) is called.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MarketState::default()),
            sweeper: Mutex::new(None),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MarketState> {
        // Lock poisoning means a panic inside a critical section; there is
        // no state worth salvaging at that point.
        self.state.lock().unwrap()
    }

    /// Seeds a seller's ledger with the default stock of every catalog
    /// item. Called once per seller registration; a returning seller keeps
    /// existing balances.
    pub fn initialize_seller_stock(&self, seller_id: &str) {
        self.state().ledger.init(seller_id, INITIAL_STOCK);
        log::info!("Initialized stock for seller: {}", seller_id);
    }

    /// Starts a sale of `quantity` units of `item_name` for `seller_id`.
    ///
    /// Debits the seller's ledger and registers the sale with the fixed
    /// 60-second duration. Fails with [`MarketError::UnknownSeller`],
    /// [`MarketError::UnknownItem`], [`MarketError::InvalidQuantity`], or
    /// [`MarketError::InsufficientStock`]; the ledger is untouched on any
    /// failure.
    pub fn start_sale(
        &self,
        seller_id: &str,
        item_name: &str,
        quantity: f64,
    ) -> Result<SaleSnapshot, MarketError> {
        self.start_sale_with_duration(
            seller_id,
            item_name,
            quantity,
            Duration::from_secs(SALE_DURATION_SECS),
        )
    }

    fn start_sale_with_duration(
        &self,
        seller_id: &str,
        item_name: &str,
        quantity: f64,
        duration: Duration,
    ) -> Result<SaleSnapshot, MarketError> {
        let mut state = self.state();
        if !state.ledger.contains(seller_id) {
            return Err(MarketError::UnknownSeller(seller_id.to_string()));
        }
        let item = ItemKind::parse(item_name)?;
        if !(quantity > 0.0) || !quantity.is_finite() {
            return Err(MarketError::InvalidQuantity(quantity));
        }

        state.ledger.debit(seller_id, item, quantity)?;

        state.next_sale_seq += 1;
        let sale_id = format!("sale_{}_{}", seller_id, state.next_sale_seq);
        let sale = match Sale::new(sale_id.clone(), item, quantity, seller_id.to_string(), duration)
        {
            Ok(sale) => sale,
            Err(e) => {
                // Undo the debit; the sale never existed.
                state.ledger.credit(seller_id, item, quantity);
                return Err(e);
            }
        };
        let snapshot = sale.snapshot();
        state.sales.insert(sale_id, sale);

        log::info!(
            "Sale started: {:.2} {} by seller {} ({})",
            quantity,
            item,
            seller_id,
            snapshot.id
        );
        Ok(snapshot)
    }

    /// Attempts to purchase `quantity` units from the sale `sale_id`.
    ///
    /// An absent, expired, or force-closed sale and an insufficient
    /// remainder are all the normal `Ok(false)` outcome, never an error. A
    /// non-positive quantity fails with [`MarketError::InvalidQuantity`].
    pub fn handle_buy(
        &self,
        sale_id: &str,
        quantity: f64,
        buyer_id: &str,
    ) -> Result<bool, MarketError> {
        if !(quantity > 0.0) || !quantity.is_finite() {
            return Err(MarketError::InvalidQuantity(quantity));
        }

        let mut state = self.state();
        let success = match state.sales.get_mut(sale_id) {
            None => {
                log::warn!("Buy request for unknown sale {} by {}", sale_id, buyer_id);
                false
            }
            Some(sale) => sale.try_purchase(quantity)?,
        };

        if success {
            log::info!(
                "Purchase successful: {:.2} of {} by {}",
                quantity,
                sale_id,
                buyer_id
            );
        } else {
            log::debug!(
                "Purchase failed: {:.2} of {} by {}",
                quantity,
                sale_id,
                buyer_id
            );
        }
        Ok(success)
    }

    /// Ends every active sale belonging to `seller_id`, crediting unsold
    /// remainders back to the ledger. Idempotent when no sales are active.
    /// Returns the closed sales.
    pub fn end_seller_sales(&self, seller_id: &str) -> Vec<SaleSnapshot> {
        let mut state = self.state();
        let sale_ids: Vec<String> = state
            .sales
            .values()
            .filter(|sale| sale.seller_id() == seller_id)
            .map(|sale| sale.id().to_string())
            .collect();

        let closed: Vec<SaleSnapshot> = sale_ids
            .iter()
            .filter_map(|id| close_sale(&mut state, id))
            .collect();

        if closed.is_empty() {
            log::debug!("No active sales found for seller: {}", seller_id);
        } else {
            log::info!("Ended {} sale(s) for seller: {}", closed.len(), seller_id);
        }
        closed
    }

    /// Immutable snapshots of all open sales, taken under the lock.
    /// Expired sales are filtered out.
    pub fn active_snapshots(&self) -> Vec<SaleSnapshot> {
        self.state()
            .sales
            .values()
            .filter(|sale| !sale.is_expired())
            .map(Sale::snapshot)
            .collect()
    }

    /// The seller that owns `sale_id`, if the sale exists.
    pub fn seller_for(&self, sale_id: &str) -> Option<String> {
        self.state()
            .sales
            .get(sale_id)
            .map(|sale| sale.seller_id().to_string())
    }

    /// A copy of one seller's ledger balances.
    pub fn seller_stock(&self, seller_id: &str) -> Option<HashMap<ItemKind, f64>> {
        self.state().ledger.balances(seller_id)
    }

    /// Closes every sale whose deadline has passed, routing each through
    /// the same close path as [`end_seller_sales`]. Returns the reclaimed
    /// sales.
    pub fn sweep_expired(&self) -> Vec<SaleSnapshot> {
        let mut state = self.state();
        let expired_ids: Vec<String> = state
            .sales
            .values()
            .filter(|sale| sale.is_expired())
            .map(|sale| sale.id().to_string())
            .collect();

        expired_ids
            .iter()
            .filter_map(|id| {
                let closed = close_sale(&mut state, id);
                if closed.is_some() {
                    log::info!("Cleaned up expired sale: {}", id);
                }
                closed
            })
            .collect()
    }

    /// Runs the expiry sweeper in a background thread.
    ///
    /// The sweeper ticks every second, reclaims expired sales, and emits a
    /// sale-end event when it closed anything so connected clients learn of
    /// the change.
    pub fn start(self: &Arc<Self>, events: SyncSender<MarketEvent>) {
        let mut guard = self.sweeper.lock().unwrap();
        if guard.is_some() {
            log::warn!("Expiry sweeper already running");
            return;
        }

        let market = Arc::clone(self);
        log::info!(
            "Starting expiry sweeper with tick period: {}ms",
            SWEEP_TICK_PERIOD_MSEC
        );

        let handle = thread::spawn(move || {
            log::debug!("Expiry sweeper thread started");
            while !market.shutdown_flag.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(SWEEP_TICK_PERIOD_MSEC));

                let closed = market.sweep_expired();
                if !closed.is_empty() {
                    if events.try_send(MarketEvent::SaleEnd).is_err() {
                        log::warn!("Broadcast queue unavailable, dropping sale-end event");
                    }
                }
            }
            log::debug!("Expiry sweeper thread stopped");
        });

        *guard = Some(handle);
    }

    /// Signals the sweeper to stop and joins it. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.join().ok();
            log::info!("Expiry sweeper joined");
        }
    }
}

impl Default for Market {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Market {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Removes a sale, force-closes it, and credits the unsold remainder back
/// to its seller. Returns the closed sale's final snapshot.
fn close_sale(state: &mut MarketState, sale_id: &str) -> Option<SaleSnapshot> {
    let mut sale = state.sales.remove(sale_id)?;
    sale.force_close();
    let snapshot = sale.snapshot();
    let remainder = sale.take_remaining();
    if remainder > 0.0 {
        state.ledger.credit(sale.seller_id(), sale.item(), remainder);
        log::info!(
            "Sale ended: returned {:.2} {} to seller {} stock",
            remainder,
            sale.item(),
            sale.seller_id()
        );
    }
    Some(snapshot)
}
