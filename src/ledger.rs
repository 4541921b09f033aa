use std::collections::HashMap;

use crate::catalog::ItemKind;
use crate::errors::MarketError;

/// Per-seller stock bookkeeping: how much of each catalog item a seller has
/// on hand and not committed to any active sale.
///
/// This is a pure data structure; all synchronization is supplied by the
/// [`Market`](crate::market::Market) that owns it. Ledgers live until broker
/// shutdown, so a seller reconnecting within a process lifetime keeps prior
/// stock.
#[derive(Debug, Default)]
pub struct StockLedger {
    stocks: HashMap<String, HashMap<ItemKind, f64>>,
}

impl StockLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a seller with `per_item` of every catalog item.
    ///
    /// Idempotent: a seller that already has a ledger keeps its existing
    /// balances untouched.
    pub fn init(&mut self, seller_id: &str, per_item: f64) {
        self.stocks.entry(seller_id.to_string()).or_insert_with(|| {
            ItemKind::ALL.iter().map(|item| (*item, per_item)).collect()
        });
    }

    /// Whether a ledger exists for this seller.
    pub fn contains(&self, seller_id: &str) -> bool {
        self.stocks.contains_key(seller_id)
    }

    /// Current balance of one item for one seller, if either exists.
    pub fn available(&self, seller_id: &str, item: ItemKind) -> Option<f64> {
        self.stocks
            .get(seller_id)
            .and_then(|stock| stock.get(&item))
            .copied()
    }

    /// Removes `amount` of `item` from the seller's balance.
    ///
    /// Pre-checked: fails with [`MarketError::UnknownSeller`] if no ledger
    /// exists, or [`MarketError::InsufficientStock`] if the balance is
    /// below `amount`. A balance never goes negative.
    pub fn debit(&mut self, seller_id: &str, item: ItemKind, amount: f64) -> Result<(), MarketError> {
        let stock = self
            .stocks
            .get_mut(seller_id)
            .ok_or_else(|| MarketError::UnknownSeller(seller_id.to_string()))?;
        let balance = stock.entry(item).or_insert(0.0);
        if *balance < amount {
            return Err(MarketError::InsufficientStock {
                item: item.name(),
                available: *balance,
                requested: amount,
            });
        }
        *balance -= amount;
        Ok(())
    }

    /// Adds `amount` of `item` back to the seller's balance.
    ///
    /// Sales only ever exist for sellers with a ledger, so a missing ledger
    /// here is logged and skipped rather than treated as an error.
    pub fn credit(&mut self, seller_id: &str, item: ItemKind, amount: f64) {
        match self.stocks.get_mut(seller_id) {
            Some(stock) => {
                *stock.entry(item).or_insert(0.0) += amount;
            }
            None => {
                log::warn!(
                    "Cannot credit {:.2} {} to unknown seller {}",
                    amount,
                    item,
                    seller_id
                );
            }
        }
    }

    /// A copy of one seller's balances, for status reporting and tests.
    pub fn balances(&self, seller_id: &str) -> Option<HashMap<ItemKind, f64>> {
        self.stocks.get(seller_id).cloned()
    }
}
