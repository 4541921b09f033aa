use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::catalog::ItemKind;
use crate::defs::MAX_SALE_DURATION_SECS;
use crate::errors::MarketError;

/// A single time-limited offer of a quantity of one catalog item.
///
/// A sale is *open* until its seller ends it or its deadline passes;
/// depletion to zero does not close it. All mutation happens under the
/// market lock, which makes check-and-decrement purchases atomic with
/// respect to each other.
#[derive(Debug)]
pub struct Sale {
    id: String,
    item: ItemKind,
    seller_id: String,
    remaining: f64,
    started_at: Instant,
    duration: Duration,
    forced_closed: bool,
}

impl Sale {
    /// Creates a sale starting now.
    ///
    /// The duration must be within `(0, 60s]`; anything else is rejected
    /// with [`MarketError::InvalidDuration`].
    pub fn new(
        id: String,
        item: ItemKind,
        quantity: f64,
        seller_id: String,
        duration: Duration,
    ) -> Result<Self, MarketError> {
        if duration.is_zero() || duration > Duration::from_secs(MAX_SALE_DURATION_SECS) {
            return Err(MarketError::InvalidDuration {
                got: duration.as_secs(),
                max: MAX_SALE_DURATION_SECS,
            });
        }
        Ok(Self {
            id,
            item,
            seller_id,
            remaining: quantity,
            started_at: Instant::now(),
            duration,
            forced_closed: false,
        })
    }

    /// The sale id assigned by the market.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The catalog item on offer.
    pub fn item(&self) -> ItemKind {
        self.item
    }

    /// The seller who started the sale.
    pub fn seller_id(&self) -> &str {
        &self.seller_id
    }

    /// Quantity still available for purchase.
    pub fn remaining(&self) -> f64 {
        self.remaining
    }

    /// Time until the deadline, zero once expired or force-closed.
    pub fn remaining_time(&self) -> Duration {
        if self.forced_closed {
            return Duration::ZERO;
        }
        self.duration
            .saturating_sub(self.started_at.elapsed())
    }

    /// Whether the sale can no longer accept purchases.
    pub fn is_expired(&self) -> bool {
        self.forced_closed || self.remaining_time().is_zero()
    }

    /// Attempts to buy `amount` units.
    ///
    /// Fails with [`MarketError::InvalidQuantity`] unless `amount` is a
    /// strictly positive number. Returns `true` and decrements the
    /// remainder iff the sale is open and holds at least `amount`;
    /// `false` otherwise (expired, force-closed, or insufficient quantity).
    pub fn try_purchase(&mut self, amount: f64) -> Result<bool, MarketError> {
        if !(amount > 0.0) || !amount.is_finite() {
            return Err(MarketError::InvalidQuantity(amount));
        }
        if self.is_expired() {
            return Ok(false);
        }
        if self.remaining >= amount {
            self.remaining -= amount;
            return Ok(true);
        }
        Ok(false)
    }

    /// Marks the sale closed. Idempotent; subsequent purchases fail and the
    /// remaining time reports zero.
    pub fn force_close(&mut self) {
        self.forced_closed = true;
    }

    /// Zeroes the remainder and returns the prior value.
    ///
    /// Called exactly once when a sale is closed, so the unsold quantity
    /// can flow back to the seller's ledger.
    pub fn take_remaining(&mut self) -> f64 {
        std::mem::take(&mut self.remaining)
    }

    /// Immutable value copy in wire form. Safe to ship without further
    /// synchronization.
    pub fn snapshot(&self) -> SaleSnapshot {
        SaleSnapshot {
            id: self.id.clone(),
            name: self.item.name().to_string(),
            quantity: self.remaining,
            seller_id: self.seller_id.clone(),
            remaining_time_ms: self.remaining_time().as_millis() as u64,
        }
    }
}

/// The wire representation of a sale at one point in time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SaleSnapshot {
    /// Market-assigned sale id.
    pub id: String,
    /// Catalog name of the item on offer.
    pub name: String,
    /// Quantity still available when the snapshot was taken.
    pub quantity: f64,
    /// The seller who started the sale.
    #[serde(rename = "sellerId")]
    pub seller_id: String,
    /// Milliseconds until the deadline, zero once expired.
    #[serde(rename = "remainingTime")]
    pub remaining_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_sale(quantity: f64) -> Sale {
        Sale::new(
            "sale_s1_1".to_string(),
            ItemKind::Flower,
            quantity,
            "s1".to_string(),
            Duration::from_secs(60),
        )
        .unwrap()
    }

    #[test]
    fn test_purchase_of_exact_remainder_succeeds() {
        let mut sale = open_sale(10.0);
        assert!(sale.try_purchase(10.0).unwrap());
        assert_eq!(sale.remaining(), 0.0);
    }

    #[test]
    fn test_purchase_above_remainder_leaves_sale_unchanged() {
        let mut sale = open_sale(10.0);
        assert!(!sale.try_purchase(10.5).unwrap());
        assert_eq!(sale.remaining(), 10.0);
    }

    #[test]
    fn test_depleted_sale_stays_open() {
        let mut sale = open_sale(5.0);
        assert!(sale.try_purchase(5.0).unwrap());
        assert!(!sale.is_expired());
        assert!(!sale.try_purchase(1.0).unwrap());
    }

    #[test]
    fn test_non_positive_amount_is_an_error() {
        let mut sale = open_sale(5.0);
        assert!(matches!(
            sale.try_purchase(0.0),
            Err(MarketError::InvalidQuantity(_))
        ));
        assert!(matches!(
            sale.try_purchase(-1.0),
            Err(MarketError::InvalidQuantity(_))
        ));
        assert_eq!(sale.remaining(), 5.0);
    }

    #[test]
    fn test_force_close_is_idempotent_and_stops_purchases() {
        let mut sale = open_sale(5.0);
        sale.force_close();
        sale.force_close();
        assert!(sale.is_expired());
        assert_eq!(sale.remaining_time(), Duration::ZERO);
        assert!(!sale.try_purchase(1.0).unwrap());
        assert_eq!(sale.remaining(), 5.0);
    }

    #[test]
    fn test_elapsed_deadline_expires_the_sale() {
        let mut sale = Sale::new(
            "sale_s1_1".to_string(),
            ItemKind::Oil,
            5.0,
            "s1".to_string(),
            Duration::from_millis(10),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert!(sale.is_expired());
        assert!(!sale.try_purchase(1.0).unwrap());
    }

    #[test]
    fn test_zero_and_overlong_durations_are_rejected() {
        let zero = Sale::new(
            "s".to_string(),
            ItemKind::Sugar,
            1.0,
            "s1".to_string(),
            Duration::ZERO,
        );
        assert!(matches!(zero, Err(MarketError::InvalidDuration { .. })));

        let overlong = Sale::new(
            "s".to_string(),
            ItemKind::Sugar,
            1.0,
            "s1".to_string(),
            Duration::from_secs(61),
        );
        assert!(matches!(overlong, Err(MarketError::InvalidDuration { .. })));
    }

    #[test]
    fn test_take_remaining_zeroes_the_sale() {
        let mut sale = open_sale(7.5);
        assert!(sale.try_purchase(2.5).unwrap());
        assert_eq!(sale.take_remaining(), 5.0);
        assert_eq!(sale.remaining(), 0.0);
    }

    #[test]
    fn test_snapshot_carries_wire_fields() {
        let sale = open_sale(50.0);
        let snap = sale.snapshot();
        assert_eq!(snap.id, "sale_s1_1");
        assert_eq!(snap.name, "flower");
        assert_eq!(snap.quantity, 50.0);
        assert_eq!(snap.seller_id, "s1");
        assert!(snap.remaining_time_ms <= 60_000);

        let encoded = serde_json::to_string(&snap).unwrap();
        assert!(encoded.contains("\"sellerId\":\"s1\""));
        assert!(encoded.contains("\"remainingTime\""));
    }
}
