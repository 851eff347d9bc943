//! Per-product credential inventory.
//!
//! Each product owns a FIFO queue of unsold credential units and an
//! append-only archive of taken units. `take` pops and archives in one step
//! under the product's entry guard, so no two callers can ever receive the
//! same unit. `return_unit` is the compensating half of a failed purchase: it
//! re-inserts the payload at the head of the queue and marks the archive row
//! as reverted instead of rewriting history.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::try_result::TryResult;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::Amount;
use crate::model::{IntentId, ProductId, UserId};

/// Error during an inventory operation.
#[derive(Debug, Error)]
pub enum StockError {
    #[error("product {0} not found")]
    ProductNotFound(ProductId),

    #[error("product {0} is out of stock")]
    OutOfStock(ProductId),

    #[error("product {product} price {price} must be positive")]
    InvalidPrice { product: ProductId, price: Amount },

    #[error("product entry busy, lost the access race")]
    Conflict,
}

/// An archived unit. Buyer linkage is filled in when the sale commits;
/// `reverted` marks rows superseded by a compensating return.
#[derive(Debug, Clone, Serialize)]
pub struct SoldUnit {
    pub payload: String,
    pub taken_at: DateTime<Utc>,
    pub buyer: Option<UserId>,
    pub intent: Option<IntentId>,
    pub reverted: bool,
}

/// Catalog data read at proposal time.
#[derive(Debug, Clone, Copy)]
pub struct ProductInfo {
    pub price: Amount,
    pub allow_pre_order: bool,
    pub available: bool,
}

#[derive(Debug)]
struct Shelf {
    price: Amount,
    allow_pre_order: bool,
    units: VecDeque<String>,
    archive: Vec<SoldUnit>,
}

/// Owns every product's unit queue and archive. Safe to share across threads.
#[derive(Debug, Default)]
pub struct InventoryStore {
    shelves: DashMap<ProductId, Shelf>,
}

impl InventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a product. The price must be positive; a free or negative
    /// price would turn the confirm debit into a payout. Returns `Ok(false)`
    /// if the id is already taken.
    pub fn add_product(
        &self,
        product: ProductId,
        price: Amount,
        allow_pre_order: bool,
    ) -> Result<bool, StockError> {
        if price <= Amount::ZERO {
            return Err(StockError::InvalidPrice { product, price });
        }
        let mut added = false;
        self.shelves.entry(product).or_insert_with(|| {
            added = true;
            Shelf {
                price,
                allow_pre_order,
                units: VecDeque::new(),
                archive: Vec::new(),
            }
        });
        Ok(added)
    }

    /// Append credential units to the tail of a product's queue (restock).
    pub fn add_units(
        &self,
        product: ProductId,
        payloads: impl IntoIterator<Item = String>,
    ) -> Result<usize, StockError> {
        let mut shelf = self
            .shelves
            .get_mut(&product)
            .ok_or(StockError::ProductNotFound(product))?;
        let before = shelf.units.len();
        shelf.units.extend(payloads);
        Ok(shelf.units.len() - before)
    }

    pub fn info(&self, product: ProductId) -> Option<ProductInfo> {
        self.shelves.get(&product).map(|shelf| ProductInfo {
            price: shelf.price,
            allow_pre_order: shelf.allow_pre_order,
            available: !shelf.units.is_empty(),
        })
    }

    /// Remaining unit count. Display and availability derivation only; commit
    /// decisions must rely on [`take`](Self::take)'s own verdict.
    pub fn count(&self, product: ProductId) -> Option<usize> {
        self.shelves.get(&product).map(|shelf| shelf.units.len())
    }

    /// Units actually sold (archived and not reverted).
    pub fn sold_count(&self, product: ProductId) -> Option<usize> {
        self.shelves
            .get(&product)
            .map(|shelf| shelf.archive.iter().filter(|u| !u.reverted).count())
    }

    /// Atomically pop the oldest unit and archive it.
    ///
    /// A busy entry is retried once before surfacing [`StockError::Conflict`].
    pub fn take(&self, product: ProductId) -> Result<String, StockError> {
        for attempt in 0..2 {
            match self.shelves.try_get_mut(&product) {
                TryResult::Present(mut shelf) => {
                    let Some(payload) = shelf.units.pop_front() else {
                        return Err(StockError::OutOfStock(product));
                    };
                    shelf.archive.push(SoldUnit {
                        payload: payload.clone(),
                        taken_at: Utc::now(),
                        buyer: None,
                        intent: None,
                        reverted: false,
                    });
                    return Ok(payload);
                }
                TryResult::Absent => return Err(StockError::ProductNotFound(product)),
                TryResult::Locked => {
                    if attempt == 0 {
                        std::thread::yield_now();
                    }
                }
            }
        }
        Err(StockError::Conflict)
    }

    /// Compensating op for a taken unit whose purchase failed to commit.
    ///
    /// The payload goes back to the head of the queue so it is the next unit
    /// out; the archive row is marked reverted, never deleted.
    pub fn return_unit(&self, product: ProductId, payload: &str) -> Result<(), StockError> {
        let mut shelf = self
            .shelves
            .get_mut(&product)
            .ok_or(StockError::ProductNotFound(product))?;
        shelf.units.push_front(payload.to_owned());

        match shelf
            .archive
            .iter_mut()
            .rev()
            .find(|unit| !unit.reverted && unit.payload == payload)
        {
            Some(unit) => unit.reverted = true,
            // the unit is back on the shelf either way
            None => warn!(product, "returned unit has no matching archive row"),
        }
        Ok(())
    }

    /// Record the buyer linkage on the most recent archive row for a payload.
    pub fn commit_sale(
        &self,
        product: ProductId,
        payload: &str,
        buyer: UserId,
        intent: IntentId,
    ) -> Result<(), StockError> {
        let mut shelf = self
            .shelves
            .get_mut(&product)
            .ok_or(StockError::ProductNotFound(product))?;
        match shelf
            .archive
            .iter_mut()
            .rev()
            .find(|unit| !unit.reverted && unit.payload == payload)
        {
            Some(unit) => {
                unit.buyer = Some(buyer);
                unit.intent = Some(intent);
            }
            None => warn!(product, buyer, "sold unit has no matching archive row"),
        }
        Ok(())
    }

    /// Archive rows for a product, oldest first.
    pub fn archive(&self, product: ProductId) -> Option<Vec<SoldUnit>> {
        self.shelves
            .get(&product)
            .map(|shelf| shelf.archive.clone())
    }

    /// Stock and sales totals per product, sorted by id. For state dumps.
    pub fn snapshot(&self) -> Vec<(ProductId, usize, usize)> {
        let mut rows: Vec<_> = self
            .shelves
            .iter()
            .map(|entry| {
                let sold = entry.archive.iter().filter(|u| !u.reverted).count();
                (*entry.key(), entry.units.len(), sold)
            })
            .collect();
        rows.sort_by_key(|(product, ..)| *product);
        rows
    }
}
