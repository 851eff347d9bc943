//! Sales report compiled from the audit feed.
//!
//! A periodic consumer builds the operator's digest here; the engine itself
//! never schedules or delivers it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::audit::{AuditEvent, AuditLog};
use crate::inventory::InventoryStore;
use crate::model::ProductId;

/// Per-product sales figures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductSales {
    pub product: ProductId,
    /// Units sold since the report window opened.
    pub sold_in_window: usize,
    /// Units still on the shelf.
    pub remaining: usize,
    /// Units sold over the product's lifetime.
    pub total_sold: usize,
}

/// Digest of sales and pre-order activity since `since`.
#[derive(Debug, Clone, Serialize)]
pub struct SalesReport {
    pub generated_at: DateTime<Utc>,
    pub since: DateTime<Utc>,
    pub products: Vec<ProductSales>,
    pub sold_in_window: usize,
    pub pre_orders_fulfilled: usize,
    pub pre_orders_pending: usize,
}

impl SalesReport {
    /// Replay the audit feed and combine it with current stock levels.
    pub fn compile(audit: &AuditLog, inventory: &InventoryStore, since: DateTime<Utc>) -> Self {
        let mut sold: BTreeMap<ProductId, usize> = BTreeMap::new();
        let mut created = 0usize;
        let mut fulfilled = 0usize;
        let mut canceled = 0usize;

        for record in audit.records() {
            match record.event {
                AuditEvent::PurchaseCompleted { product, .. } if record.at >= since => {
                    *sold.entry(product).or_default() += 1;
                }
                AuditEvent::PreOrderCreated { .. } => created += 1,
                AuditEvent::PreOrderFulfilled { .. } => fulfilled += 1,
                AuditEvent::PreOrderCanceled { .. } => canceled += 1,
                _ => {}
            }
        }

        let products: Vec<ProductSales> = inventory
            .snapshot()
            .into_iter()
            .map(|(product, remaining, total_sold)| ProductSales {
                product,
                sold_in_window: sold.get(&product).copied().unwrap_or(0),
                remaining,
                total_sold,
            })
            .collect();
        let sold_in_window = products.iter().map(|p| p.sold_in_window).sum();

        Self {
            generated_at: Utc::now(),
            since,
            products,
            sold_in_window,
            pre_orders_fulfilled: fulfilled,
            pre_orders_pending: created.saturating_sub(fulfilled + canceled),
        }
    }
}

impl fmt::Display for SalesReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "sales report {}", self.generated_at.format("%Y-%m-%d %H:%M"))?;
        for sales in &self.products {
            writeln!(
                f,
                "  product {}: sold {} (lifetime {}), {} remaining",
                sales.product, sales.sold_in_window, sales.total_sold, sales.remaining
            )?;
        }
        writeln!(f, "  total sold: {}", self.sold_in_window)?;
        writeln!(f, "  pre-orders fulfilled: {}", self.pre_orders_fulfilled)?;
        write!(f, "  pre-orders pending: {}", self.pre_orders_pending)
    }
}
