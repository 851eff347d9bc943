//! Pre-order state machine.
//!
//! Unlike purchase intents, pre-orders hold funds: the full price is debited
//! at creation and refunded in full on cancellation. There is no time bound;
//! pending orders wait for an operator. Fulfillment payloads are supplied
//! out-of-band and never drawn from the shared inventory pool.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::info;

use crate::Amount;
use crate::audit::{Actor, AuditEvent, AuditLog};
use crate::inventory::InventoryStore;
use crate::ledger::{Ledger, LedgerError};
use crate::model::{PreOrderId, ProductId, UserId};
use crate::notify::{Dispatcher, NoticeEvent, Recipient};

use super::error::PreOrderError;

/// State of a pre-order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreOrderState {
    /// Paid, waiting for an operator.
    Pending,
    /// Operator delivered a credential.
    Fulfilled,
    /// Canceled and refunded.
    Canceled,
}

impl fmt::Display for PreOrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PreOrderState::Pending => "pending",
            PreOrderState::Fulfilled => "fulfilled",
            PreOrderState::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// A paid reservation against future restock.
#[derive(Debug, Clone)]
pub struct PreOrder {
    pub id: PreOrderId,
    pub user: UserId,
    pub product: ProductId,
    pub price_charged: Amount,
    pub note: String,
    pub state: PreOrderState,
    pub created_at: DateTime<Utc>,
    pub fulfillment: Option<String>,
    pub fulfilled_at: Option<DateTime<Utc>>,
}

/// Orchestrates pre-orders over the shared ledger and audit log.
#[derive(Debug, Clone)]
pub struct PreOrderManager {
    ledger: Arc<Ledger>,
    inventory: Arc<InventoryStore>,
    audit: Arc<AuditLog>,
    dispatcher: Dispatcher,
    orders: Arc<DashMap<PreOrderId, PreOrder>>,
    next_id: Arc<AtomicU64>,
}

impl PreOrderManager {
    pub fn new(
        ledger: Arc<Ledger>,
        inventory: Arc<InventoryStore>,
        audit: Arc<AuditLog>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            ledger,
            inventory,
            audit,
            dispatcher,
            orders: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Place a pre-order, debiting the full price immediately.
    ///
    /// The product must allow pre-orders and be out of stock; both are
    /// re-validated here rather than trusted from the caller's earlier check.
    pub fn create(
        &self,
        user: UserId,
        product: ProductId,
        note: &str,
    ) -> Result<PreOrder, PreOrderError> {
        if !self.ledger.contains(user) {
            return Err(PreOrderError::UserNotFound(user));
        }
        let info = self
            .inventory
            .info(product)
            .ok_or(PreOrderError::ProductNotFound(product))?;
        if !info.allow_pre_order {
            return Err(PreOrderError::NotAllowed(product));
        }
        if info.available {
            return Err(PreOrderError::StockAvailable(product));
        }

        let balance_after = self.ledger.debit(user, info.price).map_err(map_debit)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let order = PreOrder {
            id,
            user,
            product,
            price_charged: info.price,
            note: note.to_owned(),
            state: PreOrderState::Pending,
            created_at: Utc::now(),
            fulfillment: None,
            fulfilled_at: None,
        };
        self.orders.insert(id, order.clone());

        self.audit.append(
            Actor::User(user),
            AuditEvent::PreOrderCreated {
                order: id,
                user,
                product,
                price: info.price,
                balance_after,
            },
        );
        let placed = NoticeEvent::PreOrderPlaced {
            order: id,
            user,
            product,
            price: info.price,
            note: note.to_owned(),
        };
        self.dispatcher.send(Recipient::Buyer(user), placed.clone());
        self.dispatcher.send(Recipient::Operator, placed);

        info!(order = id, user, product, price = %info.price, "pre-order placed");
        Ok(order)
    }

    /// Operator fulfills a pending pre-order with an out-of-band credential.
    pub fn fulfill(&self, id: PreOrderId, payload: &str) -> Result<(), PreOrderError> {
        let mut order = self
            .orders
            .get_mut(&id)
            .ok_or(PreOrderError::NotFound(id))?;
        if order.state != PreOrderState::Pending {
            return Err(PreOrderError::InvalidState {
                order: id,
                state: order.state,
            });
        }

        order.state = PreOrderState::Fulfilled;
        order.fulfillment = Some(payload.to_owned());
        order.fulfilled_at = Some(Utc::now());

        self.audit.append(
            Actor::Operator,
            AuditEvent::PreOrderFulfilled {
                order: id,
                user: order.user,
                product: order.product,
                payload: payload.to_owned(),
            },
        );
        self.dispatcher.send(
            Recipient::Buyer(order.user),
            NoticeEvent::PreOrderFulfilled {
                order: id,
                product: order.product,
                payload: payload.to_owned(),
            },
        );

        info!(order = id, user = order.user, "pre-order fulfilled");
        Ok(())
    }

    /// Cancel a pending pre-order and refund the full held price.
    pub fn cancel(&self, id: PreOrderId) -> Result<(), PreOrderError> {
        let mut order = self
            .orders
            .get_mut(&id)
            .ok_or(PreOrderError::NotFound(id))?;
        if order.state != PreOrderState::Pending {
            return Err(PreOrderError::InvalidState {
                order: id,
                state: order.state,
            });
        }

        let refund = order.price_charged;
        let balance_after = self.ledger.credit(order.user, refund).map_err(map_debit)?;
        order.state = PreOrderState::Canceled;

        self.audit.append(
            Actor::Operator,
            AuditEvent::PreOrderCanceled {
                order: id,
                user: order.user,
                product: order.product,
                refund,
                balance_after,
            },
        );
        self.dispatcher.send(
            Recipient::Buyer(order.user),
            NoticeEvent::PreOrderCanceled {
                order: id,
                product: order.product,
                refund,
            },
        );

        info!(order = id, user = order.user, refund = %refund, "pre-order canceled");
        Ok(())
    }

    pub fn get(&self, id: PreOrderId) -> Option<PreOrder> {
        self.orders.get(&id).map(|order| order.clone())
    }

    /// Pending orders, oldest id first. For operator dashboards.
    pub fn pending(&self) -> Vec<PreOrder> {
        let mut pending: Vec<_> = self
            .orders
            .iter()
            .filter(|entry| entry.state == PreOrderState::Pending)
            .map(|entry| entry.clone())
            .collect();
        pending.sort_by_key(|order| order.id);
        pending
    }
}

fn map_debit(err: LedgerError) -> PreOrderError {
    match err {
        LedgerError::UserNotFound(user) => PreOrderError::UserNotFound(user),
        LedgerError::InsufficientFunds {
            user,
            available,
            required,
        } => PreOrderError::InsufficientFunds {
            user,
            available,
            required,
        },
        LedgerError::Conflict => PreOrderError::Conflict,
        // prices are validated positive at registration
        err @ LedgerError::NegativeAmount { .. } => PreOrderError::Internal(err.to_string()),
    }
}
