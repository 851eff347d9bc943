//! Append-only audit log.
//!
//! Every committed balance or inventory mutation produces exactly one record
//! here. The engine only writes; reporting consumers read the feed. Records
//! are never mutated or deleted, which is what makes the replay invariant in
//! [`balance_delta_sum`](AuditLog::balance_delta_sum) meaningful.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Amount;
use crate::model::{IntentId, PreOrderId, ProductId, UserId};

/// Who performed the recorded transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Actor {
    User(UserId),
    Operator,
    System,
}

/// The recorded transition itself.
#[derive(Debug, Clone, Serialize)]
pub enum AuditEvent {
    /// Operator recharge of a user balance.
    BalanceCredited {
        user: UserId,
        amount: Amount,
        balance_after: Amount,
    },
    /// A confirmed purchase: one unit sold, one debit applied.
    PurchaseCompleted {
        intent: IntentId,
        user: UserId,
        product: ProductId,
        payload: String,
        price: Amount,
        balance_after: Amount,
        stock_after: usize,
    },
    /// Pre-order placed; the full price is held from this point on.
    PreOrderCreated {
        order: PreOrderId,
        user: UserId,
        product: ProductId,
        price: Amount,
        balance_after: Amount,
    },
    /// Pre-order fulfilled with an operator-supplied credential.
    PreOrderFulfilled {
        order: PreOrderId,
        user: UserId,
        product: ProductId,
        payload: String,
    },
    /// Pre-order canceled; held funds refunded in full.
    PreOrderCanceled {
        order: PreOrderId,
        user: UserId,
        product: ProductId,
        refund: Amount,
        balance_after: Amount,
    },
    /// A taken unit could not be returned after a failed debit. The one
    /// failure mode that can leave state inconsistent; must never be silent.
    CompensationFailed {
        intent: IntentId,
        user: UserId,
        product: ProductId,
        payload: String,
        reason: String,
    },
}

impl AuditEvent {
    /// Signed balance effect of this event on `user`, if any.
    pub fn balance_delta(&self, target: UserId) -> Option<Amount> {
        match self {
            AuditEvent::BalanceCredited { user, amount, .. } if *user == target => Some(*amount),
            AuditEvent::PurchaseCompleted { user, price, .. } if *user == target => Some(-*price),
            AuditEvent::PreOrderCreated { user, price, .. } if *user == target => Some(-*price),
            AuditEvent::PreOrderCanceled { user, refund, .. } if *user == target => Some(*refund),
            _ => None,
        }
    }
}

/// One committed state transition.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub actor: Actor,
    pub event: AuditEvent,
}

/// Append-only record store. Safe to share across threads.
#[derive(Debug, Default)]
pub struct AuditLog {
    records: RwLock<Vec<AuditRecord>>,
    next_seq: AtomicU64,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record, returning its sequence number.
    pub fn append(&self, actor: Actor, event: AuditEvent) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let record = AuditRecord {
            seq,
            at: Utc::now(),
            actor,
            event,
        };
        // lock poisoning only happens if an appender panicked mid-push;
        // the log is still append-only, keep serving
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.push(record);
        seq
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the full feed, in append order.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.read().clone()
    }

    /// Replay the feed and sum every balance delta for `user`.
    ///
    /// For any user this must equal current balance minus initial balance.
    pub fn balance_delta_sum(&self, user: UserId) -> Amount {
        self.read()
            .iter()
            .filter_map(|record| record.event.balance_delta(user))
            .sum()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<AuditRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }
}
