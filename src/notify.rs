//! Notification boundary.
//!
//! The engine decides *that* and *what* to notify; delivery, retry, and
//! operator fan-out belong to the consumer on the other end of the channel.
//! Sends are fire-and-forget: a closed channel is logged, never an error.

use tokio::sync::mpsc;
use tracing::warn;

use crate::Amount;
use crate::model::{IntentId, PreOrderId, ProductId, UserId};

/// Who a notice is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Buyer(UserId),
    Operator,
}

/// Template data for a single outbound message.
#[derive(Debug, Clone)]
pub enum NoticeEvent {
    BalanceCredited {
        amount: Amount,
        balance_after: Amount,
    },
    PurchaseCompleted {
        user: UserId,
        product: ProductId,
        payload: String,
        price: Amount,
        balance_after: Amount,
        stock_after: usize,
    },
    IntentExpired {
        intent: IntentId,
        product: ProductId,
    },
    PreOrderPlaced {
        order: PreOrderId,
        user: UserId,
        product: ProductId,
        price: Amount,
        note: String,
    },
    PreOrderFulfilled {
        order: PreOrderId,
        product: ProductId,
        payload: String,
    },
    PreOrderCanceled {
        order: PreOrderId,
        product: ProductId,
        refund: Amount,
    },
    /// Reconciliation alert: a unit was taken but neither sold nor returned.
    ReconciliationAlert {
        intent: IntentId,
        user: UserId,
        product: ProductId,
        payload: String,
        reason: String,
    },
}

/// An addressed notice, ready for the delivery layer.
#[derive(Debug, Clone)]
pub struct Notice {
    pub recipient: Recipient,
    pub event: NoticeEvent,
}

/// Sending half handed to the engine.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Notice>,
}

impl Dispatcher {
    /// Create a dispatcher and the receiving end for the delivery layer.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a notice. Never blocks and never fails the calling operation.
    pub fn send(&self, recipient: Recipient, event: NoticeEvent) {
        let notice = Notice { recipient, event };
        if self.tx.send(notice).is_err() {
            warn!(?recipient, "notification channel closed, notice dropped");
        }
    }
}
