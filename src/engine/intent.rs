use std::fmt;

use tokio::time::Instant;

use crate::Amount;
use crate::model::{IntentId, ProductId, UserId};

/// State of a purchase intent. Everything after `Proposed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentState {
    /// Awaiting confirmation within the window. Nothing is reserved.
    Proposed,
    /// Confirmed and paid; the credential was handed out.
    Fulfilled,
    /// Canceled by the user, or superseded by a newer proposal.
    Canceled,
    /// The confirmation window elapsed.
    Expired,
}

impl fmt::Display for IntentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IntentState::Proposed => "proposed",
            IntentState::Fulfilled => "fulfilled",
            IntentState::Canceled => "canceled",
            IntentState::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// A proposed-but-unconfirmed purchase.
///
/// The price is snapshotted at proposal time; later catalog edits cannot
/// retroactively change an in-flight purchase. Terminal intents are kept for
/// inspection but never mutated again.
#[derive(Debug, Clone)]
pub struct PurchaseIntent {
    pub id: IntentId,
    pub user: UserId,
    pub product: ProductId,
    pub price: Amount,
    pub state: IntentState,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl PurchaseIntent {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}
