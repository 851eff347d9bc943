//! Core domain identifiers and the engine's input operations.

use crate::Amount;

/// Buyer identifier, assigned by the chat front-end.
pub type UserId = u64;

/// Product identifier.
pub type ProductId = u64;

/// Purchase intent identifier, assigned by the engine.
pub type IntentId = u64;

/// Pre-order identifier, assigned by the engine.
pub type PreOrderId = u64;

/// An operation representing the possible inputs of the engine.
///
/// `Confirm` and `Cancel` are keyed by user rather than intent id because the
/// chat front-end tracks one live intent per user.
#[derive(Debug, Clone)]
pub enum Op {
    /// Register a product in the catalog.
    AddProduct {
        product: ProductId,
        price: Amount,
        allow_pre_order: bool,
    },
    /// Add one credential unit to a product's inventory.
    AddStock { product: ProductId, payload: String },
    /// Credit a user's balance (operator recharge).
    Credit { user: UserId, amount: Amount },
    /// Open a purchase intent for a user on a product.
    Propose { user: UserId, product: ProductId },
    /// Confirm the user's live intent.
    Confirm { user: UserId },
    /// Cancel the user's live intent.
    Cancel { user: UserId },
    /// Place a pre-order for an out-of-stock product.
    PreOrder {
        user: UserId,
        product: ProductId,
        note: String,
    },
    /// Operator fulfills a pending pre-order with an out-of-band credential.
    FulfillPreOrder { order: PreOrderId, payload: String },
    /// Operator cancels a pending pre-order, refunding the held funds.
    CancelPreOrder { order: PreOrderId },
}
