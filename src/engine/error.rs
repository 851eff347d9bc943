//! Error taxonomy for the purchase and pre-order state machines.

use thiserror::Error;

use crate::Amount;
use crate::inventory::StockError;
use crate::ledger::LedgerError;
use crate::model::{IntentId, PreOrderId, ProductId, UserId};

use super::intent::IntentState;
use super::preorder::PreOrderState;

/// Top-level error returned by [`Engine::apply`](super::Engine::apply).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("propose failed: {0}")]
    Propose(#[from] ProposeError),

    #[error("confirm failed: {0}")]
    Confirm(#[from] ConfirmError),

    #[error("cancel failed: {0}")]
    Cancel(#[from] CancelError),

    #[error("pre-order failed: {0}")]
    PreOrder(#[from] PreOrderError),

    #[error("stock update failed: {0}")]
    Stock(#[from] StockError),

    #[error("credit failed: {0}")]
    Credit(#[from] LedgerError),

    #[error("user {0} has no live intent")]
    NoLiveIntent(UserId),
}

/// Error during proposal. `OutOfStock` carries the pre-order flag so the
/// caller can route the user to the pre-order flow.
#[derive(Debug, Error)]
pub enum ProposeError {
    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("product {0} not found")]
    ProductNotFound(ProductId),

    #[error("product {product} is out of stock (allow_pre_order: {allow_pre_order})")]
    OutOfStock {
        product: ProductId,
        allow_pre_order: bool,
    },
}

/// Error during confirmation. Business failures are terminal for the intent.
#[derive(Debug, Error)]
pub enum ConfirmError {
    #[error("intent {0} not found")]
    IntentNotFound(IntentId),

    #[error("intent {intent} is {state}, not proposed")]
    InvalidState {
        intent: IntentId,
        state: IntentState,
    },

    #[error("intent {0} expired before confirmation")]
    Expired(IntentId),

    #[error("insufficient funds for user {user}: available {available}, required {required}")]
    InsufficientFunds {
        user: UserId,
        available: Amount,
        required: Amount,
    },

    #[error("product {0} ran out of stock before confirmation")]
    OutOfStock(ProductId),

    #[error("lost an access race, safe to retry or re-propose")]
    Conflict,

    #[error("internal failure: {0}")]
    Internal(String),
}

/// Error during cancellation.
#[derive(Debug, Error)]
pub enum CancelError {
    #[error("intent {0} not found")]
    IntentNotFound(IntentId),

    #[error("intent {intent} is {state}, not proposed")]
    InvalidState {
        intent: IntentId,
        state: IntentState,
    },
}

/// Error in the pre-order state machine.
#[derive(Debug, Error)]
pub enum PreOrderError {
    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("product {0} not found")]
    ProductNotFound(ProductId),

    #[error("product {0} does not allow pre-orders")]
    NotAllowed(ProductId),

    #[error("product {0} has stock, purchase it instead")]
    StockAvailable(ProductId),

    #[error("insufficient funds for user {user}: available {available}, required {required}")]
    InsufficientFunds {
        user: UserId,
        available: Amount,
        required: Amount,
    },

    #[error("pre-order {0} not found")]
    NotFound(PreOrderId),

    #[error("pre-order {order} is {state}, not pending")]
    InvalidState {
        order: PreOrderId,
        state: PreOrderState,
    },

    #[error("lost an access race, safe to retry")]
    Conflict,

    #[error("internal failure: {0}")]
    Internal(String),
}
