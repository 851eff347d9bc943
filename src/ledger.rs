//! Per-user balance ledger.
//!
//! The ledger is the only component allowed to mutate balances. Each mutation
//! happens entirely under the user's map entry guard, so a debit's
//! balance check and subtraction are one atomic step and a balance can never
//! go negative.

use dashmap::DashMap;
use dashmap::try_result::TryResult;
use thiserror::Error;

use crate::Amount;
use crate::model::UserId;

/// Error during a ledger debit.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("insufficient funds for user {user}: available {available}, required {required}")]
    InsufficientFunds {
        user: UserId,
        available: Amount,
        required: Amount,
    },

    #[error("negative amount {amount} for user {user}")]
    NegativeAmount { user: UserId, amount: Amount },

    #[error("user entry busy, lost the access race")]
    Conflict,
}

/// Owns every user balance. Safe to share across threads.
#[derive(Debug, Default)]
pub struct Ledger {
    balances: DashMap<UserId, Amount>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user with a zero balance. Returns false if already known.
    pub fn register(&self, user: UserId) -> bool {
        let mut known = true;
        self.balances.entry(user).or_insert_with(|| {
            known = false;
            Amount::ZERO
        });
        !known
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.balances.contains_key(&user)
    }

    pub fn balance(&self, user: UserId) -> Option<Amount> {
        self.balances.get(&user).map(|b| *b)
    }

    /// Credit a user, creating the account if needed. A negative amount is
    /// rejected; it would be a disguised unchecked debit. Returns the
    /// resulting balance.
    pub fn credit(&self, user: UserId, amount: Amount) -> Result<Amount, LedgerError> {
        if amount < Amount::ZERO {
            return Err(LedgerError::NegativeAmount { user, amount });
        }
        let mut balance = self.balances.entry(user).or_insert(Amount::ZERO);
        *balance += amount;
        Ok(*balance)
    }

    /// Debit a user if the available balance covers the amount.
    ///
    /// The check and the subtraction run under the entry guard. A busy entry
    /// is retried once before surfacing [`LedgerError::Conflict`]. Returns the
    /// resulting balance.
    pub fn debit(&self, user: UserId, amount: Amount) -> Result<Amount, LedgerError> {
        if amount < Amount::ZERO {
            return Err(LedgerError::NegativeAmount { user, amount });
        }
        for attempt in 0..2 {
            match self.balances.try_get_mut(&user) {
                TryResult::Present(mut balance) => {
                    if *balance < amount {
                        return Err(LedgerError::InsufficientFunds {
                            user,
                            available: *balance,
                            required: amount,
                        });
                    }
                    *balance -= amount;
                    return Ok(*balance);
                }
                TryResult::Absent => return Err(LedgerError::UserNotFound(user)),
                TryResult::Locked => {
                    if attempt == 0 {
                        std::thread::yield_now();
                    }
                }
            }
        }
        Err(LedgerError::Conflict)
    }

    /// All balances, sorted by user id. For state dumps and reports only.
    pub fn snapshot(&self) -> Vec<(UserId, Amount)> {
        let mut rows: Vec<_> = self
            .balances
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        rows.sort_by_key(|(user, _)| *user);
        rows
    }
}
