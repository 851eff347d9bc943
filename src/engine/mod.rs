//! Purchase transaction engine.
//!
//! The engine coordinates the purchase state machine over the ledger,
//! inventory, audit log and reservation timers, and carries the pre-order
//! manager for the out-of-stock path. It is a cheap-to-clone handle; all
//! state lives behind shared maps and every operation is safe under
//! arbitrary interleaving.
//!
//! A proposal reserves nothing: no funds or stock are held during the
//! confirmation window, so confirmation re-validates everything. The one
//! correctness-critical contract is confirm's take-then-debit ordering with a
//! compensating return when the debit fails after the take succeeded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_stream::{Stream, StreamExt};
use tracing::{error, info, warn};

use crate::Amount;
use crate::audit::{Actor, AuditEvent, AuditLog};
use crate::inventory::{InventoryStore, StockError};
use crate::ledger::{Ledger, LedgerError};
use crate::model::{IntentId, Op, ProductId, UserId};
use crate::notify::{Dispatcher, NoticeEvent, Recipient};
use crate::timer::ReservationTimer;

mod intent;
pub use intent::{IntentState, PurchaseIntent};

mod error;
pub use error::{CancelError, ConfirmError, EngineError, PreOrderError, ProposeError};

mod preorder;
pub use preorder::{PreOrder, PreOrderManager, PreOrderState};

/// Engine tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// How long a proposed intent stays confirmable.
    pub confirmation_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confirmation_window: Duration::from_secs(5 * 60),
        }
    }
}

/// Outcome of a confirmed purchase. The credential payload is handed out
/// exactly once, here.
#[derive(Debug, Clone)]
pub struct PurchaseReceipt {
    pub intent: IntentId,
    pub user: UserId,
    pub product: ProductId,
    pub payload: String,
    pub price: Amount,
    pub balance_after: Amount,
    pub stock_after: usize,
}

/// The purchase transaction engine.
///
/// Clones share all state; hand one to each front-end session.
#[derive(Debug, Clone)]
pub struct Engine {
    ledger: Arc<Ledger>,
    inventory: Arc<InventoryStore>,
    audit: Arc<AuditLog>,
    timers: ReservationTimer,
    dispatcher: Dispatcher,
    preorders: PreOrderManager,
    intents: Arc<DashMap<IntentId, PurchaseIntent>>,
    /// At most one live intent per user; re-proposing supersedes.
    live: Arc<DashMap<UserId, IntentId>>,
    next_intent: Arc<AtomicU64>,
    window: Duration,
}

/// Public API
impl Engine {
    pub fn new(config: EngineConfig, dispatcher: Dispatcher) -> Self {
        let ledger = Arc::new(Ledger::new());
        let inventory = Arc::new(InventoryStore::new());
        let audit = Arc::new(AuditLog::new());
        let preorders = PreOrderManager::new(
            Arc::clone(&ledger),
            Arc::clone(&inventory),
            Arc::clone(&audit),
            dispatcher.clone(),
        );
        Self {
            ledger,
            inventory,
            audit,
            timers: ReservationTimer::new(),
            dispatcher,
            preorders,
            intents: Arc::new(DashMap::new()),
            live: Arc::new(DashMap::new()),
            next_intent: Arc::new(AtomicU64::new(0)),
            window: config.confirmation_window,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn inventory(&self) -> &InventoryStore {
        &self.inventory
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn preorders(&self) -> &PreOrderManager {
        &self.preorders
    }

    /// Credit a user's balance (operator recharge) and audit it. Negative
    /// amounts are rejected by the ledger before anything changes.
    pub fn credit(&self, user: UserId, amount: Amount) -> Result<Amount, LedgerError> {
        let balance_after = self.ledger.credit(user, amount)?;
        self.audit.append(
            Actor::Operator,
            AuditEvent::BalanceCredited {
                user,
                amount,
                balance_after,
            },
        );
        self.dispatcher.send(
            Recipient::Buyer(user),
            NoticeEvent::BalanceCredited {
                amount,
                balance_after,
            },
        );
        Ok(balance_after)
    }

    /// Open a purchase intent.
    ///
    /// Reads price and availability without reserving anything, arms the
    /// confirmation timer and supersedes any earlier live intent of the same
    /// user (last proposal wins). Must run inside a tokio runtime.
    pub fn propose(
        &self,
        user: UserId,
        product: ProductId,
    ) -> Result<PurchaseIntent, ProposeError> {
        if !self.ledger.contains(user) {
            return Err(ProposeError::UserNotFound(user));
        }
        let info = self
            .inventory
            .info(product)
            .ok_or(ProposeError::ProductNotFound(product))?;
        if !info.available {
            return Err(ProposeError::OutOfStock {
                product,
                allow_pre_order: info.allow_pre_order,
            });
        }

        let id = self.next_intent.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Instant::now();
        let intent = PurchaseIntent {
            id,
            user,
            product,
            price: info.price,
            state: IntentState::Proposed,
            created_at: now,
            expires_at: now + self.window,
        };
        self.intents.insert(id, intent.clone());

        if let Some(previous) = self.live.insert(user, id) {
            self.supersede(previous);
        }

        let engine = self.clone();
        self.timers.start(id, self.window, async move {
            engine.expire(id);
        });

        info!(intent = id, user, product, price = %info.price, "intent proposed");
        Ok(intent)
    }

    /// Confirm a proposed intent: re-validate, take a unit, debit the price.
    ///
    /// The take happens before the debit; if the debit then fails the unit is
    /// returned to the shelf before the error surfaces. Exactly one of
    /// confirm, cancel or expiry wins the transition out of `Proposed`.
    pub fn confirm(&self, id: IntentId) -> Result<PurchaseReceipt, ConfirmError> {
        let mut entry = self
            .intents
            .get_mut(&id)
            .ok_or(ConfirmError::IntentNotFound(id))?;

        match entry.state {
            IntentState::Proposed => {}
            IntentState::Expired => return Err(ConfirmError::Expired(id)),
            state => return Err(ConfirmError::InvalidState { intent: id, state }),
        }
        if entry.is_expired(Instant::now()) {
            // deadline passed but the timer has not run yet; expire here
            entry.state = IntentState::Expired;
            self.close(&entry);
            self.dispatcher.send(
                Recipient::Buyer(entry.user),
                NoticeEvent::IntentExpired {
                    intent: id,
                    product: entry.product,
                },
            );
            return Err(ConfirmError::Expired(id));
        }

        let (user, product, price) = (entry.user, entry.product, entry.price);

        // (1) live balance pre-check, to fail before touching stock
        let available = self
            .ledger
            .balance(user)
            .ok_or_else(|| ConfirmError::Internal(format!("ledger lost user {user}")))?;
        if available < price {
            entry.state = IntentState::Canceled;
            self.close(&entry);
            return Err(ConfirmError::InsufficientFunds {
                user,
                available,
                required: price,
            });
        }

        // (2) take one unit
        let payload = match self.inventory.take(product) {
            Ok(payload) => payload,
            Err(StockError::OutOfStock(_)) => {
                entry.state = IntentState::Canceled;
                self.close(&entry);
                return Err(ConfirmError::OutOfStock(product));
            }
            // nothing mutated; the intent stays confirmable
            Err(StockError::Conflict) => return Err(ConfirmError::Conflict),
            Err(err) => {
                entry.state = IntentState::Canceled;
                self.close(&entry);
                return Err(ConfirmError::Internal(format!(
                    "inventory take failed: {err}"
                )));
            }
        };

        // (3) debit, compensating the take on failure
        let balance_after = match self.ledger.debit(user, price) {
            Ok(balance) => balance,
            Err(debit_err) => {
                if let Err(return_err) = self.inventory.return_unit(product, &payload) {
                    return Err(self.compensation_failed(
                        &mut entry,
                        payload,
                        &debit_err,
                        &return_err,
                    ));
                }
                return Err(match debit_err {
                    LedgerError::InsufficientFunds {
                        user,
                        available,
                        required,
                    } => {
                        entry.state = IntentState::Canceled;
                        self.close(&entry);
                        ConfirmError::InsufficientFunds {
                            user,
                            available,
                            required,
                        }
                    }
                    // unit returned, intent stays confirmable
                    LedgerError::Conflict => ConfirmError::Conflict,
                    err => {
                        entry.state = IntentState::Canceled;
                        self.close(&entry);
                        ConfirmError::Internal(format!("debit failed: {err}"))
                    }
                });
            }
        };

        // (4) committed: link the sale, settle the intent, audit and notify
        if let Err(e) = self.inventory.commit_sale(product, &payload, user, id) {
            warn!(intent = id, error = %e, "sale committed but linkage failed");
        }
        entry.state = IntentState::Fulfilled;
        self.close(&entry);

        let stock_after = self.inventory.count(product).unwrap_or(0);
        self.audit.append(
            Actor::User(user),
            AuditEvent::PurchaseCompleted {
                intent: id,
                user,
                product,
                payload: payload.clone(),
                price,
                balance_after,
                stock_after,
            },
        );
        let completed = NoticeEvent::PurchaseCompleted {
            user,
            product,
            payload: payload.clone(),
            price,
            balance_after,
            stock_after,
        };
        self.dispatcher.send(Recipient::Buyer(user), completed.clone());
        self.dispatcher.send(Recipient::Operator, completed);

        info!(intent = id, user, product, price = %price, stock_after, "purchase fulfilled");
        Ok(PurchaseReceipt {
            intent: id,
            user,
            product,
            payload,
            price,
            balance_after,
            stock_after,
        })
    }

    /// Cancel a proposed intent. No financial or stock effect.
    pub fn cancel(&self, id: IntentId) -> Result<(), CancelError> {
        let mut entry = self
            .intents
            .get_mut(&id)
            .ok_or(CancelError::IntentNotFound(id))?;
        if entry.state != IntentState::Proposed {
            return Err(CancelError::InvalidState {
                intent: id,
                state: entry.state,
            });
        }
        entry.state = IntentState::Canceled;
        self.close(&entry);
        info!(intent = id, user = entry.user, "intent canceled");
        Ok(())
    }

    /// Confirm the live intent of `user`, as the chat front-end sees it.
    pub fn confirm_for(&self, user: UserId) -> Result<PurchaseReceipt, EngineError> {
        let id = self.live_intent(user).ok_or(EngineError::NoLiveIntent(user))?;
        Ok(self.confirm(id)?)
    }

    /// Cancel the live intent of `user`.
    pub fn cancel_for(&self, user: UserId) -> Result<(), EngineError> {
        let id = self.live_intent(user).ok_or(EngineError::NoLiveIntent(user))?;
        Ok(self.cancel(id)?)
    }

    pub fn intent(&self, id: IntentId) -> Option<PurchaseIntent> {
        self.intents.get(&id).map(|entry| entry.clone())
    }

    pub fn live_intent(&self, user: UserId) -> Option<IntentId> {
        self.live.get(&user).map(|entry| *entry)
    }

    /// Apply a single operation on top of the current engine state.
    pub fn apply(&self, op: Op) -> Result<(), EngineError> {
        match op {
            Op::AddProduct {
                product,
                price,
                allow_pre_order,
            } => {
                let result = self.inventory.add_product(product, price, allow_pre_order);
                match &result {
                    Ok(true) => info!(product, %price, allow_pre_order, "product added"),
                    Ok(false) => warn!(product, "product already exists, ignored"),
                    Err(e) => info!(reason = %e, "product skipped"),
                }
                result?;
                Ok(())
            }
            Op::AddStock { product, payload } => {
                let result = self.inventory.add_units(product, [payload]);
                Self::log_result("stock", &result);
                result?;
                Ok(())
            }
            Op::Credit { user, amount } => {
                let result = self.credit(user, amount);
                Self::log_result("credit", &result);
                result?;
                Ok(())
            }
            Op::Propose { user, product } => {
                let result = self.propose(user, product);
                Self::log_result("propose", &result);
                result?;
                Ok(())
            }
            Op::Confirm { user } => {
                let result = self.confirm_for(user);
                Self::log_result("confirm", &result);
                result?;
                Ok(())
            }
            Op::Cancel { user } => {
                let result = self.cancel_for(user);
                Self::log_result("cancel", &result);
                result?;
                Ok(())
            }
            Op::PreOrder {
                user,
                product,
                note,
            } => {
                let result = self.preorders.create(user, product, &note);
                Self::log_result("preorder", &result);
                result?;
                Ok(())
            }
            Op::FulfillPreOrder { order, payload } => {
                let result = self.preorders.fulfill(order, &payload);
                Self::log_result("fulfill", &result);
                result?;
                Ok(())
            }
            Op::CancelPreOrder { order } => {
                let result = self.preorders.cancel(order);
                Self::log_result("preorder-cancel", &result);
                result?;
                Ok(())
            }
        }
    }

    /// Run the engine over the given operation stream. Failures are logged
    /// and never stop the run.
    pub async fn run(&self, mut stream: impl Stream<Item = Op> + Unpin) {
        while let Some(op) = stream.next().await {
            let _ = self.apply(op);
        }
    }
}

/// Private API
impl Engine {
    /// Small helper to log `apply` results
    fn log_result<T, E: std::fmt::Display>(op: &str, result: &Result<T, E>) {
        match result {
            Ok(_) => info!("{op} applied"),
            Err(e) => info!(reason = %e, "{op} skipped"),
        }
    }

    /// Timer callback: expire the intent if it is still proposed.
    /// Loses silently to a confirm or cancel that got there first.
    fn expire(&self, id: IntentId) {
        let Some(mut entry) = self.intents.get_mut(&id) else {
            return;
        };
        if entry.state != IntentState::Proposed {
            return;
        }
        entry.state = IntentState::Expired;
        self.live
            .remove_if(&entry.user, |_, live_id| *live_id == id);
        self.dispatcher.send(
            Recipient::Buyer(entry.user),
            NoticeEvent::IntentExpired {
                intent: id,
                product: entry.product,
            },
        );
        info!(intent = id, user = entry.user, "intent expired");
    }

    /// A newer proposal replaced `id`; cancel it if still proposed.
    fn supersede(&self, id: IntentId) {
        self.timers.cancel(id);
        if let Some(mut entry) = self.intents.get_mut(&id) {
            if entry.state == IntentState::Proposed {
                entry.state = IntentState::Canceled;
                info!(intent = id, user = entry.user, "intent superseded");
            }
        }
    }

    /// Settle a terminal intent: disarm its timer and drop the live mapping.
    fn close(&self, intent: &PurchaseIntent) {
        self.timers.cancel(intent.id);
        self.live
            .remove_if(&intent.user, |_, live_id| *live_id == intent.id);
    }

    /// A taken unit could neither be sold nor returned. Escalate loudly:
    /// audit record plus operator alert, then surface `Internal`.
    fn compensation_failed(
        &self,
        entry: &mut PurchaseIntent,
        payload: String,
        debit_err: &LedgerError,
        return_err: &StockError,
    ) -> ConfirmError {
        let reason = format!("debit failed ({debit_err}), return failed ({return_err})");
        error!(
            intent = entry.id,
            user = entry.user,
            product = entry.product,
            reason,
            "compensation failed, unit neither sold nor returned"
        );
        self.audit.append(
            Actor::System,
            AuditEvent::CompensationFailed {
                intent: entry.id,
                user: entry.user,
                product: entry.product,
                payload: payload.clone(),
                reason: reason.clone(),
            },
        );
        self.dispatcher.send(
            Recipient::Operator,
            NoticeEvent::ReconciliationAlert {
                intent: entry.id,
                user: entry.user,
                product: entry.product,
                payload,
                reason: reason.clone(),
            },
        );
        entry.state = IntentState::Canceled;
        self.close(entry);
        ConfirmError::Internal(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notice;
    use tokio::sync::mpsc::UnboundedReceiver;

    // test utils

    fn engine() -> (Engine, UnboundedReceiver<Notice>) {
        let (dispatcher, rx) = Dispatcher::channel();
        (Engine::new(EngineConfig::default(), dispatcher), rx)
    }

    fn amount(scaled: i64) -> Amount {
        Amount::from_scaled(scaled)
    }

    /// Product 1 at price 10, one unit; user 1 funded with 10.
    fn seed_single_unit(engine: &Engine) {
        engine
            .inventory()
            .add_product(1, amount(100_000), false)
            .unwrap();
        engine
            .inventory()
            .add_units(1, ["alice@mail:pw".to_string()])
            .unwrap();
        engine.credit(1, amount(100_000)).unwrap();
    }

    // Propose

    #[tokio::test]
    async fn propose_snapshots_price_and_arms_timer() {
        let (engine, _rx) = engine();
        seed_single_unit(&engine);

        let intent = engine.propose(1, 1).unwrap();
        assert_eq!(intent.state, IntentState::Proposed);
        assert_eq!(intent.price, amount(100_000));
        assert!(engine.timers.is_armed(intent.id));
        assert_eq!(engine.live_intent(1), Some(intent.id));

        // nothing reserved yet
        assert_eq!(engine.ledger().balance(1), Some(amount(100_000)));
        assert_eq!(engine.inventory().count(1), Some(1));
    }

    #[tokio::test]
    async fn propose_unknown_user_fails() {
        let (engine, _rx) = engine();
        seed_single_unit(&engine);
        assert!(matches!(
            engine.propose(99, 1),
            Err(ProposeError::UserNotFound(99))
        ));
    }

    #[tokio::test]
    async fn propose_unknown_product_fails() {
        let (engine, _rx) = engine();
        engine.credit(1, amount(100)).unwrap();
        assert!(matches!(
            engine.propose(1, 99),
            Err(ProposeError::ProductNotFound(99))
        ));
    }

    #[tokio::test]
    async fn propose_empty_stock_reports_pre_order_flag() {
        let (engine, _rx) = engine();
        engine.credit(1, amount(100)).unwrap();
        engine.inventory().add_product(2, amount(50), true).unwrap();
        engine.inventory().add_product(3, amount(50), false).unwrap();

        assert!(matches!(
            engine.propose(1, 2),
            Err(ProposeError::OutOfStock {
                product: 2,
                allow_pre_order: true
            })
        ));
        assert!(matches!(
            engine.propose(1, 3),
            Err(ProposeError::OutOfStock {
                product: 3,
                allow_pre_order: false
            })
        ));
    }

    #[tokio::test]
    async fn reproposing_supersedes_the_live_intent() {
        let (engine, _rx) = engine();
        seed_single_unit(&engine);
        engine.inventory().add_product(2, amount(50), false).unwrap();
        engine
            .inventory()
            .add_units(2, ["bob@mail:pw".to_string()])
            .unwrap();

        let first = engine.propose(1, 1).unwrap();
        let second = engine.propose(1, 2).unwrap();

        assert_eq!(engine.intent(first.id).unwrap().state, IntentState::Canceled);
        assert!(!engine.timers.is_armed(first.id));
        assert_eq!(engine.live_intent(1), Some(second.id));

        // the superseded intent can no longer be confirmed
        assert!(matches!(
            engine.confirm(first.id),
            Err(ConfirmError::InvalidState {
                state: IntentState::Canceled,
                ..
            })
        ));
    }

    // Confirm

    #[tokio::test]
    async fn confirm_debits_takes_and_audits() {
        let (engine, _rx) = engine();
        seed_single_unit(&engine);

        let intent = engine.propose(1, 1).unwrap();
        let receipt = engine.confirm(intent.id).unwrap();

        assert_eq!(receipt.payload, "alice@mail:pw");
        assert_eq!(receipt.price, amount(100_000));
        assert_eq!(receipt.balance_after, Amount::ZERO);
        assert_eq!(receipt.stock_after, 0);

        assert_eq!(engine.ledger().balance(1), Some(Amount::ZERO));
        assert_eq!(engine.inventory().count(1), Some(0));
        assert_eq!(engine.inventory().sold_count(1), Some(1));
        assert_eq!(engine.intent(intent.id).unwrap().state, IntentState::Fulfilled);
        assert!(!engine.timers.is_armed(intent.id));
        assert_eq!(engine.live_intent(1), None);

        // one audit record with the full sale detail
        let records = engine.audit().records();
        let sale = records
            .iter()
            .find(|r| matches!(r.event, AuditEvent::PurchaseCompleted { .. }))
            .unwrap();
        match &sale.event {
            AuditEvent::PurchaseCompleted {
                payload,
                price,
                balance_after,
                stock_after,
                ..
            } => {
                assert_eq!(payload, "alice@mail:pw");
                assert_eq!(*price, amount(100_000));
                assert_eq!(*balance_after, Amount::ZERO);
                assert_eq!(*stock_after, 0);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // archive carries the buyer linkage
        let archive = engine.inventory().archive(1).unwrap();
        assert_eq!(archive[0].buyer, Some(1));
        assert_eq!(archive[0].intent, Some(intent.id));
    }

    #[tokio::test]
    async fn confirm_twice_fails_and_pays_once() {
        let (engine, _rx) = engine();
        seed_single_unit(&engine);

        let intent = engine.propose(1, 1).unwrap();
        engine.confirm(intent.id).unwrap();

        assert!(matches!(
            engine.confirm(intent.id),
            Err(ConfirmError::InvalidState {
                state: IntentState::Fulfilled,
                ..
            })
        ));
        assert_eq!(engine.ledger().balance(1), Some(Amount::ZERO));
    }

    #[tokio::test]
    async fn confirm_with_drained_balance_leaves_stock_untouched() {
        let (engine, _rx) = engine();
        seed_single_unit(&engine);
        engine
            .inventory()
            .add_product(2, amount(60_000), false)
            .unwrap();
        engine
            .inventory()
            .add_units(2, ["cheap@mail:pw".to_string()])
            .unwrap();

        let expensive = engine.propose(1, 1).unwrap();
        // spend elsewhere between propose and confirm
        engine.ledger().debit(1, amount(60_000)).unwrap();

        let result = engine.confirm(expensive.id);
        assert!(matches!(
            result,
            Err(ConfirmError::InsufficientFunds {
                user: 1,
                available,
                required,
            }) if available == amount(40_000) && required == amount(100_000)
        ));

        // terminal for the intent, no mutation happened
        assert_eq!(
            engine.intent(expensive.id).unwrap().state,
            IntentState::Canceled
        );
        assert_eq!(engine.inventory().count(1), Some(1));
        assert_eq!(engine.ledger().balance(1), Some(amount(40_000)));
    }

    #[tokio::test]
    async fn confirm_after_stock_drained_fails_out_of_stock() {
        let (engine, _rx) = engine();
        seed_single_unit(&engine);
        engine.credit(2, amount(100_000)).unwrap();

        let first = engine.propose(1, 1).unwrap();
        let second = engine.propose(2, 1).unwrap();

        engine.confirm(first.id).unwrap();
        let result = engine.confirm(second.id);
        assert!(matches!(result, Err(ConfirmError::OutOfStock(1))));
        assert_eq!(
            engine.intent(second.id).unwrap().state,
            IntentState::Canceled
        );
        // the loser's funds are untouched
        assert_eq!(engine.ledger().balance(2), Some(amount(100_000)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_confirms_on_last_unit_have_one_winner() {
        let (engine, _rx) = engine();
        seed_single_unit(&engine);
        engine.credit(2, amount(100_000)).unwrap();

        let a = engine.propose(1, 1).unwrap();
        let b = engine.propose(2, 1).unwrap();

        // a Conflict means the caller lost an access race and may retry
        let confirm_until_verdict = |engine: Engine, id: IntentId| loop {
            match engine.confirm(id) {
                Err(ConfirmError::Conflict) => continue,
                verdict => return verdict,
            }
        };

        let engine_a = engine.clone();
        let engine_b = engine.clone();
        let ha = std::thread::spawn(move || confirm_until_verdict(engine_a, a.id));
        let hb = std::thread::spawn(move || confirm_until_verdict(engine_b, b.id));
        let results = [ha.join().unwrap(), hb.join().unwrap()];

        let wins = results.iter().filter(|r| r.is_ok()).count();
        let out_of_stock = results
            .iter()
            .filter(|r| matches!(r, Err(ConfirmError::OutOfStock(1))))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(out_of_stock, 1);

        // the unit was sold exactly once and only the winner paid
        assert_eq!(engine.inventory().sold_count(1), Some(1));
        let paid: Vec<_> = [1, 2]
            .iter()
            .filter(|u| engine.ledger().balance(**u) == Some(Amount::ZERO))
            .collect();
        assert_eq!(paid.len(), 1);
    }

    // Compensation

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failed_debit_after_take_returns_the_unit() {
        let (engine, _rx) = engine();
        engine
            .inventory()
            .add_product(1, amount(100_000), false)
            .unwrap();
        engine
            .inventory()
            .add_units(1, ["first:pw".to_string(), "second:pw".to_string()])
            .unwrap();
        engine.credit(1, amount(100_000)).unwrap();

        // oscillate the balance between funded and drained so a drain can
        // land between confirm's balance check and its debit
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let drainer = {
            let engine = engine.clone();
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let _ = engine.ledger().debit(1, amount(100_000));
                    let _ = engine.ledger().credit(1, amount(100_000));
                }
            })
        };

        let reverted_rows = |engine: &Engine| {
            engine
                .inventory()
                .archive(1)
                .unwrap()
                .iter()
                .filter(|unit| unit.reverted)
                .count()
        };

        // a debit failure after the take is the only path that marks an
        // archive row reverted during a confirm
        let mut compensated = None;
        for i in 0..100_000 {
            let before = reverted_rows(&engine);
            let intent = engine.propose(1, 1).unwrap();
            match engine.confirm(intent.id) {
                Ok(_) => {
                    // replace the sold unit so the shelf never runs dry
                    engine
                        .inventory()
                        .add_units(1, [format!("restock{i}:pw")])
                        .unwrap();
                }
                Err(ConfirmError::InsufficientFunds { .. }) => {
                    if reverted_rows(&engine) > before {
                        compensated = Some(intent.id);
                        break;
                    }
                }
                // debit lost the entry race; the unit was returned too
                Err(ConfirmError::Conflict) => {}
                Err(other) => panic!("unexpected confirm error: {other}"),
            }
        }
        stop.store(true, Ordering::Relaxed);
        drainer.join().unwrap();

        let id = compensated.expect("debit never failed after a successful take");
        assert_eq!(engine.intent(id).unwrap().state, IntentState::Canceled);
        assert_eq!(engine.live_intent(1), None);

        // the returned payload sits at the head of the queue, next one out
        let returned = engine
            .inventory()
            .archive(1)
            .unwrap()
            .iter()
            .rev()
            .find(|unit| unit.reverted)
            .unwrap()
            .payload
            .clone();
        assert_eq!(engine.inventory().take(1).unwrap(), returned);
    }

    #[tokio::test]
    async fn unreturned_unit_raises_a_reconciliation_alert() {
        let (engine, mut rx) = engine();
        seed_single_unit(&engine);
        let intent = engine.propose(1, 1).unwrap();

        // the failed-return escalation, driven directly: the public surface
        // cannot lose a product mid-confirm
        let err = {
            let mut entry = engine.intents.get_mut(&intent.id).unwrap();
            engine.compensation_failed(
                &mut entry,
                "alice@mail:pw".to_string(),
                &LedgerError::Conflict,
                &StockError::ProductNotFound(1),
            )
        };

        assert!(matches!(err, ConfirmError::Internal(_)));
        assert_eq!(engine.intent(intent.id).unwrap().state, IntentState::Canceled);
        assert_eq!(engine.live_intent(1), None);
        assert!(engine.audit().records().iter().any(|record| matches!(
            record.event,
            AuditEvent::CompensationFailed { intent: id, user: 1, .. } if id == intent.id
        )));

        let mut alerted = false;
        while let Ok(notice) = rx.try_recv() {
            if matches!(notice.event, NoticeEvent::ReconciliationAlert { .. }) {
                assert_eq!(notice.recipient, Recipient::Operator);
                alerted = true;
            }
        }
        assert!(alerted);
    }

    // Amount validation

    #[tokio::test]
    async fn negative_credit_cannot_drive_a_balance_negative() {
        let (engine, _rx) = engine();
        engine.credit(1, amount(100_000)).unwrap();

        let result = engine.apply(Op::Credit {
            user: 1,
            amount: amount(-500_000),
        });
        assert!(matches!(
            result,
            Err(EngineError::Credit(LedgerError::NegativeAmount { .. }))
        ));
        assert_eq!(engine.ledger().balance(1), Some(amount(100_000)));
        // only the seeding credit was audited
        assert_eq!(engine.audit().len(), 1);
    }

    #[tokio::test]
    async fn negative_priced_product_is_rejected() {
        let (engine, _rx) = engine();
        engine.credit(1, amount(100_000)).unwrap();

        let result = engine.apply(Op::AddProduct {
            product: 1,
            price: amount(-50_000),
            allow_pre_order: false,
        });
        assert!(matches!(
            result,
            Err(EngineError::Stock(StockError::InvalidPrice { .. }))
        ));

        // never registered, so no purchase can pay a negative price
        assert!(engine.inventory().info(1).is_none());
        assert!(matches!(
            engine.propose(1, 1),
            Err(ProposeError::ProductNotFound(1))
        ));
    }

    // Cancel

    #[tokio::test]
    async fn cancel_is_free_of_side_effects() {
        let (engine, _rx) = engine();
        seed_single_unit(&engine);

        let intent = engine.propose(1, 1).unwrap();
        engine.cancel(intent.id).unwrap();

        assert_eq!(engine.intent(intent.id).unwrap().state, IntentState::Canceled);
        assert!(!engine.timers.is_armed(intent.id));
        assert_eq!(engine.live_intent(1), None);
        assert_eq!(engine.ledger().balance(1), Some(amount(100_000)));
        assert_eq!(engine.inventory().count(1), Some(1));
        assert!(engine.audit().records().iter().all(|r| !matches!(
            r.event,
            AuditEvent::PurchaseCompleted { .. }
        )));
    }

    #[tokio::test]
    async fn cancel_of_fulfilled_intent_fails() {
        let (engine, _rx) = engine();
        seed_single_unit(&engine);

        let intent = engine.propose(1, 1).unwrap();
        engine.confirm(intent.id).unwrap();

        assert!(matches!(
            engine.cancel(intent.id),
            Err(CancelError::InvalidState {
                state: IntentState::Fulfilled,
                ..
            })
        ));
    }

    // Expiry

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_intent_expires_without_mutation() {
        let (engine, mut rx) = engine();
        seed_single_unit(&engine);

        let intent = engine.propose(1, 1).unwrap();
        tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;

        assert_eq!(engine.intent(intent.id).unwrap().state, IntentState::Expired);
        assert_eq!(engine.live_intent(1), None);
        assert_eq!(engine.ledger().balance(1), Some(amount(100_000)));
        assert_eq!(engine.inventory().count(1), Some(1));

        // buyer was told; skip the credit notice from seeding
        let mut saw_expiry = false;
        while let Ok(notice) = rx.try_recv() {
            if matches!(notice.event, NoticeEvent::IntentExpired { .. }) {
                assert_eq!(notice.recipient, Recipient::Buyer(1));
                saw_expiry = true;
            }
        }
        assert!(saw_expiry);
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_of_expired_intent_fails() {
        let (engine, _rx) = engine();
        seed_single_unit(&engine);

        let intent = engine.propose(1, 1).unwrap();
        tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;

        assert!(matches!(
            engine.confirm(intent.id),
            Err(ConfirmError::Expired(_))
        ));
        assert_eq!(engine.ledger().balance(1), Some(amount(100_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_wins_over_a_late_timer() {
        let (engine, _rx) = engine();
        seed_single_unit(&engine);

        let intent = engine.propose(1, 1).unwrap();
        engine.confirm(intent.id).unwrap();

        // even if time passes, the settled intent stays fulfilled
        tokio::time::sleep(Duration::from_secs(10 * 60)).await;
        assert_eq!(engine.intent(intent.id).unwrap().state, IntentState::Fulfilled);
    }

    // Conservation invariants

    #[tokio::test]
    async fn audit_replay_matches_balances() {
        let (engine, _rx) = engine();
        engine
            .inventory()
            .add_product(1, amount(30_000), true)
            .unwrap();
        engine
            .inventory()
            .add_units(1, (0..3).map(|i| format!("u{i}:pw")))
            .unwrap();
        engine.credit(1, amount(100_000)).unwrap();
        engine.credit(2, amount(40_000)).unwrap();

        let a = engine.propose(1, 1).unwrap();
        engine.confirm(a.id).unwrap();
        let b = engine.propose(2, 1).unwrap();
        engine.confirm(b.id).unwrap();
        let c = engine.propose(1, 1).unwrap();
        engine.cancel(c.id).unwrap();

        for user in [1, 2] {
            assert_eq!(
                engine.audit().balance_delta_sum(user),
                engine.ledger().balance(user).unwrap(),
            );
        }
    }

    #[tokio::test]
    async fn units_are_conserved() {
        let (engine, _rx) = engine();
        engine
            .inventory()
            .add_product(1, amount(10_000), false)
            .unwrap();
        engine
            .inventory()
            .add_units(1, (0..5).map(|i| format!("u{i}:pw")))
            .unwrap();
        engine.credit(1, amount(100_000)).unwrap();

        for _ in 0..3 {
            let intent = engine.propose(1, 1).unwrap();
            engine.confirm(intent.id).unwrap();
        }

        let remaining = engine.inventory().count(1).unwrap();
        let sold = engine.inventory().sold_count(1).unwrap();
        assert_eq!(remaining + sold, 5);
    }

    // Scenario walkthroughs

    #[tokio::test]
    async fn single_unit_purchase_scenario() {
        // product P: 1 unit, price 10; user U: balance 10
        let (engine, _rx) = engine();
        seed_single_unit(&engine);

        let intent = engine.propose(1, 1).unwrap();
        assert_eq!(intent.state, IntentState::Proposed);

        let receipt = engine.confirm(intent.id).unwrap();
        assert_eq!(receipt.balance_after, Amount::ZERO);
        assert_eq!(engine.inventory().count(1), Some(0));

        let records = engine.audit().records();
        assert!(records.iter().any(|r| matches!(
            &r.event,
            AuditEvent::PurchaseCompleted { payload, price, .. }
                if payload == "alice@mail:pw" && *price == amount(100_000)
        )));
        assert_eq!(engine.audit().balance_delta_sum(1), Amount::ZERO);
    }

    #[tokio::test]
    async fn preorder_roundtrip_scenario() {
        // product Q: 0 units, pre-orderable, price 5; user V: balance 5
        let (engine, _rx) = engine();
        engine
            .inventory()
            .add_product(2, amount(50_000), true)
            .unwrap();
        engine.credit(2, amount(50_000)).unwrap();

        let order = engine.preorders().create(2, 2, "note").unwrap();
        assert_eq!(order.state, PreOrderState::Pending);
        assert_eq!(engine.ledger().balance(2), Some(Amount::ZERO));

        engine.preorders().cancel(order.id).unwrap();
        assert_eq!(
            engine.preorders().get(order.id).unwrap().state,
            PreOrderState::Canceled
        );
        assert_eq!(engine.ledger().balance(2), Some(amount(50_000)));
    }

    // Op stream runner

    #[tokio::test]
    async fn run_processes_an_op_stream() {
        let (engine, _rx) = engine();
        let ops = vec![
            Op::AddProduct {
                product: 1,
                price: amount(30_000),
                allow_pre_order: false,
            },
            Op::AddStock {
                product: 1,
                payload: "a:1".into(),
            },
            Op::Credit {
                user: 1,
                amount: amount(100_000),
            },
            Op::Propose { user: 1, product: 1 },
            Op::Confirm { user: 1 },
        ];

        engine.run(tokio_stream::iter(ops)).await;

        assert_eq!(engine.ledger().balance(1), Some(amount(70_000)));
        assert_eq!(engine.inventory().count(1), Some(0));
        assert_eq!(engine.inventory().sold_count(1), Some(1));
    }

    #[tokio::test]
    async fn run_skips_failed_ops_and_continues() {
        let (engine, _rx) = engine();
        let ops = vec![
            Op::AddProduct {
                product: 1,
                price: amount(30_000),
                allow_pre_order: false,
            },
            Op::AddStock {
                product: 1,
                payload: "a:1".into(),
            },
            Op::Credit {
                user: 1,
                amount: amount(10_000),
            },
            Op::Propose { user: 1, product: 1 },
            // fails: 10_000 < 30_000
            Op::Confirm { user: 1 },
            Op::Credit {
                user: 1,
                amount: amount(50_000),
            },
            Op::Propose { user: 1, product: 1 },
            Op::Confirm { user: 1 },
        ];

        engine.run(tokio_stream::iter(ops)).await;

        assert_eq!(engine.ledger().balance(1), Some(amount(30_000)));
        assert_eq!(engine.inventory().sold_count(1), Some(1));
    }

    #[tokio::test]
    async fn confirm_for_without_live_intent_fails() {
        let (engine, _rx) = engine();
        assert!(matches!(
            engine.confirm_for(9),
            Err(EngineError::NoLiveIntent(9))
        ));
    }
}
