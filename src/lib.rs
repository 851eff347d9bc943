pub mod amount;
pub mod audit;
pub mod csv;
pub mod engine;
pub mod inventory;
pub mod ledger;
pub mod model;
pub mod notify;
pub mod report;
pub mod timer;

pub use amount::Amount;
pub use engine::{Engine, EngineConfig, PurchaseReceipt};
pub use model::{IntentId, Op, PreOrderId, ProductId, UserId};
pub use notify::{Dispatcher, Notice};
