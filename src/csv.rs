//! CSV op scripts and state dumps.
//!
//! The binary replays a script of engine operations from a CSV file and
//! prints the final ledger and inventory state back out as CSV.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::model::{Op, PreOrderId, ProductId, UserId};
use crate::{Amount, report::SalesReport};

/// Errors that can occur when parsing script rows
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized op '{op}'")]
    UnrecognizedOp { line: usize, op: String },

    #[error("line {line}: {op} missing {field}")]
    MissingField {
        line: usize,
        op: String,
        field: &'static str,
    },
}

#[derive(Debug, Deserialize)]
struct InputRow {
    op: String,
    user: Option<UserId>,
    product: Option<ProductId>,
    order: Option<PreOrderId>,
    amount: Option<f64>,
    text: Option<String>,
}

impl InputRow {
    fn require<T>(&self, value: Option<T>, line: usize, field: &'static str) -> Result<T, ScriptError> {
        value.ok_or_else(|| ScriptError::MissingField {
            line,
            op: self.op.clone(),
            field,
        })
    }

    fn text(&self, line: usize, field: &'static str) -> Result<String, ScriptError> {
        let text = self.text.clone().filter(|t| !t.is_empty());
        self.require(text, line, field)
    }

    fn into_op(self, line: usize) -> Result<Op, ScriptError> {
        match self.op.as_str() {
            "product" => Ok(Op::AddProduct {
                product: self.require(self.product, line, "product")?,
                price: Amount::from_float(self.require(self.amount, line, "amount")?),
                allow_pre_order: self.text.as_deref() == Some("preorder"),
            }),
            "stock" => Ok(Op::AddStock {
                product: self.require(self.product, line, "product")?,
                payload: self.text(line, "text")?,
            }),
            "credit" => Ok(Op::Credit {
                user: self.require(self.user, line, "user")?,
                amount: Amount::from_float(self.require(self.amount, line, "amount")?),
            }),
            "propose" => Ok(Op::Propose {
                user: self.require(self.user, line, "user")?,
                product: self.require(self.product, line, "product")?,
            }),
            "confirm" => Ok(Op::Confirm {
                user: self.require(self.user, line, "user")?,
            }),
            "cancel" => Ok(Op::Cancel {
                user: self.require(self.user, line, "user")?,
            }),
            "preorder" => Ok(Op::PreOrder {
                user: self.require(self.user, line, "user")?,
                product: self.require(self.product, line, "product")?,
                note: self.text.clone().unwrap_or_default(),
            }),
            "fulfill" => Ok(Op::FulfillPreOrder {
                order: self.require(self.order, line, "order")?,
                payload: self.text(line, "text")?,
            }),
            "preorder-cancel" => Ok(Op::CancelPreOrder {
                order: self.require(self.order, line, "order")?,
            }),
            other => Err(ScriptError::UnrecognizedOp {
                line,
                op: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct UserRow {
    user: UserId,
    balance: String,
}

#[derive(Debug, Serialize)]
struct ProductRow {
    product: ProductId,
    stock: usize,
    sold: usize,
}

/// Read engine operations from a csv script
pub fn read_ops(path: impl AsRef<Path>) -> impl Iterator<Item = Result<Op, ScriptError>> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .expect("failed to open csv file");

    reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| ScriptError::Parse { line, source })?;
            row.into_op(line)
        })
}

/// Write final user balances to stdout in csv format
pub fn write_users(users: impl IntoIterator<Item = (UserId, Amount)>) {
    let stdout = io::stdout();
    let mut writer = csv::Writer::from_writer(stdout.lock());

    for (user, balance) in users {
        let row = UserRow {
            user,
            balance: balance.to_string(),
        };
        writer.serialize(&row).expect("failed to write csv row");
    }

    writer.flush().expect("failed to flush csv writer");
}

/// Write final product stock levels to stdout in csv format
pub fn write_products(products: impl IntoIterator<Item = (ProductId, usize, usize)>) {
    let stdout = io::stdout();
    let mut writer = csv::Writer::from_writer(stdout.lock());

    for (product, stock, sold) in products {
        let row = ProductRow {
            product,
            stock,
            sold,
        };
        writer.serialize(&row).expect("failed to write csv row");
    }

    writer.flush().expect("failed to flush csv writer");
}

/// Write the per-product lines of a sales report in csv format
pub fn write_report(report: &SalesReport, to: impl io::Write) -> csv::Result<()> {
    let mut writer = csv::Writer::from_writer(to);
    for sales in &report.products {
        writer.serialize(sales)?;
    }
    writer.flush()?;
    Ok(())
}
