//! Account balances and the expense check.
//!
//! Balances are derived on every read from the active transactions of an
//! account and are never stored.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use diesel::dsl::sum;
use diesel::prelude::*;
use diesel::PgConnection;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::Account;
use crate::schema::transactions;

pub const ENTRY_CATEGORIES: &[&str] = &["don", "parrainage", "subvention", "vente", "autre"];
pub const EXIT_CATEGORIES: &[&str] = &[
    "alimentation",
    "sante",
    "education",
    "salaires",
    "loyer",
    "fournitures",
    "transport",
    "autre",
];

/// Largest amount a `NUMERIC(12,2)` column holds.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(1_410_065_408, 2, 0, false, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Entree,
    Sortie,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Entree => "entree",
            Direction::Sortie => "sortie",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Direction::Entree => "Entrée",
            Direction::Sortie => "Sortie",
        }
    }

    pub fn categories(self) -> &'static [&'static str] {
        match self {
            Direction::Entree => ENTRY_CATEGORIES,
            Direction::Sortie => EXIT_CATEGORIES,
        }
    }

    pub fn accepts_category(self, category: &str) -> bool {
        self.categories().contains(&category)
    }

    /// Net effect of `amount` on a balance.
    pub fn signed(self, amount: Decimal) -> Decimal {
        match self {
            Direction::Entree => amount,
            Direction::Sortie => -amount,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "entree" | "entrée" => Ok(Direction::Entree),
            "sortie" => Ok(Direction::Sortie),
            other => Err(format!("unknown direction '{other}', expected entree or sortie")),
        }
    }
}

/// Rejects non-positive amounts and anything that does not fit in cents.
pub fn validate_amount(amount: Decimal) -> Result<Decimal, String> {
    if amount <= Decimal::ZERO {
        return Err("amount must be greater than zero".into());
    }
    if amount.normalize().scale() > 2 {
        return Err("amount must have at most two decimal places".into());
    }
    if amount >= MAX_AMOUNT {
        return Err("amount is too large".into());
    }
    Ok(money(amount))
}

/// Forces two decimal places so amounts always serialise as `"0.00"`.
pub fn money(mut value: Decimal) -> Decimal {
    value.rescale(2);
    value
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateWindow {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateWindow {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Result<Self, String> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err("start date must not be after end date".into());
            }
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |start| date >= start) && self.end.map_or(true, |end| date <= end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerTotals {
    pub initial_balance: Decimal,
    pub total_entries: Decimal,
    pub total_exits: Decimal,
    pub balance: Decimal,
}

impl LedgerTotals {
    pub fn new(initial_balance: Decimal, total_entries: Decimal, total_exits: Decimal) -> Self {
        Self {
            initial_balance: money(initial_balance),
            total_entries: money(total_entries),
            total_exits: money(total_exits),
            balance: money(initial_balance + total_entries - total_exits),
        }
    }

    pub fn zero() -> Self {
        Self::new(Decimal::ZERO, Decimal::ZERO, Decimal::ZERO)
    }

    pub fn combine(self, other: LedgerTotals) -> Self {
        Self::new(
            self.initial_balance + other.initial_balance,
            self.total_entries + other.total_entries,
            self.total_exits + other.total_exits,
        )
    }
}

/// Totals per account over `window`, counting active transactions only.
/// `exclude` leaves one transaction out, for re-checking an edited row.
pub fn account_totals(
    conn: &mut PgConnection,
    accounts: &[Account],
    window: DateWindow,
    exclude: Option<Uuid>,
) -> QueryResult<HashMap<Uuid, LedgerTotals>> {
    if accounts.is_empty() {
        return Ok(HashMap::new());
    }
    let account_ids: Vec<Uuid> = accounts.iter().map(|account| account.id).collect();

    let mut query = transactions::table
        .group_by((transactions::account_id, transactions::direction))
        .select((
            transactions::account_id,
            transactions::direction,
            sum(transactions::amount),
        ))
        .into_boxed()
        .filter(transactions::account_id.eq_any(account_ids))
        .filter(transactions::is_active.eq(true));

    if let Some(start) = window.start {
        query = query.filter(transactions::transaction_date.ge(start));
    }
    if let Some(end) = window.end {
        query = query.filter(transactions::transaction_date.le(end));
    }
    if let Some(excluded) = exclude {
        query = query.filter(transactions::id.ne(excluded));
    }

    let rows: Vec<(Uuid, String, Option<Decimal>)> = query.load(conn)?;

    let mut sums: HashMap<Uuid, (Decimal, Decimal)> = HashMap::new();
    for (account_id, direction, total) in rows {
        let total = total.unwrap_or(Decimal::ZERO);
        let entry = sums.entry(account_id).or_insert((Decimal::ZERO, Decimal::ZERO));
        match direction.parse::<Direction>() {
            Ok(Direction::Entree) => entry.0 += total,
            Ok(Direction::Sortie) => entry.1 += total,
            Err(_) => {
                tracing::warn!(account_id = %account_id, direction = %direction, "ignoring transactions with unknown direction");
            }
        }
    }

    Ok(accounts
        .iter()
        .map(|account| {
            let (entries, exits) = sums
                .get(&account.id)
                .copied()
                .unwrap_or((Decimal::ZERO, Decimal::ZERO));
            (
                account.id,
                LedgerTotals::new(account.initial_balance, entries, exits),
            )
        })
        .collect())
}

/// Current balance of one account across its whole history.
pub fn current_balance(
    conn: &mut PgConnection,
    account: &Account,
    exclude: Option<Uuid>,
) -> QueryResult<Decimal> {
    let totals = account_totals(
        conn,
        std::slice::from_ref(account),
        DateWindow::default(),
        exclude,
    )?;
    Ok(totals
        .get(&account.id)
        .map(|totals| totals.balance)
        .unwrap_or_else(|| money(account.initial_balance)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("insufficient balance: {balance} available, {requested} requested")]
pub struct ExpenseRejected {
    pub balance: Decimal,
    pub requested: Decimal,
}

/// Point-in-time funds check for an outgoing amount. Returns the balance the
/// account will have once the expense is recorded.
pub fn authorize_expense(
    balance: Decimal,
    amount: Decimal,
    allow_negative_balance: bool,
) -> Result<Decimal, ExpenseRejected> {
    if balance < amount && !allow_negative_balance {
        return Err(ExpenseRejected {
            balance: money(balance),
            requested: money(amount),
        });
    }
    Ok(money(balance - amount))
}

impl From<ExpenseRejected> for AppError {
    fn from(value: ExpenseRejected) -> Self {
        AppError::validation(
            value.to_string(),
            json!({
                "balance": value.balance,
                "requested": value.requested,
            }),
        )
    }
}
