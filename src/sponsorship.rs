//! Payment status of a sponsorship, recomputed on every read.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use diesel::dsl::sum;
use diesel::prelude::*;
use diesel::PgConnection;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::ledger::{money, Direction};
use crate::models::Sponsorship;
use crate::schema::transactions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    AJour,
    Partiel,
    EnRetard,
    Termine,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::AJour => "a_jour",
            PaymentStatus::Partiel => "partiel",
            PaymentStatus::EnRetard => "en_retard",
            PaymentStatus::Termine => "termine",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PaymentStatus::AJour => "À jour",
            PaymentStatus::Partiel => "Partiel",
            PaymentStatus::EnRetard => "En retard",
            PaymentStatus::Termine => "Terminé",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "a_jour" => Ok(PaymentStatus::AJour),
            "partiel" => Ok(PaymentStatus::Partiel),
            "en_retard" => Ok(PaymentStatus::EnRetard),
            "termine" => Ok(PaymentStatus::Termine),
            other => Err(format!(
                "unknown sponsorship status '{other}', expected a_jour, partiel, en_retard or termine"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PaymentSummary {
    pub status: PaymentStatus,
    pub status_label: &'static str,
    pub months_elapsed: u32,
    pub amount_expected: Decimal,
    pub amount_received: Decimal,
    pub difference: Decimal,
}

/// Calendar months from `start` to `today`, counting the current partial
/// month. Zero when the sponsorship has not started yet.
pub fn months_elapsed(start: NaiveDate, today: NaiveDate) -> u32 {
    let months = (today.year() - start.year()) * 12 + today.month() as i32 - start.month() as i32 + 1;
    months.max(0) as u32
}

pub fn is_ended(sponsorship: &Sponsorship, today: NaiveDate) -> bool {
    !sponsorship.is_active || sponsorship.end_date.map_or(false, |end| end < today)
}

/// Classifies a sponsorship given what its linked entries add up to.
///
/// An ended sponsorship is measured up to its end date so the figures stay
/// meaningful; its status is always `Termine`.
pub fn evaluate(sponsorship: &Sponsorship, received: Decimal, today: NaiveDate) -> PaymentSummary {
    let ended = is_ended(sponsorship, today);
    let reference = match sponsorship.end_date {
        Some(end) if ended && end < today => end,
        _ => today,
    };

    let months = months_elapsed(sponsorship.start_date, reference);
    let expected = sponsorship.monthly_amount * Decimal::from(months);
    let difference = received - expected;

    let status = if ended {
        PaymentStatus::Termine
    } else if difference >= Decimal::ZERO {
        PaymentStatus::AJour
    } else if difference.abs() > sponsorship.monthly_amount {
        PaymentStatus::EnRetard
    } else {
        PaymentStatus::Partiel
    };

    PaymentSummary {
        status,
        status_label: status.label(),
        months_elapsed: months,
        amount_expected: money(expected),
        amount_received: money(received),
        difference: money(difference),
    }
}

/// Sum of active entrée transactions linked to each sponsorship.
pub fn received_amounts(
    conn: &mut PgConnection,
    sponsorship_ids: &[Uuid],
) -> QueryResult<HashMap<Uuid, Decimal>> {
    if sponsorship_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows: Vec<(Option<Uuid>, Option<Decimal>)> = transactions::table
        .filter(transactions::sponsorship_id.eq_any(sponsorship_ids))
        .filter(transactions::is_active.eq(true))
        .filter(transactions::direction.eq(Direction::Entree.as_str()))
        .group_by(transactions::sponsorship_id)
        .select((transactions::sponsorship_id, sum(transactions::amount)))
        .load(conn)?;

    Ok(rows
        .into_iter()
        .filter_map(|(id, total)| id.map(|id| (id, total.unwrap_or(Decimal::ZERO))))
        .collect())
}
