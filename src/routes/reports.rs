use axum::extract::{Json, Query, State};
use chrono::NaiveDate;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::sites::site_names;
use crate::access::{Caller, Permission, ScopeDomain};
use crate::error::{AppError, AppResult};
use crate::ledger::{account_totals, DateWindow, LedgerTotals};
use crate::models::Account;
use crate::schema::accounts;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ReportQuery {
    pub site: Option<Uuid>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

#[derive(Serialize)]
pub struct AccountReportLine {
    pub account_id: Uuid,
    pub name: String,
    pub site_id: Uuid,
    pub site_name: Option<String>,
    #[serde(flatten)]
    pub totals: LedgerTotals,
}

#[derive(Serialize)]
pub struct FinancialReport {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub site_id: Option<Uuid>,
    pub accounts: Vec<AccountReportLine>,
    pub totals: LedgerTotals,
}

/// Entry and exit totals per active account over the requested window.
pub async fn financial_report(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<ReportQuery>,
) -> AppResult<Json<FinancialReport>> {
    caller.require(Permission::ViewReport)?;
    let window = DateWindow::new(params.start, params.end).map_err(AppError::bad_request)?;

    let scope = caller.scope(ScopeDomain::Financial);
    if let Some(site_id) = params.site {
        if !scope.permits(site_id) {
            return Err(AppError::forbidden());
        }
    }

    let mut conn = state.db()?;
    let mut query = accounts::table
        .filter(accounts::is_active.eq(true))
        .into_boxed();
    if let Some(ids) = scope.narrowed(params.site).restriction() {
        query = query.filter(accounts::site_id.eq_any(ids));
    }
    let rows: Vec<Account> = query
        .order((accounts::site_id.asc(), accounts::name.asc()))
        .load(&mut conn)?;

    let totals = account_totals(&mut conn, &rows, window, None)?;
    let mut site_ids: Vec<Uuid> = rows.iter().map(|account| account.site_id).collect();
    site_ids.dedup();
    let names = site_names(&mut conn, &site_ids)?;

    let mut grand = LedgerTotals::zero();
    let lines = rows
        .into_iter()
        .map(|account| {
            let line_totals = totals
                .get(&account.id)
                .copied()
                .unwrap_or_else(LedgerTotals::zero);
            grand = grand.combine(line_totals);
            AccountReportLine {
                account_id: account.id,
                site_name: names.get(&account.site_id).cloned(),
                site_id: account.site_id,
                name: account.name,
                totals: line_totals,
            }
        })
        .collect();

    Ok(Json(FinancialReport {
        start: window.start,
        end: window.end,
        site_id: params.site,
        accounts: lines,
        totals: grand,
    }))
}
