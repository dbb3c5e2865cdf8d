use std::collections::BTreeSet;

use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use chrono::Utc;
use diesel::{prelude::*, PgConnection};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::sites::{ensure_site_exists, site_names};
use crate::access::{Caller, Permission, ScopeDomain};
use crate::error::{AppError, AppResult};
use crate::ledger::{account_totals, money, DateWindow, LedgerTotals, MAX_AMOUNT};
use crate::models::{Account, NewAccount};
use crate::schema::accounts;
use crate::state::AppState;
use crate::utils::json::required_text;

#[derive(Deserialize)]
pub struct AccountListQuery {
    pub site: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct CreateAccountRequest {
    pub site_id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub initial_balance: Decimal,
    #[serde(default)]
    pub description: String,
}

#[derive(Deserialize)]
pub struct UpdateAccountRequest {
    pub name: Option<String>,
    pub initial_balance: Option<Decimal>,
    pub description: Option<String>,
}

#[derive(AsChangeset)]
#[diesel(table_name = accounts)]
struct AccountChangeset {
    name: Option<String>,
    initial_balance: Option<Decimal>,
    description: Option<String>,
    updated_at: chrono::NaiveDateTime,
}

#[derive(Serialize)]
pub struct AccountResponse {
    pub id: Uuid,
    pub site_id: Uuid,
    pub site_name: Option<String>,
    pub name: String,
    pub description: String,
    pub is_active: bool,
    #[serde(flatten)]
    pub totals: LedgerTotals,
}

#[derive(Serialize)]
pub struct AccountOption {
    pub id: Uuid,
    pub name: String,
}

/// Loads an account whose site lies in the caller's financial scope.
pub(crate) fn find_account_in_scope(
    conn: &mut PgConnection,
    caller: &Caller,
    account_id: Uuid,
) -> AppResult<Account> {
    let account: Account = accounts::table.find(account_id).first(conn)?;
    if !caller.scope(ScopeDomain::Financial).permits(account.site_id) {
        return Err(AppError::not_found());
    }
    Ok(account)
}

fn validate_initial_balance(value: Decimal) -> AppResult<Decimal> {
    if value.normalize().scale() > 2 {
        return Err(AppError::validation(
            "initial_balance must have at most two decimal places",
            serde_json::json!({ "field": "initial_balance" }),
        ));
    }
    if value.abs() >= MAX_AMOUNT {
        return Err(AppError::validation(
            "initial_balance is too large",
            serde_json::json!({ "field": "initial_balance" }),
        ));
    }
    Ok(money(value))
}

fn build_responses(
    conn: &mut PgConnection,
    rows: Vec<Account>,
) -> AppResult<Vec<AccountResponse>> {
    let totals = account_totals(conn, &rows, DateWindow::default(), None)?;
    let site_ids: Vec<Uuid> = rows
        .iter()
        .map(|account| account.site_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let names = site_names(conn, &site_ids)?;

    Ok(rows
        .into_iter()
        .map(|account| AccountResponse {
            totals: totals
                .get(&account.id)
                .copied()
                .unwrap_or_else(|| LedgerTotals::new(account.initial_balance, Decimal::ZERO, Decimal::ZERO)),
            site_name: names.get(&account.site_id).cloned(),
            id: account.id,
            site_id: account.site_id,
            name: account.name,
            description: account.description,
            is_active: account.is_active,
        })
        .collect())
}

pub async fn list_accounts(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<AccountListQuery>,
) -> AppResult<Json<Vec<AccountResponse>>> {
    caller.require(Permission::ViewAccount)?;
    let mut conn = state.db()?;
    let mut query = accounts::table
        .filter(accounts::is_active.eq(true))
        .into_boxed();
    if let Some(ids) = caller.scope(ScopeDomain::Financial).narrowed(params.site).restriction() {
        query = query.filter(accounts::site_id.eq_any(ids));
    }
    let rows: Vec<Account> = query.order(accounts::name.asc()).load(&mut conn)?;
    Ok(Json(build_responses(&mut conn, rows)?))
}

pub async fn get_account(
    State(state): State<AppState>,
    caller: Caller,
    Path(account_id): Path<Uuid>,
) -> AppResult<Json<AccountResponse>> {
    caller.require(Permission::ViewAccount)?;
    let mut conn = state.db()?;
    let account = find_account_in_scope(&mut conn, &caller, account_id)?;
    let mut responses = build_responses(&mut conn, vec![account])?;
    responses.pop().map(Json).ok_or_else(AppError::not_found)
}

pub async fn create_account(
    State(state): State<AppState>,
    caller: Caller,
    Json(payload): Json<CreateAccountRequest>,
) -> AppResult<(StatusCode, Json<AccountResponse>)> {
    caller.require(Permission::ManageAccount)?;
    let site_id = caller
        .form_policy(ScopeDomain::Financial)
        .resolve_site(payload.site_id)?;

    let new_account = NewAccount {
        id: Uuid::new_v4(),
        site_id,
        name: required_text("name", &payload.name).map_err(AppError::bad_request)?,
        initial_balance: validate_initial_balance(payload.initial_balance)?,
        description: payload.description.trim().to_string(),
    };

    let mut conn = state.db()?;
    ensure_site_exists(&mut conn, site_id)?;
    let account: Account = diesel::insert_into(accounts::table)
        .values(&new_account)
        .get_result(&mut conn)?;

    info!(account_id = %account.id, site_id = %account.site_id, created_by = %caller.user_id, "account created");
    let mut responses = build_responses(&mut conn, vec![account])?;
    let response = responses.pop().ok_or_else(AppError::not_found)?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn update_account(
    State(state): State<AppState>,
    caller: Caller,
    Path(account_id): Path<Uuid>,
    Json(payload): Json<UpdateAccountRequest>,
) -> AppResult<Json<AccountResponse>> {
    caller.require(Permission::ManageAccount)?;
    let mut conn = state.db()?;
    let existing = find_account_in_scope(&mut conn, &caller, account_id)?;
    if !existing.is_active {
        return Err(AppError::bad_request("archived accounts cannot be modified"));
    }

    let changes = AccountChangeset {
        name: payload
            .name
            .as_deref()
            .map(|name| required_text("name", name))
            .transpose()
            .map_err(AppError::bad_request)?,
        initial_balance: payload
            .initial_balance
            .map(validate_initial_balance)
            .transpose()?,
        description: payload.description.map(|value| value.trim().to_string()),
        updated_at: Utc::now().naive_utc(),
    };

    let account: Account = diesel::update(accounts::table.find(account_id))
        .set(&changes)
        .get_result(&mut conn)?;
    info!(account_id = %account.id, updated_by = %caller.user_id, "account updated");
    let mut responses = build_responses(&mut conn, vec![account])?;
    responses.pop().map(Json).ok_or_else(AppError::not_found)
}

pub async fn archive_account(
    State(state): State<AppState>,
    caller: Caller,
    Path(account_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    caller.require(Permission::ManageAccount)?;
    let mut conn = state.db()?;
    find_account_in_scope(&mut conn, &caller, account_id)?;
    diesel::update(accounts::table.find(account_id))
        .set((
            accounts::is_active.eq(false),
            accounts::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;
    info!(account_id = %account_id, archived_by = %caller.user_id, "account archived");
    Ok(StatusCode::NO_CONTENT)
}

/// Active accounts of one site, for the dependent account dropdown.
pub async fn site_accounts(
    State(state): State<AppState>,
    caller: Caller,
    Path(site_id): Path<Uuid>,
) -> AppResult<Json<Vec<AccountOption>>> {
    if !caller.scope(ScopeDomain::Financial).permits(site_id) {
        return Err(AppError::forbidden());
    }
    let mut conn = state.db()?;
    let rows: Vec<(Uuid, String)> = accounts::table
        .filter(accounts::site_id.eq(site_id))
        .filter(accounts::is_active.eq(true))
        .order(accounts::name.asc())
        .select((accounts::id, accounts::name))
        .load(&mut conn)?;
    Ok(Json(
        rows.into_iter()
            .map(|(id, name)| AccountOption { id, name })
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    #[test]
    fn initial_balance_is_rounded_to_cents() {
        assert_eq!(validate_initial_balance(dec("12.5")).unwrap().to_string(), "12.50");
        assert_eq!(validate_initial_balance(dec("-300")).unwrap().to_string(), "-300.00");
    }

    #[test]
    fn initial_balance_outside_column_range_is_rejected() {
        let err = validate_initial_balance(dec("10000000000")).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let err = validate_initial_balance(dec("-10000000000")).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(validate_initial_balance(dec("9999999999.99")).is_ok());
    }

    #[test]
    fn initial_balance_rejects_fractions_of_cents() {
        let err = validate_initial_balance(dec("1.005")).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
