use std::collections::BTreeSet;

use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use diesel::{prelude::*, PgConnection};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::accounts::find_account_in_scope;
use super::sites::site_names;
use crate::access::{Caller, Permission, ScopeDomain};
use crate::error::{AppError, AppResult};
use crate::export::{self, ExportFormat, TransactionExportRow};
use crate::history::to_iso;
use crate::ledger::{
    authorize_expense, current_balance, money, validate_amount, DateWindow, Direction,
};
use crate::models::{Account, NewTransaction, Sponsorship, Transaction};
use crate::schema::{accounts, children, sponsorships, transactions};
use crate::state::AppState;
use crate::utils::json::nullable;

#[derive(Deserialize)]
pub struct TransactionListQuery {
    pub site: Option<Uuid>,
    pub account: Option<Uuid>,
    pub direction: Option<String>,
    pub category: Option<String>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    #[serde(default)]
    pub format: ExportFormat,
}

#[derive(Deserialize)]
pub struct CreateTransactionRequest {
    pub account_id: Uuid,
    pub direction: String,
    pub category: String,
    pub amount: Decimal,
    pub transaction_date: NaiveDate,
    #[serde(default)]
    pub description: String,
    pub sponsorship_id: Option<Uuid>,
    #[serde(default)]
    pub allow_negative_balance: bool,
}

#[derive(Deserialize)]
pub struct UpdateTransactionRequest {
    pub account_id: Option<Uuid>,
    pub direction: Option<String>,
    pub category: Option<String>,
    pub amount: Option<Decimal>,
    pub transaction_date: Option<NaiveDate>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub sponsorship_id: Option<Option<Uuid>>,
    #[serde(default)]
    pub allow_negative_balance: bool,
}

#[derive(AsChangeset)]
#[diesel(table_name = transactions, treat_none_as_null = true)]
struct TransactionChangeset<'a> {
    account_id: Uuid,
    direction: &'a str,
    category: &'a str,
    amount: Decimal,
    transaction_date: NaiveDate,
    description: &'a str,
    sponsorship_id: Option<Uuid>,
    updated_at: NaiveDateTime,
}

#[derive(Serialize)]
pub struct TransactionResponse {
    pub id: Uuid,
    pub account_id: Uuid,
    pub account_name: String,
    pub site_id: Uuid,
    pub site_name: Option<String>,
    pub direction: String,
    pub direction_label: Option<&'static str>,
    pub category: String,
    pub amount: Decimal,
    pub signed_amount: Decimal,
    pub transaction_date: NaiveDate,
    pub description: String,
    pub sponsorship_id: Option<Uuid>,
    pub created_by: Option<Uuid>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl TransactionResponse {
    fn build(tx: Transaction, account_name: String, site_id: Uuid, site_name: Option<String>) -> Self {
        let direction = tx.direction.parse::<Direction>().ok();
        Self {
            id: tx.id,
            account_id: tx.account_id,
            account_name,
            site_id,
            site_name,
            direction_label: direction.map(Direction::label),
            signed_amount: money(direction.map_or(tx.amount, |d| d.signed(tx.amount))),
            direction: tx.direction,
            category: tx.category,
            amount: money(tx.amount),
            transaction_date: tx.transaction_date,
            description: tx.description,
            sponsorship_id: tx.sponsorship_id,
            created_by: tx.created_by,
            is_active: tx.is_active,
            created_at: to_iso(tx.created_at),
            updated_at: to_iso(tx.updated_at),
        }
    }
}

#[derive(Serialize)]
pub struct TransactionExportPreview {
    pub count: usize,
    pub rows: Vec<TransactionExportRow>,
}

/// Checked values of a transaction about to be written.
#[derive(Debug)]
struct TransactionDraft {
    direction: Direction,
    category: String,
    amount: Decimal,
    sponsorship_id: Option<Uuid>,
}

impl TransactionDraft {
    fn validate(
        direction: &str,
        category: &str,
        amount: Decimal,
        sponsorship_id: Option<Uuid>,
    ) -> AppResult<Self> {
        let direction: Direction = direction.parse().map_err(|msg: String| {
            AppError::validation(msg, json!({ "field": "direction" }))
        })?;
        let category = category.trim().to_lowercase();
        if !direction.accepts_category(&category) {
            return Err(AppError::validation(
                format!(
                    "category '{category}' is not valid for {}",
                    direction.as_str()
                ),
                json!({ "field": "category", "allowed": direction.categories() }),
            ));
        }
        let amount = validate_amount(amount)
            .map_err(|msg| AppError::validation(msg, json!({ "field": "amount" })))?;
        if sponsorship_id.is_some() && direction != Direction::Entree {
            return Err(AppError::validation(
                "only an entree can be linked to a sponsorship",
                json!({ "field": "sponsorship_id" }),
            ));
        }
        Ok(Self {
            direction,
            category,
            amount,
            sponsorship_id,
        })
    }
}

/// A linked sponsorship must be active and belong to a child of the
/// account's site.
fn check_sponsorship_link(
    conn: &mut PgConnection,
    account: &Account,
    sponsorship_id: Uuid,
) -> AppResult<()> {
    let found: Option<(Sponsorship, Uuid)> = sponsorships::table
        .inner_join(children::table)
        .filter(sponsorships::id.eq(sponsorship_id))
        .select((sponsorships::all_columns, children::site_id))
        .first(conn)
        .optional()?;
    match found {
        Some((sponsorship, site_id)) if sponsorship.is_active && site_id == account.site_id => Ok(()),
        Some(_) => Err(AppError::validation(
            "sponsorship is archived or belongs to another site",
            json!({ "field": "sponsorship_id" }),
        )),
        None => Err(AppError::validation(
            "sponsorship does not exist",
            json!({ "field": "sponsorship_id" }),
        )),
    }
}

fn active_account_in_scope(
    conn: &mut PgConnection,
    caller: &Caller,
    account_id: Uuid,
) -> AppResult<Account> {
    let account = find_account_in_scope(conn, caller, account_id).map_err(|err| {
        if err.status() == StatusCode::NOT_FOUND {
            AppError::validation("account not found", json!({ "field": "account_id" }))
        } else {
            err
        }
    })?;
    if !account.is_active {
        return Err(AppError::validation(
            "account is archived",
            json!({ "field": "account_id" }),
        ));
    }
    Ok(account)
}

fn find_transaction_in_scope(
    conn: &mut PgConnection,
    caller: &Caller,
    transaction_id: Uuid,
) -> AppResult<(Transaction, Account)> {
    let (tx, account): (Transaction, Account) = transactions::table
        .inner_join(accounts::table)
        .filter(transactions::id.eq(transaction_id))
        .select((transactions::all_columns, accounts::all_columns))
        .first(conn)?;
    if !caller.scope(ScopeDomain::Financial).permits(account.site_id) {
        return Err(AppError::not_found());
    }
    Ok((tx, account))
}

fn respond(
    conn: &mut PgConnection,
    tx: Transaction,
    account: &Account,
) -> AppResult<TransactionResponse> {
    let site_name = site_names(conn, &[account.site_id])?.remove(&account.site_id);
    Ok(TransactionResponse::build(
        tx,
        account.name.clone(),
        account.site_id,
        site_name,
    ))
}

/// Active transactions matching `params` within the caller's financial
/// scope, newest first, with account name and site. Listing, preview and
/// download all read through here.
fn filtered_transactions(
    conn: &mut PgConnection,
    caller: &Caller,
    params: &TransactionListQuery,
) -> AppResult<Vec<(Transaction, String, Uuid)>> {
    let window = DateWindow::new(params.start, params.end).map_err(AppError::bad_request)?;
    let direction = params
        .direction
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .map(str::parse::<Direction>)
        .transpose()
        .map_err(AppError::bad_request)?;

    let mut query = transactions::table
        .inner_join(accounts::table)
        .filter(transactions::is_active.eq(true))
        .select((transactions::all_columns, accounts::name, accounts::site_id))
        .into_boxed();

    if let Some(ids) = caller.scope(ScopeDomain::Financial).narrowed(params.site).restriction() {
        query = query.filter(accounts::site_id.eq_any(ids));
    }
    if let Some(account_id) = params.account {
        query = query.filter(transactions::account_id.eq(account_id));
    }
    if let Some(direction) = direction {
        query = query.filter(transactions::direction.eq(direction.as_str()));
    }
    if let Some(category) = params.category.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        query = query.filter(transactions::category.eq(category.to_lowercase()));
    }
    if let Some(start) = window.start {
        query = query.filter(transactions::transaction_date.ge(start));
    }
    if let Some(end) = window.end {
        query = query.filter(transactions::transaction_date.le(end));
    }

    Ok(query
        .order((
            transactions::transaction_date.desc(),
            transactions::created_at.desc(),
        ))
        .load(conn)?)
}

pub async fn list_transactions(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<TransactionListQuery>,
) -> AppResult<Json<Vec<TransactionResponse>>> {
    caller.require(Permission::ViewTransaction)?;
    let mut conn = state.db()?;
    let rows = filtered_transactions(&mut conn, &caller, &params)?;
    let site_ids: Vec<Uuid> = rows
        .iter()
        .map(|(_, _, site_id)| *site_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let names = site_names(&mut conn, &site_ids)?;

    Ok(Json(
        rows.into_iter()
            .map(|(tx, account_name, site_id)| {
                let site_name = names.get(&site_id).cloned();
                TransactionResponse::build(tx, account_name, site_id, site_name)
            })
            .collect(),
    ))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    caller: Caller,
    Path(transaction_id): Path<Uuid>,
) -> AppResult<Json<TransactionResponse>> {
    caller.require(Permission::ViewTransaction)?;
    let mut conn = state.db()?;
    let (tx, account) = find_transaction_in_scope(&mut conn, &caller, transaction_id)?;
    Ok(Json(respond(&mut conn, tx, &account)?))
}

pub async fn create_transaction(
    State(state): State<AppState>,
    caller: Caller,
    Json(payload): Json<CreateTransactionRequest>,
) -> AppResult<(StatusCode, Json<TransactionResponse>)> {
    caller.require(Permission::AddTransaction)?;
    let draft = TransactionDraft::validate(
        &payload.direction,
        &payload.category,
        payload.amount,
        payload.sponsorship_id,
    )?;

    let mut conn = state.db()?;
    let account = active_account_in_scope(&mut conn, &caller, payload.account_id)?;
    if let Some(sponsorship_id) = draft.sponsorship_id {
        check_sponsorship_link(&mut conn, &account, sponsorship_id)?;
    }

    // The balance read and the insert below are not serialised against
    // concurrent submissions on the same account.
    if draft.direction == Direction::Sortie {
        let balance = current_balance(&mut conn, &account, None)?;
        let remaining =
            authorize_expense(balance, draft.amount, payload.allow_negative_balance)?;
        if remaining < Decimal::ZERO {
            warn!(account_id = %account.id, balance = %balance, amount = %draft.amount, "expense recorded with negative balance override");
        }
    }

    let new_tx = NewTransaction {
        id: Uuid::new_v4(),
        account_id: account.id,
        direction: draft.direction.as_str().to_string(),
        category: draft.category,
        amount: draft.amount,
        transaction_date: payload.transaction_date,
        description: payload.description.trim().to_string(),
        sponsorship_id: draft.sponsorship_id,
        created_by: Some(caller.user_id),
    };
    let tx: Transaction = diesel::insert_into(transactions::table)
        .values(&new_tx)
        .get_result(&mut conn)?;

    info!(
        transaction_id = %tx.id,
        account_id = %tx.account_id,
        direction = %tx.direction,
        amount = %tx.amount,
        created_by = %caller.user_id,
        "transaction recorded"
    );
    Ok((StatusCode::CREATED, Json(respond(&mut conn, tx, &account)?)))
}

pub async fn update_transaction(
    State(state): State<AppState>,
    caller: Caller,
    Path(transaction_id): Path<Uuid>,
    Json(payload): Json<UpdateTransactionRequest>,
) -> AppResult<Json<TransactionResponse>> {
    caller.require(Permission::ChangeTransaction)?;
    let mut conn = state.db()?;
    let (existing, current_account) = find_transaction_in_scope(&mut conn, &caller, transaction_id)?;
    if !existing.is_active {
        return Err(AppError::bad_request("archived transactions cannot be modified"));
    }

    let account = match payload.account_id {
        Some(account_id) if account_id != current_account.id => {
            active_account_in_scope(&mut conn, &caller, account_id)?
        }
        _ if !current_account.is_active => {
            return Err(AppError::validation(
                "account is archived",
                json!({ "field": "account_id" }),
            ));
        }
        _ => current_account,
    };
    let direction = payload.direction.unwrap_or(existing.direction);
    let category = payload.category.unwrap_or(existing.category);
    let amount = payload.amount.unwrap_or(existing.amount);
    let sponsorship_id = payload.sponsorship_id.unwrap_or(existing.sponsorship_id);
    let draft = TransactionDraft::validate(&direction, &category, amount, sponsorship_id)?;

    if let Some(sponsorship_id) = draft.sponsorship_id {
        check_sponsorship_link(&mut conn, &account, sponsorship_id)?;
    }
    if draft.direction == Direction::Sortie {
        let balance = current_balance(&mut conn, &account, Some(existing.id))?;
        authorize_expense(balance, draft.amount, payload.allow_negative_balance)?;
    }

    let description = payload
        .description
        .map(|value| value.trim().to_string())
        .unwrap_or(existing.description);
    let changes = TransactionChangeset {
        account_id: account.id,
        direction: draft.direction.as_str(),
        category: &draft.category,
        amount: draft.amount,
        transaction_date: payload.transaction_date.unwrap_or(existing.transaction_date),
        description: &description,
        sponsorship_id: draft.sponsorship_id,
        updated_at: Utc::now().naive_utc(),
    };
    let tx: Transaction = diesel::update(transactions::table.find(transaction_id))
        .set(&changes)
        .get_result(&mut conn)?;

    info!(transaction_id = %tx.id, updated_by = %caller.user_id, "transaction updated");
    Ok(Json(respond(&mut conn, tx, &account)?))
}

pub async fn archive_transaction(
    State(state): State<AppState>,
    caller: Caller,
    Path(transaction_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    caller.require(Permission::ArchiveTransaction)?;
    let mut conn = state.db()?;
    find_transaction_in_scope(&mut conn, &caller, transaction_id)?;
    diesel::update(transactions::table.find(transaction_id))
        .set((
            transactions::is_active.eq(false),
            transactions::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;
    info!(transaction_id = %transaction_id, archived_by = %caller.user_id, "transaction archived");
    Ok(StatusCode::NO_CONTENT)
}

fn export_rows(
    conn: &mut PgConnection,
    caller: &Caller,
    params: &TransactionListQuery,
) -> AppResult<Vec<TransactionExportRow>> {
    let rows = filtered_transactions(conn, caller, params)?;
    let site_ids: Vec<Uuid> = rows
        .iter()
        .map(|(_, _, site_id)| *site_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let names = site_names(conn, &site_ids)?;
    Ok(rows
        .into_iter()
        .map(|(tx, account_name, site_id)| {
            let site_name = names.get(&site_id).map(String::as_str).unwrap_or("");
            TransactionExportRow::project(tx, &account_name, site_name)
        })
        .collect())
}

pub async fn export_preview(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<TransactionListQuery>,
) -> AppResult<Json<TransactionExportPreview>> {
    caller.require(Permission::ViewTransaction)?;
    let mut conn = state.db()?;
    let rows = export_rows(&mut conn, &caller, &params)?;
    Ok(Json(TransactionExportPreview {
        count: rows.len(),
        rows,
    }))
}

pub async fn export_download(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<TransactionListQuery>,
) -> AppResult<Response> {
    caller.require(Permission::ViewTransaction)?;
    let rows = {
        let mut conn = state.db()?;
        export_rows(&mut conn, &caller, &params)?
    };
    let bytes = export::render(params.format, "Transactions", &rows)?;
    info!(rows = rows.len(), format = params.format.extension(), exported_by = %caller.user_id, "transactions exported");
    let stem = format!("transactions_{}", Utc::now().format("%Y%m%d"));
    Ok(export::attachment(params.format, &stem, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    #[test]
    fn category_must_match_direction() {
        assert!(TransactionDraft::validate("entree", "don", dec("10"), None).is_ok());
        let err = TransactionDraft::validate("sortie", "don", dec("10"), None).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(TransactionDraft::validate("sortie", " Loyer ", dec("10"), None).is_ok());
    }

    #[test]
    fn sponsorship_link_requires_entree() {
        let sponsorship = Some(Uuid::new_v4());
        assert!(TransactionDraft::validate("entree", "parrainage", dec("10"), sponsorship).is_ok());
        assert!(TransactionDraft::validate("sortie", "autre", dec("10"), sponsorship).is_err());
    }

    #[test]
    fn amount_must_be_positive() {
        assert!(TransactionDraft::validate("entree", "don", dec("0"), None).is_err());
        assert!(TransactionDraft::validate("entree", "don", dec("-5"), None).is_err());
        let draft = TransactionDraft::validate("entree", "don", dec("12.5"), None).unwrap();
        assert_eq!(draft.amount.to_string(), "12.50");
    }
}
