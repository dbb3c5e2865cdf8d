use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use diesel::{dsl, pg::Pg, prelude::*, result::DatabaseErrorKind, PgConnection};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::sites::site_names;
use crate::access::{Caller, Permission, ScopeDomain};
use crate::error::{AppError, AppResult};
use crate::history::to_iso;
use crate::ledger::{money, validate_amount};
use crate::models::{NewSponsorship, Sponsorship};
use crate::schema::{children, sponsorships};
use crate::sponsorship::{evaluate, received_amounts, PaymentStatus, PaymentSummary};
use crate::state::AppState;
use crate::utils::json::{nullable, required_text};

#[derive(Deserialize)]
pub struct SponsorshipListQuery {
    pub site: Option<Uuid>,
    pub status: Option<String>,
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Deserialize)]
pub struct CreateSponsorshipRequest {
    pub child_id: Uuid,
    pub sponsor_name: String,
    pub monthly_amount: Decimal,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

#[derive(Deserialize)]
pub struct UpdateSponsorshipRequest {
    pub sponsor_name: Option<String>,
    pub monthly_amount: Option<Decimal>,
    pub start_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "nullable")]
    pub end_date: Option<Option<NaiveDate>>,
}

#[derive(AsChangeset)]
#[diesel(table_name = sponsorships, treat_none_as_null = true)]
struct SponsorshipChangeset<'a> {
    sponsor_name: &'a str,
    monthly_amount: Decimal,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    updated_at: NaiveDateTime,
}

#[derive(Serialize)]
pub struct SponsorshipResponse {
    pub id: Uuid,
    pub child_id: Uuid,
    pub child_name: String,
    pub site_id: Uuid,
    pub site_name: Option<String>,
    pub sponsor_name: String,
    pub monthly_amount: Decimal,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub is_active: bool,
    pub created_at: String,
    pub payment: PaymentSummary,
}

/// Sponsorship joined with the child fields the responses show.
type SponsorshipRow = (Sponsorship, String, String, Uuid);

type SponsorshipSelect = (
    <sponsorships::table as Table>::AllColumns,
    children::first_name,
    children::last_name,
    children::site_id,
);

type SponsorshipQuery = dsl::IntoBoxed<
    'static,
    dsl::Select<dsl::InnerJoin<sponsorships::table, children::table>, SponsorshipSelect>,
    Pg,
>;

fn sponsorship_query() -> SponsorshipQuery {
    sponsorships::table
        .inner_join(children::table)
        .select((
            sponsorships::all_columns,
            children::first_name,
            children::last_name,
            children::site_id,
        ))
        .into_boxed()
}

/// Attaches the payment summary, computed now from linked entries.
pub(crate) fn build_responses(
    conn: &mut PgConnection,
    rows: Vec<SponsorshipRow>,
) -> QueryResult<Vec<SponsorshipResponse>> {
    let ids: Vec<Uuid> = rows.iter().map(|(s, _, _, _)| s.id).collect();
    let received = received_amounts(conn, &ids)?;
    let mut site_ids: Vec<Uuid> = rows.iter().map(|(_, _, _, site)| *site).collect();
    site_ids.sort();
    site_ids.dedup();
    let names = site_names(conn, &site_ids)?;
    let today = Utc::now().date_naive();

    Ok(rows
        .into_iter()
        .map(|(sponsorship, first_name, last_name, site_id)| {
            let amount = received.get(&sponsorship.id).copied().unwrap_or(Decimal::ZERO);
            let payment = evaluate(&sponsorship, amount, today);
            SponsorshipResponse {
                id: sponsorship.id,
                child_id: sponsorship.child_id,
                child_name: format!("{first_name} {last_name}"),
                site_id,
                site_name: names.get(&site_id).cloned(),
                sponsor_name: sponsorship.sponsor_name,
                monthly_amount: money(sponsorship.monthly_amount),
                start_date: sponsorship.start_date,
                end_date: sponsorship.end_date,
                is_active: sponsorship.is_active,
                created_at: to_iso(sponsorship.created_at),
                payment,
            }
        })
        .collect())
}

/// The active sponsorship of a child, if any.
pub(crate) fn active_for_child(
    conn: &mut PgConnection,
    child_id: Uuid,
) -> QueryResult<Option<SponsorshipResponse>> {
    let rows: Vec<SponsorshipRow> = sponsorship_query()
        .filter(sponsorships::child_id.eq(child_id))
        .filter(sponsorships::is_active.eq(true))
        .limit(1)
        .load(conn)?;
    Ok(build_responses(conn, rows)?.pop())
}

fn find_in_scope(
    conn: &mut PgConnection,
    caller: &Caller,
    sponsorship_id: Uuid,
) -> AppResult<SponsorshipRow> {
    let row: SponsorshipRow = sponsorship_query()
        .filter(sponsorships::id.eq(sponsorship_id))
        .first(conn)?;
    if !caller.scope(ScopeDomain::Financial).permits(row.3) {
        return Err(AppError::not_found());
    }
    Ok(row)
}

fn respond_one(conn: &mut PgConnection, row: SponsorshipRow) -> AppResult<SponsorshipResponse> {
    build_responses(conn, vec![row])?
        .pop()
        .ok_or_else(AppError::not_found)
}

fn check_dates(start: NaiveDate, end: Option<NaiveDate>) -> AppResult<()> {
    if let Some(end) = end {
        if end < start {
            return Err(AppError::validation(
                "end_date cannot precede start_date",
                json!({ "field": "end_date" }),
            ));
        }
    }
    Ok(())
}

fn check_amount(amount: Decimal) -> AppResult<Decimal> {
    validate_amount(amount)
        .map_err(|msg| AppError::validation(msg, json!({ "field": "monthly_amount" })))
}

fn duplicate_active() -> AppError {
    AppError::conflict("this child already has an active sponsorship")
}

pub async fn list_sponsorships(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<SponsorshipListQuery>,
) -> AppResult<Json<Vec<SponsorshipResponse>>> {
    caller.require(Permission::ViewSponsorship)?;
    let status = params
        .status
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .map(str::parse::<PaymentStatus>)
        .transpose()
        .map_err(AppError::bad_request)?;

    let mut conn = state.db()?;
    let mut query = sponsorship_query();
    if let Some(ids) = caller.scope(ScopeDomain::Financial).narrowed(params.site).restriction() {
        query = query.filter(children::site_id.eq_any(ids));
    }
    if !params.include_archived && status != Some(PaymentStatus::Termine) {
        query = query.filter(sponsorships::is_active.eq(true));
    }
    let rows: Vec<SponsorshipRow> = query
        .order((sponsorships::start_date.desc(), sponsorships::sponsor_name.asc()))
        .load(&mut conn)?;

    let mut responses = build_responses(&mut conn, rows)?;
    if let Some(status) = status {
        responses.retain(|response| response.payment.status == status);
    }
    Ok(Json(responses))
}

pub async fn get_sponsorship(
    State(state): State<AppState>,
    caller: Caller,
    Path(sponsorship_id): Path<Uuid>,
) -> AppResult<Json<SponsorshipResponse>> {
    caller.require(Permission::ViewSponsorship)?;
    let mut conn = state.db()?;
    let row = find_in_scope(&mut conn, &caller, sponsorship_id)?;
    Ok(Json(respond_one(&mut conn, row)?))
}

pub async fn create_sponsorship(
    State(state): State<AppState>,
    caller: Caller,
    Json(payload): Json<CreateSponsorshipRequest>,
) -> AppResult<(StatusCode, Json<SponsorshipResponse>)> {
    caller.require(Permission::ManageSponsorship)?;
    let sponsor_name = required_text("sponsor_name", &payload.sponsor_name)
        .map_err(|msg| AppError::validation(msg, json!({ "field": "sponsor_name" })))?;
    let monthly_amount = check_amount(payload.monthly_amount)?;
    check_dates(payload.start_date, payload.end_date)?;

    let mut conn = state.db()?;
    let (child_site, child_active): (Uuid, bool) = children::table
        .find(payload.child_id)
        .select((children::site_id, children::is_active))
        .first(&mut conn)
        .optional()?
        .ok_or_else(|| AppError::validation("child not found", json!({ "field": "child_id" })))?;
    if !caller.scope(ScopeDomain::Financial).permits(child_site) {
        return Err(AppError::validation("child not found", json!({ "field": "child_id" })));
    }
    if !child_active {
        return Err(AppError::bad_request("archived children cannot be sponsored"));
    }

    let already: bool = diesel::select(diesel::dsl::exists(
        sponsorships::table
            .filter(sponsorships::child_id.eq(payload.child_id))
            .filter(sponsorships::is_active.eq(true)),
    ))
    .get_result(&mut conn)?;
    if already {
        return Err(duplicate_active());
    }

    let new_sponsorship = NewSponsorship {
        id: Uuid::new_v4(),
        child_id: payload.child_id,
        sponsor_name,
        monthly_amount,
        start_date: payload.start_date,
        end_date: payload.end_date,
    };
    let created: Sponsorship = match diesel::insert_into(sponsorships::table)
        .values(&new_sponsorship)
        .get_result(&mut conn)
    {
        Ok(created) => created,
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            return Err(duplicate_active());
        }
        Err(err) => return Err(err.into()),
    };

    info!(sponsorship_id = %created.id, child_id = %created.child_id, created_by = %caller.user_id, "sponsorship created");
    let row = find_in_scope(&mut conn, &caller, created.id)?;
    Ok((StatusCode::CREATED, Json(respond_one(&mut conn, row)?)))
}

pub async fn update_sponsorship(
    State(state): State<AppState>,
    caller: Caller,
    Path(sponsorship_id): Path<Uuid>,
    Json(payload): Json<UpdateSponsorshipRequest>,
) -> AppResult<Json<SponsorshipResponse>> {
    caller.require(Permission::ManageSponsorship)?;
    let mut conn = state.db()?;
    let (existing, _, _, _) = find_in_scope(&mut conn, &caller, sponsorship_id)?;
    if !existing.is_active {
        return Err(AppError::bad_request("archived sponsorships cannot be modified"));
    }

    let sponsor_name = match payload.sponsor_name.as_deref() {
        Some(name) => required_text("sponsor_name", name)
            .map_err(|msg| AppError::validation(msg, json!({ "field": "sponsor_name" })))?,
        None => existing.sponsor_name,
    };
    let monthly_amount = match payload.monthly_amount {
        Some(amount) => check_amount(amount)?,
        None => existing.monthly_amount,
    };
    let start_date = payload.start_date.unwrap_or(existing.start_date);
    let end_date = payload.end_date.unwrap_or(existing.end_date);
    check_dates(start_date, end_date)?;

    diesel::update(sponsorships::table.find(sponsorship_id))
        .set(&SponsorshipChangeset {
            sponsor_name: &sponsor_name,
            monthly_amount,
            start_date,
            end_date,
            updated_at: Utc::now().naive_utc(),
        })
        .execute(&mut conn)?;

    info!(sponsorship_id = %sponsorship_id, updated_by = %caller.user_id, "sponsorship updated");
    let row = find_in_scope(&mut conn, &caller, sponsorship_id)?;
    Ok(Json(respond_one(&mut conn, row)?))
}

pub async fn archive_sponsorship(
    State(state): State<AppState>,
    caller: Caller,
    Path(sponsorship_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    caller.require(Permission::ManageSponsorship)?;
    let mut conn = state.db()?;
    find_in_scope(&mut conn, &caller, sponsorship_id)?;
    diesel::update(sponsorships::table.find(sponsorship_id))
        .set((
            sponsorships::is_active.eq(false),
            sponsorships::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;
    info!(sponsorship_id = %sponsorship_id, archived_by = %caller.user_id, "sponsorship archived");
    Ok(StatusCode::NO_CONTENT)
}
