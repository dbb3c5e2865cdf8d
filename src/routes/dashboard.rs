use std::collections::BTreeMap;

use axum::extract::{Json, State};
use chrono::{Datelike, NaiveDate, Utc};
use diesel::dsl::count_star;
use diesel::{prelude::*, PgConnection};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::access::{Caller, Permission, ScopeDomain, SiteScope};
use crate::error::AppResult;
use crate::history::to_iso;
use crate::ledger::{money, Direction};
use crate::models::{ChildHistoryEntry, MedicalFollowup};
use crate::schema::{accounts, child_history, children, medical_followups, sites, transactions, users};
use crate::state::AppState;

const RECENT_MEDICAL_LIMIT: i64 = 5;
const RECENT_ACTIVITY_LIMIT: i64 = 3;

#[derive(Serialize)]
pub struct SiteCount {
    pub site_id: Uuid,
    pub name: String,
    pub active_children: i64,
}

#[derive(Serialize)]
pub struct Birthday {
    pub child_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub birth_date: NaiveDate,
}

#[derive(Serialize)]
pub struct RecentMedical {
    pub id: Uuid,
    pub child_id: Uuid,
    pub child_name: String,
    pub consultation_date: NaiveDate,
    pub consultation_type: String,
    pub doctor: String,
}

#[derive(Serialize)]
pub struct RecentActivity {
    pub id: Uuid,
    pub child_id: Uuid,
    pub change_kind: String,
    pub changed_by_username: Option<String>,
    pub changed_at: String,
}

#[derive(Serialize)]
pub struct MonthlyTotal {
    pub month: String,
    pub total: Decimal,
}

#[derive(Serialize, Default)]
pub struct DashboardResponse {
    pub active_children: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children_per_site: Option<Vec<SiteCount>>,
    pub birthdays_this_month: Vec<Birthday>,
    pub recent_medical: Vec<RecentMedical>,
    pub recent_activity: Vec<RecentActivity>,
    pub total_activity: i64,
    pub monthly_entries: Vec<MonthlyTotal>,
}

fn scoped_children(scope: &SiteScope) -> children::BoxedQuery<'static, diesel::pg::Pg> {
    let mut query = children::table
        .filter(children::is_active.eq(true))
        .into_boxed();
    if let Some(ids) = scope.restriction() {
        query = query.filter(children::site_id.eq_any(ids));
    }
    query
}

fn children_per_site(conn: &mut PgConnection) -> QueryResult<Vec<SiteCount>> {
    let counts: BTreeMap<Uuid, i64> = children::table
        .filter(children::is_active.eq(true))
        .group_by(children::site_id)
        .select((children::site_id, count_star()))
        .load::<(Uuid, i64)>(conn)?
        .into_iter()
        .collect();
    let mut rows: Vec<SiteCount> = sites::table
        .select((sites::id, sites::name))
        .load::<(Uuid, String)>(conn)?
        .into_iter()
        .map(|(site_id, name)| SiteCount {
            active_children: counts.get(&site_id).copied().unwrap_or(0),
            site_id,
            name,
        })
        .collect();
    rows.sort_by(|a, b| b.active_children.cmp(&a.active_children).then(a.name.cmp(&b.name)));
    Ok(rows)
}

/// Entrée totals for each month of `year` that has any.
fn monthly_entries(
    conn: &mut PgConnection,
    scope: &SiteScope,
    year: i32,
) -> QueryResult<Vec<MonthlyTotal>> {
    let (Some(first), Some(last)) = (
        NaiveDate::from_ymd_opt(year, 1, 1),
        NaiveDate::from_ymd_opt(year, 12, 31),
    ) else {
        return Ok(Vec::new());
    };

    let mut query = transactions::table
        .inner_join(accounts::table)
        .filter(transactions::is_active.eq(true))
        .filter(transactions::direction.eq(Direction::Entree.as_str()))
        .filter(transactions::transaction_date.between(first, last))
        .select((transactions::transaction_date, transactions::amount))
        .into_boxed();
    if let Some(ids) = scope.restriction() {
        query = query.filter(accounts::site_id.eq_any(ids));
    }
    let rows: Vec<(NaiveDate, Decimal)> = query.load(conn)?;

    let mut by_month: BTreeMap<u32, Decimal> = BTreeMap::new();
    for (date, amount) in rows {
        *by_month.entry(date.month()).or_insert(Decimal::ZERO) += amount;
    }
    Ok(by_month
        .into_iter()
        .map(|(month, total)| MonthlyTotal {
            month: format!("{year}-{month:02}"),
            total: money(total),
        })
        .collect())
}

pub async fn dashboard(
    State(state): State<AppState>,
    caller: Caller,
) -> AppResult<Json<DashboardResponse>> {
    let today = Utc::now().date_naive();
    let general = caller.scope(ScopeDomain::General);
    let mut conn = state.db()?;
    let mut response = DashboardResponse::default();

    if caller.has(Permission::ViewChild) {
        response.active_children = scoped_children(&general).count().get_result(&mut conn)?;

        if general.is_unrestricted() {
            response.site_count = Some(sites::table.count().get_result(&mut conn)?);
            response.children_per_site = Some(children_per_site(&mut conn)?);
        }

        let mut birthdays: Vec<Birthday> = scoped_children(&general)
            .select((
                children::id,
                children::first_name,
                children::last_name,
                children::birth_date,
            ))
            .load::<(Uuid, String, String, NaiveDate)>(&mut conn)?
            .into_iter()
            .filter(|(_, _, _, birth_date)| birth_date.month() == today.month())
            .map(|(child_id, first_name, last_name, birth_date)| Birthday {
                child_id,
                first_name,
                last_name,
                birth_date,
            })
            .collect();
        birthdays.sort_by_key(|birthday| birthday.birth_date.day());
        response.birthdays_this_month = birthdays;

        let in_scope = scoped_children(&general).select(children::id);
        let recent: Vec<(ChildHistoryEntry, Option<String>)> = child_history::table
            .left_join(users::table)
            .filter(child_history::child_id.eq_any(in_scope))
            .order(child_history::changed_at.desc())
            .limit(RECENT_ACTIVITY_LIMIT)
            .select((child_history::all_columns, users::username.nullable()))
            .load(&mut conn)?;
        response.recent_activity = recent
            .into_iter()
            .map(|(entry, username)| RecentActivity {
                id: entry.id,
                child_id: entry.child_id,
                change_kind: entry.change_kind,
                changed_by_username: username,
                changed_at: to_iso(entry.changed_at),
            })
            .collect();
        response.total_activity = child_history::table
            .filter(child_history::child_id.eq_any(scoped_children(&general).select(children::id)))
            .count()
            .get_result(&mut conn)?;
    }

    if caller.has(Permission::ViewMedical) {
        let recent: Vec<(MedicalFollowup, String, String)> = medical_followups::table
            .inner_join(children::table)
            .filter(medical_followups::is_active.eq(true))
            .filter(medical_followups::child_id.eq_any(scoped_children(&general).select(children::id)))
            .order(medical_followups::consultation_date.desc())
            .limit(RECENT_MEDICAL_LIMIT)
            .select((
                medical_followups::all_columns,
                children::first_name,
                children::last_name,
            ))
            .load(&mut conn)?;
        response.recent_medical = recent
            .into_iter()
            .map(|(followup, first_name, last_name)| RecentMedical {
                id: followup.id,
                child_id: followup.child_id,
                child_name: format!("{first_name} {last_name}"),
                consultation_date: followup.consultation_date,
                consultation_type: followup.consultation_type,
                doctor: followup.doctor,
            })
            .collect();
    }

    if caller.has(Permission::ViewTransaction) {
        let financial = caller.scope(ScopeDomain::Financial);
        response.monthly_entries = monthly_entries(&mut conn, &financial, today.year())?;
    }

    Ok(Json(response))
}
