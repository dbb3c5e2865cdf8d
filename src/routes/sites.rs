use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use diesel::{prelude::*, result::DatabaseErrorKind, PgConnection};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::access::{Caller, ScopeDomain};
use crate::error::{AppError, AppResult};
use crate::models::{NewSite, Site};
use crate::schema::sites;
use crate::state::AppState;
use crate::utils::json::required_text;

#[derive(Deserialize)]
pub struct CreateSiteRequest {
    pub name: String,
    pub city: String,
    pub country: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Serialize)]
pub struct SiteResponse {
    pub id: Uuid,
    pub name: String,
    pub city: String,
    pub country: String,
    pub address: String,
    pub created_on: NaiveDate,
}

impl From<Site> for SiteResponse {
    fn from(site: Site) -> Self {
        Self {
            id: site.id,
            name: site.name,
            city: site.city,
            country: site.country,
            address: site.address,
            created_on: site.created_on,
        }
    }
}

pub async fn list_sites(
    State(state): State<AppState>,
    caller: Caller,
) -> AppResult<Json<Vec<SiteResponse>>> {
    let mut conn = state.db()?;
    let mut query = sites::table.order(sites::name.asc()).into_boxed();
    if let Some(ids) = caller.scope(ScopeDomain::General).restriction() {
        query = query.filter(sites::id.eq_any(ids));
    }
    let rows: Vec<Site> = query.load(&mut conn)?;
    Ok(Json(rows.into_iter().map(SiteResponse::from).collect()))
}

pub async fn get_site(
    State(state): State<AppState>,
    caller: Caller,
    Path(site_id): Path<Uuid>,
) -> AppResult<Json<SiteResponse>> {
    if !caller.scope(ScopeDomain::General).permits(site_id) {
        return Err(AppError::not_found());
    }
    let mut conn = state.db()?;
    let site: Site = sites::table.find(site_id).first(&mut conn)?;
    Ok(Json(site.into()))
}

pub async fn create_site(
    State(state): State<AppState>,
    caller: Caller,
    Json(payload): Json<CreateSiteRequest>,
) -> AppResult<(StatusCode, Json<SiteResponse>)> {
    if !caller.is_superuser {
        return Err(AppError::forbidden());
    }

    let new_site = NewSite {
        id: Uuid::new_v4(),
        name: required_text("name", &payload.name).map_err(AppError::bad_request)?,
        city: required_text("city", &payload.city).map_err(AppError::bad_request)?,
        country: required_text("country", &payload.country).map_err(AppError::bad_request)?,
        address: payload.address.trim().to_string(),
    };

    let mut conn = state.db()?;
    let site: Site = match diesel::insert_into(sites::table)
        .values(&new_site)
        .get_result(&mut conn)
    {
        Ok(site) => site,
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            return Err(AppError::conflict("a site with that name already exists"));
        }
        Err(err) => return Err(AppError::from(err)),
    };

    info!(site_id = %site.id, name = %site.name, created_by = %caller.user_id, "site created");
    Ok((StatusCode::CREATED, Json(site.into())))
}

/// Rejects identifiers that do not name a site.
pub(crate) fn ensure_site_exists(conn: &mut PgConnection, site_id: Uuid) -> AppResult<()> {
    let exists: bool =
        diesel::select(diesel::dsl::exists(sites::table.filter(sites::id.eq(site_id))))
            .get_result(conn)?;
    if !exists {
        return Err(AppError::bad_request("site does not exist"));
    }
    Ok(())
}

pub(crate) fn site_names(
    conn: &mut PgConnection,
    site_ids: &[Uuid],
) -> QueryResult<HashMap<Uuid, String>> {
    if site_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<(Uuid, String)> = sites::table
        .filter(sites::id.eq_any(site_ids))
        .select((sites::id, sites::name))
        .load(conn)?;
    Ok(rows.into_iter().collect())
}
