//! Medical and school follow-ups. Both inherit their scope from the child.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use diesel::{prelude::*, result::DatabaseErrorKind, PgConnection};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::children::find_child_in_scope;
use crate::access::{Caller, Permission, ScopeDomain};
use crate::error::{AppError, AppResult};
use crate::history::to_iso;
use crate::models::{MedicalFollowup, NewMedicalFollowup, NewSchoolFollowup, SchoolFollowup};
use crate::schema::{medical_followups, school_followups};
use crate::state::AppState;
use crate::utils::json::required_text;

#[derive(Serialize)]
pub struct MedicalResponse {
    pub id: Uuid,
    pub child_id: Uuid,
    pub consultation_date: NaiveDate,
    pub consultation_type: String,
    pub doctor: String,
    pub diagnosis: String,
    pub treatment: String,
    pub notes: String,
    pub is_active: bool,
    pub created_at: String,
}

impl From<MedicalFollowup> for MedicalResponse {
    fn from(row: MedicalFollowup) -> Self {
        Self {
            id: row.id,
            child_id: row.child_id,
            consultation_date: row.consultation_date,
            consultation_type: row.consultation_type,
            doctor: row.doctor,
            diagnosis: row.diagnosis,
            treatment: row.treatment,
            notes: row.notes,
            is_active: row.is_active,
            created_at: to_iso(row.created_at),
        }
    }
}

#[derive(Deserialize)]
pub struct CreateMedicalRequest {
    pub consultation_date: NaiveDate,
    pub consultation_type: String,
    #[serde(default)]
    pub doctor: String,
    pub diagnosis: String,
    #[serde(default)]
    pub treatment: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Deserialize, Default)]
pub struct UpdateMedicalRequest {
    pub consultation_date: Option<NaiveDate>,
    pub consultation_type: Option<String>,
    pub doctor: Option<String>,
    pub diagnosis: Option<String>,
    pub treatment: Option<String>,
    pub notes: Option<String>,
}

#[derive(AsChangeset)]
#[diesel(table_name = medical_followups)]
struct MedicalChangeset<'a> {
    consultation_date: Option<NaiveDate>,
    consultation_type: Option<&'a str>,
    doctor: Option<&'a str>,
    diagnosis: Option<&'a str>,
    treatment: Option<&'a str>,
    notes: Option<&'a str>,
    updated_at: NaiveDateTime,
}

pub(crate) fn active_medical(
    conn: &mut PgConnection,
    child_id: Uuid,
) -> QueryResult<Vec<MedicalResponse>> {
    let rows: Vec<MedicalFollowup> = medical_followups::table
        .filter(medical_followups::child_id.eq(child_id))
        .filter(medical_followups::is_active.eq(true))
        .order(medical_followups::consultation_date.desc())
        .load(conn)?;
    Ok(rows.into_iter().map(MedicalResponse::from).collect())
}

fn find_medical_in_scope(
    conn: &mut PgConnection,
    caller: &Caller,
    followup_id: Uuid,
) -> AppResult<MedicalFollowup> {
    let row: MedicalFollowup = medical_followups::table.find(followup_id).first(conn)?;
    find_child_in_scope(conn, caller, row.child_id, ScopeDomain::General)?;
    Ok(row)
}

fn text_field(field: &str, value: &str) -> AppResult<String> {
    required_text(field, value).map_err(AppError::bad_request)
}

pub async fn list_medical(
    State(state): State<AppState>,
    caller: Caller,
    Path(child_id): Path<Uuid>,
) -> AppResult<Json<Vec<MedicalResponse>>> {
    caller.require(Permission::ViewMedical)?;
    let mut conn = state.db()?;
    find_child_in_scope(&mut conn, &caller, child_id, ScopeDomain::General)?;
    Ok(Json(active_medical(&mut conn, child_id)?))
}

pub async fn create_medical(
    State(state): State<AppState>,
    caller: Caller,
    Path(child_id): Path<Uuid>,
    Json(payload): Json<CreateMedicalRequest>,
) -> AppResult<(StatusCode, Json<MedicalResponse>)> {
    caller.require(Permission::AddMedical)?;
    let mut conn = state.db()?;
    let child = find_child_in_scope(&mut conn, &caller, child_id, ScopeDomain::General)?;
    if payload.consultation_date < child.birth_date {
        return Err(AppError::bad_request(
            "consultation_date cannot precede the child's birth date",
        ));
    }

    let new_row = NewMedicalFollowup {
        id: Uuid::new_v4(),
        child_id,
        consultation_date: payload.consultation_date,
        consultation_type: text_field("consultation_type", &payload.consultation_type)?,
        doctor: payload.doctor.trim().to_string(),
        diagnosis: text_field("diagnosis", &payload.diagnosis)?,
        treatment: payload.treatment.trim().to_string(),
        notes: payload.notes.trim().to_string(),
    };
    let row: MedicalFollowup = diesel::insert_into(medical_followups::table)
        .values(&new_row)
        .get_result(&mut conn)?;

    info!(followup_id = %row.id, child_id = %child_id, created_by = %caller.user_id, "medical follow-up recorded");
    Ok((StatusCode::CREATED, Json(row.into())))
}

pub async fn update_medical(
    State(state): State<AppState>,
    caller: Caller,
    Path(followup_id): Path<Uuid>,
    Json(payload): Json<UpdateMedicalRequest>,
) -> AppResult<Json<MedicalResponse>> {
    caller.require(Permission::ChangeMedical)?;
    let mut conn = state.db()?;
    let existing = find_medical_in_scope(&mut conn, &caller, followup_id)?;
    if !existing.is_active {
        return Err(AppError::bad_request("archived follow-ups cannot be modified"));
    }

    let consultation_type = payload
        .consultation_type
        .as_deref()
        .map(|value| text_field("consultation_type", value))
        .transpose()?;
    let diagnosis = payload
        .diagnosis
        .as_deref()
        .map(|value| text_field("diagnosis", value))
        .transpose()?;

    let changeset = MedicalChangeset {
        consultation_date: payload.consultation_date,
        consultation_type: consultation_type.as_deref(),
        doctor: payload.doctor.as_deref().map(str::trim),
        diagnosis: diagnosis.as_deref(),
        treatment: payload.treatment.as_deref().map(str::trim),
        notes: payload.notes.as_deref().map(str::trim),
        updated_at: Utc::now().naive_utc(),
    };
    let row: MedicalFollowup = diesel::update(medical_followups::table.find(followup_id))
        .set(&changeset)
        .get_result(&mut conn)?;

    info!(followup_id = %row.id, updated_by = %caller.user_id, "medical follow-up updated");
    Ok(Json(row.into()))
}

pub async fn archive_medical(
    State(state): State<AppState>,
    caller: Caller,
    Path(followup_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    caller.require(Permission::ArchiveMedical)?;
    let mut conn = state.db()?;
    let existing = find_medical_in_scope(&mut conn, &caller, followup_id)?;
    if existing.is_active {
        diesel::update(medical_followups::table.find(followup_id))
            .set((
                medical_followups::is_active.eq(false),
                medical_followups::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(&mut conn)?;
        info!(followup_id = %followup_id, archived_by = %caller.user_id, "medical follow-up archived");
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
pub struct SchoolResponse {
    pub id: Uuid,
    pub child_id: Uuid,
    pub school_year: String,
    pub school: String,
    pub grade: String,
    pub results: String,
    pub is_active: bool,
    pub created_at: String,
}

impl From<SchoolFollowup> for SchoolResponse {
    fn from(row: SchoolFollowup) -> Self {
        Self {
            id: row.id,
            child_id: row.child_id,
            school_year: row.school_year,
            school: row.school,
            grade: row.grade,
            results: row.results,
            is_active: row.is_active,
            created_at: to_iso(row.created_at),
        }
    }
}

#[derive(Deserialize)]
pub struct CreateSchoolRequest {
    pub school_year: String,
    pub school: String,
    pub grade: String,
    #[serde(default)]
    pub results: String,
}

#[derive(Deserialize, Default)]
pub struct UpdateSchoolRequest {
    pub school_year: Option<String>,
    pub school: Option<String>,
    pub grade: Option<String>,
    pub results: Option<String>,
}

#[derive(AsChangeset)]
#[diesel(table_name = school_followups)]
struct SchoolChangeset<'a> {
    school_year: Option<&'a str>,
    school: Option<&'a str>,
    grade: Option<&'a str>,
    results: Option<&'a str>,
    updated_at: NaiveDateTime,
}

/// Accepts `YYYY-YYYY` where the second year follows the first.
pub fn validate_school_year(value: &str) -> Result<String, String> {
    let trimmed = value.trim();
    let malformed = || format!("school_year '{trimmed}' must look like 2024-2025");
    let (first, second) = trimmed.split_once('-').ok_or_else(malformed)?;
    let is_year = |part: &str| part.len() == 4 && part.chars().all(|ch| ch.is_ascii_digit());
    if !is_year(first) || !is_year(second) {
        return Err(malformed());
    }
    let first: i32 = first.parse().map_err(|_| malformed())?;
    let second: i32 = second.parse().map_err(|_| malformed())?;
    if second != first + 1 {
        return Err(format!(
            "school_year '{trimmed}' must span two consecutive years"
        ));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn active_school(
    conn: &mut PgConnection,
    child_id: Uuid,
) -> QueryResult<Vec<SchoolResponse>> {
    let rows: Vec<SchoolFollowup> = school_followups::table
        .filter(school_followups::child_id.eq(child_id))
        .filter(school_followups::is_active.eq(true))
        .order(school_followups::school_year.desc())
        .load(conn)?;
    Ok(rows.into_iter().map(SchoolResponse::from).collect())
}

fn find_school_in_scope(
    conn: &mut PgConnection,
    caller: &Caller,
    followup_id: Uuid,
) -> AppResult<SchoolFollowup> {
    let row: SchoolFollowup = school_followups::table.find(followup_id).first(conn)?;
    find_child_in_scope(conn, caller, row.child_id, ScopeDomain::General)?;
    Ok(row)
}

fn duplicate_year(err: diesel::result::Error) -> AppError {
    match err {
        diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
            AppError::conflict("a school record already exists for this child and school year")
        }
        other => AppError::from(other),
    }
}

pub async fn list_school(
    State(state): State<AppState>,
    caller: Caller,
    Path(child_id): Path<Uuid>,
) -> AppResult<Json<Vec<SchoolResponse>>> {
    caller.require(Permission::ViewSchool)?;
    let mut conn = state.db()?;
    find_child_in_scope(&mut conn, &caller, child_id, ScopeDomain::General)?;
    Ok(Json(active_school(&mut conn, child_id)?))
}

pub async fn create_school(
    State(state): State<AppState>,
    caller: Caller,
    Path(child_id): Path<Uuid>,
    Json(payload): Json<CreateSchoolRequest>,
) -> AppResult<(StatusCode, Json<SchoolResponse>)> {
    caller.require(Permission::AddSchool)?;
    let new_row = NewSchoolFollowup {
        id: Uuid::new_v4(),
        child_id,
        school_year: validate_school_year(&payload.school_year).map_err(AppError::bad_request)?,
        school: text_field("school", &payload.school)?,
        grade: text_field("grade", &payload.grade)?,
        results: payload.results.trim().to_string(),
    };

    let mut conn = state.db()?;
    find_child_in_scope(&mut conn, &caller, child_id, ScopeDomain::General)?;
    let row: SchoolFollowup = diesel::insert_into(school_followups::table)
        .values(&new_row)
        .get_result(&mut conn)
        .map_err(duplicate_year)?;

    info!(followup_id = %row.id, child_id = %child_id, school_year = %row.school_year, created_by = %caller.user_id, "school follow-up recorded");
    Ok((StatusCode::CREATED, Json(row.into())))
}

pub async fn update_school(
    State(state): State<AppState>,
    caller: Caller,
    Path(followup_id): Path<Uuid>,
    Json(payload): Json<UpdateSchoolRequest>,
) -> AppResult<Json<SchoolResponse>> {
    caller.require(Permission::ChangeSchool)?;
    let school_year = payload
        .school_year
        .as_deref()
        .map(validate_school_year)
        .transpose()
        .map_err(AppError::bad_request)?;
    let school = payload
        .school
        .as_deref()
        .map(|value| text_field("school", value))
        .transpose()?;
    let grade = payload
        .grade
        .as_deref()
        .map(|value| text_field("grade", value))
        .transpose()?;

    let mut conn = state.db()?;
    let existing = find_school_in_scope(&mut conn, &caller, followup_id)?;
    if !existing.is_active {
        return Err(AppError::bad_request("archived follow-ups cannot be modified"));
    }

    let changeset = SchoolChangeset {
        school_year: school_year.as_deref(),
        school: school.as_deref(),
        grade: grade.as_deref(),
        results: payload.results.as_deref().map(str::trim),
        updated_at: Utc::now().naive_utc(),
    };
    let row: SchoolFollowup = diesel::update(school_followups::table.find(followup_id))
        .set(&changeset)
        .get_result(&mut conn)
        .map_err(duplicate_year)?;

    info!(followup_id = %row.id, updated_by = %caller.user_id, "school follow-up updated");
    Ok(Json(row.into()))
}

pub async fn archive_school(
    State(state): State<AppState>,
    caller: Caller,
    Path(followup_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    caller.require(Permission::ArchiveSchool)?;
    let mut conn = state.db()?;
    let existing = find_school_in_scope(&mut conn, &caller, followup_id)?;
    if existing.is_active {
        diesel::update(school_followups::table.find(followup_id))
            .set((
                school_followups::is_active.eq(false),
                school_followups::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(&mut conn)?;
        info!(followup_id = %followup_id, archived_by = %caller.user_id, "school follow-up archived");
    }
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::validate_school_year;

    #[test]
    fn school_year_must_be_consecutive() {
        assert_eq!(validate_school_year(" 2024-2025 ").unwrap(), "2024-2025");
        assert!(validate_school_year("2024-2026").is_err());
        assert!(validate_school_year("2025-2024").is_err());
        assert!(validate_school_year("24-25").is_err());
        assert!(validate_school_year("2024/2025").is_err());
        assert!(validate_school_year("２０２４-2025").is_err());
    }
}
