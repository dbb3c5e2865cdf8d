use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::time::Duration;

use axum::extract::{Json, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Utc};
use diesel::{prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::documents::{
    load_documents, read_file_field, read_text_field, store_upload, DocumentResponse,
    DocumentType, PRESIGNED_URL_EXPIRY_SECONDS,
};
use super::followups::{active_medical, active_school, MedicalResponse, SchoolResponse};
use super::sites::{ensure_site_exists, site_names};
use super::sponsorships::{active_for_child, SponsorshipResponse};
use crate::access::{Caller, Permission, ScopeDomain};
use crate::error::{AppError, AppResult};
use crate::export::{self, ChildExportRow, ExportFormat};
use crate::history::{self, to_iso, ChangeKind};
use crate::models::{
    Child, ChildHistoryEntry, MedicalFollowup, NewChild, NewChildDocument, SchoolFollowup,
};
use crate::schema::{
    child_documents, child_history, children, medical_followups, school_followups, users,
};
use crate::state::AppState;
use crate::storage::{child_document_key, child_photo_key, discard_objects, UploadedFile};
use crate::utils::json::{nullable, required_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildStatus {
    Accueilli,
    Adopte,
    Reunifie,
    Majeur,
}

impl ChildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChildStatus::Accueilli => "accueilli",
            ChildStatus::Adopte => "adopte",
            ChildStatus::Reunifie => "reunifie",
            ChildStatus::Majeur => "majeur",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ChildStatus::Accueilli => "Accueilli",
            ChildStatus::Adopte => "Adopté",
            ChildStatus::Reunifie => "Réunifié",
            ChildStatus::Majeur => "Majeur",
        }
    }

    /// Statuses meaning the child has left the site.
    pub fn is_departure(self) -> bool {
        !matches!(self, ChildStatus::Accueilli)
    }
}

impl FromStr for ChildStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "accueilli" => Ok(ChildStatus::Accueilli),
            "adopte" => Ok(ChildStatus::Adopte),
            "reunifie" => Ok(ChildStatus::Reunifie),
            "majeur" => Ok(ChildStatus::Majeur),
            other => Err(format!("unknown child status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    M,
    F,
}

impl Sex {
    pub fn as_str(self) -> &'static str {
        match self {
            Sex::M => "M",
            Sex::F => "F",
        }
    }
}

/// Validated child record, independent of how it arrived.
#[derive(Debug, Clone)]
pub(crate) struct ChildFields {
    last_name: String,
    first_name: String,
    birth_date: NaiveDate,
    sex: Sex,
    birth_place: String,
    arrival_date: NaiveDate,
    admission_reason: String,
    life_story: String,
    status: ChildStatus,
    departure_date: Option<NaiveDate>,
}

fn field_error(field: &str, message: impl Into<String>) -> AppError {
    AppError::validation(message, json!({ "field": field }))
}

impl ChildFields {
    fn from_child(child: &Child) -> AppResult<Self> {
        let sex = match child.sex.as_str() {
            "M" => Sex::M,
            "F" => Sex::F,
            other => return Err(AppError::internal(format!("stored sex '{other}' is invalid"))),
        };
        let status = child.status.parse::<ChildStatus>().map_err(AppError::internal)?;
        Ok(Self {
            last_name: child.last_name.clone(),
            first_name: child.first_name.clone(),
            birth_date: child.birth_date,
            sex,
            birth_place: child.birth_place.clone(),
            arrival_date: child.arrival_date,
            admission_reason: child.admission_reason.clone(),
            life_story: child.life_story.clone(),
            status,
            departure_date: child.departure_date,
        })
    }

    fn apply(mut self, patch: UpdateChildRequest) -> Self {
        if let Some(value) = patch.last_name {
            self.last_name = value;
        }
        if let Some(value) = patch.first_name {
            self.first_name = value;
        }
        if let Some(value) = patch.birth_date {
            self.birth_date = value;
        }
        if let Some(value) = patch.sex {
            self.sex = value;
        }
        if let Some(value) = patch.birth_place {
            self.birth_place = value;
        }
        if let Some(value) = patch.arrival_date {
            self.arrival_date = value;
        }
        if let Some(value) = patch.admission_reason {
            self.admission_reason = value;
        }
        if let Some(value) = patch.life_story {
            self.life_story = value;
        }
        if let Some(value) = patch.status {
            self.status = value;
        }
        if let Some(value) = patch.departure_date {
            self.departure_date = value;
        }
        self
    }

    /// A departure status needs a departure date; `accueilli` drops it.
    fn validate(mut self, today: NaiveDate) -> AppResult<Self> {
        self.last_name =
            required_text("last_name", &self.last_name).map_err(|msg| field_error("last_name", msg))?;
        self.first_name = required_text("first_name", &self.first_name)
            .map_err(|msg| field_error("first_name", msg))?;
        self.birth_place = self.birth_place.trim().to_string();
        self.admission_reason = self.admission_reason.trim().to_string();

        if self.birth_date > today {
            return Err(field_error("birth_date", "birth_date cannot be in the future"));
        }
        if self.arrival_date < self.birth_date {
            return Err(field_error(
                "arrival_date",
                "arrival_date cannot precede birth_date",
            ));
        }

        if self.status.is_departure() {
            let departure = self.departure_date.ok_or_else(|| {
                field_error(
                    "departure_date",
                    format!(
                        "departure_date is required when status is {}",
                        self.status.as_str()
                    ),
                )
            })?;
            if departure < self.arrival_date {
                return Err(field_error(
                    "departure_date",
                    "departure_date cannot precede arrival_date",
                ));
            }
        } else {
            self.departure_date = None;
        }
        Ok(self)
    }

    fn changeset(&self, site_id: Uuid, now: NaiveDateTime) -> ChildChangeset<'_> {
        ChildChangeset {
            site_id,
            last_name: &self.last_name,
            first_name: &self.first_name,
            birth_date: self.birth_date,
            sex: self.sex.as_str(),
            birth_place: &self.birth_place,
            arrival_date: self.arrival_date,
            admission_reason: &self.admission_reason,
            life_story: &self.life_story,
            status: self.status.as_str(),
            departure_date: self.departure_date,
            updated_at: now,
        }
    }
}

#[derive(AsChangeset)]
#[diesel(table_name = children, treat_none_as_null = true)]
struct ChildChangeset<'a> {
    site_id: Uuid,
    last_name: &'a str,
    first_name: &'a str,
    birth_date: NaiveDate,
    sex: &'a str,
    birth_place: &'a str,
    arrival_date: NaiveDate,
    admission_reason: &'a str,
    life_story: &'a str,
    status: &'a str,
    departure_date: Option<NaiveDate>,
    updated_at: NaiveDateTime,
}

fn default_status() -> ChildStatus {
    ChildStatus::Accueilli
}

#[derive(Deserialize)]
pub struct CreateChildRequest {
    pub site_id: Option<Uuid>,
    pub last_name: String,
    pub first_name: String,
    pub birth_date: NaiveDate,
    pub sex: Sex,
    #[serde(default)]
    pub birth_place: String,
    pub arrival_date: NaiveDate,
    #[serde(default)]
    pub admission_reason: String,
    #[serde(default)]
    pub life_story: String,
    #[serde(default = "default_status")]
    pub status: ChildStatus,
    pub departure_date: Option<NaiveDate>,
}

impl From<CreateChildRequest> for ChildFields {
    fn from(request: CreateChildRequest) -> Self {
        Self {
            last_name: request.last_name,
            first_name: request.first_name,
            birth_date: request.birth_date,
            sex: request.sex,
            birth_place: request.birth_place,
            arrival_date: request.arrival_date,
            admission_reason: request.admission_reason,
            life_story: request.life_story,
            status: request.status,
            departure_date: request.departure_date,
        }
    }
}

#[derive(Deserialize, Default)]
pub struct UpdateChildRequest {
    pub site_id: Option<Uuid>,
    pub last_name: Option<String>,
    pub first_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub sex: Option<Sex>,
    pub birth_place: Option<String>,
    pub arrival_date: Option<NaiveDate>,
    pub admission_reason: Option<String>,
    pub life_story: Option<String>,
    pub status: Option<ChildStatus>,
    #[serde(default, deserialize_with = "nullable")]
    pub departure_date: Option<Option<NaiveDate>>,
}

#[derive(Deserialize)]
pub struct ChildListQuery {
    pub site: Option<Uuid>,
    pub status: Option<String>,
    pub q: Option<String>,
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Serialize)]
pub struct ChildResponse {
    pub id: Uuid,
    pub site_id: Uuid,
    pub site_name: Option<String>,
    pub last_name: String,
    pub first_name: String,
    pub birth_date: NaiveDate,
    pub age: u32,
    pub sex: String,
    pub birth_place: String,
    pub has_photo: bool,
    pub arrival_date: NaiveDate,
    pub admission_reason: String,
    pub life_story: String,
    pub status: String,
    pub status_label: Option<&'static str>,
    pub departure_date: Option<NaiveDate>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl ChildResponse {
    fn build(child: Child, site_name: Option<String>, today: NaiveDate) -> Self {
        let status_label = child.status.parse::<ChildStatus>().ok().map(ChildStatus::label);
        Self {
            id: child.id,
            site_id: child.site_id,
            site_name,
            last_name: child.last_name,
            first_name: child.first_name,
            birth_date: child.birth_date,
            age: age_on(child.birth_date, today),
            sex: child.sex,
            birth_place: child.birth_place,
            has_photo: child.photo_key.is_some(),
            arrival_date: child.arrival_date,
            admission_reason: child.admission_reason,
            life_story: child.life_story,
            status: child.status,
            status_label,
            departure_date: child.departure_date,
            is_active: child.is_active,
            created_at: to_iso(child.created_at),
            updated_at: to_iso(child.updated_at),
        }
    }
}

#[derive(Serialize)]
pub struct ChildDetailResponse {
    #[serde(flatten)]
    pub child: ChildResponse,
    pub photo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents: Option<Vec<DocumentResponse>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medical_followups: Option<Vec<MedicalResponse>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub school_followups: Option<Vec<SchoolResponse>>,
    pub sponsorship: Option<SponsorshipResponse>,
}

#[derive(Serialize)]
pub struct HistoryEntryResponse {
    pub id: Uuid,
    pub child_id: Uuid,
    pub change_kind: String,
    pub changed_by: Option<Uuid>,
    pub changed_by_username: Option<String>,
    pub changed_at: String,
    pub snapshot: Value,
}

impl HistoryEntryResponse {
    fn build(entry: ChildHistoryEntry, username: Option<String>) -> Self {
        Self {
            id: entry.id,
            child_id: entry.child_id,
            change_kind: entry.change_kind,
            changed_by: entry.changed_by,
            changed_by_username: username,
            changed_at: to_iso(entry.changed_at),
            snapshot: entry.snapshot,
        }
    }
}

/// Whole years between `birth` and `today`.
pub fn age_on(birth: NaiveDate, today: NaiveDate) -> u32 {
    let mut years = today.year() - birth.year();
    if (today.month(), today.day()) < (birth.month(), birth.day()) {
        years -= 1;
    }
    years.max(0) as u32
}

/// Loads a child the caller may see. Out-of-scope rows answer 404.
pub(crate) fn find_child_in_scope(
    conn: &mut PgConnection,
    caller: &Caller,
    child_id: Uuid,
    domain: ScopeDomain,
) -> AppResult<Child> {
    let child: Child = children::table.find(child_id).first(conn)?;
    if !caller.scope(domain).permits(child.site_id) {
        return Err(AppError::not_found());
    }
    Ok(child)
}

pub async fn list_children(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<ChildListQuery>,
) -> AppResult<Json<Vec<ChildResponse>>> {
    caller.require(Permission::ViewChild)?;
    let status = params
        .status
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .map(str::parse::<ChildStatus>)
        .transpose()
        .map_err(AppError::bad_request)?;

    let mut conn = state.db()?;
    let mut query = children::table.into_boxed();
    if let Some(ids) = caller.scope(ScopeDomain::General).narrowed(params.site).restriction() {
        query = query.filter(children::site_id.eq_any(ids));
    }
    if !params.include_archived {
        query = query.filter(children::is_active.eq(true));
    }
    if let Some(status) = status {
        query = query.filter(children::status.eq(status.as_str()));
    }
    if let Some(term) = params.q.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let pattern = format!("%{term}%");
        query = query.filter(
            children::last_name
                .ilike(pattern.clone())
                .or(children::first_name.ilike(pattern)),
        );
    }

    let rows: Vec<Child> = query
        .order((children::last_name.asc(), children::first_name.asc()))
        .load(&mut conn)?;

    let site_ids: Vec<Uuid> = rows
        .iter()
        .map(|child| child.site_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let names = site_names(&mut conn, &site_ids)?;
    let today = Utc::now().date_naive();

    Ok(Json(
        rows.into_iter()
            .map(|child| {
                let site_name = names.get(&child.site_id).cloned();
                ChildResponse::build(child, site_name, today)
            })
            .collect(),
    ))
}

pub async fn get_child(
    State(state): State<AppState>,
    caller: Caller,
    Path(child_id): Path<Uuid>,
) -> AppResult<Json<ChildDetailResponse>> {
    caller.require(Permission::ViewChild)?;
    let child = {
        let mut conn = state.db()?;
        find_child_in_scope(&mut conn, &caller, child_id, ScopeDomain::General)?
    };
    Ok(Json(build_detail(&state, &caller, child).await?))
}

async fn build_detail(
    state: &AppState,
    caller: &Caller,
    child: Child,
) -> AppResult<ChildDetailResponse> {
    let (site_name, documents, medical, school, sponsorship) = {
        let mut conn = state.db()?;
        let site_name = site_names(&mut conn, &[child.site_id])?.remove(&child.site_id);
        let documents = if caller.has(Permission::ViewDocument) {
            Some(load_documents(&mut conn, child.id)?)
        } else {
            None
        };
        let medical = if caller.has(Permission::ViewMedical) {
            Some(active_medical(&mut conn, child.id)?)
        } else {
            None
        };
        let school = if caller.has(Permission::ViewSchool) {
            Some(active_school(&mut conn, child.id)?)
        } else {
            None
        };
        let sponsorship = if caller.has(Permission::ViewSponsorship)
            && caller.scope(ScopeDomain::Financial).permits(child.site_id)
        {
            active_for_child(&mut conn, child.id)?
        } else {
            None
        };
        (site_name, documents, medical, school, sponsorship)
    };

    let photo_url = match &child.photo_key {
        Some(key) => match state
            .storage
            .presign_get_object(key, Duration::from_secs(PRESIGNED_URL_EXPIRY_SECONDS))
            .await
        {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(child_id = %child.id, error = %err, "failed to presign child photo");
                None
            }
        },
        None => None,
    };

    Ok(ChildDetailResponse {
        child: ChildResponse::build(child, site_name, Utc::now().date_naive()),
        photo_url,
        documents,
        medical_followups: medical,
        school_followups: school,
        sponsorship,
    })
}

struct PendingDocument {
    document_type: DocumentType,
    description: Option<String>,
    file: UploadedFile,
}

#[derive(Default)]
struct ChildForm {
    child: Option<CreateChildRequest>,
    photo: Option<UploadedFile>,
    documents: Vec<PendingDocument>,
}

/// Reads the create form. Each `document` part takes the most recent
/// `document_type` and `document_description` parts sent before it.
async fn read_child_form(mut multipart: Multipart) -> AppResult<ChildForm> {
    let mut form = ChildForm::default();
    let mut pending_type: Option<DocumentType> = None;
    let mut pending_description: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("child") => {
                let value = read_text_field(field, "child").await?;
                let request: CreateChildRequest = serde_json::from_str(&value)
                    .map_err(|err| AppError::bad_request(format!("child must be valid JSON: {err}")))?;
                form.child = Some(request);
            }
            Some("photo") => form.photo = Some(read_file_field(field).await?),
            Some("document_type") => {
                let value = read_text_field(field, "document_type").await?;
                pending_type = Some(value.parse().map_err(AppError::bad_request)?);
            }
            Some("document_description") => {
                let value = read_text_field(field, "document_description").await?;
                pending_description = crate::utils::json::optional_text(Some(&value));
            }
            Some("document") => {
                let file = read_file_field(field).await?;
                let document_type = pending_type.take().ok_or_else(|| {
                    AppError::bad_request("each document part must follow a document_type part")
                })?;
                form.documents.push(PendingDocument {
                    document_type,
                    description: pending_description.take(),
                    file,
                });
            }
            _ => {}
        }
    }
    Ok(form)
}

pub async fn create_child(
    State(state): State<AppState>,
    caller: Caller,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<ChildDetailResponse>)> {
    caller.require(Permission::AddChild)?;
    let form = read_child_form(multipart).await?;
    let request = form
        .child
        .ok_or_else(|| AppError::bad_request("child part is required"))?;
    if !form.documents.is_empty() {
        caller.require(Permission::AddDocument)?;
    }

    let site_id = caller
        .form_policy(ScopeDomain::General)
        .resolve_site(request.site_id)?;
    let fields = ChildFields::from(request).validate(Utc::now().date_naive())?;
    {
        let mut conn = state.db()?;
        ensure_site_exists(&mut conn, site_id)?;
    }

    let child_id = Uuid::new_v4();
    let mut stored_keys: Vec<String> = Vec::new();

    let photo_key = match form.photo {
        Some(photo) => {
            let key = child_photo_key(child_id, &photo);
            store_upload(&state, &key, photo).await?;
            stored_keys.push(key.clone());
            Some(key)
        }
        None => None,
    };

    let mut new_documents = Vec::with_capacity(form.documents.len());
    for pending in form.documents {
        let document_id = Uuid::new_v4();
        let key = child_document_key(child_id, document_id);
        let (original_name, content_type, size_bytes) =
            match store_upload(&state, &key, pending.file).await {
                Ok(meta) => meta,
                Err(err) => {
                    discard_objects(state.storage.as_ref(), &stored_keys).await;
                    return Err(err);
                }
            };
        stored_keys.push(key.clone());
        new_documents.push(NewChildDocument {
            id: document_id,
            child_id,
            document_type: pending.document_type.as_str().to_string(),
            description: pending.description,
            storage_key: key,
            original_name,
            content_type,
            size_bytes,
            uploaded_by: Some(caller.user_id),
        });
    }

    let new_child = NewChild {
        id: child_id,
        site_id,
        last_name: fields.last_name,
        first_name: fields.first_name,
        birth_date: fields.birth_date,
        sex: fields.sex.as_str().to_string(),
        birth_place: fields.birth_place,
        photo_key,
        arrival_date: fields.arrival_date,
        admission_reason: fields.admission_reason,
        life_story: fields.life_story,
        status: fields.status.as_str().to_string(),
        departure_date: fields.departure_date,
    };

    let created = state.db().and_then(|mut conn| {
        conn.transaction::<Child, AppError, _>(|conn| {
            let child: Child = diesel::insert_into(children::table)
                .values(&new_child)
                .get_result(conn)?;
            if !new_documents.is_empty() {
                diesel::insert_into(child_documents::table)
                    .values(&new_documents)
                    .execute(conn)?;
            }
            history::record(conn, &child, ChangeKind::Created, caller.user_id)?;
            Ok(child)
        })
    });

    let child = match created {
        Ok(child) => child,
        Err(err) => {
            error!(error = %err, child_id = %child_id, "child creation rolled back");
            discard_objects(state.storage.as_ref(), &stored_keys).await;
            return Err(err);
        }
    };

    info!(
        child_id = %child.id,
        site_id = %child.site_id,
        documents = new_documents.len(),
        created_by = %caller.user_id,
        "child record created"
    );
    let detail = build_detail(&state, &caller, child).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

pub async fn update_child(
    State(state): State<AppState>,
    caller: Caller,
    Path(child_id): Path<Uuid>,
    Json(payload): Json<UpdateChildRequest>,
) -> AppResult<Json<ChildDetailResponse>> {
    caller.require(Permission::ChangeChild)?;
    let child = {
        let mut conn = state.db()?;
        let existing = find_child_in_scope(&mut conn, &caller, child_id, ScopeDomain::General)?;
        if !existing.is_active {
            return Err(AppError::bad_request("archived children cannot be modified"));
        }

        let site_id = match payload.site_id {
            Some(requested) if requested != existing.site_id => {
                let site_id = caller
                    .form_policy(ScopeDomain::General)
                    .resolve_site(Some(requested))?;
                ensure_site_exists(&mut conn, site_id)?;
                site_id
            }
            _ => existing.site_id,
        };

        let fields = ChildFields::from_child(&existing)?
            .apply(payload)
            .validate(Utc::now().date_naive())?;
        let now = Utc::now().naive_utc();

        conn.transaction::<Child, AppError, _>(|conn| {
            let updated: Child = diesel::update(children::table.find(child_id))
                .set(&fields.changeset(site_id, now))
                .get_result(conn)?;
            history::record(conn, &updated, ChangeKind::Updated, caller.user_id)?;
            Ok(updated)
        })?
    };

    info!(child_id = %child.id, status = %child.status, updated_by = %caller.user_id, "child record updated");
    Ok(Json(build_detail(&state, &caller, child).await?))
}

pub async fn replace_photo(
    State(state): State<AppState>,
    caller: Caller,
    Path(child_id): Path<Uuid>,
    mut multipart: Multipart,
) -> AppResult<Json<ChildDetailResponse>> {
    caller.require(Permission::ChangeChild)?;
    {
        let mut conn = state.db()?;
        let existing = find_child_in_scope(&mut conn, &caller, child_id, ScopeDomain::General)?;
        if !existing.is_active {
            return Err(AppError::bad_request("archived children cannot be modified"));
        }
    }

    let mut photo: Option<UploadedFile> = None;
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        if field.name() == Some("photo") {
            photo = Some(read_file_field(field).await?);
        }
    }
    let photo = photo.ok_or_else(|| AppError::bad_request("photo field is required"))?;

    let key = child_photo_key(child_id, &photo);
    store_upload(&state, &key, photo).await?;

    let updated = state.db().and_then(|mut conn| {
        conn.transaction::<(Child, Option<String>), AppError, _>(|conn| {
            let previous: Option<String> = children::table
                .find(child_id)
                .select(children::photo_key)
                .first(conn)?;
            let child: Child = diesel::update(children::table.find(child_id))
                .set((
                    children::photo_key.eq(Some(&key)),
                    children::updated_at.eq(Utc::now().naive_utc()),
                ))
                .get_result(conn)?;
            history::record(conn, &child, ChangeKind::Updated, caller.user_id)?;
            Ok((child, previous))
        })
    });

    let (child, previous) = match updated {
        Ok(result) => result,
        Err(err) => {
            discard_objects(state.storage.as_ref(), &[key]).await;
            return Err(err);
        }
    };
    if let Some(previous) = previous {
        discard_objects(state.storage.as_ref(), &[previous]).await;
    }

    info!(child_id = %child.id, updated_by = %caller.user_id, "child photo replaced");
    Ok(Json(build_detail(&state, &caller, child).await?))
}

pub async fn archive_child(
    State(state): State<AppState>,
    caller: Caller,
    Path(child_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    caller.require(Permission::ArchiveChild)?;
    let mut conn = state.db()?;
    let existing = find_child_in_scope(&mut conn, &caller, child_id, ScopeDomain::General)?;
    if !existing.is_active {
        return Ok(StatusCode::NO_CONTENT);
    }

    conn.transaction::<(), AppError, _>(|conn| {
        let archived: Child = diesel::update(children::table.find(child_id))
            .set((
                children::is_active.eq(false),
                children::updated_at.eq(Utc::now().naive_utc()),
            ))
            .get_result(conn)?;
        history::record(conn, &archived, ChangeKind::Archived, caller.user_id)?;
        Ok(())
    })?;

    info!(child_id = %child_id, archived_by = %caller.user_id, "child record archived");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_history(
    State(state): State<AppState>,
    caller: Caller,
    Path(child_id): Path<Uuid>,
) -> AppResult<Json<Vec<HistoryEntryResponse>>> {
    caller.require(Permission::ViewChild)?;
    let mut conn = state.db()?;
    find_child_in_scope(&mut conn, &caller, child_id, ScopeDomain::General)?;

    let rows: Vec<(ChildHistoryEntry, Option<String>)> = child_history::table
        .left_join(users::table)
        .filter(child_history::child_id.eq(child_id))
        .order(child_history::changed_at.desc())
        .select((child_history::all_columns, users::username.nullable()))
        .load(&mut conn)?;

    Ok(Json(
        rows.into_iter()
            .map(|(entry, username)| HistoryEntryResponse::build(entry, username))
            .collect(),
    ))
}

pub async fn get_history_entry(
    State(state): State<AppState>,
    caller: Caller,
    Path(history_id): Path<Uuid>,
) -> AppResult<Json<HistoryEntryResponse>> {
    caller.require(Permission::ViewChild)?;
    let mut conn = state.db()?;
    let (entry, username): (ChildHistoryEntry, Option<String>) = child_history::table
        .left_join(users::table)
        .filter(child_history::id.eq(history_id))
        .select((child_history::all_columns, users::username.nullable()))
        .first(&mut conn)?;
    find_child_in_scope(&mut conn, &caller, entry.child_id, ScopeDomain::General)?;
    Ok(Json(HistoryEntryResponse::build(entry, username)))
}

#[derive(Deserialize)]
pub struct ChildExportQuery {
    pub site: Option<Uuid>,
    pub status: Option<String>,
    pub arrival_from: Option<NaiveDate>,
    pub arrival_to: Option<NaiveDate>,
    #[serde(default)]
    pub format: ExportFormat,
}

#[derive(Serialize)]
pub struct ChildExportPreview {
    pub count: usize,
    pub rows: Vec<ChildExportRow>,
}

/// The one query behind both the export preview and the download.
fn export_rows(
    conn: &mut PgConnection,
    caller: &Caller,
    params: &ChildExportQuery,
) -> AppResult<Vec<ChildExportRow>> {
    let mut query = children::table.into_boxed();
    if let Some(ids) = caller.scope(ScopeDomain::General).narrowed(params.site).restriction() {
        query = query.filter(children::site_id.eq_any(ids));
    }
    match params.status.as_deref().map(str::trim) {
        None | Some("") => {}
        Some("actifs") => query = query.filter(children::is_active.eq(true)),
        Some("inactifs") => query = query.filter(children::is_active.eq(false)),
        Some(other) => {
            return Err(AppError::bad_request(format!(
                "unknown status filter '{other}', expected actifs or inactifs"
            )))
        }
    }
    if let Some(from) = params.arrival_from {
        query = query.filter(children::arrival_date.ge(from));
    }
    if let Some(to) = params.arrival_to {
        query = query.filter(children::arrival_date.le(to));
    }

    let rows: Vec<Child> = query
        .order((children::last_name.asc(), children::first_name.asc()))
        .load(conn)?;
    let child_ids: Vec<Uuid> = rows.iter().map(|child| child.id).collect();
    let site_ids: Vec<Uuid> = rows
        .iter()
        .map(|child| child.site_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let names = site_names(conn, &site_ids)?;

    let mut last_medical: HashMap<Uuid, MedicalFollowup> = HashMap::new();
    let medical: Vec<MedicalFollowup> = medical_followups::table
        .filter(medical_followups::child_id.eq_any(&child_ids))
        .filter(medical_followups::is_active.eq(true))
        .order((
            medical_followups::consultation_date.desc(),
            medical_followups::created_at.desc(),
        ))
        .load(conn)?;
    for row in medical {
        last_medical.entry(row.child_id).or_insert(row);
    }

    let mut last_school: HashMap<Uuid, SchoolFollowup> = HashMap::new();
    let school: Vec<SchoolFollowup> = school_followups::table
        .filter(school_followups::child_id.eq_any(&child_ids))
        .filter(school_followups::is_active.eq(true))
        .order(school_followups::school_year.desc())
        .load(conn)?;
    for row in school {
        last_school.entry(row.child_id).or_insert(row);
    }

    Ok(rows
        .into_iter()
        .map(|child| {
            let site_name = names.get(&child.site_id).map(String::as_str).unwrap_or("");
            let medical = last_medical.get(&child.id);
            let school = last_school.get(&child.id);
            ChildExportRow::project(child, site_name, medical, school)
        })
        .collect())
}

pub async fn export_preview(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<ChildExportQuery>,
) -> AppResult<Json<ChildExportPreview>> {
    caller.require(Permission::ViewChild)?;
    let mut conn = state.db()?;
    let rows = export_rows(&mut conn, &caller, &params)?;
    Ok(Json(ChildExportPreview {
        count: rows.len(),
        rows,
    }))
}

pub async fn export_download(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<ChildExportQuery>,
) -> AppResult<Response> {
    caller.require(Permission::ViewChild)?;
    let rows = {
        let mut conn = state.db()?;
        export_rows(&mut conn, &caller, &params)?
    };
    let bytes = export::render(params.format, "Enfants", &rows)?;
    info!(rows = rows.len(), format = params.format.extension(), exported_by = %caller.user_id, "children exported");
    let stem = format!("enfants_{}", Utc::now().format("%Y%m%d"));
    Ok(export::attachment(params.format, &stem, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn fields(status: ChildStatus, departure: Option<NaiveDate>) -> ChildFields {
        ChildFields {
            last_name: " Koffi ".into(),
            first_name: "Yao".into(),
            birth_date: date(2012, 5, 4),
            sex: Sex::M,
            birth_place: "Lomé".into(),
            arrival_date: date(2019, 1, 10),
            admission_reason: String::new(),
            life_story: String::new(),
            status,
            departure_date: departure,
        }
    }

    #[test]
    fn departure_status_requires_date() {
        let today = date(2024, 6, 1);
        let err = fields(ChildStatus::Adopte, None).validate(today).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let ok = fields(ChildStatus::Majeur, Some(date(2024, 5, 4)))
            .validate(today)
            .unwrap();
        assert_eq!(ok.departure_date, Some(date(2024, 5, 4)));
        assert_eq!(ok.last_name, "Koffi");
    }

    #[test]
    fn accueilli_clears_departure() {
        let validated = fields(ChildStatus::Accueilli, Some(date(2023, 1, 1)))
            .validate(date(2024, 6, 1))
            .unwrap();
        assert_eq!(validated.departure_date, None);
    }

    #[test]
    fn departure_cannot_precede_arrival() {
        let err = fields(ChildStatus::Reunifie, Some(date(2018, 12, 31)))
            .validate(date(2024, 6, 1))
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn future_birth_date_is_rejected() {
        let mut record = fields(ChildStatus::Accueilli, None);
        record.birth_date = date(2030, 1, 1);
        record.arrival_date = date(2030, 1, 2);
        assert!(record.validate(date(2024, 6, 1)).is_err());
    }

    #[test]
    fn patch_can_clear_departure_by_returning_to_accueilli() {
        let patch = UpdateChildRequest {
            status: Some(ChildStatus::Accueilli),
            ..Default::default()
        };
        let validated = fields(ChildStatus::Adopte, Some(date(2023, 1, 1)))
            .apply(patch)
            .validate(date(2024, 6, 1))
            .unwrap();
        assert_eq!(validated.status, ChildStatus::Accueilli);
        assert_eq!(validated.departure_date, None);
    }

    #[test]
    fn age_counts_completed_years() {
        assert_eq!(age_on(date(2012, 5, 4), date(2024, 5, 3)), 11);
        assert_eq!(age_on(date(2012, 5, 4), date(2024, 5, 4)), 12);
        assert_eq!(age_on(date(2024, 5, 4), date(2024, 5, 4)), 0);
    }

    #[test]
    fn status_round_trips_through_labels() {
        assert_eq!("reunifie".parse::<ChildStatus>().unwrap(), ChildStatus::Reunifie);
        assert_eq!(ChildStatus::Adopte.label(), "Adopté");
        assert!(!ChildStatus::Accueilli.is_departure());
        assert!("parti".parse::<ChildStatus>().is_err());
    }
}
