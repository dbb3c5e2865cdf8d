use std::{str::FromStr, time::Duration};

use axum::extract::{multipart::Field, Json, Multipart, Path, State};
use axum::http::StatusCode;
use diesel::{prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::children::find_child_in_scope;
use crate::access::{Caller, Permission, ScopeDomain};
use crate::error::{AppError, AppResult};
use crate::history::to_iso;
use crate::models::{ChildDocument, NewChildDocument};
use crate::schema::child_documents;
use crate::state::AppState;
use crate::storage::{child_document_key, discard_objects, inline_content_disposition, UploadedFile};

pub const PRESIGNED_URL_EXPIRY_SECONDS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    ActeNaissance,
    Jugement,
    CarnetSante,
    BulletinScolaire,
    Autre,
}

impl DocumentType {
    pub const ALL: [DocumentType; 5] = [
        DocumentType::ActeNaissance,
        DocumentType::Jugement,
        DocumentType::CarnetSante,
        DocumentType::BulletinScolaire,
        DocumentType::Autre,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentType::ActeNaissance => "acte_naissance",
            DocumentType::Jugement => "jugement",
            DocumentType::CarnetSante => "carnet_sante",
            DocumentType::BulletinScolaire => "bulletin_scolaire",
            DocumentType::Autre => "autre",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DocumentType::ActeNaissance => "Acte de naissance",
            DocumentType::Jugement => "Jugement",
            DocumentType::CarnetSante => "Carnet de santé",
            DocumentType::BulletinScolaire => "Bulletin scolaire",
            DocumentType::Autre => "Autre",
        }
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        DocumentType::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown document type '{}'", value.trim()))
    }
}

#[derive(Serialize)]
pub struct DocumentResponse {
    pub id: Uuid,
    pub child_id: Uuid,
    pub document_type: String,
    pub document_type_label: Option<&'static str>,
    pub description: Option<String>,
    pub original_name: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub uploaded_by: Option<Uuid>,
    pub uploaded_at: String,
}

impl From<ChildDocument> for DocumentResponse {
    fn from(doc: ChildDocument) -> Self {
        let label = doc
            .document_type
            .parse::<DocumentType>()
            .ok()
            .map(DocumentType::label);
        Self {
            id: doc.id,
            child_id: doc.child_id,
            document_type: doc.document_type,
            document_type_label: label,
            description: doc.description,
            original_name: doc.original_name,
            content_type: doc.content_type,
            size_bytes: doc.size_bytes,
            uploaded_by: doc.uploaded_by,
            uploaded_at: to_iso(doc.uploaded_at),
        }
    }
}

#[derive(Serialize)]
pub struct DocumentDownloadResponse {
    pub url: String,
    pub expires_in: u64,
    pub filename: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
}

pub(crate) fn load_documents(
    conn: &mut PgConnection,
    child_id: Uuid,
) -> QueryResult<Vec<DocumentResponse>> {
    let docs: Vec<ChildDocument> = child_documents::table
        .filter(child_documents::child_id.eq(child_id))
        .order(child_documents::uploaded_at.desc())
        .load(conn)?;
    Ok(docs.into_iter().map(DocumentResponse::from).collect())
}

pub(crate) async fn read_file_field(field: Field<'_>) -> AppResult<UploadedFile> {
    let original_name = field
        .file_name()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AppError::bad_request("uploaded files need a filename"))?;
    let content_type = field.content_type().map(|mime| mime.to_string());
    let bytes = field.bytes().await.map_err(|err| {
        error!(error = %err, "failed to read uploaded file");
        AppError::bad_request(format!("failed to read file bytes: {err}"))
    })?;
    if bytes.is_empty() {
        return Err(AppError::bad_request(format!(
            "uploaded file '{original_name}' is empty"
        )));
    }
    Ok(UploadedFile {
        original_name,
        content_type,
        bytes: bytes.to_vec(),
    })
}

pub(crate) async fn read_text_field(field: Field<'_>, name: &str) -> AppResult<String> {
    field.text().await.map_err(|err| {
        error!(error = %err, field = name, "invalid multipart text field");
        AppError::bad_request(format!("invalid {name}: {err}"))
    })
}

/// Uploads `file` under `key` and returns the row metadata it needs.
pub(crate) async fn store_upload(
    state: &AppState,
    key: &str,
    file: UploadedFile,
) -> AppResult<(String, Option<String>, i64)> {
    let content_type = file.resolved_content_type();
    let size_bytes = file.bytes.len() as i64;
    let disposition = inline_content_disposition(&file.original_name);
    state
        .storage
        .put_object(key, file.bytes, content_type.clone(), disposition)
        .await
        .map_err(|err| {
            error!(error = %err, key = %key, "failed to store upload");
            AppError::internal(format!("failed to store file: {err}"))
        })?;
    Ok((file.original_name, content_type, size_bytes))
}

pub async fn list_child_documents(
    State(state): State<AppState>,
    caller: Caller,
    Path(child_id): Path<Uuid>,
) -> AppResult<Json<Vec<DocumentResponse>>> {
    caller.require(Permission::ViewDocument)?;
    let mut conn = state.db()?;
    find_child_in_scope(&mut conn, &caller, child_id, ScopeDomain::General)?;
    Ok(Json(load_documents(&mut conn, child_id)?))
}

pub async fn upload_child_document(
    State(state): State<AppState>,
    caller: Caller,
    Path(child_id): Path<Uuid>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<DocumentResponse>)> {
    caller.require(Permission::AddDocument)?;
    {
        let mut conn = state.db()?;
        find_child_in_scope(&mut conn, &caller, child_id, ScopeDomain::General)?;
    }

    let mut document_type: Option<DocumentType> = None;
    let mut description: Option<String> = None;
    let mut file: Option<UploadedFile> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("document_type") => {
                let value = read_text_field(field, "document_type").await?;
                document_type = Some(value.parse().map_err(AppError::bad_request)?);
            }
            Some("description") => {
                let value = read_text_field(field, "description").await?;
                description = crate::utils::json::optional_text(Some(&value));
            }
            Some("file") => file = Some(read_file_field(field).await?),
            _ => {}
        }
    }

    let document_type =
        document_type.ok_or_else(|| AppError::bad_request("document_type is required"))?;
    let file = file.ok_or_else(|| AppError::bad_request("file field is required"))?;

    let document_id = Uuid::new_v4();
    let key = child_document_key(child_id, document_id);
    let (original_name, content_type, size_bytes) = store_upload(&state, &key, file).await?;

    let new_document = NewChildDocument {
        id: document_id,
        child_id,
        document_type: document_type.as_str().to_string(),
        description,
        storage_key: key.clone(),
        original_name,
        content_type,
        size_bytes,
        uploaded_by: Some(caller.user_id),
    };

    let inserted = state.db().and_then(|mut conn| {
        diesel::insert_into(child_documents::table)
            .values(&new_document)
            .get_result::<ChildDocument>(&mut conn)
            .map_err(AppError::from)
    });
    let document = match inserted {
        Ok(document) => document,
        Err(err) => {
            discard_objects(state.storage.as_ref(), &[key]).await;
            return Err(err);
        }
    };

    info!(
        document_id = %document.id,
        child_id = %child_id,
        document_type = %document.document_type,
        uploaded_by = %caller.user_id,
        "child document uploaded"
    );
    Ok((StatusCode::CREATED, Json(document.into())))
}

fn find_document_in_scope(
    conn: &mut PgConnection,
    caller: &Caller,
    document_id: Uuid,
) -> AppResult<ChildDocument> {
    let document: ChildDocument = child_documents::table.find(document_id).first(conn)?;
    find_child_in_scope(conn, caller, document.child_id, ScopeDomain::General)?;
    Ok(document)
}

pub async fn download_document(
    State(state): State<AppState>,
    caller: Caller,
    Path(document_id): Path<Uuid>,
) -> AppResult<Json<DocumentDownloadResponse>> {
    caller.require(Permission::ViewDocument)?;
    let document = {
        let mut conn = state.db()?;
        find_document_in_scope(&mut conn, &caller, document_id)?
    };

    let url = state
        .storage
        .presign_get_object(
            &document.storage_key,
            Duration::from_secs(PRESIGNED_URL_EXPIRY_SECONDS),
        )
        .await
        .map_err(|err| AppError::internal(format!("failed to generate download URL: {err}")))?;

    Ok(Json(DocumentDownloadResponse {
        url,
        expires_in: PRESIGNED_URL_EXPIRY_SECONDS,
        filename: document.original_name,
        content_type: document.content_type,
        size_bytes: document.size_bytes,
    }))
}

pub async fn delete_document(
    State(state): State<AppState>,
    caller: Caller,
    Path(document_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    caller.require(Permission::DeleteDocument)?;
    let document = {
        let mut conn = state.db()?;
        let document = find_document_in_scope(&mut conn, &caller, document_id)?;
        diesel::delete(child_documents::table.find(document.id)).execute(&mut conn)?;
        document
    };

    if let Err(err) = state.storage.delete_object(&document.storage_key).await {
        warn!(document_id = %document.id, error = %err, "document row removed but object deletion failed");
    }
    info!(document_id = %document.id, child_id = %document.child_id, deleted_by = %caller.user_id, "child document deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::DocumentType;

    #[test]
    fn document_types_parse_from_form_values() {
        assert_eq!(
            "carnet_sante".parse::<DocumentType>().unwrap(),
            DocumentType::CarnetSante
        );
        assert_eq!(
            " Acte_Naissance ".parse::<DocumentType>().unwrap(),
            DocumentType::ActeNaissance
        );
        assert!("passport".parse::<DocumentType>().is_err());
    }
}
