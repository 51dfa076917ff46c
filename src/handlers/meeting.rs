//! Meeting transcript upload.

use axum::{
    Json,
    extract::{Multipart, State},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::company::{FileUploadForm, read_upload};
use super::extract::ApiPath;
use super::tenant_db;
use crate::error::ApiError;
use crate::server::AppState;
use crate::services::meeting::upload_transcript;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MeetingUploadResponse {
    pub status: String,
    pub message: String,
    pub file_id: Uuid,
    /// Number of CSV rows written
    pub rows: usize,
}

/// Converts a plain-text transcript to conversation CSV and stores it
#[utoipa::path(
    post,
    path = "/api/v1/meeting/{company_id}/upload",
    params(("company_id" = Uuid, Path, description = "Company identifier")),
    request_body(content = FileUploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Transcript converted and stored", body = MeetingUploadResponse),
        (status = 400, description = "Not a UTF-8 .txt file", body = ApiError)
    ),
    tag = "meeting"
)]
pub async fn upload_meeting(
    State(state): State<AppState>,
    ApiPath(company_id): ApiPath<Uuid>,
    multipart: Multipart,
) -> Result<Json<MeetingUploadResponse>, ApiError> {
    let upload = read_upload(multipart).await?;
    let db = tenant_db(&state, company_id).await?;
    let (file, rows) = upload_transcript(
        state.blob.as_ref(),
        &db,
        company_id,
        &upload.file_name,
        &upload.data,
    )
    .await?;

    Ok(Json(MeetingUploadResponse {
        status: "success".to_string(),
        message: "ファイルが正常にアップロードされました".to_string(),
        file_id: file.id,
        rows,
    }))
}
