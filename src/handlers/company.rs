//! Company onboarding, senpai personas, data files, prompts, invitations and
//! allowed domains.

use axum::{
    Json,
    extract::{Multipart, State},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use super::extract::{ApiJson, ApiPath};
use super::{StatusMessage, tenant_db};
use crate::auth::CurrentUser;
use crate::error::{ApiError, invalid_request, not_found};
use crate::models::master::{slack_workspace, tenant};
use crate::models::tenant::{csv_file, senpai};
use crate::repositories::{
    CompanyRepository, SenpaiRepository, SlackWorkspaceRepository, TenantRepository,
};
use crate::server::AppState;
use crate::services::company as company_service;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateCompanyRequest {
    /// Display name, unique across tenants
    #[schema(example = "Example Inc.")]
    pub company_name: String,
    /// Database server that will hold the tenant schema
    #[schema(example = "example-db")]
    pub company_server_name: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateCompanyResponse {
    #[schema(example = "success")]
    pub status: String,
    pub message: String,
    pub company_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TenantSummary {
    pub id: Uuid,
    pub company_name: String,
    pub company_id: Uuid,
    pub company_server_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<tenant::Model> for TenantSummary {
    fn from(model: tenant::Model) -> Self {
        Self {
            id: model.id,
            company_name: model.company_name,
            company_id: model.company_id,
            company_server_name: model.company_server_name,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TenantListResponse {
    pub status: String,
    pub tenants: Vec<TenantSummary>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CompanyInfo {
    pub id: Uuid,
    pub company_name: String,
    pub company_server_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TenantInfoResponse {
    pub status: String,
    pub tenant: CompanyInfo,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterSenpaiRequest {
    #[schema(example = "田中")]
    pub senpai_name: String,
    /// Free-form profile document
    #[schema(value_type = Object)]
    pub profile: Value,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RegisterSenpaiResponse {
    pub status: String,
    pub message: String,
    pub senpai_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SenpaiDetail {
    pub senpai_id: Uuid,
    pub senpai_name: String,
    #[schema(value_type = Object)]
    pub profile: Value,
    pub created_at: DateTime<Utc>,
}

impl From<senpai::Model> for SenpaiDetail {
    fn from(model: senpai::Model) -> Self {
        Self {
            senpai_id: model.id,
            senpai_name: model.name,
            profile: model.profile,
            created_at: model.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SenpaiListResponse {
    pub status: String,
    pub senpais: Vec<SenpaiDetail>,
}

/// Multipart form carrying one file.
#[derive(Debug, ToSchema)]
pub struct FileUploadForm {
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadDataResponse {
    pub status: String,
    pub message: String,
    pub file_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestoredFile {
    pub file_id: Uuid,
    pub file_name: String,
    pub uploaded_at: DateTime<Utc>,
}

impl From<csv_file::Model> for RestoredFile {
    fn from(model: csv_file::Model) -> Self {
        Self {
            file_id: model.id,
            file_name: model.file_name,
            uploaded_at: model.uploaded_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RestoreDataResponse {
    pub status: String,
    pub message: String,
    pub restored_files: Vec<RestoredFile>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    pub file_id: Uuid,
    /// `uploaded` or `indexed`
    pub current_stage: String,
    pub records_count: usize,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileStatusResponse {
    pub status: String,
    pub file_status: FileStatus,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DeleteDataRequest {
    pub file_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PromptResponse {
    pub prompt: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PromptUpdateRequest {
    pub prompt: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct InviteCodeRequest {
    #[serde(default = "default_invite_days")]
    #[schema(example = 7)]
    pub expires_in_days: i64,
}

fn default_invite_days() -> i64 {
    7
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct InviteCodeResponse {
    #[schema(example = "K3Q9Z0M2B7XA")]
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub company_id: Uuid,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AllowedDomainsRequest {
    #[schema(example = json!(["@example.com"]))]
    pub allowed_domains: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AllowedDomainsResponse {
    pub status: String,
    pub allowed_domains: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SlackWorkspaceInfo {
    pub id: Uuid,
    pub team_id: String,
    pub company_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<slack_workspace::Model> for SlackWorkspaceInfo {
    fn from(model: slack_workspace::Model) -> Self {
        Self {
            id: model.id,
            team_id: model.team_id,
            company_id: model.tenant_id,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SlackWorkspaceListResponse {
    pub status: String,
    pub workspaces: Vec<SlackWorkspaceInfo>,
}

/// A file read from the `file` field of a multipart body.
pub(crate) struct UploadedFile {
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

pub(crate) async fn read_upload(mut multipart: Multipart) -> Result<UploadedFile, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| invalid_request(format!("Failed to read multipart: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| invalid_request("File name is required"))?
            .to_string();
        let content_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| invalid_request(format!("Failed to read file: {}", e)))?
            .to_vec();
        return Ok(UploadedFile {
            file_name,
            content_type,
            data,
        });
    }
    Err(invalid_request("No file provided"))
}

/// Registers a company and provisions its tenant database
#[utoipa::path(
    post,
    path = "/api/v1/company",
    request_body = CreateCompanyRequest,
    responses(
        (status = 200, description = "Company created", body = CreateCompanyResponse),
        (status = 409, description = "Company name or server already exists", body = ApiError)
    ),
    tag = "company"
)]
pub async fn create_company(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreateCompanyRequest>,
) -> Result<Json<CreateCompanyResponse>, ApiError> {
    tracing::info!(company_name = %request.company_name, "Starting company registration");
    let created = company_service::create_company(
        &state.db,
        &state.tenants,
        &request.company_name,
        &request.company_server_name,
    )
    .await?;

    Ok(Json(CreateCompanyResponse {
        status: "success".to_string(),
        message: format!(
            "Company created successfully. Default invite code: {}",
            created.invite_code
        ),
        company_id: created.company_id,
    }))
}

/// Lists every registered tenant
#[utoipa::path(
    get,
    path = "/api/v1/company",
    responses((status = 200, description = "Registered tenants", body = TenantListResponse)),
    tag = "company"
)]
pub async fn list_companies(
    State(state): State<AppState>,
) -> Result<Json<TenantListResponse>, ApiError> {
    let tenants = TenantRepository::new(&state.db).list().await?;
    Ok(Json(TenantListResponse {
        status: "success".to_string(),
        tenants: tenants.into_iter().map(TenantSummary::from).collect(),
    }))
}

/// Company row from the tenant database
#[utoipa::path(
    get,
    path = "/api/v1/company/{company_id}",
    params(("company_id" = Uuid, Path, description = "Company identifier")),
    responses(
        (status = 200, description = "Company details", body = TenantInfoResponse),
        (status = 404, description = "Company not found", body = ApiError)
    ),
    tag = "company"
)]
pub async fn get_company(
    State(state): State<AppState>,
    ApiPath(company_id): ApiPath<Uuid>,
) -> Result<Json<TenantInfoResponse>, ApiError> {
    let db = tenant_db(&state, company_id).await?;
    let company = CompanyRepository::new(&db)
        .find(company_id)
        .await?
        .ok_or_else(|| not_found(format!("Company not found: {}", company_id)))?;

    Ok(Json(TenantInfoResponse {
        status: "success".to_string(),
        tenant: CompanyInfo {
            id: company.id,
            company_name: company.company_name,
            company_server_name: company.company_server_name,
            created_at: company.created_at,
            updated_at: company.updated_at,
        },
    }))
}

/// Registers a senpai persona
#[utoipa::path(
    post,
    path = "/api/v1/company/{company_id}/senpai",
    params(("company_id" = Uuid, Path, description = "Company identifier")),
    request_body = RegisterSenpaiRequest,
    responses(
        (status = 200, description = "Senpai registered", body = RegisterSenpaiResponse),
        (status = 404, description = "Company not found", body = ApiError)
    ),
    tag = "company"
)]
pub async fn register_senpai(
    State(state): State<AppState>,
    ApiPath(company_id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<RegisterSenpaiRequest>,
) -> Result<Json<RegisterSenpaiResponse>, ApiError> {
    let db = tenant_db(&state, company_id).await?;
    let senpai = SenpaiRepository::new(&db)
        .create(company_id, &request.senpai_name, request.profile)
        .await?;
    tracing::info!(%company_id, senpai_id = %senpai.id, "Senpai registered");

    Ok(Json(RegisterSenpaiResponse {
        status: "success".to_string(),
        message: "Senpai registered successfully".to_string(),
        senpai_id: senpai.id,
    }))
}

/// Lists the company's senpai personas
#[utoipa::path(
    get,
    path = "/api/v1/company/{company_id}/senpai",
    params(("company_id" = Uuid, Path, description = "Company identifier")),
    responses((status = 200, description = "Senpai list", body = SenpaiListResponse)),
    tag = "company"
)]
pub async fn list_senpais(
    State(state): State<AppState>,
    ApiPath(company_id): ApiPath<Uuid>,
) -> Result<Json<SenpaiListResponse>, ApiError> {
    let db = tenant_db(&state, company_id).await?;
    let senpais = SenpaiRepository::new(&db).list(company_id).await?;
    Ok(Json(SenpaiListResponse {
        status: "success".to_string(),
        senpais: senpais.into_iter().map(SenpaiDetail::from).collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/company/{company_id}/senpai/{senpai_id}",
    params(
        ("company_id" = Uuid, Path, description = "Company identifier"),
        ("senpai_id" = Uuid, Path, description = "Senpai identifier")
    ),
    responses(
        (status = 200, description = "Senpai details", body = SenpaiDetail),
        (status = 404, description = "Senpai not found", body = ApiError)
    ),
    tag = "company"
)]
pub async fn get_senpai(
    State(state): State<AppState>,
    ApiPath((company_id, senpai_id)): ApiPath<(Uuid, Uuid)>,
) -> Result<Json<SenpaiDetail>, ApiError> {
    let db = tenant_db(&state, company_id).await?;
    let senpai = SenpaiRepository::new(&db)
        .find(senpai_id)
        .await?
        .filter(|s| s.company_id == company_id)
        .ok_or_else(|| not_found(format!("Senpai not found: {}", senpai_id)))?;
    Ok(Json(senpai.into()))
}

/// Uploads a conversation CSV
#[utoipa::path(
    post,
    path = "/api/v1/company/{company_id}/data/upload",
    params(("company_id" = Uuid, Path, description = "Company identifier")),
    request_body(content = FileUploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "File stored", body = UploadDataResponse),
        (status = 400, description = "Not a CSV file", body = ApiError),
        (status = 413, description = "File larger than 10 MiB", body = ApiError)
    ),
    tag = "company"
)]
pub async fn upload_data(
    State(state): State<AppState>,
    ApiPath(company_id): ApiPath<Uuid>,
    multipart: Multipart,
) -> Result<Json<UploadDataResponse>, ApiError> {
    let upload = read_upload(multipart).await?;
    let db = tenant_db(&state, company_id).await?;
    let file = company_service::upload_csv(
        state.blob.as_ref(),
        &db,
        company_id,
        &upload.file_name,
        upload.content_type.as_deref(),
        upload.data,
    )
    .await?;

    Ok(Json(UploadDataResponse {
        status: "success".to_string(),
        message: "File uploaded successfully".to_string(),
        file_id: file.id,
    }))
}

/// Recreates file records for blobs already in storage
#[utoipa::path(
    post,
    path = "/api/v1/company/{company_id}/data/restore",
    params(("company_id" = Uuid, Path, description = "Company identifier")),
    responses((status = 200, description = "Restored file records", body = RestoreDataResponse)),
    tag = "company"
)]
pub async fn restore_data(
    State(state): State<AppState>,
    ApiPath(company_id): ApiPath<Uuid>,
) -> Result<Json<RestoreDataResponse>, ApiError> {
    let db = tenant_db(&state, company_id).await?;
    let restored =
        company_service::restore_csv_metadata(state.blob.as_ref(), &db, company_id).await?;

    Ok(Json(RestoreDataResponse {
        status: "success".to_string(),
        message: format!("Restored {} files", restored.len()),
        restored_files: restored.into_iter().map(RestoredFile::from).collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/company/{company_id}/data/status/{file_id}",
    params(
        ("company_id" = Uuid, Path, description = "Company identifier"),
        ("file_id" = Uuid, Path, description = "File identifier")
    ),
    responses(
        (status = 200, description = "File processing status", body = FileStatusResponse),
        (status = 404, description = "File not found", body = ApiError)
    ),
    tag = "company"
)]
pub async fn file_status(
    State(state): State<AppState>,
    ApiPath((company_id, file_id)): ApiPath<(Uuid, Uuid)>,
) -> Result<Json<FileStatusResponse>, ApiError> {
    let db = tenant_db(&state, company_id).await?;
    let (file, records_count) =
        company_service::file_status(state.blob.as_ref(), &db, company_id, file_id).await?;

    Ok(Json(FileStatusResponse {
        status: "success".to_string(),
        file_status: FileStatus {
            file_id: file.id,
            current_stage: file.status,
            records_count,
            updated_at: file.uploaded_at,
        },
    }))
}

#[utoipa::path(
    delete,
    path = "/api/v1/company/{company_id}/data/delete",
    params(("company_id" = Uuid, Path, description = "Company identifier")),
    request_body = DeleteDataRequest,
    responses(
        (status = 200, description = "File deleted", body = StatusMessage),
        (status = 404, description = "File not found", body = ApiError)
    ),
    tag = "company"
)]
pub async fn delete_data(
    State(state): State<AppState>,
    ApiPath(company_id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<DeleteDataRequest>,
) -> Result<Json<StatusMessage>, ApiError> {
    let db = tenant_db(&state, company_id).await?;
    company_service::delete_csv(state.blob.as_ref(), &db, company_id, request.file_id).await?;
    Ok(Json(StatusMessage::success("File deleted successfully")))
}

/// Current RAG prompt template
#[utoipa::path(
    get,
    path = "/api/v1/company/{company_id}/rag/prompt",
    params(("company_id" = Uuid, Path, description = "Company identifier")),
    responses(
        (status = 200, description = "Prompt template", body = PromptResponse),
        (status = 404, description = "Company not found", body = ApiError)
    ),
    tag = "company"
)]
pub async fn get_prompt(
    State(state): State<AppState>,
    ApiPath(company_id): ApiPath<Uuid>,
) -> Result<Json<PromptResponse>, ApiError> {
    let db = tenant_db(&state, company_id).await?;
    let prompt = company_service::prompt_template(&db, company_id).await?;
    Ok(Json(PromptResponse { prompt }))
}

#[utoipa::path(
    put,
    path = "/api/v1/company/{company_id}/rag/prompt",
    params(("company_id" = Uuid, Path, description = "Company identifier")),
    request_body = PromptUpdateRequest,
    responses(
        (status = 200, description = "Prompt template updated", body = StatusMessage),
        (status = 404, description = "Company not found", body = ApiError)
    ),
    tag = "company"
)]
pub async fn update_prompt(
    State(state): State<AppState>,
    ApiPath(company_id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<PromptUpdateRequest>,
) -> Result<Json<StatusMessage>, ApiError> {
    let db = tenant_db(&state, company_id).await?;
    company_service::set_prompt_template(&db, company_id, &request.prompt).await?;
    Ok(Json(StatusMessage::success(
        "Prompt template updated successfully",
    )))
}

#[utoipa::path(
    delete,
    path = "/api/v1/company/{company_id}/rag/prompt",
    params(("company_id" = Uuid, Path, description = "Company identifier")),
    responses(
        (status = 200, description = "Prompt template reset", body = StatusMessage),
        (status = 404, description = "Company not found", body = ApiError)
    ),
    tag = "company"
)]
pub async fn reset_prompt(
    State(state): State<AppState>,
    ApiPath(company_id): ApiPath<Uuid>,
) -> Result<Json<StatusMessage>, ApiError> {
    let db = tenant_db(&state, company_id).await?;
    company_service::set_prompt_template(&db, company_id, "").await?;
    Ok(Json(StatusMessage::success("Prompt template reset successfully")))
}

/// Issues an additional invite code
#[utoipa::path(
    post,
    path = "/api/v1/company/{company_id}/invite-codes",
    params(("company_id" = Uuid, Path, description = "Company identifier")),
    request_body = InviteCodeRequest,
    responses(
        (status = 200, description = "Invite code created", body = InviteCodeResponse),
        (status = 403, description = "Caller may not issue codes for this company", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "company"
)]
pub async fn create_invite_code(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(company_id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<InviteCodeRequest>,
) -> Result<Json<InviteCodeResponse>, ApiError> {
    let (token, expires_at) = company_service::create_invite_code(
        &state.db,
        &user,
        company_id,
        request.expires_in_days,
    )
    .await?;
    Ok(Json(InviteCodeResponse {
        token,
        expires_at,
        company_id,
    }))
}

/// Replaces the e-mail domains allowed to sign up without an invite code
#[utoipa::path(
    patch,
    path = "/api/v1/company/{company_id}/allowed-domains",
    params(("company_id" = Uuid, Path, description = "Company identifier")),
    request_body = AllowedDomainsRequest,
    responses(
        (status = 200, description = "Domains updated", body = StatusMessage),
        (status = 400, description = "A domain does not start with @", body = ApiError),
        (status = 403, description = "Caller may not manage this company", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "company"
)]
pub async fn update_allowed_domains(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(company_id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<AllowedDomainsRequest>,
) -> Result<Json<StatusMessage>, ApiError> {
    company_service::update_allowed_domains(&state.db, &user, company_id, request.allowed_domains)
        .await?;
    Ok(Json(StatusMessage::success("許可ドメインが更新されました")))
}

#[utoipa::path(
    get,
    path = "/api/v1/company/{company_id}/allowed-domains",
    params(("company_id" = Uuid, Path, description = "Company identifier")),
    responses(
        (status = 200, description = "Allowed domains", body = AllowedDomainsResponse),
        (status = 403, description = "Caller may not manage this company", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "company"
)]
pub async fn get_allowed_domains(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(company_id): ApiPath<Uuid>,
) -> Result<Json<AllowedDomainsResponse>, ApiError> {
    let allowed_domains =
        company_service::allowed_domains(&state.db, &user, company_id).await?;
    Ok(Json(AllowedDomainsResponse {
        status: "success".to_string(),
        allowed_domains,
    }))
}

/// Installed Slack workspaces across all companies
#[utoipa::path(
    get,
    path = "/api/v1/company/list/slack-workspaces",
    responses((status = 200, description = "Slack workspaces", body = SlackWorkspaceListResponse)),
    tag = "company"
)]
pub async fn list_slack_workspaces(
    State(state): State<AppState>,
) -> Result<Json<SlackWorkspaceListResponse>, ApiError> {
    let workspaces = SlackWorkspaceRepository::new(&state.db).list().await?;
    tracing::info!(count = workspaces.len(), "Slack workspaces retrieved");
    Ok(Json(SlackWorkspaceListResponse {
        status: "success".to_string(),
        workspaces: workspaces.into_iter().map(SlackWorkspaceInfo::from).collect(),
    }))
}
