//! Index maintenance and retrieval queries over a company's knowledge base.

use axum::{
    Json,
    extract::State,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::company::PromptUpdateRequest;
use super::extract::{ApiJson, ApiPath, ApiQuery};
use super::{StatusMessage, tenant_db};
use crate::auth::CurrentUser;
use crate::error::ApiError;
use crate::repositories::CsvFileRepository;
use crate::server::AppState;
use crate::services::company as company_service;
use crate::services::rag::RagAnswer;

const DEFAULT_QUERY_TOP_K: usize = 5;
const DEFAULT_DOCUMENT_LIMIT: usize = 10;

#[derive(Debug, Deserialize, ToSchema)]
pub struct BuildIndexRequest {
    pub company_id: Uuid,
    pub file_id: Uuid,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BuildIndexFromBlobRequest {
    pub company_id: Uuid,
    #[schema(example = "https://account.blob.core.windows.net/data/acme/slack.csv")]
    pub blob_url: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PromptRequest {
    pub company_id: Uuid,
    pub prompt: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildIndexResponse {
    pub status: String,
    pub message: String,
    /// Number of documents uploaded
    pub index_size: usize,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct QueryRequest {
    pub company_id: Uuid,
    #[schema(example = "有給の申請方法")]
    pub query: String,
    /// Accepted for compatibility; the company index is always used
    pub index_name: Option<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    DEFAULT_QUERY_TOP_K
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct DocumentsQuery {
    /// Defaults to the caller's company
    pub company_id: Option<Uuid>,
    /// Maximum number of documents
    pub top: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IndexDocument {
    pub id: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileItem {
    pub id: Uuid,
    pub blob_url: String,
    pub status: String,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct CompanyQuery {
    pub company_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PromptStatusResponse {
    pub status: String,
    pub prompt: String,
}

/// Chunks, embeds and indexes one uploaded CSV file
#[utoipa::path(
    post,
    path = "/api/v1/rag/build-index",
    request_body = BuildIndexRequest,
    responses(
        (status = 200, description = "Index built", body = BuildIndexResponse),
        (status = 404, description = "File not found", body = ApiError)
    ),
    tag = "rag"
)]
pub async fn build_index(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<BuildIndexRequest>,
) -> Result<Json<BuildIndexResponse>, ApiError> {
    tracing::info!(file_id = %request.file_id, "Received request to build RAG index");
    let db = tenant_db(&state, request.company_id).await?;
    let index_size = state
        .rag
        .build_index(&db, request.company_id, request.file_id)
        .await?;
    Ok(Json(BuildIndexResponse {
        status: "success".to_string(),
        message: "Index built successfully".to_string(),
        index_size,
    }))
}

/// Indexes a CSV blob by URL, registering it as a company file if needed
#[utoipa::path(
    post,
    path = "/api/v1/rag/build-index-from-blob",
    request_body = BuildIndexFromBlobRequest,
    responses(
        (status = 200, description = "Index built", body = BuildIndexResponse),
        (status = 400, description = "Empty blob URL", body = ApiError)
    ),
    tag = "rag"
)]
pub async fn build_index_from_blob(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<BuildIndexFromBlobRequest>,
) -> Result<Json<BuildIndexResponse>, ApiError> {
    tracing::info!(blob_url = %request.blob_url, "Received request to build RAG index from blob");
    let db = tenant_db(&state, request.company_id).await?;
    let index_size = state
        .rag
        .build_index_from_blob(&db, request.company_id, &request.blob_url)
        .await?;
    Ok(Json(BuildIndexResponse {
        status: "success".to_string(),
        message: "Index built successfully".to_string(),
        index_size,
    }))
}

/// Drops the caller's company index
#[utoipa::path(
    delete,
    path = "/api/v1/rag/delete-index",
    responses((status = 200, description = "Index deleted", body = StatusMessage)),
    security(("bearer_auth" = [])),
    tag = "rag"
)]
pub async fn delete_index(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<StatusMessage>, ApiError> {
    let db = tenant_db(&state, user.company_id).await?;
    state.rag.delete_index(&db, user.company_id).await?;
    Ok(Json(StatusMessage::success("Index deleted successfully")))
}

/// Expands the query and answers it from the company index
#[utoipa::path(
    post,
    path = "/api/v1/rag/query",
    request_body = QueryRequest,
    responses((status = 200, description = "Generated answer with sources", body = RagAnswer)),
    tag = "rag"
)]
pub async fn query(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<QueryRequest>,
) -> Result<Json<RagAnswer>, ApiError> {
    let db = tenant_db(&state, request.company_id).await?;
    let expanded = state.rag.expand_query(&request.query).await;
    tracing::info!(company_id = %request.company_id, expanded, "Expanded query");
    let answer = state
        .rag
        .query_index(&db, request.company_id, &expanded, request.top_k)
        .await?;
    Ok(Json(answer))
}

#[utoipa::path(
    get,
    path = "/api/v1/rag/index/documents",
    params(DocumentsQuery),
    responses((status = 200, description = "Indexed documents", body = [IndexDocument])),
    security(("bearer_auth" = [])),
    tag = "rag"
)]
pub async fn list_index_documents(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiQuery(query): ApiQuery<DocumentsQuery>,
) -> Result<Json<Vec<IndexDocument>>, ApiError> {
    let company_id = query.company_id.unwrap_or(user.company_id);
    let hits = state
        .rag
        .list_documents(company_id, query.top.unwrap_or(DEFAULT_DOCUMENT_LIMIT))
        .await?;
    Ok(Json(
        hits.into_iter()
            .map(|hit| IndexDocument {
                id: hit.id,
                content: hit.content,
            })
            .collect(),
    ))
}

#[utoipa::path(
    get,
    path = "/api/v1/rag/files/{company_id}",
    params(("company_id" = Uuid, Path, description = "Company identifier")),
    responses((status = 200, description = "Uploaded files", body = [FileItem])),
    tag = "rag"
)]
pub async fn list_files(
    State(state): State<AppState>,
    ApiPath(company_id): ApiPath<Uuid>,
) -> Result<Json<Vec<FileItem>>, ApiError> {
    let db = tenant_db(&state, company_id).await?;
    let files = CsvFileRepository::new(&db).list(company_id).await?;
    Ok(Json(
        files
            .into_iter()
            .map(|file| FileItem {
                id: file.id,
                blob_url: file.blob_url,
                status: file.status,
            })
            .collect(),
    ))
}

#[utoipa::path(
    delete,
    path = "/api/v1/rag/documents/{document_id}",
    params(
        ("document_id" = String, Path, description = "Index document key"),
        CompanyQuery
    ),
    responses((status = 200, description = "Document deleted", body = StatusMessage)),
    security(("bearer_auth" = [])),
    tag = "rag"
)]
pub async fn delete_document(
    State(state): State<AppState>,
    _user: CurrentUser,
    ApiPath(document_id): ApiPath<String>,
    ApiQuery(query): ApiQuery<CompanyQuery>,
) -> Result<Json<StatusMessage>, ApiError> {
    state
        .rag
        .delete_document(query.company_id, &document_id)
        .await?;
    tracing::info!(company_id = %query.company_id, document_id, "Index document deleted");
    Ok(Json(StatusMessage::success("Document deleted successfully")))
}

#[utoipa::path(
    get,
    path = "/api/v1/rag/prompt/{company_id}",
    params(("company_id" = Uuid, Path, description = "Company identifier")),
    responses((status = 200, description = "Prompt template", body = PromptStatusResponse)),
    tag = "rag"
)]
pub async fn get_prompt(
    State(state): State<AppState>,
    ApiPath(company_id): ApiPath<Uuid>,
) -> Result<Json<PromptStatusResponse>, ApiError> {
    let db = tenant_db(&state, company_id).await?;
    let prompt = company_service::prompt_template(&db, company_id).await?;
    Ok(Json(PromptStatusResponse {
        status: "success".to_string(),
        prompt,
    }))
}

/// Body form of the prompt update
#[utoipa::path(
    post,
    path = "/api/v1/rag/prompt",
    request_body = PromptRequest,
    responses((status = 200, description = "Prompt template updated", body = StatusMessage)),
    tag = "rag"
)]
pub async fn post_prompt(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<PromptRequest>,
) -> Result<Json<StatusMessage>, ApiError> {
    let db = tenant_db(&state, request.company_id).await?;
    company_service::set_prompt_template(&db, request.company_id, &request.prompt).await?;
    Ok(Json(StatusMessage::success("システムプロンプトを更新しました")))
}

#[utoipa::path(
    put,
    path = "/api/v1/rag/prompt/{company_id}",
    params(("company_id" = Uuid, Path, description = "Company identifier")),
    request_body = PromptUpdateRequest,
    responses((status = 200, description = "Prompt template updated", body = StatusMessage)),
    tag = "rag"
)]
pub async fn set_prompt(
    State(state): State<AppState>,
    ApiPath(company_id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<PromptUpdateRequest>,
) -> Result<Json<StatusMessage>, ApiError> {
    let db = tenant_db(&state, company_id).await?;
    company_service::set_prompt_template(&db, company_id, &request.prompt).await?;
    Ok(Json(StatusMessage::success("システムプロンプトを更新しました")))
}

#[utoipa::path(
    delete,
    path = "/api/v1/rag/prompt/{company_id}",
    params(("company_id" = Uuid, Path, description = "Company identifier")),
    responses((status = 200, description = "Prompt template reset", body = StatusMessage)),
    tag = "rag"
)]
pub async fn reset_prompt(
    State(state): State<AppState>,
    ApiPath(company_id): ApiPath<Uuid>,
) -> Result<Json<StatusMessage>, ApiError> {
    let db = tenant_db(&state, company_id).await?;
    company_service::set_prompt_template(&db, company_id, "").await?;
    Ok(Json(StatusMessage::success(
        "システムプロンプトをデフォルトに戻しました",
    )))
}
