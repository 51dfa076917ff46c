//! Retrieval-augmented answering over per-company vector indexes.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use super::chunking::{chunk_conversation, parse_csv};
use crate::clients::{
    BlobStore, ChatMessage, ChatRequest, LanguageModel, SearchDocument, SearchHit, VectorIndex,
};
use crate::error::{ApiError, ErrorCode, invalid_request, not_found};
use crate::repositories::{CompanyRepository, CsvFileRepository};

const FAQ_SYSTEM_PROMPT: &str = "あなたはFAQチャットボットです。以下の情報を元に、可能な範囲で正確に質問に回答してください。\n\
部分的にでも情報があれば、それに基づいて回答してください。\n\
コンテクストは「タイムスタンプ」「ユーザーId」「ユーザー名」「チャンネル」「メッセージ」「添付ファイル」の順番で表示されます。";

/// A retrieved document as returned to callers.
#[derive(Debug, Clone, Serialize, ToSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceDocument {
    pub document_id: String,
    pub relevance_score: f64,
    pub content_snippet: String,
}

impl From<SearchHit> for SourceDocument {
    fn from(hit: SearchHit) -> Self {
        Self {
            document_id: hit.id,
            relevance_score: hit.score,
            content_snippet: hit.content,
        }
    }
}

/// Result of [`RagService::query_index`].
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RagAnswer {
    pub answer: String,
    pub scores: Vec<f64>,
    pub source_documents: Vec<SourceDocument>,
    pub expanded_query: String,
}

pub struct RagService {
    llm: Arc<dyn LanguageModel>,
    index: Arc<dyn VectorIndex>,
    blob: Arc<dyn BlobStore>,
    base_index: String,
}

impl RagService {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        index: Arc<dyn VectorIndex>,
        blob: Arc<dyn BlobStore>,
        base_index: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            index,
            blob,
            base_index: base_index.into(),
        }
    }

    /// `{base}-{company_id}` with the id lowercased.
    pub fn index_name(&self, company_id: Uuid) -> String {
        format!("{}-{}", self.base_index, company_id.to_string().to_lowercase())
    }

    /// Chunks, embeds and uploads one CSV file. Returns the number of documents.
    pub async fn build_index(
        &self,
        db: &DatabaseConnection,
        company_id: Uuid,
        file_id: Uuid,
    ) -> Result<usize, ApiError> {
        let file = CsvFileRepository::new(db).find(file_id).await?.ok_or_else(|| {
            not_found(format!("CSV file record not found for file_id: {}", file_id))
        })?;
        let data = self.download(&file.blob_url).await?;
        self.index_file(db, company_id, file_id, &data).await
    }

    /// Indexes a CSV blob by URL. A blob with no file record is registered
    /// as an uploaded file first so it shows up in the company's file list.
    pub async fn build_index_from_blob(
        &self,
        db: &DatabaseConnection,
        company_id: Uuid,
        blob_url: &str,
    ) -> Result<usize, ApiError> {
        if blob_url.trim().is_empty() {
            return Err(invalid_request("blob_url must not be empty"));
        }
        let files = CsvFileRepository::new(db);
        if let Some(file) = files.find_by_url(company_id, blob_url).await? {
            return self.build_index(db, company_id, file.id).await;
        }

        let data = self.download(blob_url).await?;
        let file = files
            .create(
                company_id,
                &blob_file_name(blob_url),
                data.len() as i64,
                blob_url,
                Utc::now(),
            )
            .await?;
        tracing::info!(file_id = %file.id, blob_url, "Registered blob for indexing");
        self.index_file(db, company_id, file.id, &data).await
    }

    async fn download(&self, blob_url: &str) -> Result<Vec<u8>, ApiError> {
        self.blob.download(blob_url).await.map_err(|e| {
            ApiError::new(
                ErrorCode::InternalServerError,
                format!("Failed to download CSV from blob: {}", e),
            )
        })
    }

    async fn index_file(
        &self,
        db: &DatabaseConnection,
        company_id: Uuid,
        file_id: Uuid,
        data: &[u8],
    ) -> Result<usize, ApiError> {
        let rows = parse_csv(data).map_err(|e| {
            ApiError::new(
                ErrorCode::InternalServerError,
                format!("Failed to preprocess and chunk data: {}", e),
            )
        })?;
        let chunks = chunk_conversation(&rows);
        tracing::info!(%file_id, rows = rows.len(), chunks = chunks.len(), "Chunked CSV file");

        let vectors = self.llm.embed(&chunks).await?;
        let index = self.index_name(company_id);
        self.index.ensure_index(&index).await?;

        let documents: Vec<SearchDocument> = chunks
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (content, content_vector))| SearchDocument {
                id: format!("{}_{}", file_id, i),
                content,
                content_vector,
            })
            .collect();
        let count = documents.len();
        self.index.upload_documents(&index, documents).await?;

        if let Err(e) = CsvFileRepository::new(db).mark_indexed(file_id).await {
            tracing::error!(%file_id, error = %e, "Failed to update CSV file status");
        }
        tracing::info!(%file_id, index, count, "Indexed CSV file");
        Ok(count)
    }

    /// Rewrites a short query into a search-friendly sentence. Falls back to the input.
    pub async fn expand_query(&self, query: &str) -> String {
        let prompt = format!(
            "以下の短いクエリを、類義語や関連するキーワードを含めて検索に適した自然な文章に書き換えてください。\n\nクエリ: \"{}\"\n\n書き換え後のクエリ:",
            query
        );
        let request = ChatRequest::new(vec![ChatMessage::user(prompt)])
            .max_tokens(50)
            .temperature(0.2);
        match self.llm.chat(request).await {
            Ok(expanded) if !expanded.is_empty() => {
                tracing::debug!(query, expanded, "Expanded query");
                expanded
            }
            Ok(_) => query.to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "Query expansion failed; using original query");
                query.to_string()
            }
        }
    }

    async fn rerank(&self, query: &str, documents: &[SourceDocument]) -> Vec<(f64, String)> {
        let mut scored = Vec::with_capacity(documents.len());
        for doc in documents {
            let prompt = format!(
                "以下のドキュメントが、質問に回答するためにどの程度役に立つかを1〜10で評価してください。\n\n質問: {}\n\nドキュメント:\n{}\n\n評価 (数値のみ):",
                query, doc.content_snippet
            );
            let request = ChatRequest::new(vec![ChatMessage::user(prompt)])
                .max_tokens(3)
                .temperature(0.0);
            let score = match self.llm.chat(request).await {
                Ok(text) => parse_score(&text),
                Err(e) => {
                    tracing::warn!(document = %doc.document_id, error = %e, "Rerank failed");
                    0.0
                }
            };
            scored.push((score, doc.content_snippet.clone()));
        }
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored
    }

    /// Answers `query` from the company's index.
    pub async fn query_index(
        &self,
        db: &DatabaseConnection,
        company_id: Uuid,
        query: &str,
        top_k: usize,
    ) -> Result<RagAnswer, ApiError> {
        let mut vectors = self.llm.embed(&[query.to_string()]).await?;
        let vector = vectors.pop().ok_or_else(|| {
            ApiError::new(ErrorCode::InternalServerError, "Failed to create embedding")
        })?;

        let index = self.index_name(company_id);
        let hits = self.index.vector_search(&index, vector, top_k).await?;
        let source_documents: Vec<SourceDocument> =
            hits.into_iter().map(SourceDocument::from).collect();
        tracing::info!(index, hits = source_documents.len(), "Vector search completed");

        let reranked = self.rerank(query, &source_documents).await;
        let context = reranked
            .into_iter()
            .map(|(_, snippet)| snippet)
            .collect::<Vec<_>>()
            .join("\n");

        let prompt_template = CompanyRepository::new(db)
            .find(company_id)
            .await?
            .map(|c| c.prompt_template)
            .unwrap_or_default();

        let answer = self
            .llm
            .chat(ChatRequest::new(vec![
                ChatMessage::system(FAQ_SYSTEM_PROMPT),
                ChatMessage::system(prompt_template),
                ChatMessage::system(context),
                ChatMessage::user(query),
            ]))
            .await?;

        Ok(RagAnswer {
            answer,
            scores: source_documents.iter().map(|d| d.relevance_score).collect(),
            source_documents,
            expanded_query: query.to_string(),
        })
    }

    /// Drops the company index and returns every file to `uploaded`.
    pub async fn delete_index(
        &self,
        db: &DatabaseConnection,
        company_id: Uuid,
    ) -> Result<(), ApiError> {
        let index = self.index_name(company_id);
        self.index.delete_index(&index).await.map_err(|e| {
            ApiError::new(
                ErrorCode::InternalServerError,
                format!("Failed to delete index '{}' from Azure AI Search", index),
            )
            .with_details(serde_json::json!({ "error": e.to_string() }))
        })?;
        let reset = CsvFileRepository::new(db).reset_all().await?;
        tracing::info!(index, reset, "Deleted company index");
        Ok(())
    }

    pub async fn list_documents(
        &self,
        company_id: Uuid,
        top: usize,
    ) -> Result<Vec<SearchHit>, ApiError> {
        Ok(self
            .index
            .list_documents(&self.index_name(company_id), top)
            .await?)
    }

    pub async fn delete_document(&self, company_id: Uuid, document_id: &str) -> Result<(), ApiError> {
        self.index
            .delete_document(&self.index_name(company_id), document_id)
            .await?;
        Ok(())
    }
}

/// Reads a 1-10 rating; anything unparsable scores 0.
fn parse_score(text: &str) -> f64 {
    text.trim().parse::<f64>().unwrap_or(0.0)
}

/// Last path segment of a blob URL, query string excluded.
fn blob_file_name(blob_url: &str) -> String {
    let path = blob_url.split(['?', '#']).next().unwrap_or(blob_url);
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(path)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rerank_scores_default_to_zero() {
        assert_eq!(parse_score(" 8 "), 8.0);
        assert_eq!(parse_score("7.5"), 7.5);
        assert_eq!(parse_score("とても良い"), 0.0);
    }

    #[test]
    fn blob_file_name_drops_query_and_path() {
        assert_eq!(
            blob_file_name("https://acct.blob.core.windows.net/data/acme/slack.csv?sv=1"),
            "slack.csv"
        );
        assert_eq!(blob_file_name("acme/export.csv/"), "export.csv");
    }
}
