//! Azure AI Search vector index operations.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{ClientError, check_status, trim_base};
use crate::config::SearchConfig;

const SERVICE: &str = "azure-search";
const UPLOAD_BATCH: usize = 1000;

pub const VECTOR_DIMENSIONS: usize = 1536;
pub const VECTOR_PROFILE: &str = "my-vector-profile";
pub const VECTOR_ALGORITHM: &str = "my-vector-algorithm";

/// Document stored in a company index.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchDocument {
    pub id: String,
    pub content: String,
    #[serde(rename = "contentVector")]
    pub content_vector: Vec<f32>,
}

/// A search result (or listed document).
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SearchHit {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "@search.score", default)]
    pub score: f64,
}

#[derive(Deserialize)]
struct SearchResponse {
    value: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct IndexList {
    value: Vec<IndexName>,
}

#[derive(Deserialize)]
struct IndexName {
    name: String,
}

/// Vector index used for retrieval.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Creates the index with the content/vector schema unless it exists.
    async fn ensure_index(&self, index: &str) -> Result<(), ClientError>;
    async fn upload_documents(
        &self,
        index: &str,
        documents: Vec<SearchDocument>,
    ) -> Result<(), ClientError>;
    async fn vector_search(
        &self,
        index: &str,
        vector: Vec<f32>,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, ClientError>;
    async fn list_documents(&self, index: &str, top: usize) -> Result<Vec<SearchHit>, ClientError>;
    async fn delete_document(&self, index: &str, id: &str) -> Result<(), ClientError>;
    /// Deletes the index. A missing index is not an error.
    async fn delete_index(&self, index: &str) -> Result<(), ClientError>;
    async fn list_indexes(&self) -> Result<Vec<String>, ClientError>;
}

/// Index definition: string key, searchable content and an HNSW cosine vector field.
pub fn index_schema(name: &str) -> Value {
    json!({
        "name": name,
        "fields": [
            { "name": "id", "type": "Edm.String", "key": true },
            {
                "name": "content",
                "type": "Edm.String",
                "searchable": true,
                "filterable": true,
                "sortable": true,
                "facetable": true
            },
            {
                "name": "contentVector",
                "type": "Collection(Edm.Single)",
                "searchable": true,
                "dimensions": VECTOR_DIMENSIONS,
                "vectorSearchProfile": VECTOR_PROFILE
            }
        ],
        "vectorSearch": {
            "algorithms": [{
                "name": VECTOR_ALGORITHM,
                "kind": "hnsw",
                "hnswParameters": {
                    "m": 4,
                    "efConstruction": 400,
                    "efSearch": 500,
                    "metric": "cosine"
                }
            }],
            "profiles": [{ "name": VECTOR_PROFILE, "algorithm": VECTOR_ALGORITHM }]
        }
    })
}

/// [`VectorIndex`] backed by the Azure AI Search REST API.
pub struct AzureSearch {
    http: Client,
    config: SearchConfig,
}

impl AzureSearch {
    pub fn new(http: Client, config: SearchConfig) -> Self {
        Self { http, config }
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ClientError> {
        let key = self
            .config
            .admin_key
            .as_deref()
            .ok_or_else(|| ClientError::NotConfigured("search admin key".to_string()))?;
        Ok(self
            .http
            .request(
                method,
                format!("{}{}", trim_base(&self.config.endpoint), path),
            )
            .query(&[("api-version", self.config.api_version.as_str())])
            .header("api-key", key))
    }

    async fn search(&self, index: &str, body: Value) -> Result<Vec<SearchHit>, ClientError> {
        let response = self
            .request(Method::POST, &format!("/indexes/{}/docs/search", index))?
            .json(&body)
            .send()
            .await?;
        let parsed: SearchResponse = check_status(SERVICE, response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::malformed(SERVICE, e))?;
        Ok(parsed.value)
    }
}

#[async_trait]
impl VectorIndex for AzureSearch {
    async fn ensure_index(&self, index: &str) -> Result<(), ClientError> {
        let response = self
            .request(Method::GET, &format!("/indexes/{}", index))?
            .send()
            .await?;
        if response.status() != StatusCode::NOT_FOUND {
            check_status(SERVICE, response).await?;
            return Ok(());
        }

        tracing::info!(index, "Creating search index");
        let response = self
            .request(Method::PUT, &format!("/indexes/{}", index))?
            .json(&index_schema(index))
            .send()
            .await?;
        check_status(SERVICE, response).await?;
        Ok(())
    }

    async fn upload_documents(
        &self,
        index: &str,
        documents: Vec<SearchDocument>,
    ) -> Result<(), ClientError> {
        for batch in documents.chunks(UPLOAD_BATCH) {
            let actions: Vec<Value> = batch
                .iter()
                .map(|doc| {
                    json!({
                        "@search.action": "upload",
                        "id": doc.id,
                        "content": doc.content,
                        "contentVector": doc.content_vector,
                    })
                })
                .collect();

            let response = self
                .request(Method::POST, &format!("/indexes/{}/docs/index", index))?
                .json(&json!({ "value": actions }))
                .send()
                .await?;
            check_status(SERVICE, response).await?;
        }
        Ok(())
    }

    async fn vector_search(
        &self,
        index: &str,
        vector: Vec<f32>,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, ClientError> {
        self.search(
            index,
            json!({
                "vectorQueries": [{
                    "kind": "vector",
                    "vector": vector,
                    "k": top_k,
                    "fields": "contentVector"
                }],
                "select": "id,content",
                "top": top_k
            }),
        )
        .await
    }

    async fn list_documents(&self, index: &str, top: usize) -> Result<Vec<SearchHit>, ClientError> {
        self.search(
            index,
            json!({ "search": "*", "select": "id,content", "top": top }),
        )
        .await
    }

    async fn delete_document(&self, index: &str, id: &str) -> Result<(), ClientError> {
        let response = self
            .request(Method::POST, &format!("/indexes/{}/docs/index", index))?
            .json(&json!({ "value": [{ "@search.action": "delete", "id": id }] }))
            .send()
            .await?;
        check_status(SERVICE, response).await?;
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<(), ClientError> {
        let response = self
            .request(Method::DELETE, &format!("/indexes/{}", index))?
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::warn!(index, "Search index did not exist");
            return Ok(());
        }
        check_status(SERVICE, response).await?;
        Ok(())
    }

    async fn list_indexes(&self) -> Result<Vec<String>, ClientError> {
        let response = self
            .request(Method::GET, "/indexes")?
            .query(&[("$select", "name")])
            .send()
            .await?;
        let list: IndexList = check_status(SERVICE, response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::malformed(SERVICE, e))?;
        Ok(list.value.into_iter().map(|i| i.name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> AzureSearch {
        AzureSearch::new(
            Client::new(),
            SearchConfig {
                endpoint: server.uri(),
                admin_key: Some("admin".to_string()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn schema_has_hnsw_cosine_profile() {
        let schema = index_schema("idx");
        assert_eq!(schema["fields"][2]["dimensions"], 1536);
        assert_eq!(
            schema["vectorSearch"]["algorithms"][0]["hnswParameters"]["metric"],
            "cosine"
        );
        assert_eq!(schema["vectorSearch"]["profiles"][0]["name"], VECTOR_PROFILE);
    }

    #[tokio::test]
    async fn ensure_index_creates_missing_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/indexes/inthub-c1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/indexes/inthub-c1"))
            .and(header("api-key", "admin"))
            .and(body_partial_json(json!({ "name": "inthub-c1" })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).ensure_index("inthub-c1").await.unwrap();
    }

    #[tokio::test]
    async fn ensure_index_skips_existing_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/indexes/inthub-c1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "inthub-c1" })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        client(&server).ensure_index("inthub-c1").await.unwrap();
    }

    #[tokio::test]
    async fn vector_search_parses_scores() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/indexes/idx/docs/search"))
            .and(body_partial_json(json!({ "top": 2 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    { "@search.score": 0.91, "id": "f_0", "content": "alpha" },
                    { "@search.score": 0.42, "id": "f_1", "content": "beta" }
                ]
            })))
            .mount(&server)
            .await;

        let hits = client(&server)
            .vector_search("idx", vec![0.1, 0.2], 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "f_0");
        assert!((hits[0].score - 0.91).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn deleting_missing_index_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/indexes/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        client(&server).delete_index("gone").await.unwrap();
    }
}
