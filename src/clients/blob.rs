//! Azure Blob Storage over the REST API with Shared Key authorization.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use regex::Regex;
use reqwest::{Client, Method, RequestBuilder};
use sha2::Sha256;
use std::sync::LazyLock;

use super::{ClientError, check_status, trim_base};
use crate::config::StorageConfig;

const SERVICE: &str = "blob-storage";
const API_VERSION: &str = "2021-08-06";

static BLOB_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Blob>(.*?)</Blob>").expect("valid regex"));
static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<Name>(.*?)</Name>").expect("valid regex"));
static LENGTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<Content-Length>(\d+)</Content-Length>").expect("valid regex")
});
static CREATED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<Creation-Time>(.*?)</Creation-Time>").expect("valid regex")
});
static NEXT_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<NextMarker>(.*?)</NextMarker>").expect("valid regex"));

/// One entry from a container listing.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobItem {
    pub name: String,
    pub size: i64,
    pub created_at: Option<DateTime<Utc>>,
}

impl BlobItem {
    /// Final path segment of the blob name.
    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// Object storage for uploaded CSV files.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload `data` as `name`, returning the blob URL.
    async fn upload(&self, name: &str, data: Vec<u8>, content_type: &str)
    -> Result<String, ClientError>;
    async fn download(&self, url: &str) -> Result<Vec<u8>, ClientError>;
    async fn delete(&self, url: &str) -> Result<(), ClientError>;
    async fn list(&self, prefix: &str) -> Result<Vec<BlobItem>, ClientError>;
    /// URL a blob named `name` is (or would be) stored at.
    fn url_for(&self, name: &str) -> String;
    async fn ping(&self) -> Result<(), ClientError>;
}

/// [`BlobStore`] backed by an Azure storage account container.
pub struct AzureBlobStore {
    http: Client,
    config: StorageConfig,
}

impl AzureBlobStore {
    pub fn new(http: Client, config: StorageConfig) -> Self {
        Self { http, config }
    }

    fn base(&self) -> String {
        match self.config.endpoint.as_deref() {
            Some(endpoint) => trim_base(endpoint).to_string(),
            None => format!("https://{}.blob.core.windows.net", self.config.account_name),
        }
    }

    fn container_url(&self) -> String {
        format!("{}/{}", self.base(), self.config.container_name)
    }

    /// Encoded blob path (relative to the container) taken from a blob URL.
    fn blob_path<'a>(&self, url: &'a str) -> Result<&'a str, ClientError> {
        let prefix = format!("{}/", self.container_url());
        url.strip_prefix(&prefix)
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| {
                ClientError::malformed(SERVICE, format!("URL '{}' is outside the container", url))
            })
    }

    /// Builds a signed request. `query` values are unencoded.
    fn signed(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        content_type: Option<&str>,
        content_length: usize,
        extra_headers: &[(&str, &str)],
    ) -> Result<RequestBuilder, ClientError> {
        let key = self
            .config
            .account_key
            .as_deref()
            .ok_or_else(|| ClientError::NotConfigured("storage account key".to_string()))?;
        let key = general_purpose::STANDARD
            .decode(key)
            .map_err(|e| ClientError::NotConfigured(format!("storage account key: {}", e)))?;

        let url = url::Url::parse(&format!("{}{}", self.base(), path))
            .map_err(|e| ClientError::malformed(SERVICE, e))?;
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

        let mut ms_headers: Vec<(String, String)> = vec![
            ("x-ms-date".to_string(), date.clone()),
            ("x-ms-version".to_string(), API_VERSION.to_string()),
        ];
        for (name, value) in extra_headers {
            ms_headers.push((name.to_lowercase(), value.to_string()));
        }
        ms_headers.sort();

        let string_to_sign = string_to_sign(
            method.as_str(),
            content_type.unwrap_or(""),
            content_length,
            &ms_headers,
            &self.config.account_name,
            url.path(),
            query,
        );

        let mut mac = Hmac::<Sha256>::new_from_slice(&key)
            .map_err(|e| ClientError::NotConfigured(format!("storage account key: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        let mut request = self
            .http
            .request(method, url)
            .query(query)
            .header(
                "Authorization",
                format!("SharedKey {}:{}", self.config.account_name, signature),
            );
        for (name, value) in &ms_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(content_type) = content_type {
            request = request.header("Content-Type", content_type);
        }
        Ok(request)
    }
}

fn string_to_sign(
    verb: &str,
    content_type: &str,
    content_length: usize,
    ms_headers: &[(String, String)],
    account: &str,
    path: &str,
    query: &[(&str, String)],
) -> String {
    let length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };

    let mut out = format!("{verb}\n\n\n{length}\n\n{content_type}\n\n\n\n\n\n\n");
    for (name, value) in ms_headers {
        out.push_str(&format!("{}:{}\n", name, value));
    }
    out.push_str(&format!("/{}{}", account, path));

    let mut params: Vec<(String, &str)> = query
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.as_str()))
        .collect();
    params.sort();
    for (k, v) in params {
        out.push_str(&format!("\n{}:{}", k, v));
    }
    out
}

fn encode_blob_name(name: &str) -> String {
    let mut url = url::Url::parse("http://blob.invalid/").expect("static url");
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().extend(name.split('/'));
    }
    url.path().trim_start_matches('/').to_string()
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Parses one page of a List Blobs response, returning items and the next marker.
fn parse_listing(xml: &str) -> (Vec<BlobItem>, Option<String>) {
    let items = BLOB_RE
        .captures_iter(xml)
        .filter_map(|blob| {
            let body = blob.get(1)?.as_str();
            let name = xml_unescape(NAME_RE.captures(body)?.get(1)?.as_str());
            let size = LENGTH_RE
                .captures(body)
                .and_then(|c| c.get(1)?.as_str().parse().ok())
                .unwrap_or(0);
            let created_at = CREATED_RE
                .captures(body)
                .and_then(|c| DateTime::parse_from_rfc2822(c.get(1)?.as_str()).ok())
                .map(|dt| dt.with_timezone(&Utc));
            Some(BlobItem {
                name,
                size,
                created_at,
            })
        })
        .collect();

    let marker = NEXT_MARKER_RE
        .captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| xml_unescape(m.as_str()))
        .filter(|m| !m.is_empty());

    (items, marker)
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    async fn upload(
        &self,
        name: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<String, ClientError> {
        let url = self.url_for(name);
        let path = format!("/{}/{}", self.config.container_name, encode_blob_name(name));
        let request = self.signed(
            Method::PUT,
            &path,
            &[],
            Some(content_type),
            data.len(),
            &[("x-ms-blob-type", "BlockBlob")],
        )?;

        let response = request.body(data).send().await?;
        check_status(SERVICE, response).await?;
        tracing::info!(blob = %name, "Uploaded blob");
        Ok(url)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ClientError> {
        let path = format!("/{}/{}", self.config.container_name, self.blob_path(url)?);
        let response = self
            .signed(Method::GET, &path, &[], None, 0, &[])?
            .send()
            .await?;
        let bytes = check_status(SERVICE, response).await?.bytes().await?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, url: &str) -> Result<(), ClientError> {
        let path = format!("/{}/{}", self.config.container_name, self.blob_path(url)?);
        let response = self
            .signed(Method::DELETE, &path, &[], None, 0, &[])?
            .send()
            .await?;
        check_status(SERVICE, response).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobItem>, ClientError> {
        let path = format!("/{}", self.config.container_name);
        let mut items = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut query = vec![
                ("comp", "list".to_string()),
                ("prefix", prefix.to_string()),
                ("restype", "container".to_string()),
            ];
            if let Some(ref m) = marker {
                query.push(("marker", m.clone()));
            }

            let response = self
                .signed(Method::GET, &path, &query, None, 0, &[])?
                .send()
                .await?;
            let body = check_status(SERVICE, response).await?.text().await?;
            let (page, next) = parse_listing(&body);
            items.extend(page);

            match next {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        Ok(items)
    }

    fn url_for(&self, name: &str) -> String {
        format!("{}/{}", self.container_url(), encode_blob_name(name))
    }

    async fn ping(&self) -> Result<(), ClientError> {
        let path = format!("/{}", self.config.container_name);
        let response = self
            .signed(
                Method::GET,
                &path,
                &[("restype", "container".to_string())],
                None,
                0,
                &[],
            )?
            .send()
            .await?;
        check_status(SERVICE, response).await?;
        Ok(())
    }
}
