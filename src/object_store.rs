//! Object store adapter: the cold tier.
//!
//! All blobs for a document live under a single `{uuid}/` prefix:
//!
//! ```text
//! {uuid}/original            — original uploaded bytes
//! {uuid}/extracted.txt       — normalized extracted text
//! {uuid}/chunks/NNN.json     — one per chunk: {text, index, metadata?}
//! {uuid}/bm25_doc_index.json — term-frequency map
//! ```
//!
//! Two backends implement [`ObjectStore`]:
//! - **[`S3Store`]** — the S3 REST API with AWS Signature V4 authentication,
//!   using only pure-Rust crypto (`hmac`, `sha2`). Custom endpoints support
//!   S3-compatible services (MinIO, LocalStack). Credentials come from
//!   `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`.
//! - **[`LocalStore`]** — a directory tree, for development and tests.
//!
//! Writes are idempotent at a given path. The ingestion orchestrator issues
//! all uploads for a document concurrently and commits the vector-store row
//! only after every blob landed.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ObjectStoreConfig;
use crate::error::{RagError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Blob storage under UUID-addressed prefixes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write a blob. Overwrites silently (idempotent at a path).
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;
    /// Read a blob. Missing paths are `NotFound`.
    async fn get(&self, path: &str) -> Result<Vec<u8>>;
    /// List every object path under a prefix.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;
    /// Delete every object under a prefix. Returns the number removed;
    /// individual failures are logged and skipped.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}

/// Construct the configured backend.
pub fn create_store(config: &ObjectStoreConfig) -> Result<Arc<dyn ObjectStore>> {
    match config.provider.as_str() {
        "local" => {
            let root = config.root.clone().ok_or_else(|| {
                RagError::Internal("object_store.root required for local provider".to_string())
            })?;
            Ok(Arc::new(LocalStore::new(root)))
        }
        "s3" => {
            let bucket = config.bucket.clone().ok_or_else(|| {
                RagError::Internal("object_store.bucket required for s3 provider".to_string())
            })?;
            Ok(Arc::new(S3Store::new(
                bucket,
                config.region.clone(),
                config.endpoint_url.clone(),
            )))
        }
        other => Err(RagError::Internal(format!(
            "Unknown object store provider: {}",
            other
        ))),
    }
}

// ============ Blob paths ============

pub fn original_path(uuid: &str) -> String {
    format!("{}/original", uuid)
}

pub fn extracted_path(uuid: &str) -> String {
    format!("{}/extracted.txt", uuid)
}

pub fn chunk_path(uuid: &str, index: usize) -> String {
    format!("{}/chunks/{:03}.json", uuid, index)
}

pub fn bm25_path(uuid: &str) -> String {
    format!("{}/bm25_doc_index.json", uuid)
}

// ============ Local directory backend ============

/// Directory-tree backend. Object paths map directly to files under `root`.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, _content_type: &str) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RagError::ObjectStore(e.to_string()))?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .map_err(|e| RagError::ObjectStore(e.to_string()))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path);
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RagError::NotFound(format!("object not found: {}", path)))
            }
            Err(e) => Err(RagError::ObjectStore(e.to_string())),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.resolve(prefix);
        let mut found = Vec::new();
        let mut pending = vec![base];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(RagError::ObjectStore(e.to_string())),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| RagError::ObjectStore(e.to_string()))?
            {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    found.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }

        found.sort();
        Ok(found)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let count = self.list_prefix(prefix).await?.len();
        if count == 0 {
            return Ok(0);
        }
        let base = self.resolve(prefix);
        match tokio::fs::remove_dir_all(&base).await {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(RagError::ObjectStore(e.to_string())),
        }
    }
}

// ============ S3 backend ============

/// S3 REST backend with AWS SigV4 signing.
pub struct S3Store {
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
    client: reqwest::Client,
}

/// AWS credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").map_err(|_| {
            RagError::ObjectStore("AWS_ACCESS_KEY_ID environment variable not set".to_string())
        })?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            RagError::ObjectStore("AWS_SECRET_ACCESS_KEY environment variable not set".to_string())
        })?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

impl S3Store {
    pub fn new(bucket: String, region: String, endpoint_url: Option<String>) -> Self {
        Self {
            bucket,
            region,
            endpoint_url,
            client: reqwest::Client::new(),
        }
    }

    /// Hostname for the bucket: a custom endpoint when configured, the
    /// standard virtual-hosted S3 hostname otherwise.
    fn host(&self) -> String {
        if let Some(ref endpoint) = self.endpoint_url {
            endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string()
        } else {
            format!("{}.s3.{}.amazonaws.com", self.bucket, self.region)
        }
    }

    fn scheme(&self) -> &'static str {
        match self.endpoint_url {
            Some(ref endpoint) if endpoint.starts_with("http://") => "http",
            _ => "https",
        }
    }

    /// Sign and send one S3 request.
    async fn signed_request(
        &self,
        method: &str,
        key: &str,
        query: &[(String, String)],
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<reqwest::Response> {
        let creds = AwsCredentials::from_env()?;
        let host = self.host();

        let canonical_uri = if key.is_empty() {
            "/".to_string()
        } else {
            format!(
                "/{}",
                key.split('/').map(sigv4_encode).collect::<Vec<_>>().join("/")
            )
        };

        let mut sorted_query = query.to_vec();
        sorted_query.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring: String = sorted_query
            .iter()
            .map(|(k, v)| format!("{}={}", sigv4_encode(k), sigv4_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let now = chrono::Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = sha256_hex(&body);

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, canonical_uri, canonical_querystring, canonical_headers, signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let signing_key =
            derive_signing_key(&creds.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}://{}{}", self.scheme(), host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut req = match method {
            "GET" => self.client.get(&url),
            "PUT" => self.client.put(&url),
            "DELETE" => self.client.delete(&url),
            other => {
                return Err(RagError::Internal(format!(
                    "unsupported S3 method: {}",
                    other
                )))
            }
        };

        req = req
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ref token) = creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        if let Some(ct) = content_type {
            req = req.header("Content-Type", ct);
        }
        if method == "PUT" {
            req = req.body(body);
        }

        req.send()
            .await
            .map_err(|e| RagError::ObjectStore(format!("S3 request failed: {}", e)))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
                ("prefix".to_string(), prefix.to_string()),
            ];
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self.signed_request("GET", "", &query, Vec::new(), None).await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(RagError::ObjectStore(format!(
                    "S3 ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                )));
            }

            let xml = resp
                .text()
                .await
                .map_err(|e| RagError::ObjectStore(e.to_string()))?;
            let (batch, next_token) = parse_list_response(&xml);
            keys.extend(batch);

            match next_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        Ok(keys)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let resp = self
            .signed_request("PUT", path, &[], bytes, Some(content_type))
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(RagError::ObjectStore(format!(
                "S3 PutObject failed (HTTP {}) for key '{}'",
                status, path
            )));
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let resp = self.signed_request("GET", path, &[], Vec::new(), None).await?;
        let status = resp.status();

        if status.as_u16() == 404 {
            return Err(RagError::NotFound(format!("object not found: {}", path)));
        }
        if !status.is_success() {
            return Err(RagError::ObjectStore(format!(
                "S3 GetObject failed (HTTP {}) for key '{}'",
                status, path
            )));
        }

        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| RagError::ObjectStore(e.to_string()))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.list_keys(prefix).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list_keys(prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let deletions = keys.iter().map(|key| async move {
            let resp = self
                .signed_request("DELETE", key, &[], Vec::new(), None)
                .await?;
            if resp.status().is_success() || resp.status().as_u16() == 404 {
                Ok(())
            } else {
                Err(RagError::ObjectStore(format!(
                    "S3 DeleteObject failed (HTTP {}) for key '{}'",
                    resp.status(),
                    key
                )))
            }
        });

        let results = futures::future::join_all(deletions).await;
        let mut deleted = 0usize;
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(()) => deleted += 1,
                Err(e) => tracing::warn!(key = %key, error = %e, "failed to delete object"),
            }
        }
        Ok(deleted)
    }
}

// ============ SigV4 helpers ============

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("any key length is a valid HMAC key");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// SigV4 signing key: the secret (prefixed `AWS4`) is folded through one
/// HMAC round per scope component, ending with the fixed `aws4_request`
/// terminator.
fn derive_signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let seed = format!("AWS4{}", secret).into_bytes();
    [date_stamp, region, service, "aws4_request"]
        .iter()
        .fold(seed, |key, component| hmac_sha256(&key, component.as_bytes()))
}

/// Percent-encode one path or query component for the canonical request.
/// Only RFC 3986 unreserved characters pass through unescaped.
fn sigv4_encode(component: &str) -> String {
    component
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            other => format!("%{:02X}", other),
        })
        .collect()
}

/// Pull the object keys and the pagination token out of a `ListObjectsV2`
/// XML response. Returns `None` for the token when the listing is complete.
/// Directory placeholder keys (trailing `/`) are skipped.
fn parse_list_response(xml: &str) -> (Vec<String>, Option<String>) {
    let keys = xml
        .split("<Contents>")
        .skip(1)
        .filter_map(|section| {
            let block = section.split("</Contents>").next()?;
            let key = xml_tag_value(block, "Key")?;
            (!key.is_empty() && !key.ends_with('/')).then_some(key)
        })
        .collect();

    let truncated = xml_tag_value(xml, "IsTruncated").as_deref() == Some("true");
    let next_token = truncated
        .then(|| xml_tag_value(xml, "NextContinuationToken"))
        .flatten();

    (keys, next_token)
}

/// Text content of a flat (non-nested, attribute-free) XML tag.
fn xml_tag_value(xml: &str, tag: &str) -> Option<String> {
    let after_open = xml.split(&format!("<{}>", tag)).nth(1)?;
    let value = after_open.split(&format!("</{}>", tag)).next()?;
    Some(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn local_store() -> (tempfile::TempDir, LocalStore) {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path().to_path_buf());
        (tmp, store)
    }

    #[tokio::test]
    async fn local_put_get_roundtrip() {
        let (_tmp, store) = local_store().await;
        store
            .put("u1/original", b"raw bytes".to_vec(), "application/pdf")
            .await
            .unwrap();
        let bytes = store.get("u1/original").await.unwrap();
        assert_eq!(bytes, b"raw bytes");
    }

    #[tokio::test]
    async fn local_get_missing_is_not_found() {
        let (_tmp, store) = local_store().await;
        let err = store.get("nope/original").await.unwrap_err();
        assert!(matches!(err, RagError::NotFound(_)));
    }

    #[tokio::test]
    async fn local_put_is_idempotent_at_a_path() {
        let (_tmp, store) = local_store().await;
        store.put("u1/x", b"one".to_vec(), "text/plain").await.unwrap();
        store.put("u1/x", b"two".to_vec(), "text/plain").await.unwrap();
        assert_eq!(store.get("u1/x").await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn local_list_prefix_returns_all_objects() {
        let (_tmp, store) = local_store().await;
        store.put("u1/original", b"a".to_vec(), "x").await.unwrap();
        store.put("u1/extracted.txt", b"b".to_vec(), "x").await.unwrap();
        store.put("u1/chunks/000.json", b"c".to_vec(), "x").await.unwrap();
        store.put("u2/original", b"d".to_vec(), "x").await.unwrap();

        let listed = store.list_prefix("u1/").await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.contains(&"u1/chunks/000.json".to_string()));
        assert!(!listed.iter().any(|p| p.starts_with("u2/")));
    }

    #[tokio::test]
    async fn local_delete_prefix_removes_everything() {
        let (_tmp, store) = local_store().await;
        store.put("u1/original", b"a".to_vec(), "x").await.unwrap();
        store.put("u1/chunks/000.json", b"b".to_vec(), "x").await.unwrap();
        store.put("u2/original", b"keep".to_vec(), "x").await.unwrap();

        let deleted = store.delete_prefix("u1/").await.unwrap();
        assert_eq!(deleted, 2);
        assert!(store.list_prefix("u1/").await.unwrap().is_empty());
        assert!(store.get("u2/original").await.is_ok());

        // Deleting an absent prefix is a no-op.
        assert_eq!(store.delete_prefix("u1/").await.unwrap(), 0);
    }

    #[test]
    fn chunk_paths_are_zero_padded() {
        assert_eq!(chunk_path("u", 0), "u/chunks/000.json");
        assert_eq!(chunk_path("u", 42), "u/chunks/042.json");
        assert_eq!(chunk_path("u", 1234), "u/chunks/1234.json");
    }

    #[test]
    fn blob_paths_share_the_uuid_prefix() {
        assert_eq!(original_path("u"), "u/original");
        assert_eq!(extracted_path("u"), "u/extracted.txt");
        assert_eq!(bm25_path("u"), "u/bm25_doc_index.json");
    }

    #[test]
    fn sigv4_signing_key_matches_aws_test_vector() {
        // Example from the AWS SigV4 documentation.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20150830",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(&key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn sigv4_encoding_preserves_unreserved_characters() {
        assert_eq!(sigv4_encode("abc-123_~.X"), "abc-123_~.X");
        assert_eq!(sigv4_encode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn list_response_parsing() {
        let xml = r#"<ListBucketResult>
            <IsTruncated>true</IsTruncated>
            <NextContinuationToken>tok123</NextContinuationToken>
            <Contents><Key>u1/original</Key></Contents>
            <Contents><Key>u1/chunks/000.json</Key></Contents>
            <Contents><Key>u1/folder/</Key></Contents>
        </ListBucketResult>"#;

        let (keys, token) = parse_list_response(xml);
        assert_eq!(keys, vec!["u1/original", "u1/chunks/000.json"]);
        assert_eq!(token.as_deref(), Some("tok123"));
    }

    #[test]
    fn list_response_without_truncation_has_no_token() {
        let xml = r#"<ListBucketResult>
            <IsTruncated>false</IsTruncated>
            <Contents><Key>u1/original</Key></Contents>
        </ListBucketResult>"#;

        let (keys, token) = parse_list_response(xml);
        assert_eq!(keys, vec!["u1/original"]);
        assert!(token.is_none());
    }
}
