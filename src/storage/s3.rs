//! S3-compatible object store driver.
//!
//! Talks plain HTTP to any S3-compatible endpoint (AWS, MinIO, Ceph RGW)
//! using SigV4 header signing over reqwest. Multipart uploads map straight
//! onto the native S3 multipart API.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use data_encoding::HEXLOWER;
use futures_util::StreamExt;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use regex::Regex;
use ring::{digest, hmac};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use super::{ByteStream, ObjectMeta, ObjectStore, PartReceipt, StorageError};
use crate::config::StorageConfig;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Everything except unreserved characters must be escaped in canonical URIs.
const URI_ENCODE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'|')
    .add(b'\\')
    .add(b'&')
    .add(b'=')
    .add(b'+')
    .add(b':')
    .add(b'@')
    .add(b'$')
    .add(b',')
    .add(b';')
    .add(b'!')
    .add(b'\'')
    .add(b'(')
    .add(b')')
    .add(b'*');

pub struct S3Store {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .finish()
    }
}

fn hex_sha256(payload: &[u8]) -> String {
    HEXLOWER.encode(digest::digest(&digest::SHA256, payload).as_ref())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data).as_ref().to_vec()
}

impl S3Store {
    pub fn new(config: &StorageConfig) -> Option<Self> {
        match config {
            StorageConfig::S3 {
                endpoint,
                bucket,
                region,
                access_key,
                secret_key,
            } => Some(Self {
                client: reqwest::Client::new(),
                endpoint: endpoint.trim_end_matches('/').to_string(),
                bucket: bucket.clone(),
                region: region.clone(),
                access_key: access_key.clone(),
                secret_key: secret_key.clone(),
            }),
            _ => None,
        }
    }

    fn canonical_uri(&self, key: &str) -> String {
        let mut uri = format!("/{}", self.bucket);
        for segment in key.split('/') {
            uri.push('/');
            uri.push_str(&utf8_percent_encode(segment, URI_ENCODE).to_string());
        }
        uri
    }

    fn host(&self) -> String {
        self.endpoint
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .to_string()
    }

    /// Build the SigV4 Authorization header for one request.
    fn authorization(
        &self,
        method: &str,
        canonical_uri: &str,
        query: &[(String, String)],
        amz_date: &str,
        payload_hash: &str,
    ) -> String {
        let date = &amz_date[0..8];

        let mut sorted = query.to_vec();
        sorted.sort();
        let canonical_query = sorted
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    utf8_percent_encode(k, URI_ENCODE),
                    utf8_percent_encode(v, URI_ENCODE)
                )
            })
            .collect::<Vec<_>>()
            .join("&");

        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            self.host(),
            payload_hash,
            amz_date
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";

        let canonical_request = format!(
            "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );

        let scope = format!("{}/{}/s3/aws4_request", date, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let k_date = hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = HEXLOWER.encode(&hmac_sha256(&k_signing, string_to_sign.as_bytes()));

        format!(
            "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
            self.access_key, scope, signed_headers, signature
        )
    }

    fn request(
        &self,
        method: reqwest::Method,
        key: &str,
        query: &[(String, String)],
        payload_hash: &str,
    ) -> reqwest::RequestBuilder {
        let canonical_uri = self.canonical_uri(key);
        let amz_date = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();

        let authorization = self.authorization(
            method.as_str(),
            &canonical_uri,
            query,
            &amz_date,
            payload_hash,
        );

        let url = format!("{}{}", self.endpoint, canonical_uri);

        self.client
            .request(method, url)
            .query(query)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header("Authorization", authorization)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, StorageError> {
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::Backend(format!("{status}: {body}")));
        }
        Ok(resp)
    }

    async fn collect(mut body: ByteStream) -> Result<Bytes, StorageError> {
        let mut buf = Vec::new();
        while let Some(item) = body.next().await {
            buf.extend_from_slice(&item?);
        }
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn stat(&self, key: &str) -> Result<ObjectMeta, StorageError> {
        let resp = self
            .request(reqwest::Method::HEAD, key, &[], &hex_sha256(b""))
            .send()
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        let resp = Self::check(resp).await?;

        let size = resp
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| StorageError::Backend("missing content-length".to_string()))?;

        Ok(ObjectMeta { size })
    }

    async fn upload(&self, key: &str, body: ByteStream) -> Result<u64, StorageError> {
        // Parts arrive from clients with unknown length, so sign the body as
        // unsigned payload and buffer only to learn the size.
        let payload = Self::collect(body).await?;
        let size = payload.len() as u64;

        let resp = self
            .request(reqwest::Method::PUT, key, &[], UNSIGNED_PAYLOAD)
            .body(payload)
            .send()
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        Self::check(resp).await?;

        Ok(size)
    }

    async fn reader(
        &self,
        key: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, StorageError> {
        let resp = self
            .request(reqwest::Method::GET, key, &[], &hex_sha256(b""))
            .send()
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        let resp = Self::check(resp).await?;

        let stream = resp
            .bytes_stream()
            .map(|item| item.map_err(std::io::Error::other));

        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        // S3 has no rename; server side copy then delete the source.
        let copy_source = self.canonical_uri(from);

        let canonical_uri = self.canonical_uri(to);
        let amz_date = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(b"");

        // x-amz-copy-source participates in signing, so this request cannot
        // reuse the plain request builder.
        let date = &amz_date[0..8];
        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-copy-source:{}\nx-amz-date:{}\n",
            self.host(),
            payload_hash,
            copy_source,
            amz_date
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-copy-source;x-amz-date";
        let canonical_request = format!(
            "PUT\n{canonical_uri}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );
        let scope = format!("{}/{}/s3/aws4_request", date, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let k_date = hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = HEXLOWER.encode(&hmac_sha256(&k_signing, string_to_sign.as_bytes()));
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
            self.access_key, scope, signed_headers, signature
        );

        let url = format!("{}{}", self.endpoint, canonical_uri);
        let resp = self
            .client
            .put(url)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-copy-source", copy_source)
            .header("Authorization", authorization)
            .send()
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        Self::check(resp).await?;

        self.delete(from).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let resp = self
            .request(reqwest::Method::DELETE, key, &[], &hex_sha256(b""))
            .send()
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;

        // DELETE of a missing key is a success in S3; mirror that
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(resp).await?;
        Ok(())
    }

    async fn create_multipart(&self, key: &str) -> Result<String, StorageError> {
        let query = vec![("uploads".to_string(), String::new())];

        let resp = self
            .request(reqwest::Method::POST, key, &query, &hex_sha256(b""))
            .send()
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        let resp = Self::check(resp).await?;

        let body = resp
            .text()
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;

        let re = Regex::new(r"<UploadId>([^<]+)</UploadId>").unwrap();
        let upload_id = re
            .captures(&body)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| StorageError::Backend("no UploadId in response".to_string()))?;

        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: ByteStream,
    ) -> Result<PartReceipt, StorageError> {
        let payload = Self::collect(body).await?;
        let size = payload.len() as u64;

        let query = vec![
            ("partNumber".to_string(), part_number.to_string()),
            ("uploadId".to_string(), upload_id.to_string()),
        ];

        let resp = self
            .request(reqwest::Method::PUT, key, &query, UNSIGNED_PAYLOAD)
            .body(payload)
            .send()
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        let resp = Self::check(resp).await?;

        let etag = resp
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
            .ok_or_else(|| StorageError::Backend("missing etag".to_string()))?;

        Ok(PartReceipt { etag, size })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        etags: &[String],
    ) -> Result<(), StorageError> {
        let mut body = String::from("<CompleteMultipartUpload>");
        for (index, etag) in etags.iter().enumerate() {
            body.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>\"{}\"</ETag></Part>",
                index + 1,
                etag
            ));
        }
        body.push_str("</CompleteMultipartUpload>");

        let query = vec![("uploadId".to_string(), upload_id.to_string())];

        let resp = self
            .request(
                reqwest::Method::POST,
                key,
                &query,
                &hex_sha256(body.as_bytes()),
            )
            .body(body)
            .send()
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        Self::check(resp).await?;

        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StorageError> {
        let query = vec![("uploadId".to_string(), upload_id.to_string())];

        let resp = self
            .request(reqwest::Method::DELETE, key, &query, &hex_sha256(b""))
            .send()
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(resp).await?;
        Ok(())
    }
}
