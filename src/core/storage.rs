//! S3 object storage client
//!
//! Uploads go through the multipart protocol: initiate, one signed PUT per
//! fixed-size part, then complete. Any failure after initiate aborts the
//! upload so no half-written multipart state is left in the bucket.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, DATE, ETAG};
use reqwest::{Client, Method, Response, StatusCode, Url};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::core::error::{AgentError, Result};
use crate::core::sigv4::{self, SigV4Signer};
use crate::utils::app_config::S3Settings;
use crate::utils::constants::{ARCHIVE_CONTENT_TYPE, MAX_UPLOAD_PARTS, STORAGE_CONNECT_TIMEOUT_SECS};

/// Byte range of one upload part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub number: u32,
    pub offset: u64,
    pub len: u64,
}

/// Split `file_size` bytes into consecutive parts of `part_size`
///
/// The last part carries the remainder. An empty file still produces a
/// single empty part since the protocol needs at least one.
pub fn plan_parts(file_size: u64, part_size: u64) -> Result<Vec<PartRange>> {
    if part_size == 0 {
        return Err(AgentError::Config("part size must be positive".to_string()));
    }

    let count = if file_size == 0 {
        1
    } else {
        file_size.div_ceil(part_size)
    };
    if count > MAX_UPLOAD_PARTS {
        return Err(AgentError::Config(format!(
            "{} bytes needs {} parts of {} bytes, more than the {} allowed",
            file_size, count, part_size, MAX_UPLOAD_PARTS
        )));
    }

    Ok((0..count)
        .map(|i| {
            let offset = i * part_size;
            PartRange {
                number: (i + 1) as u32,
                offset,
                len: part_size.min(file_size - offset),
            }
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub number: u32,
    pub etag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Initiated,
    Uploading,
    Completed,
    Aborted,
}

#[derive(Debug)]
pub struct MultipartUpload {
    pub key: String,
    pub upload_id: String,
    pub parts: Vec<CompletedPart>,
    pub state: UploadState,
}

pub fn complete_body(parts: &[CompletedPart]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>\n");
    for part in parts {
        body.push_str(&format!(
            "<Part>\n<PartNumber>{}</PartNumber>\n<ETag>{}</ETag>\n</Part>\n",
            part.number, part.etag
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

/// Text of the first `<element>` in an XML response body
pub fn xml_element_text(body: &str, element: &str) -> Option<String> {
    let open = format!("<{}>", element);
    let close = format!("</{}>", element);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].trim().to_string())
}

fn object_key(file: &Path) -> Result<String> {
    file.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| AgentError::NotFound(format!("no file name in {}", file.display())))
}

async fn unexpected(response: Response) -> AgentError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    AgentError::Protocol { status, body }
}

/// Where session archives are kept off-site
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Store a local archive under its file name
    async fn upload(&self, file: &Path) -> Result<()>;

    /// Fetch `key` into the host file `dest`; `NotFound` if it does not exist
    async fn download(&self, key: &str, dest: &Path) -> Result<()>;
}

pub struct ObjectStorage {
    client: Client,
    settings: S3Settings,
    signer: SigV4Signer,
}

impl ObjectStorage {
    pub fn new(settings: &S3Settings) -> Result<Self> {
        if settings.bucket.is_empty() {
            return Err(AgentError::Config("storage bucket is empty".to_string()));
        }

        let client = Client::builder()
            .user_agent(concat!("platform-backup-agent/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(STORAGE_CONNECT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            signer: SigV4Signer::new(
                settings.access_key.clone(),
                settings.secret_key.clone(),
                settings.region.clone(),
                "s3",
            ),
            settings: settings.clone(),
        })
    }

    /// Origin and canonical path of an object
    ///
    /// A configured endpoint gets path-style addressing, otherwise the
    /// regional virtual-hosted bucket name is used.
    fn object_location(&self, key: &str) -> (String, String) {
        let key = sigv4::uri_encode(key);
        match &self.settings.endpoint {
            Some(endpoint) => (
                endpoint.trim_end_matches('/').to_string(),
                format!("/{}/{}", sigv4::uri_encode(&self.settings.bucket), key),
            ),
            None => (
                format!(
                    "https://{}.s3.{}.amazonaws.com",
                    self.settings.bucket, self.settings.region
                ),
                format!("/{}", key),
            ),
        }
    }

    fn object_url(&self, key: &str, query: &str) -> Result<(Url, String)> {
        let (origin, path) = self.object_location(key);
        let raw = if query.is_empty() {
            format!("{}{}", origin, path)
        } else {
            format!("{}{}?{}", origin, path, query)
        };
        let url = Url::parse(&raw)
            .map_err(|e| AgentError::Config(format!("invalid storage url {}: {}", raw, e)))?;
        Ok((url, path))
    }

    async fn send_signed(
        &self,
        method: Method,
        key: &str,
        query: &str,
        body: Vec<u8>,
    ) -> Result<Response> {
        let (url, path) = self.object_url(key, query)?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(AgentError::Config(format!("no host in {}", url))),
        };

        let now = Utc::now();
        let payload_hash = sigv4::hex_sha256(&body);
        let canonical =
            sigv4::canonical_request(method.as_str(), &path, query, &host, &payload_hash, &now);

        debug!(method = %method, key, query, bytes = body.len(), "signed storage request");
        let response = self
            .client
            .request(method, url)
            .header("x-amz-date", sigv4::amz_date(&now))
            .header("x-amz-content-sha256", payload_hash)
            .header(AUTHORIZATION, self.signer.authorization(&now, &canonical))
            .body(body)
            .send()
            .await?;
        Ok(response)
    }

    pub async fn initiate(&self, key: &str) -> Result<MultipartUpload> {
        let response = self
            .send_signed(Method::POST, key, "uploads=", Vec::new())
            .await?;
        if response.status() != StatusCode::OK {
            return Err(unexpected(response).await);
        }

        let body = response.text().await?;
        let upload_id = xml_element_text(&body, "UploadId").ok_or_else(|| AgentError::Protocol {
            status: 200,
            body: format!("no UploadId in initiate response: {}", body),
        })?;

        info!(key, upload_id = %upload_id, "multipart upload initiated");
        Ok(MultipartUpload {
            key: key.to_string(),
            upload_id,
            parts: Vec::new(),
            state: UploadState::Initiated,
        })
    }

    /// Upload every planned part in order, stopping at the first failure
    pub async fn upload_parts(
        &self,
        upload: &mut MultipartUpload,
        file: &Path,
        plan: &[PartRange],
    ) -> Result<()> {
        upload.state = UploadState::Uploading;
        let mut source = File::open(file)
            .await
            .map_err(|e| AgentError::io(format!("open {}", file.display()), e))?;

        for part in plan {
            source
                .seek(std::io::SeekFrom::Start(part.offset))
                .await
                .map_err(|e| AgentError::io(format!("seek {}", file.display()), e))?;
            let mut chunk = vec![0u8; part.len as usize];
            source
                .read_exact(&mut chunk)
                .await
                .map_err(|e| AgentError::io(format!("read {}", file.display()), e))?;

            let query = format!(
                "partNumber={}&uploadId={}",
                part.number,
                sigv4::uri_encode(&upload.upload_id)
            );
            let response = self
                .send_signed(Method::PUT, &upload.key, &query, chunk)
                .await?;
            if response.status() != StatusCode::OK {
                return Err(unexpected(response).await);
            }

            let etag = response
                .headers()
                .get(ETAG)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| AgentError::Protocol {
                    status: 200,
                    body: format!("part {} response carries no ETag", part.number),
                })?;

            debug!(part = part.number, of = plan.len(), etag = %etag, "part uploaded");
            upload.parts.push(CompletedPart {
                number: part.number,
                etag,
            });
        }

        Ok(())
    }

    pub async fn complete(&self, upload: &mut MultipartUpload) -> Result<()> {
        let query = format!("uploadId={}", sigv4::uri_encode(&upload.upload_id));
        let body = complete_body(&upload.parts).into_bytes();
        let response = self
            .send_signed(Method::POST, &upload.key, &query, body)
            .await?;
        if response.status() != StatusCode::OK {
            return Err(unexpected(response).await);
        }

        // A 200 can still carry an <Error> document
        let text = response.text().await?;
        if text.contains("<Error>") {
            return Err(AgentError::Protocol {
                status: 200,
                body: text,
            });
        }

        upload.state = UploadState::Completed;
        info!(key = %upload.key, parts = upload.parts.len(), "multipart upload completed");
        Ok(())
    }

    pub async fn abort(&self, upload: &mut MultipartUpload) -> Result<()> {
        let query = format!("uploadId={}", sigv4::uri_encode(&upload.upload_id));
        let response = self
            .send_signed(Method::DELETE, &upload.key, &query, Vec::new())
            .await?;
        if response.status() != StatusCode::NO_CONTENT {
            return Err(unexpected(response).await);
        }

        upload.state = UploadState::Aborted;
        info!(key = %upload.key, "multipart upload aborted");
        Ok(())
    }

    /// Upload a local file under its own file name
    pub async fn upload(&self, file: &Path) -> Result<()> {
        let key = object_key(file)?;
        let size = tokio::fs::metadata(file)
            .await
            .map_err(|e| AgentError::io(format!("stat {}", file.display()), e))?
            .len();
        let plan = plan_parts(size, self.settings.part_size)?;

        let mut upload = self.initiate(&key).await?;
        let outcome = match self.upload_parts(&mut upload, file, &plan).await {
            Ok(()) => self.complete(&mut upload).await,
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            warn!(key = %key, error = %e, "upload failed, aborting");
            if let Err(abort_err) = self.abort(&mut upload).await {
                warn!(key = %key, error = %abort_err, "abort failed");
            }
            return Err(e);
        }

        Ok(())
    }

    /// Single PUT with the legacy signature header, for small artifacts
    pub async fn put_object(&self, file: &Path) -> Result<()> {
        let key = object_key(file)?;
        let body = tokio::fs::read(file)
            .await
            .map_err(|e| AgentError::io(format!("read {}", file.display()), e))?;

        let (url, path) = self.object_url(&key, "")?;
        let resource = match self.settings.endpoint {
            Some(_) => path,
            None => format!("/{}{}", self.settings.bucket, path),
        };
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let string_to_sign = format!("PUT\n\n{}\n{}\n{}", ARCHIVE_CONTENT_TYPE, date, resource);

        let response = self
            .client
            .put(url)
            .header(DATE, date)
            .header(CONTENT_TYPE, ARCHIVE_CONTENT_TYPE)
            .header(
                AUTHORIZATION,
                sigv4::legacy_authorization(
                    &self.settings.access_key,
                    &self.settings.secret_key,
                    &string_to_sign,
                ),
            )
            .body(body)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(unexpected(response).await);
        }

        info!(key = %key, "object stored");
        Ok(())
    }

    /// Stream an object to `dest`
    ///
    /// A missing object is reported as `NotFound` so callers can fall back
    /// to another name.
    pub async fn download(&self, key: &str, dest: &Path) -> Result<()> {
        let response = self.send_signed(Method::GET, key, "", Vec::new()).await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(AgentError::NotFound(format!(
                    "object {} in bucket {}",
                    key, self.settings.bucket
                )))
            }
            _ => return Err(unexpected(response).await),
        }

        let mut out = File::create(dest)
            .await
            .map_err(|e| AgentError::io(format!("create {}", dest.display()), e))?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.write_all(&chunk)
                .await
                .map_err(|e| AgentError::io(format!("write {}", dest.display()), e))?;
            written += chunk.len() as u64;
        }
        out.flush()
            .await
            .map_err(|e| AgentError::io(format!("flush {}", dest.display()), e))?;

        info!(key, bytes = written, dest = %dest.display(), "object downloaded");
        Ok(())
    }
}

#[async_trait]
impl ArchiveStore for ObjectStorage {
    async fn upload(&self, file: &Path) -> Result<()> {
        ObjectStorage::upload(self, file).await
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<()> {
        ObjectStorage::download(self, key, dest).await
    }
}
