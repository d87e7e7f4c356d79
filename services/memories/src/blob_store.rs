use crate::config::BlobConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors from the blob store adapter
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("blob transport failed: {0}")]
    Transport(String),

    #[error("url '{0}' does not belong to this blob store")]
    ForeignUrl(String),
}

/// Content-addressable storage for binary assets.
///
/// Blob lifetime is not authoritative, the metadata store is. `delete` must
/// succeed when the object is already gone.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key` and return the url it can be read from
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<String, StorageError>;

    /// Remove the object behind `url`
    async fn delete(&self, url: &str) -> Result<(), StorageError>;
}

/// Delete a blob, logging instead of failing.
///
/// Used wherever a metadata row has already been removed and the blob is
/// just garbage to clean up.
pub async fn delete_best_effort(store: &dyn BlobStore, url: &str) {
    if let Err(e) = store.delete(url).await {
        warn!(error = %e, url = %url, "Best-effort blob delete failed");
        metrics::counter!("memories.blobs.delete_failed").increment(1);
    }
}

/// Which family of generated image a key is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratedKind {
    Sketch,
    Background,
}

impl GeneratedKind {
    pub fn prefix(self) -> &'static str {
        match self {
            GeneratedKind::Sketch => "sketches",
            GeneratedKind::Background => "backgrounds",
        }
    }
}

/// Key for an uploaded photo: `photos/{random}.{ext}`
pub fn photo_key(extension: &str) -> String {
    format!("photos/{}.{}", Uuid::new_v4().simple(), sanitize_extension(extension))
}

/// Key for a generated image: `{kind}/{event_id}/{timestamp_ms}-{index}.{ext}`
pub fn generated_key(
    kind: GeneratedKind,
    event_id: Uuid,
    timestamp_ms: i64,
    index: u32,
    extension: &str,
) -> String {
    format!(
        "{prefix}/{event_id}/{timestamp_ms}-{index}.{ext}",
        prefix = kind.prefix(),
        ext = sanitize_extension(extension)
    )
}

fn sanitize_extension(extension: &str) -> String {
    let cleaned: String = extension
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if cleaned.is_empty() {
        "bin".to_string()
    } else {
        cleaned
    }
}

/// File extension for an upload, preferring the content type over the file name
pub fn extension_for(content_type: &str, file_name: Option<&str>) -> String {
    let from_type = match content_type.to_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "image/heic" => Some("heic"),
        "image/heif" => Some("heif"),
        "image/tiff" => Some("tiff"),
        _ => None,
    };

    from_type
        .map(String::from)
        .or_else(|| {
            file_name
                .and_then(|name| name.rsplit_once('.'))
                .map(|(_, ext)| sanitize_extension(ext))
        })
        .unwrap_or_else(|| "bin".to_string())
}

/// Blob store backed by S3 or an S3-compatible service
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    public_base_url: Option<String>,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub async fn new(config: &BlobConfig) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            public_base_url: config
                .public_base_url
                .as_ref()
                .map(|base| base.trim_end_matches('/').to_string()),
        }
    }

    fn url_for(&self, key: &str) -> String {
        match self.public_base_url {
            Some(ref base) => format!("{base}/{key}"),
            None => format!("s3://{}/{}", self.bucket, key),
        }
    }

    fn key_for<'a>(&self, url: &'a str) -> Option<&'a str> {
        let key = match self.public_base_url {
            Some(ref base) => url.strip_prefix(base.as_str())?.strip_prefix('/'),
            None => url
                .strip_prefix("s3://")?
                .strip_prefix(self.bucket.as_str())?
                .strip_prefix('/'),
        }?;
        (!key.is_empty()).then_some(key)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, bytes), fields(key = %key, size_bytes = bytes.len()))]
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<String, StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::Transport(format!("put {key}: {e}")))?;

        debug!(key = %key, "Blob stored in S3");
        Ok(self.url_for(key))
    }

    #[instrument(skip(self), fields(url = %url))]
    async fn delete(&self, url: &str) -> Result<(), StorageError> {
        let key = self
            .key_for(url)
            .ok_or_else(|| StorageError::ForeignUrl(url.to_string()))?;

        // DeleteObject answers 204 for missing keys; some compatible stores answer 404.
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => {
                debug!(key = %key, "Blob deleted from S3");
                Ok(())
            }
            Err(e) if e.raw_response().map(|r| r.status().as_u16()) == Some(404) => {
                debug!(key = %key, "Blob already absent");
                Ok(())
            }
            Err(e) => Err(StorageError::Transport(format!("delete {key}: {e}"))),
        }
    }
}

/// Process-local blob store.
///
/// Used for development without an object store and in tests, where single
/// operations can be made to fail.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, (Bytes, String)>>,
    failures: Mutex<Failures>,
}

#[derive(Default)]
struct Failures {
    puts: usize,
    deletes: usize,
}

const MEMORY_SCHEME: &str = "memory://";

impl MemoryBlobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` puts fail with a transport error
    pub fn fail_next_puts(&self, count: usize) {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).puts = count;
    }

    /// Make the next `count` deletes fail with a transport error
    pub fn fail_next_deletes(&self, count: usize) {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).deletes = count;
    }

    pub fn contains(&self, url: &str) -> bool {
        url.strip_prefix(MEMORY_SCHEME)
            .map(|key| self.lock_objects().contains_key(key))
            .unwrap_or(false)
    }

    /// Stored bytes and content type behind `url`
    pub fn get(&self, url: &str) -> Option<(Bytes, String)> {
        let key = url.strip_prefix(MEMORY_SCHEME)?;
        self.lock_objects().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_objects(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Bytes, String)>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_failure(&self, pick: impl FnOnce(&mut Failures) -> &mut usize) -> bool {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let remaining = pick(&mut failures);
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<String, StorageError> {
        if self.take_failure(|f| &mut f.puts) {
            return Err(StorageError::Transport(format!("put {key}: injected failure")));
        }

        self.lock_objects()
            .insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(format!("{MEMORY_SCHEME}{key}"))
    }

    async fn delete(&self, url: &str) -> Result<(), StorageError> {
        let key = url
            .strip_prefix(MEMORY_SCHEME)
            .ok_or_else(|| StorageError::ForeignUrl(url.to_string()))?;

        if self.take_failure(|f| &mut f.deletes) {
            return Err(StorageError::Transport(format!("delete {key}: injected failure")));
        }

        self.lock_objects().remove(key);
        Ok(())
    }
}
