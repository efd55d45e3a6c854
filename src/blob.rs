use std::{collections::HashMap, sync::Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use isahc::{AsyncReadResponseExt, Request, RequestExt};
use log::{log, Level};

/// Named uploads that come back as a stable retrievable URL.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(
        &self,
        name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, anyhow::Error>;
}

pub struct HttpBlobStore {
    endpoint: String,
    token: Option<String>,
}

impl HttpBlobStore {
    pub fn new(endpoint: &str, token: Option<String>) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn url_for(&self, name: &str) -> String {
        format!("{}/{}", self.endpoint, name)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(
        &self,
        name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, anyhow::Error> {
        let url = self.url_for(name);
        let mut request = Request::put(&url).header("Content-Type", content_type);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        let mut response = request.body(bytes)?.send_async().await?;

        if response.status().is_success() {
            log!(Level::Debug, "Uploaded blob {name}");
            Ok(url)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(anyhow!(
                "Failed to upload {name}: {} {body}",
                response.status()
            ))
        }
    }
}

/// Keeps uploads in memory; URLs use the `memory://` scheme.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, (String, Vec<u8>)>>,
    failing: Mutex<bool>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_uploads(&self, failing: bool) {
        if let Ok(mut flag) = self.failing.lock() {
            *flag = failing;
        }
    }

    /// Content type and bytes of a stored blob.
    pub fn get(&self, name: &str) -> Option<(String, Vec<u8>)> {
        self.blobs.lock().ok()?.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(
        &self,
        name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, anyhow::Error> {
        if self.failing.lock().map(|f| *f).unwrap_or(false) {
            return Err(anyhow!("Failed to upload {name}: storage unavailable"));
        }
        self.blobs
            .lock()
            .map_err(|_| anyhow!("blob lock poisoned"))?
            .insert(name.to_string(), (content_type.to_string(), bytes));
        Ok(format!("memory://{name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_upload_round_trips() {
        let blobs = MemoryBlobStore::new();
        let url = blobs
            .upload("complaint-images/1-a.png", "image/png", vec![1, 2, 3])
            .await
            .unwrap();
        assert_eq!(url, "memory://complaint-images/1-a.png");
        assert_eq!(
            blobs.get("complaint-images/1-a.png"),
            Some(("image/png".to_string(), vec![1, 2, 3]))
        );
    }

    #[tokio::test]
    async fn failing_uploads_store_nothing() {
        let blobs = MemoryBlobStore::new();
        blobs.fail_uploads(true);
        assert!(blobs.upload("x", "image/png", vec![]).await.is_err());
        assert!(blobs.is_empty());
    }

    #[test]
    fn http_urls_join_endpoint_and_name() {
        let blobs = HttpBlobStore::new("https://files.example.edu/bucket/", None);
        assert_eq!(
            blobs.url_for("complaint-images/1-a.png"),
            "https://files.example.edu/bucket/complaint-images/1-a.png"
        );
    }
}
