//! Object storage client: downloads résumé files by path.
//!
//! One process-wide handle. Transport failures retry with back-off and
//! rebuild the underlying HTTP client once by atomic swap; the handle is
//! never mutated in place.

use rand::Rng;
use reqwest::Client;
use std::sync::RwLock;
use std::time::Duration;

use crate::config::StorageConfig;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage not configured")]
    NotConfigured,
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("download failed after {retries} retries: {message}")]
    DownloadFailed { message: String, retries: u32 },
}

pub struct StorageService {
    client: RwLock<Client>,
    config: StorageConfig,
}

impl StorageService {
    pub fn new(client: Client, config: StorageConfig) -> Self {
        Self { client: RwLock::new(client), config }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.base_url.is_empty()
    }

    fn object_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.bucket,
            path.trim_start_matches('/')
        )
    }

    /// Download an object. Retryable transport errors back off (1s, 2s,
    /// 4s... jittered); a missing object fails immediately.
    pub async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        if !self.is_configured() {
            return Err(StorageError::NotConfigured);
        }

        let url = self.object_url(path);
        let mut last_error = String::new();
        let mut rebuilt = false;

        for attempt in 0..=self.config.max_retries {
            let client = self.client.read().expect("storage client lock").clone();
            let result = client
                .get(&url)
                .header("Authorization", format!("Bearer {}", self.config.service_key))
                .timeout(Duration::from_secs(self.config.timeout_secs))
                .send()
                .await;

            match result {
                Ok(response) if response.status() == reqwest::StatusCode::NOT_FOUND => {
                    return Err(StorageError::NotFound(path.to_string()));
                },
                Ok(response) if response.status().is_success() => {
                    match response.bytes().await {
                        Ok(bytes) => {
                            tracing::info!("[storage] downloaded {} ({} bytes)", path, bytes.len());
                            return Ok(bytes.to_vec());
                        },
                        Err(e) => last_error = e.to_string(),
                    }
                },
                Ok(response) => {
                    last_error = format!("HTTP {}", response.status());
                },
                Err(e) => {
                    last_error = e.to_string();
                    // One rebuild per download: a wedged pool or stale DNS
                    // entry does not survive the swap
                    if !rebuilt && (e.is_connect() || e.is_timeout()) {
                        self.rebuild_client();
                        rebuilt = true;
                    }
                },
            }

            if attempt < self.config.max_retries {
                let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
                let delay = (2f64.powi(attempt as i32) + jitter).min(8.0);
                tracing::warn!(
                    "[storage] download retry {}/{} in {:.1}s: {}",
                    attempt + 1,
                    self.config.max_retries,
                    delay,
                    last_error
                );
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
        }

        Err(StorageError::DownloadFailed {
            message: last_error,
            retries: self.config.max_retries,
        })
    }

    fn rebuild_client(&self) {
        tracing::warn!("[storage] rebuilding HTTP client");
        let fresh = Client::builder()
            .pool_max_idle_per_host(5)
            .build()
            .unwrap_or_else(|_| Client::new());
        if let Ok(mut guard) = self.client.write() {
            *guard = fresh;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url() {
        let config = StorageConfig {
            base_url: "https://proj.supabase.co/".to_string(),
            bucket: "resumes".to_string(),
            ..Default::default()
        };
        let svc = StorageService::new(Client::new(), config);
        assert_eq!(
            svc.object_url("/user1/file.pdf"),
            "https://proj.supabase.co/storage/v1/object/resumes/user1/file.pdf"
        );
    }

    #[tokio::test]
    async fn test_unconfigured_download_fails_fast() {
        let svc = StorageService::new(Client::new(), StorageConfig::default());
        assert!(matches!(svc.download("x.pdf").await, Err(StorageError::NotConfigured)));
    }
}
