use crate::error::AppError;

use tracing::{debug, error};

/// Durable object-storage client for call recordings (Supabase-style REST
/// surface).  Writes are upserts, so re-processing a recording rewrites the
/// same object instead of accumulating duplicates.
#[derive(Clone)]
pub struct StorageClient {
    base_url: String,
    api_key: String,
    bucket: String,
}

/// Storage path for one recording, namespaced so artifacts from different
/// outreaches and calls can never collide.
pub fn recording_object_path(outreach_id: &str, call_sid: &str, recording_sid: &str) -> String {
    format!("{outreach_id}/{call_sid}/{recording_sid}.mp3")
}

impl StorageClient {
    pub fn new(base_url: String, api_key: String, bucket: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            bucket,
        }
    }

    /// Upload bytes under `object_path` and return the stable public URL.
    /// The returned URL is storage-hosted; never the telephony provider's
    /// possibly time-limited media URL.
    pub async fn upload(
        &self,
        http_client: &reqwest::Client,
        object_path: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, AppError> {
        let url = format!("{}/object/{}/{}", self.base_url, self.bucket, object_path);
        let resp = http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send upload request to storage");
                AppError("storage upload request failed")
            })?;
        if !resp.status().is_success() {
            error!(status=%resp.status(), object_path=%object_path, "storage upload rejected");
            return Err(AppError("storage upload rejected"));
        }
        debug!(object_path=%object_path, "uploaded recording to durable storage");

        Ok(self.public_url(object_path))
    }

    pub fn public_url(&self, object_path: &str) -> String {
        format!(
            "{}/object/public/{}/{}",
            self.base_url, self.bucket, object_path
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_path_is_namespaced_by_outreach_and_call() {
        assert_eq!(
            recording_object_path("o-1", "CA123", "RE456"),
            "o-1/CA123/RE456.mp3"
        );
    }

    #[test]
    fn public_url_shape() {
        let client = StorageClient::new(
            "https://proj.supabase.co/storage/v1/".to_string(),
            "key".to_string(),
            "recordings".to_string(),
        );
        assert_eq!(
            client.public_url("o-1/CA123/RE456.mp3"),
            "https://proj.supabase.co/storage/v1/object/public/recordings/o-1/CA123/RE456.mp3"
        );
    }
}
