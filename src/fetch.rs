//! Source file download.

use std::time::Duration;

use tracing::debug;

use crate::attachment::file_name_from_url;
use crate::error::FetchError;

/// Bytes of a downloaded file plus what the server said about them.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub bytes: Vec<u8>,
    /// `Content-Type` response header, parameters stripped.
    pub content_type: Option<String>,
    pub file_name: String,
}

/// Downloads attachment files over HTTP.
#[derive(Clone)]
pub struct FileFetcher {
    client: reqwest::Client,
}

impl FileFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError {
                url: String::new(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// GET `url`. Any non-2xx status is an error.
    pub async fn fetch(&self, url: &str) -> Result<FetchedFile, FetchError> {
        let failed = |reason: String| FetchError {
            url: url.to_string(),
            reason,
        };

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {status}")));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty());

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| failed(format!("reading body: {e}")))?
            .to_vec();

        debug!(url, bytes = bytes.len(), content_type = ?content_type, "File fetched");
        Ok(FetchedFile {
            bytes,
            content_type,
            file_name: file_name_from_url(url),
        })
    }
}
