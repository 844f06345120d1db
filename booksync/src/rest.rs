use std::time::Duration;

use reqwest::Client;

use crate::error::{Result, SyncError};

/// HTTP client wrapper for an exchange REST API.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
}

impl HttpClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// GET a resource and return the raw body.
    ///
    /// Non-2xx responses become [`SyncError::Http`]; exceeding `timeout`
    /// becomes [`SyncError::Timeout`].
    pub async fn get_bytes(
        &self,
        path: &str,
        query: &[(String, String)],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_request_error)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::Http {
                status,
                message: body,
            });
        }

        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(map_request_error)
    }
}

fn map_request_error(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::Timeout
    } else {
        SyncError::Request(err)
    }
}
