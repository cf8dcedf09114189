//! openWB simpleAPI HTTP client.
//!
//! Reads are GET requests with a query string (`?get_chargepoint_all=4`)
//! returning a JSON aggregate; writes are form-encoded POSTs answered
//! with `{"success": true, "data": {...}}`. Transport-level failures
//! (connect, timeout) are reported separately from server-side ones so
//! the poll loop can log them at different volumes.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiClientError {
    #[error("communication error: {0}")]
    Communication(String),
    #[error("server error: {0}")]
    Server(String),
}

pub struct HttpApiClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpApiClient {
    pub fn new(base_url: &str, token: Option<String>) -> HttpApiClient {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        HttpApiClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        }
    }

    pub fn endpoint(&self, query: &str) -> String {
        format!("{}/{}", self.base_url, query.trim_start_matches('/'))
    }

    /// Fetch a JSON aggregate for the given query string.
    pub async fn get(&self, query: &str) -> Result<Value, ApiClientError> {
        let url = self.endpoint(query);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ApiClientError::Communication(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ApiClientError::Server(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| ApiClientError::Server(format!("invalid json from {url}: {e}")))
    }

    /// Issue a form-encoded write and return the parsed response body.
    pub async fn post_form(&self, body: String) -> Result<Value, ApiClientError> {
        let mut request = self
            .client
            .post(&self.base_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ApiClientError::Communication(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ApiClientError::Server(format!(
                "write returned {}",
                response.status()
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| ApiClientError::Server(format!("invalid json in write response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_cleanly() {
        let client = HttpApiClient::new("http://openwb.local:8420/", None);
        assert_eq!(
            client.endpoint("?get_chargepoint_all=4"),
            "http://openwb.local:8420/?get_chargepoint_all=4"
        );
        assert_eq!(
            client.endpoint("/?get_battery=1"),
            "http://openwb.local:8420/?get_battery=1"
        );
    }
}
