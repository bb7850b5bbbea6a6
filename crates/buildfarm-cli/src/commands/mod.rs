//! CLI command implementations.

pub mod builds;
pub mod jobs;
pub mod workers;

use anyhow::{Context, Result, bail};
use buildfarm_config::load_farm_config;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;

/// Thin client for the manager's HTTP API.
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base_url))?;
        decode(response).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base_url))?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body = response.text().await.unwrap_or_default();
    bail!("{} ({})", error_message(&body), status)
}

/// Pull the message out of an API error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

pub fn validate(path: &Path) -> Result<()> {
    let config = load_farm_config(path)
        .with_context(|| format!("Configuration error in {}", path.display()))?;
    println!("Configuration is valid");
    println!("  workers: {}", config.workers.len());
    println!(
        "  database: {}",
        config.database_url.as_deref().unwrap_or("in-memory")
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_error_message_from_json_body() {
        assert_eq!(
            error_message(r#"{"error":"not found: worker nobody"}"#),
            "not found: worker nobody"
        );
        assert_eq!(error_message("bad gateway\n"), "bad gateway");
    }

    #[test]
    fn test_api_url_joins_cleanly() {
        let api = ApiClient::new("http://manager:8080/");
        assert_eq!(api.url("/workers"), "http://manager:8080/api/workers");
    }

    #[test]
    fn test_validate() {
        let mut good = NamedTempFile::new().unwrap();
        writeln!(good, r#"worker "bob" url="http://bob:8221" processor="386""#).unwrap();
        assert!(validate(good.path()).is_ok());

        let mut bad = NamedTempFile::new().unwrap();
        writeln!(bad, r#"worker "Bob_1" url="http://x" processor="386""#).unwrap();
        assert!(validate(bad.path()).is_err());
    }
}
