//! HTTP client for the profile service that hands out application ids

use crate::resolver::{ApplicationIdProvider, ResolverError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// `ApplicationIdProvider` backed by `GET {endpoint}/api/profiles/{ikey}/appId`
pub struct ProfileApiClient {
    client: Client,
    base: Url,
}

impl ProfileApiClient {
    /// Create a client with a per-request timeout
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ResolverError> {
        let base = Url::parse(base_url)
            .map_err(|e| ResolverError::InvalidEndpoint(format!("{}: {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(ResolverError::InvalidEndpoint(base_url.to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("deptrack/{}", env!("CARGO_PKG_VERSION")))
            .gzip(true)
            .build()?;

        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str().trim_end_matches('/')
    }

    /// The key goes in as a single percent-encoded path segment
    fn app_id_url(&self, instrumentation_key: &str) -> Result<Url, ResolverError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ResolverError::InvalidEndpoint(self.base.to_string()))?
            .pop_if_empty()
            .extend(["api", "profiles", instrumentation_key, "appId"]);
        Ok(url)
    }
}

#[async_trait]
impl ApplicationIdProvider for ProfileApiClient {
    async fn fetch_app_id(&self, instrumentation_key: &str) -> Result<String, ResolverError> {
        if instrumentation_key.is_empty() {
            return Err(ResolverError::NotFound(String::new()));
        }

        let url = self.app_id_url(instrumentation_key)?;
        debug!("Looking up application id at {}", url);

        let response = self.client.get(url).send().await?;
        let status = response.status();

        match status {
            StatusCode::OK => {
                let body = response.text().await?;
                let app_id = body.trim().trim_matches('"');
                if app_id.is_empty() {
                    Err(ResolverError::InvalidResponse(
                        "empty application id".to_string(),
                    ))
                } else {
                    Ok(app_id.to_string())
                }
            }
            StatusCode::NOT_FOUND => Err(ResolverError::NotFound(instrumentation_key.to_string())),
            _ => {
                let message = response.text().await.unwrap_or_default();
                Err(ResolverError::Server {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }
}
