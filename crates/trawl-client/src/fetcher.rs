use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use trawl_core::error::AppError;
use trawl_core::models::{Identity, Target};
use trawl_core::traits::{FetcherFactory, PageFetcher};

type ClientKey = (Option<String>, String);

/// HTTP page fetcher using reqwest.
///
/// reqwest binds proxy and User-Agent at client build time, so one
/// [`Client`] is built per distinct identity and reused for the lifetime of
/// the fetcher. The per-request timeout is applied on each request.
#[derive(Default)]
pub struct ReqwestFetcher {
    clients: Mutex<HashMap<ClientKey, Client>>,
}

impl ReqwestFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct identities a client has been built for.
    pub fn client_count(&self) -> usize {
        self.lock_clients().len()
    }

    fn client_for(&self, identity: &Identity) -> Result<Client, AppError> {
        let key = (identity.proxy.clone(), identity.user_agent.clone());
        if let Some(client) = self.lock_clients().get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .user_agent(identity.user_agent.as_str())
            .connect_timeout(Duration::from_secs(10));
        builder = match &identity.proxy {
            Some(proxy) => {
                let proxy = reqwest::Proxy::all(proxy.as_str()).map_err(|e| {
                    AppError::FetcherFatal(format!("Invalid proxy '{proxy}': {e}"))
                })?;
                builder.proxy(proxy)
            }
            // "No proxy" means direct, not whatever the environment says.
            None => builder.no_proxy(),
        };
        let client = builder
            .build()
            .map_err(|e| AppError::FetcherFatal(format!("Failed to build HTTP client: {e}")))?;

        tracing::debug!(proxy = ?identity.proxy, "Built HTTP client for identity");
        self.lock_clients().insert(key, client.clone());
        Ok(client)
    }

    fn lock_clients(&self) -> MutexGuard<'_, HashMap<ClientKey, Client>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PageFetcher for ReqwestFetcher {
    async fn fetch(
        &self,
        target: &Target,
        identity: &Identity,
        timeout: Duration,
    ) -> Result<String, AppError> {
        let client = self.client_for(identity)?;
        let url = target.url().as_str();

        let response = client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_request_error(e, timeout))?;

        check_status(response.status(), url)?;

        response
            .text()
            .await
            .map_err(|e| map_request_error(e, timeout))
    }
}

/// Map a non-success status onto the fetch error taxonomy.
pub(crate) fn check_status(status: StatusCode, url: &str) -> Result<(), AppError> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => Err(AppError::NotFound(url.to_string())),
        StatusCode::TOO_MANY_REQUESTS => Err(AppError::RateLimitExceeded),
        _ => Err(AppError::HttpError {
            status: status.as_u16(),
            message: format!("HTTP {} for {url}", status.as_u16()),
        }),
    }
}

fn map_request_error(e: reqwest::Error, timeout: Duration) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout.as_secs())
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else if e.is_builder() {
        AppError::FetcherFatal(format!("Request could not be built: {e}"))
    } else {
        AppError::NetworkError(e.to_string())
    }
}

/// Hands each worker its own [`ReqwestFetcher`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReqwestFetcherFactory;

impl FetcherFactory for ReqwestFetcherFactory {
    type Fetcher = ReqwestFetcher;

    async fn create(&self) -> Result<ReqwestFetcher, AppError> {
        Ok(ReqwestFetcher::new())
    }
}
