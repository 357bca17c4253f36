//! JSON/HTTP client for the records server.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, warn};

use super::{Batch, RemoteError, RemoteResult, RemoteSource};
use crate::models::{Encounter, Location, Observation, Order, Patient, PatientDelta, User, VoidObs};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ObservationsResponse {
    results: Vec<Observation>,
    snapshot_time: DateTime<Utc>,
}

/// Records server client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpRemote {
    pub fn new(base_url: &str, username: &str, password: &str) -> RemoteResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Check if response is successful.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> RemoteResult<Option<Response>> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::from_status(status, &body))
        }
    }

    /// Send the request built by `build`, backing off on rate limits.
    async fn execute(&self, url: &str, build: impl Fn(&Client) -> RequestBuilder) -> RemoteResult<Response> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build(&self.client)
                .basic_auth(&self.username, Some(&self.password))
                .send()
                .await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(RemoteError::RateLimited);
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> RemoteResult<T> {
        let url = self.url(path);
        debug!(url = %url, "GET");
        let response = self.execute(&url, |c| c.get(&url)).await?;
        response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(format!("{}: {}", url, e)))
    }

    /// GET with `query` encoded into the URL's query string.
    async fn get_query<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> RemoteResult<T> {
        let url = self.url(path);
        debug!(url = %url, ?query, "GET");
        let response = self.execute(&url, |c| get_request(c, &url, query)).await?;
        response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(format!("{}: {}", url, e)))
    }

    async fn post<T: DeserializeOwned, B: serde::Serialize + Sync>(&self, path: &str, body: &B) -> RemoteResult<T> {
        let url = self.url(path);
        debug!(url = %url, "POST");
        let response = self.execute(&url, |c| c.post(&url).json(body)).await?;
        response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(format!("{}: {}", url, e)))
    }

    async fn delete(&self, path: &str) -> RemoteResult<()> {
        let url = self.url(path);
        debug!(url = %url, "DELETE");
        self.execute(&url, |c| c.delete(&url)).await?;
        Ok(())
    }

    async fn list<T: DeserializeOwned>(&self, path: &str) -> RemoteResult<Vec<T>> {
        let response: ListResponse<T> = self.get(path).await?;
        Ok(response.results)
    }
}

fn get_request(client: &Client, url: &str, query: &[(&str, &str)]) -> RequestBuilder {
    client.get(url).query(query)
}

#[async_trait]
impl RemoteSource for HttpRemote {
    async fn list_locations(&self) -> RemoteResult<Vec<Location>> {
        self.list("locations").await
    }

    async fn list_patients(&self) -> RemoteResult<Vec<Patient>> {
        self.list("patients").await
    }

    async fn list_users(&self) -> RemoteResult<Vec<User>> {
        self.list("users").await
    }

    async fn list_orders(&self) -> RemoteResult<Vec<Order>> {
        self.list("orders").await
    }

    async fn list_observations_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> RemoteResult<Batch<Observation>> {
        let since = since.map(|t| t.timestamp_millis().to_string());
        let response: ObservationsResponse = match since {
            Some(ref since) => self.get_query("observations", &[("since", since.as_str())]).await?,
            None => self.get("observations").await?,
        };
        Ok(Batch {
            items: response.results,
            server_time: response.snapshot_time,
        })
    }

    async fn get_patient(&self, id: &str) -> RemoteResult<Patient> {
        let matches: ListResponse<Patient> = self.get_query("patients", &[("id", id)]).await?;
        matches
            .results
            .into_iter()
            .find(|p| p.id.as_deref() == Some(id))
            .ok_or_else(|| RemoteError::NotFound(format!("patient {}", id)))
    }

    async fn add_patient(&self, delta: &PatientDelta) -> RemoteResult<Patient> {
        self.post("patients", delta).await
    }

    async fn update_patient(&self, uuid: &str, delta: &PatientDelta) -> RemoteResult<Patient> {
        self.post(&format!("patients/{}", uuid), delta).await
    }

    async fn delete_patient(&self, uuid: &str) -> RemoteResult<()> {
        self.delete(&format!("patients/{}", uuid)).await
    }

    async fn add_encounter(&self, encounter: &Encounter) -> RemoteResult<Encounter> {
        self.post("encounters", encounter).await
    }

    async fn save_order(&self, order: &Order) -> RemoteResult<Order> {
        match order.uuid {
            Some(ref uuid) => self.post(&format!("orders/{}", uuid), order).await,
            None => self.post("orders", order).await,
        }
    }

    async fn delete_order(&self, uuid: &str) -> RemoteResult<()> {
        self.delete(&format!("orders/{}", uuid)).await
    }

    async fn void_observation(&self, obs: &VoidObs) -> RemoteResult<()> {
        self.delete(&format!("observations/{}", obs.uuid)).await
    }
}
