//! Upstream device-safety data access.
//!
//! [`DataSource`] is the seam collectors depend on; [`OpenFdaClient`] is the
//! production implementation backed by the openFDA device endpoints.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::intent::{is_manufacturer, Intent};
use crate::settings::DataSourceConfig;

/// Upper bound openFDA accepts for `limit`
const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("{endpoint} answered {status}: {body}")]
    Rejected {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("{endpoint} still unavailable after {attempts} attempts (last status {status})")]
    Exhausted {
        endpoint: String,
        attempts: u32,
        status: u16,
    },

    #[error("Malformed response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

/// Device datasets the collectors read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    AdverseEvents,
    Recalls,
    Classification,
}

impl Dataset {
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::AdverseEvents => "device/event.json",
            Self::Recalls => "device/recall.json",
            Self::Classification => "device/classification.json",
        }
    }

    fn device_fields(&self) -> &'static [&'static str] {
        match self {
            Self::AdverseEvents => &["device.generic_name", "device.brand_name"],
            Self::Recalls => &["product_description", "openfda.device_name"],
            Self::Classification => &["device_name"],
        }
    }

    fn manufacturer_fields(&self) -> &'static [&'static str] {
        match self {
            Self::AdverseEvents => &["device.manufacturer_d_name"],
            Self::Recalls => &["recalling_firm"],
            // Classification records are not per manufacturer
            Self::Classification => &[],
        }
    }
}

/// One search against a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataQuery {
    pub dataset: Dataset,
    /// openFDA search expression; `None` lists the most recent records
    pub search: Option<String>,
    pub limit: usize,
}

impl DataQuery {
    /// Build a search for the entities named in `intent`. Manufacturer names
    /// are matched against firm fields, everything else against device names.
    /// Datasets without firm fields ignore manufacturers.
    pub fn for_intent(dataset: Dataset, intent: &Intent, limit: usize) -> Self {
        let clauses: Vec<String> = intent
            .entities
            .iter()
            .flat_map(|entity| {
                let fields = if is_manufacturer(entity) {
                    dataset.manufacturer_fields()
                } else {
                    dataset.device_fields()
                };
                let term = escape_term(entity);
                fields
                    .iter()
                    .map(move |field| format!("{}:\"{}\"", field, term))
            })
            .collect();

        Self {
            dataset,
            search: if clauses.is_empty() {
                None
            } else {
                Some(clauses.join(" OR "))
            },
            limit: limit.clamp(1, MAX_PAGE_SIZE),
        }
    }
}

/// Quotes and backslashes would end the phrase early
fn escape_term(term: &str) -> String {
    term.chars().filter(|c| !matches!(c, '"' | '\\')).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub records: Vec<Value>,
    /// Total matches upstream, which may exceed `records.len()`
    pub total: u64,
}

#[async_trait]
pub trait DataSource: Send + Sync {
    async fn search(&self, query: &DataQuery) -> Result<SearchResponse, SourceError>;
}

#[derive(Deserialize)]
struct OpenFdaEnvelope {
    #[serde(default)]
    meta: Option<OpenFdaMeta>,
    #[serde(default)]
    results: Vec<Value>,
}

#[derive(Deserialize)]
struct OpenFdaMeta {
    results: Option<OpenFdaPaging>,
}

#[derive(Deserialize)]
struct OpenFdaPaging {
    total: u64,
}

/// openFDA REST client with bounded retries on transient failures
pub struct OpenFdaClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl OpenFdaClient {
    pub fn new(config: &DataSourceConfig) -> Result<Self, SourceError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| SourceError::Transport {
                endpoint: base_url.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    fn request_for(&self, query: &DataQuery) -> RequestBuilder {
        let mut params: Vec<(&str, String)> = vec![("limit", query.limit.to_string())];
        if let Some(search) = &query.search {
            params.push(("search", search.clone()));
        }
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }
        self.client
            .get(format!("{}/{}", self.base_url, query.dataset.endpoint()))
            .query(&params)
    }

    fn is_transient(status: StatusCode) -> bool {
        status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
    }
}

#[async_trait]
impl DataSource for OpenFdaClient {
    #[instrument(skip(self), fields(dataset = ?query.dataset))]
    async fn search(&self, query: &DataQuery) -> Result<SearchResponse, SourceError> {
        let endpoint = query.dataset.endpoint().to_string();
        let attempts = self.max_retries + 1;
        let mut last_status = 0u16;

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = self.retry_backoff * 2u32.saturating_pow(attempt - 2);
                debug!(attempt, ?delay, "Retrying data source request");
                tokio::time::sleep(delay).await;
            }

            let response = match self.request_for(query).send().await {
                Ok(response) => response,
                Err(e) if attempt < attempts => {
                    warn!(attempt, error = %e, "Data source request failed");
                    continue;
                }
                Err(e) => {
                    return Err(SourceError::Transport {
                        endpoint,
                        message: e.to_string(),
                    })
                }
            };

            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                // openFDA answers 404 when a search matches nothing
                debug!("No matching records");
                return Ok(SearchResponse::default());
            }
            if Self::is_transient(status) {
                warn!(attempt, status = status.as_u16(), "Data source temporarily unavailable");
                last_status = status.as_u16();
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SourceError::Rejected {
                    endpoint,
                    status: status.as_u16(),
                    body,
                });
            }

            let envelope: OpenFdaEnvelope =
                response.json().await.map_err(|e| SourceError::Decode {
                    endpoint: endpoint.clone(),
                    message: e.to_string(),
                })?;
            let total = envelope
                .meta
                .and_then(|meta| meta.results)
                .map(|paging| paging.total)
                .unwrap_or(envelope.results.len() as u64);

            debug!(records = envelope.results.len(), total, "Data source search complete");
            return Ok(SearchResponse {
                records: envelope.results,
                total,
            });
        }

        Err(SourceError::Exhausted {
            endpoint,
            attempts,
            status: last_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::IntentCategory;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> DataSourceConfig {
        DataSourceConfig {
            base_url: base_url.to_string(),
            max_retries: 2,
            retry_backoff_ms: 1,
            request_timeout_seconds: 5,
            ..DataSourceConfig::default()
        }
    }

    fn recall_query() -> DataQuery {
        let intent = Intent::new(IntentCategory::Recalls, ["recalls_collector"])
            .with_entities(["Medtronic", "insulin pump"]);
        DataQuery::for_intent(Dataset::Recalls, &intent, 10)
    }

    #[test]
    fn test_query_targets_firm_and_device_fields() {
        let query = recall_query();
        let search = query.search.unwrap();
        assert!(search.contains("recalling_firm:\"Medtronic\""));
        assert!(search.contains("product_description:\"insulin pump\""));
        assert_eq!(query.limit, 10);
    }

    #[test]
    fn test_query_keeps_punctuation_inside_phrases() {
        let intent = Intent::new(IntentCategory::Recalls, ["recalls_collector"])
            .with_entities(["Johnson & Johnson", "B. Braun"]);
        let query = DataQuery::for_intent(Dataset::Recalls, &intent, 10);
        assert_eq!(
            query.search.as_deref(),
            Some("recalling_firm:\"Johnson & Johnson\" OR recalling_firm:\"B. Braun\"")
        );
        assert_eq!(escape_term("a \"quoted\" \\name"), "a quoted name");
    }

    #[test]
    fn test_query_without_entities_lists_recent_records() {
        let intent = Intent::new(IntentCategory::General, ["events_collector"]);
        let query = DataQuery::for_intent(Dataset::AdverseEvents, &intent, 5000);
        assert_eq!(query.search, None);
        assert_eq!(query.limit, MAX_PAGE_SIZE);
    }

    #[tokio::test]
    async fn test_search_parses_records_and_total() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/device/recall.json"))
            .and(query_param("limit", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "meta": { "results": { "skip": 0, "limit": 10, "total": 42 } },
                "results": [ { "recall_number": "Z-1" }, { "recall_number": "Z-2" } ]
            })))
            .mount(&server)
            .await;

        let client = OpenFdaClient::new(&config(&server.uri())).unwrap();
        let response = client.search(&recall_query()).await.unwrap();
        assert_eq!(response.records.len(), 2);
        assert_eq!(response.total, 42);
    }

    #[tokio::test]
    async fn test_query_string_is_form_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/device/recall.json"))
            .and(|req: &wiremock::Request| {
                let pairs: Vec<(String, String)> = req.url.query_pairs().into_owned().collect();
                pairs
                    == vec![
                        ("limit".to_string(), "10".to_string()),
                        ("search".to_string(), "recalling_firm:\"Johnson & Johnson\"".to_string()),
                        ("api_key".to_string(), "k+y&limit=1".to_string()),
                    ]
            })
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [ { "recall_number": "Z-9" } ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenFdaClient::new(&DataSourceConfig {
            api_key: Some("k+y&limit=1".to_string()),
            ..config(&server.uri())
        })
        .unwrap();
        let intent = Intent::new(IntentCategory::Recalls, ["recalls_collector"])
            .with_entities(["Johnson & Johnson"]);
        let response = client
            .search(&DataQuery::for_intent(Dataset::Recalls, &intent, 10))
            .await
            .unwrap();
        assert_eq!(response.records.len(), 1);
        assert_eq!(response.total, 1);
    }

    #[tokio::test]
    async fn test_not_found_means_no_matches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = OpenFdaClient::new(&config(&server.uri())).unwrap();
        let response = client.search(&recall_query()).await.unwrap();
        assert!(response.records.is_empty());
        assert_eq!(response.total, 0);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_then_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = OpenFdaClient::new(&config(&server.uri())).unwrap();
        let err = client.search(&recall_query()).await.unwrap_err();
        assert!(matches!(
            err,
            SourceError::Exhausted { attempts: 3, status: 503, .. }
        ));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad search"))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenFdaClient::new(&config(&server.uri())).unwrap();
        let err = client.search(&recall_query()).await.unwrap_err();
        assert!(matches!(err, SourceError::Rejected { status: 400, .. }));
    }
}
