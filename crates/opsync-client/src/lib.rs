//! OpenProject work-package query building and the single-page HTTP fetch.

use std::time::Duration;

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "opsync-client";

/// Header carrying the API key on every request.
pub const API_KEY_HEADER: &str = "X-OpenProject-API-Key";

/// Basic-auth user name OpenProject expects alongside an API key password.
pub const BASIC_AUTH_USER: &str = "apikey";

/// Sort order attached to every query. Not configurable.
pub const SORT_BY: &[(&str, &str)] = &[
    ("priority", "desc"),
    ("dueDate", "asc"),
    ("startDate", "asc"),
    ("status", "desc"),
    ("type", "desc"),
    ("percentageDone", "desc"),
    ("assignee", "desc"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Condition {
    operator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    values: Option<Vec<String>>,
}

/// One `{"<field>": {"operator": ..., "values": [...]}}` entry of the filter array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPredicate {
    field: String,
    condition: Condition,
}

impl FilterPredicate {
    pub fn new(field: &str, operator: &str, values: Option<Vec<String>>) -> Self {
        Self {
            field: field.to_string(),
            condition: Condition {
                operator: operator.to_string(),
                values,
            },
        }
    }

    pub fn status_open() -> Self {
        Self::new("status", "o", None)
    }

    pub fn assignee_is_me() -> Self {
        Self::new("assignee", "=", Some(vec!["me".to_string()]))
    }

    pub fn project_equals(project_id: &str) -> Self {
        Self::new("project", "=", Some(vec![project_id.to_string()]))
    }

    pub fn field(&self) -> &str {
        &self.field
    }
}

impl Serialize for FilterPredicate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.field, &self.condition)?;
        map.end()
    }
}

/// ANDed predicates, serialized as the JSON array the `filters` parameter takes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct FilterExpression {
    predicates: Vec<FilterPredicate>,
}

impl FilterExpression {
    pub fn predicates(&self) -> &[FilterPredicate] {
        &self.predicates
    }

    pub fn to_query_value(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "[]".to_string())
    }
}

/// Open work packages, optionally narrowed to the caller and to one project.
/// An empty project id is treated as unset.
pub fn build_filter(only_assigned: bool, project_id: Option<&str>) -> FilterExpression {
    let mut predicates = vec![FilterPredicate::status_open()];
    if only_assigned {
        predicates.push(FilterPredicate::assignee_is_me());
    }
    if let Some(project_id) = project_id.filter(|p| !p.is_empty()) {
        predicates.push(FilterPredicate::project_equals(project_id));
    }
    FilterExpression { predicates }
}

pub fn sort_by_query_value() -> String {
    let pairs = SORT_BY
        .iter()
        .map(|(field, direction)| [*field, *direction])
        .collect::<Vec<_>>();
    serde_json::to_string(&pairs).unwrap_or_else(|_| "[]".to_string())
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("building http client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub verify_ssl: bool,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            verify_ssl: true,
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CollectionEnvelope {
    #[serde(rename = "_embedded")]
    embedded: EmbeddedElements,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EmbeddedElements {
    elements: Vec<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct OpenProjectClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenProjectClient {
    pub fn new(config: ClientConfig) -> Result<Self, RemoteError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_ssl);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(RemoteError::ClientBuild)?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The work-package collection endpoint (`<base>/`).
    pub fn endpoint(&self) -> String {
        format!("{}/", self.base_url)
    }

    pub fn query_params(filter: &FilterExpression, limit: Option<u32>) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("sortBy", sort_by_query_value()),
            ("filters", filter.to_query_value()),
        ];
        if let Some(limit) = limit {
            params.push(("pageSize", limit.to_string()));
        }
        params
    }

    /// Fetches one page of work packages and returns the raw `elements`.
    ///
    /// Only the first page is read: items beyond `limit` (or the server's
    /// default page size) are omitted.
    pub async fn find_work_packages(
        &self,
        filter: &FilterExpression,
        limit: Option<u32>,
    ) -> Result<Vec<JsonValue>, RemoteError> {
        let url = self.endpoint();
        let span = info_span!("fetch_work_packages", url = %url, limit = ?limit);
        async {
            let mut request = self
                .client
                .get(&url)
                .query(&Self::query_params(filter, limit));
            if !self.api_key.is_empty() {
                request = request
                    .header(API_KEY_HEADER, &self.api_key)
                    .basic_auth(BASIC_AUTH_USER, Some(&self.api_key));
            }

            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(RemoteError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?;
            let envelope: CollectionEnvelope =
                serde_json::from_slice(&body).map_err(|e| RemoteError::Malformed {
                    url: final_url.clone(),
                    reason: e.to_string(),
                })?;

            let elements = envelope.embedded.elements;
            debug!(" Found {} total.", elements.len());
            if let (Some(total), Some(count)) = (envelope.total, envelope.count) {
                if total > count {
                    warn!(total, count, "more work packages match than one page holds; the rest are skipped");
                }
            }
            Ok::<_, RemoteError>(elements)
        }
        .instrument(span)
        .await
    }
}
