//! reqwest-backed read and write endpoints.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::{debug, warn};

use super::{Fetcher, WriteEndpoint, WriteRequest};
use crate::config::{BackendConfig, FieldGroupConfig, StreamConfig, WriteMethod};
use crate::error::SyncError;
use crate::model::{scalar_text, FieldGroup};

/// Envelope keys that may carry the record array, in lookup order.
const ENVELOPE_KEYS: [&str; 4] = ["data", "events", "items", "results"];

/// Header carrying the pending write's correlation id.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Build the shared HTTP client for a backend.
pub fn build_client(backend: &BackendConfig) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_millis(backend.request_timeout_ms))
        .user_agent(concat!("guardsync/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

// ---------------------------------------------------------------------------
// Read endpoint
// ---------------------------------------------------------------------------

/// Polls a JSON collection endpoint.
pub struct HttpFetcher {
    client: Client,
    url: String,
    token: Option<String>,
    limit: Option<usize>,
    items_pointer: Option<String>,
}

impl HttpFetcher {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            token: None,
            limit: None,
            items_pointer: None,
        }
    }

    /// Build a fetcher for a configured stream.
    pub fn for_stream(client: Client, backend: &BackendConfig, stream: &StreamConfig) -> Self {
        let mut fetcher = Self::new(client, join_url(&backend.base_url, &stream.path));
        fetcher.token = backend.token.clone();
        fetcher.limit = stream.limit;
        fetcher.items_pointer = stream.items_pointer.clone();
        fetcher
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_items_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.items_pointer = Some(pointer.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self) -> Result<Vec<Value>, SyncError> {
        let mut request = self.client.get(&self.url);
        if let Some(limit) = self.limit {
            request = request.query(&[("limit", limit)]);
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(SyncError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::rejected(status.as_u16(), &body));
        }

        let body: Value = response.json().await.map_err(SyncError::from_reqwest)?;
        extract_items(body, self.items_pointer.as_deref()).inspect_err(|e| {
            if matches!(e, SyncError::MalformedResponse(_)) {
                warn!(url = %self.url, error = %e, "read endpoint returned an unexpected body");
            }
        })
    }
}

/// Pull the record array out of a read response body.
///
/// Accepts a bare array, an explicit JSON pointer, or an envelope object
/// carrying the array under one of the usual keys. An envelope with
/// `"success": false` is a rejection.
pub fn extract_items(mut body: Value, pointer: Option<&str>) -> Result<Vec<Value>, SyncError> {
    reject_failed_envelope(&body)?;

    if let Some(pointer) = pointer {
        return match body.pointer_mut(pointer).map(Value::take) {
            Some(Value::Array(items)) => Ok(items),
            Some(other) => Err(SyncError::MalformedResponse(format!(
                "value at '{pointer}' is {}, expected an array",
                kind(&other)
            ))),
            None => Err(SyncError::MalformedResponse(format!(
                "response has no value at '{pointer}'"
            ))),
        };
    }

    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            for key in ENVELOPE_KEYS {
                if let Some(Value::Array(items)) = map.remove(key) {
                    return Ok(items);
                }
            }
            Err(SyncError::MalformedResponse(
                "object body carries no record array".to_string(),
            ))
        }
        other => Err(SyncError::MalformedResponse(format!(
            "expected an array or envelope object, got {}",
            kind(&other)
        ))),
    }
}

fn reject_failed_envelope(body: &Value) -> Result<(), SyncError> {
    if body.get("success") == Some(&Value::Bool(false)) {
        let message = ["error", "message", "detail"]
            .iter()
            .find_map(|key| body.get(*key).and_then(scalar_text))
            .unwrap_or_else(|| "backend reported failure".to_string());
        return Err(SyncError::ServerRejected {
            status: None,
            message,
        });
    }
    Ok(())
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Write endpoint
// ---------------------------------------------------------------------------

/// Where a field-group is written and read back.
#[derive(Debug, Clone)]
pub struct WriteRoute {
    pub method: Method,
    pub write_url: String,
    pub read_url: Option<String>,
    /// JSON pointer to the group's value inside responses.
    pub value_pointer: Option<String>,
}

/// Writes field-groups to the backend and reads them back.
pub struct HttpWriteEndpoint {
    client: Client,
    token: Option<String>,
    routes: HashMap<FieldGroup, WriteRoute>,
}

impl HttpWriteEndpoint {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            token: None,
            routes: HashMap::new(),
        }
    }

    /// Build an endpoint with one route per configured field-group.
    pub fn from_config(
        client: Client,
        backend: &BackendConfig,
        groups: &[FieldGroupConfig],
    ) -> Self {
        let mut endpoint = Self::new(client);
        endpoint.token = backend.token.clone();
        for group in groups {
            let method = match group.write_method {
                WriteMethod::Post => Method::POST,
                WriteMethod::Put => Method::PUT,
            };
            endpoint.routes.insert(
                FieldGroup::new(group.name.clone()),
                WriteRoute {
                    method,
                    write_url: join_url(&backend.base_url, &group.write_path),
                    read_url: group
                        .read_path
                        .as_deref()
                        .map(|p| join_url(&backend.base_url, p)),
                    value_pointer: group.value_pointer.clone(),
                },
            );
        }
        endpoint
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn route(mut self, group: impl Into<FieldGroup>, route: WriteRoute) -> Self {
        self.routes.insert(group.into(), route);
        self
    }

    fn route_for(&self, group: &FieldGroup) -> Result<&WriteRoute, SyncError> {
        self.routes.get(group).ok_or_else(|| SyncError::ServerRejected {
            status: None,
            message: format!("no route configured for field-group '{group}'"),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, SyncError> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await.map_err(SyncError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::rejected(status.as_u16(), &body));
        }
        response.json().await.map_err(SyncError::from_reqwest)
    }
}

#[async_trait::async_trait]
impl WriteEndpoint for HttpWriteEndpoint {
    async fn write(&self, request: &WriteRequest) -> Result<Value, SyncError> {
        let route = self.route_for(&request.group)?;
        debug!(group = %request.group, write_id = %request.id, url = %route.write_url, "sending write");

        let builder = self
            .client
            .request(route.method.clone(), &route.write_url)
            .header(REQUEST_ID_HEADER, request.id.to_string())
            .json(&request.fields);
        let body = self.send(builder).await?;

        extract_value(body, route.value_pointer.as_deref())?.ok_or_else(|| {
            warn!(group = %request.group, url = %route.write_url, "write response carried no value");
            SyncError::MalformedResponse("write response carried no value".to_string())
        })
    }

    async fn read(&self, group: &FieldGroup) -> Result<Option<Value>, SyncError> {
        let route = self.route_for(group)?;
        let Some(url) = &route.read_url else {
            return Ok(None);
        };
        let body = self.send(self.client.get(url)).await?;
        extract_value(body, route.value_pointer.as_deref())
    }
}

/// Pull a field-group value out of a response body.
///
/// Uses `pointer` when given, otherwise a `data` envelope, otherwise the
/// whole body. Null and missing values are `None`.
pub fn extract_value(mut body: Value, pointer: Option<&str>) -> Result<Option<Value>, SyncError> {
    reject_failed_envelope(&body)?;

    let value = match pointer {
        Some(pointer) => body.pointer_mut(pointer).map(Value::take),
        None => match body.get_mut("data") {
            Some(data) => Some(data.take()),
            None => Some(body),
        },
    };
    Ok(value.filter(|v| !v.is_null()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bare_array_body() {
        let items = extract_items(json!([{"id": 1}, {"id": 2}]), None).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_live_feed_envelope() {
        let body = json!({
            "success": true,
            "total_events": 1,
            "events": [{"id": "evt-1", "severity": "low"}],
            "last_updated": "2026-01-01T00:00:00Z"
        });
        let items = extract_items(body, None).unwrap();
        assert_eq!(items, vec![json!({"id": "evt-1", "severity": "low"})]);
    }

    #[test]
    fn test_explicit_pointer() {
        let body = json!({"tree": {"roots": [{"pid": 4}]}});
        let items = extract_items(body, Some("/tree/roots")).unwrap();
        assert_eq!(items[0]["pid"], 4);
    }

    #[test]
    fn test_pointer_to_non_array_is_malformed() {
        let err = extract_items(json!({"tree": {"roots": 3}}), Some("/tree/roots")).unwrap_err();
        assert!(matches!(err, SyncError::MalformedResponse(_)));
    }

    #[test]
    fn test_success_false_is_rejected() {
        let err = extract_items(json!({"success": false, "error": "license expired"}), None)
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::ServerRejected {
                status: None,
                message: "license expired".to_string()
            }
        );
    }

    #[test]
    fn test_scalar_body_is_malformed() {
        let err = extract_items(json!("nope"), None).unwrap_err();
        assert!(matches!(err, SyncError::MalformedResponse(_)));
    }

    #[test]
    fn test_extract_value_unwraps_data() {
        let value = extract_value(json!({"data": {"threat_threshold": 90}}), None).unwrap();
        assert_eq!(value, Some(json!({"threat_threshold": 90})));
    }

    #[test]
    fn test_extract_value_missing_pointer_is_none() {
        let value = extract_value(json!({"enabled": true}), Some("/paths")).unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("http://localhost:8000/", "/api/ai/live-feed"),
            "http://localhost:8000/api/ai/live-feed"
        );
    }
}
