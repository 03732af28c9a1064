//! Tool Client (C3): a uniform `Execute(toolName, input)` call to the
//! external tool backend, with per-tool field remapping applied on the
//! way out and undone on the way back (§4.3).

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    NotFound,
    Unauthorized,
    Upstream,
    Timeout,
    Malformed,
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Renames applied to a request's top-level fields before it leaves this
/// client, and undone on the matching response field (e.g. the tool
/// backend's `accountId` vs. this system's internal `accountNumber`).
#[derive(Debug, Clone, Default)]
pub struct FieldRemap {
    /// internal name -> upstream name
    request: HashMap<String, String>,
}

impl FieldRemap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rename(mut self, internal_name: impl Into<String>, upstream_name: impl Into<String>) -> Self {
        self.request.insert(internal_name.into(), upstream_name.into());
        self
    }

    fn apply_to_request(&self, input: &Value) -> Value {
        remap_object(input, &self.request)
    }

    fn undo_on_response(&self, result: &Value) -> Value {
        let reversed: HashMap<String, String> =
            self.request.iter().map(|(k, v)| (v.clone(), k.clone())).collect();
        remap_object(result, &reversed)
    }
}

fn remap_object(value: &Value, renames: &HashMap<String, String>) -> Value {
    let Some(obj) = value.as_object() else {
        return value.clone();
    };
    let mut out = Map::with_capacity(obj.len());
    for (key, val) in obj {
        let target_key = renames.get(key).cloned().unwrap_or_else(|| key.clone());
        out.insert(target_key, val.clone());
    }
    Value::Object(out)
}

pub struct ToolOutcome {
    pub success: bool,
    pub result: Option<Value>,
}

pub struct ToolClient {
    http: reqwest::Client,
    base_url: String,
    remaps: HashMap<String, FieldRemap>,
}

impl ToolClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            remaps: HashMap::new(),
        }
    }

    pub fn with_remap(mut self, tool_name: impl Into<String>, remap: FieldRemap) -> Self {
        self.remaps.insert(tool_name.into(), remap);
        self
    }

    pub async fn execute(&self, tool_name: &str, input: Value) -> Result<ToolOutcome, ToolError> {
        let remap = self.remaps.get(tool_name);
        let payload = remap.map(|r| r.apply_to_request(&input)).unwrap_or(input);

        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), tool_name);
        let resp = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ToolError::new(ToolErrorKind::Timeout, format!("{tool_name} timed out"))
                } else {
                    ToolError::new(ToolErrorKind::Upstream, e.to_string())
                }
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ToolError::new(ToolErrorKind::NotFound, format!("tool not found: {tool_name}")));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ToolError::new(ToolErrorKind::Unauthorized, format!("unauthorized calling {tool_name}")));
        }
        if !status.is_success() {
            return Err(ToolError::new(ToolErrorKind::Upstream, format!("{tool_name} returned {status}")));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ToolError::new(ToolErrorKind::Malformed, e.to_string()))?;

        let result = remap.map(|r| r.undo_on_response(&body)).unwrap_or(body);
        Ok(ToolOutcome {
            success: true,
            result: Some(result),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn execute_remaps_request_field_and_undoes_on_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/check_balance"))
            .and(body_json(json!({"accountId": "12345678"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accountId": "12345678", "balance": 450})))
            .mount(&server)
            .await;

        let client = ToolClient::new(server.uri())
            .with_remap("check_balance", FieldRemap::new().rename("accountNumber", "accountId"));

        let outcome = client
            .execute("check_balance", json!({"accountNumber": "12345678"}))
            .await
            .unwrap();

        assert!(outcome.success);
        let result = outcome.result.unwrap();
        assert_eq!(result["accountNumber"], "12345678");
        assert_eq!(result["balance"], 450);
    }

    #[tokio::test]
    async fn execute_unknown_tool_returns_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ghost_tool"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = ToolClient::new(server.uri());
        let err = client.execute("ghost_tool", json!({})).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::NotFound);
    }

    #[tokio::test]
    async fn execute_upstream_server_error_is_upstream_kind() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = ToolClient::new(server.uri());
        let err = client.execute("flaky", json!({})).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Upstream);
    }

    #[test]
    fn field_remap_round_trips_unmapped_fields() {
        let remap = FieldRemap::new().rename("accountNumber", "accountId");
        let request = remap.apply_to_request(&json!({"accountNumber": "1", "other": "x"}));
        assert_eq!(request["accountId"], "1");
        assert_eq!(request["other"], "x");
        assert!(request.get("accountNumber").is_none());

        let response = remap.undo_on_response(&json!({"accountId": "1", "balance": 5}));
        assert_eq!(response["accountNumber"], "1");
        assert_eq!(response["balance"], 5);
    }
}
