//! HTTP webhook executor

use super::{ActionContext, ActionExecutor, ActionResult};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};

/// Forwards an action to an HTTP endpoint.
///
/// The request body is `{"parameters": {...}, "context": {...}}`. A 2xx
/// response whose body is an `ActionResult` is returned as-is; any other 2xx
/// body becomes the `data` of a successful result. Non-2xx statuses and
/// transport failures become failed results.
pub struct WebhookExecutor {
    client: Client,
    name: String,
    description: String,
    url: String,
}

impl WebhookExecutor {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), name, url)
    }

    pub fn with_client(client: Client, name: impl Into<String>, url: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            client,
            description: format!("Call the {name} webhook"),
            name,
            url: url.into(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Map a webhook response body into a result
fn interpret_body(status: reqwest::StatusCode, body: &str) -> ActionResult {
    if !status.is_success() {
        let snippet: String = body.chars().take(200).collect();
        return ActionResult::failure(format!("HTTP {status}: {snippet}"));
    }

    if body.trim().is_empty() {
        return ActionResult::success(format!("HTTP {}", status.as_u16()));
    }

    if let Ok(result) = serde_json::from_str::<ActionResult>(body) {
        return result;
    }

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(data)) => ActionResult::success(format!("HTTP {}", status.as_u16())).with_data(data),
        Ok(other) => {
            let mut data = Map::new();
            data.insert("response".to_string(), other);
            ActionResult::success(format!("HTTP {}", status.as_u16())).with_data(data)
        }
        Err(_) => ActionResult::success(body.to_string()),
    }
}

#[async_trait]
impl ActionExecutor for WebhookExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    async fn execute(&self, parameters: Map<String, Value>, ctx: ActionContext) -> ActionResult {
        let body = json!({
            "parameters": parameters,
            "context": ctx.to_value(),
        });

        let response = match self.client.post(&self.url).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                let kind = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connection failed"
                } else {
                    "request failed"
                };
                tracing::warn!(action = %self.name, url = %self.url, error = %e, "Webhook {kind}");
                return ActionResult::failure(format!("{kind}: {e}"));
            }
        };

        let status = response.status();
        match response.text().await {
            Ok(text) => interpret_body(status, &text),
            Err(e) => ActionResult::failure(format!("failed to read response: {e}")),
        }
    }
}
