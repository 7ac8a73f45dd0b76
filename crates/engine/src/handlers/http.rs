use async_trait::async_trait;
use serde_json::json;

use fleetrun_core::domain::step::StepFamily;
use fleetrun_core::errors::{AdapterFamily, EngineError};

use super::{required_string_input, StepHandler, StepInvocation, StepOutput};

/// Direct HTTP request steps. The step budget becomes the request timeout,
/// so a stalled endpoint cannot outlive its deadline.
pub struct HttpRequestHandler {
    client: reqwest::Client,
}

impl HttpRequestHandler {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for HttpRequestHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub(crate) struct ParsedRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

pub(crate) fn parse_request(inputs: &serde_json::Value) -> Result<ParsedRequest, EngineError> {
    let url = required_string_input(inputs, "url")?.to_string();

    let method_raw = inputs.get("method").and_then(|value| value.as_str()).unwrap_or("GET");
    let method = method_raw
        .to_ascii_uppercase()
        .parse::<reqwest::Method>()
        .map_err(|_| EngineError::Validation {
            message: format!("unsupported HTTP method `{method_raw}`"),
        })?;

    let headers = inputs
        .get("headers")
        .and_then(|value| value.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(key, value)| {
                    value.as_str().map(|value| (key.clone(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ParsedRequest { method, url, headers, body: inputs.get("body").cloned() })
}

#[async_trait]
impl StepHandler for HttpRequestHandler {
    fn family(&self) -> StepFamily {
        StepFamily::Http
    }

    async fn invoke(&self, invocation: StepInvocation<'_>) -> Result<StepOutput, EngineError> {
        let request = parse_request(&invocation.inputs)?;

        let mut builder = self
            .client
            .request(request.method, &request.url)
            .timeout(invocation.deadline);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|error| EngineError::Adapter {
            family: AdapterFamily::Http,
            message: error.to_string(),
        })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|error| EngineError::Adapter {
            family: AdapterFamily::Http,
            message: error.to_string(),
        })?;
        let body = serde_json::from_str::<serde_json::Value>(&text)
            .unwrap_or(serde_json::Value::String(text));

        Ok(StepOutput::new(json!({ "status": status, "body": body })))
    }

    fn check_success(&self, output: &StepOutput) -> bool {
        output
            .data
            .get("status")
            .and_then(|value| value.as_u64())
            .map(|status| status < 400)
            .unwrap_or(false)
    }

    fn describe_error(&self, error: &EngineError) -> String {
        format!("http request failed: {error}")
    }
}
