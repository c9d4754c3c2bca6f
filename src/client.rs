//! Structured chat-completion client.
//!
//! Issues exactly one completion call per request against an
//! OpenAI-compatible endpoint, with decoding constrained server-side via
//! the `guided_grammar` / `guided_json` extension fields. No retry policy:
//! a generation call is not idempotent, so failures surface to the caller
//! and the caller decides whether to re-submit.

use crate::cache::{ArtifactCache, ArtifactError};
use crate::config::{ClientConfig, Constraint};
use crate::protocol::{ErrorBody, Request};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Transport seam for chat completions.
///
/// The server and one-shot paths go through this trait, so tests can script
/// endpoint replies without a live server. Timeouts belong to the transport;
/// callers see them as ordinary failures.
#[async_trait]
pub trait ChatCompletions {
    /// Issue one completion and return the first choice's content.
    async fn complete(&self, request: &ChatRequest) -> Result<String>;
}

/// HTTP transport to an OpenAI-compatible endpoint.
pub struct HttpEndpoint {
    client: Client,
    chat_url: String,
    models_url: String,
    api_key: String,
}

impl HttpEndpoint {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        let base = config.base_url.trim_end_matches('/');
        Ok(Self {
            client,
            chat_url: format!("{}/chat/completions", base),
            models_url: format!("{}/models", base),
            api_key: config.api_key.clone(),
        })
    }

    /// Verify the endpoint answers on its model-listing route.
    pub async fn probe(&self) -> Result<()> {
        let response = self
            .client
            .get(&self.models_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", self.models_url))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Endpoint returned {} for {}",
                response.status(),
                self.models_url
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatCompletions for HttpEndpoint {
    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let response = self
            .client
            .post(&self.chat_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", self.chat_url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            // OpenAI-compatible servers wrap failures as {"error":{"message":..}};
            // fall back to the raw body for anything else.
            let message = serde_json::from_str::<EndpointError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(anyhow!(
                "Endpoint request failed with status {}: {}",
                status,
                message
            ));
        }

        let completion: ChatResponse = response
            .json()
            .await
            .context("Failed to parse chat completion response")?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.unwrap_or_default())
            .ok_or_else(|| anyhow!("Chat completion had no choices"))
    }
}

/// Warm client: fixed mode, preloaded default artifacts, one transport.
pub struct StructuredClient<E> {
    endpoint: E,
    config: ClientConfig,
}

impl StructuredClient<HttpEndpoint> {
    /// Build a client over a real HTTP endpoint, logging the model and mode
    /// once it is ready.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let endpoint = HttpEndpoint::new(&config)?;
        info!("initialized (model={}, mode={})", config.model, config.mode());
        Ok(Self::with_endpoint(endpoint, config))
    }
}

impl<E: ChatCompletions> StructuredClient<E> {
    pub fn with_endpoint(endpoint: E, config: ClientConfig) -> Self {
        Self { endpoint, config }
    }

    /// Run one structured completion for `request`.
    ///
    /// `Err` carries the wire error envelope: endpoint and artifact
    /// failures map to `exception`, unparseable output to
    /// `non_json_output`. Overrides apply to this request only.
    pub async fn infer(
        &self,
        request: &Request,
        cache: &mut ArtifactCache,
    ) -> Result<Value, ErrorBody> {
        let constraint = self.request_constraint(request, cache)?;
        let system = request
            .system
            .as_deref()
            .or(self.config.system_text.as_deref());
        let assistant = request
            .assistant
            .as_deref()
            .or(self.config.assistant_text.as_deref());

        let (guided_grammar, guided_json) = match constraint {
            Constraint::Grammar(text) => (Some(text), None),
            Constraint::Schema(schema) => (None, Some(schema)),
        };
        let chat = ChatRequest {
            model: self.config.model.clone(),
            messages: build_messages(&request.user, system, assistant),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            guided_grammar,
            guided_json,
        };

        debug!("dispatching completion for {} message(s)", chat.messages.len());
        let raw = match self.endpoint.complete(&chat).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!("inference call failed: {:#}", err);
                return Err(ErrorBody::exception(format!("{:#}", err)));
            }
        };
        coerce_json(&raw)
    }

    /// Resolve the constraint for one request: inline override, then path
    /// override through the cache, then the configured default. Fields for
    /// the inactive mode are ignored.
    fn request_constraint(
        &self,
        request: &Request,
        cache: &mut ArtifactCache,
    ) -> Result<Constraint, ErrorBody> {
        match &self.config.constraint {
            Constraint::Grammar(default) => {
                if let Some(text) = &request.grammar {
                    return Ok(Constraint::Grammar(text.clone()));
                }
                if let Some(path) = &request.grammar_path {
                    let text = cache.grammar_text(path).map_err(artifact_error)?;
                    return Ok(Constraint::Grammar(text.to_string()));
                }
                Ok(Constraint::Grammar(default.clone()))
            }
            Constraint::Schema(default) => {
                if let Some(schema) = &request.json_schema {
                    return Ok(Constraint::Schema(schema.clone()));
                }
                if let Some(path) = &request.json_schema_path {
                    let schema = cache.schema_object(path).map_err(artifact_error)?;
                    return Ok(Constraint::Schema(schema.clone()));
                }
                Ok(Constraint::Schema(default.clone()))
            }
        }
    }
}

/// Assemble the message sequence: optional system entry, optional assistant
/// entry, then exactly one user entry. A role is included only when its
/// effective text is non-empty, so an explicit empty override suppresses
/// that role for the request.
pub fn build_messages(
    user: &str,
    system: Option<&str>,
    assistant: Option<&str>,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(3);
    if let Some(text) = system.filter(|text| !text.is_empty()) {
        messages.push(ChatMessage::new("system", text));
    }
    if let Some(text) = assistant.filter(|text| !text.is_empty()) {
        messages.push(ChatMessage::new("assistant", text));
    }
    messages.push(ChatMessage::new("user", user));
    messages
}

/// Parse the endpoint's text output as JSON.
///
/// The endpoint is expected to honor the decoding constraint, so a parse
/// failure signals a constraint violation or empty output. It degrades to
/// an error envelope instead of tearing down the caller.
fn coerce_json(raw: &str) -> Result<Value, ErrorBody> {
    let trimmed = raw.trim();
    match serde_json::from_str(trimmed) {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!("endpoint output is not JSON: {}", err);
            Err(ErrorBody::non_json_output(trimmed))
        }
    }
}

fn artifact_error(err: ArtifactError) -> ErrorBody {
    let detail = format!("{:#}", anyhow::Error::new(err));
    warn!("artifact load failed: {}", detail);
    ErrorBody::exception(detail)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub(crate) model: String,
    pub(crate) messages: Vec<ChatMessage>,
    pub(crate) temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) guided_grammar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) guided_json: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub(crate) role: String,
    pub(crate) content: String,
}

impl ChatMessage {
    fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndpointError {
    error: EndpointErrorDetail,
}

#[derive(Debug, Deserialize)]
struct EndpointErrorDetail {
    message: String,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// One canned endpoint reply.
    pub(crate) enum Reply {
        Content(&'static str),
        Fail(&'static str),
    }

    /// Scripted transport that records every request it receives.
    pub(crate) struct ScriptedEndpoint {
        replies: Mutex<VecDeque<Reply>>,
        pub(crate) requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedEndpoint {
        pub(crate) fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatCompletions for ScriptedEndpoint {
        async fn complete(&self, request: &ChatRequest) -> Result<String> {
            self.requests.lock().unwrap().push(request.clone());
            match self.replies.lock().unwrap().pop_front() {
                Some(Reply::Content(text)) => Ok(text.to_string()),
                Some(Reply::Fail(message)) => Err(anyhow!("{}", message)),
                None => Err(anyhow!("no scripted reply left")),
            }
        }
    }

    pub(crate) fn test_config(constraint: Constraint) -> ClientConfig {
        ClientConfig {
            base_url: "http://127.0.0.1:8000/v1".to_string(),
            api_key: "not-used".to_string(),
            model: "meta/llama-3.2-3b-instruct".to_string(),
            system_text: None,
            assistant_text: None,
            constraint,
            temperature: 0.0,
            max_tokens: None,
        }
    }
}
