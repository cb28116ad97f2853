//! Plan and change generation against an OpenAI-compatible chat API.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::plan::{Plan, parse_plan_response};
use crate::io::config::LlmConfig;
use crate::io::prompt::{ChangeRequest, PlanRequest, Prompt, PromptEngine};

pub const PLAN_TEMPERATURE: f32 = 0.1;
pub const CHANGE_TEMPERATURE: f32 = 0.2;

/// Source of plans and raw change payloads.
pub trait Generator {
    fn plan(&self, request: &PlanRequest) -> Result<Plan>;

    /// Raw model output expected to contain a change set. Parsing is the
    /// applicator's job.
    fn generate_changes(&self, request: &ChangeRequest) -> Result<String>;
}

impl<T: Generator + ?Sized> Generator for &T {
    fn plan(&self, request: &PlanRequest) -> Result<Plan> {
        (**self).plan(request)
    }

    fn generate_changes(&self, request: &ChangeRequest) -> Result<String> {
        (**self).generate_changes(request)
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

pub struct ChatGenerator {
    base_url: String,
    model: String,
    api_key: String,
    client: Client,
    prompts: PromptEngine,
}

impl ChatGenerator {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| anyhow!("LLM_API_KEY is required"))?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("build LLM HTTP client")?;
        Ok(Self {
            base_url: normalize_api_base(&config.base_url),
            model: config.model.clone(),
            api_key,
            client,
            prompts: PromptEngine::new()?,
        })
    }

    #[instrument(skip_all, fields(model = %self.model))]
    fn complete(&self, prompt: &Prompt, temperature: f32) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatCompletionRequest {
            model: &self.model,
            temperature,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
        };
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .context("request /chat/completions")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(anyhow!("POST /chat/completions failed: {status}\n{body}"));
        }

        let parsed: ChatCompletionResponse =
            resp.json().context("parse /chat/completions response")?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| anyhow!("chat completion returned no content"))?;
        debug!(chars = content.len(), "completion received");
        Ok(content)
    }
}

impl Generator for ChatGenerator {
    fn plan(&self, request: &PlanRequest) -> Result<Plan> {
        let prompt = self.prompts.render_plan(request)?;
        let text = self.complete(&prompt, PLAN_TEMPERATURE)?;
        parse_plan_response(&text).map_err(|err| anyhow!("unusable plan response: {err}"))
    }

    fn generate_changes(&self, request: &ChangeRequest) -> Result<String> {
        let prompt = self.prompts.render_changes(request)?;
        self.complete(&prompt, CHANGE_TEMPERATURE)
    }
}

/// Trim trailing slashes and make sure the base ends in `/v1`.
pub fn normalize_api_base(input: &str) -> String {
    let mut base = input.trim().trim_end_matches('/').to_string();
    if base.ends_with("/v1") {
        return base;
    }
    base.push_str("/v1");
    base
}
