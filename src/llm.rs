use std::collections::BTreeSet;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AnalyzeError;
use crate::notify::report::{Narrator, ReportDigest};
use crate::prompts;
use crate::scoring::{Analysis, Analyzer};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }

    fn user(content: String) -> Self {
        Self {
            role: "user".to_string(),
            content,
        }
    }
}

/// OpenAI-compatible chat client used as the significance analyzer and the
/// report narrator.
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl LlmClient {
    pub fn from_env() -> Result<Self> {
        let base_url = dotenv::var("LLM_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:1234/v1".to_string());
        let model =
            dotenv::var("LLM_MODEL").unwrap_or_else(|_| "qwen/qwen3-8b".to_string());
        let api_key = dotenv::var("LLM_API_KEY").ok().filter(|k| !k.is_empty());

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            model,
            api_key,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Resolve the chat completions endpoint from the base URL.
    fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else if base.ends_with("/v1") {
            format!("{}/chat/completions", base)
        } else {
            format!("{}/v1/chat/completions", base)
        }
    }

    /// Non-streaming chat completion.
    pub async fn chat(&self, messages: &[Message], temperature: f32, max_tokens: u32) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        let mut req = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let resp = req
            .send()
            .await
            .context("LLM request failed")?
            .error_for_status()
            .context("LLM returned an error status")?;
        let text = resp.text().await.context("Failed to read LLM response")?;
        let json: serde_json::Value =
            serde_json::from_str(&text).context("Failed to parse LLM JSON")?;

        // Extract content from choices[0].message.content (handle null)
        let content = json["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .unwrap_or("")
            .to_string();

        Ok(content)
    }
}

#[async_trait]
impl Analyzer for LlmClient {
    async fn analyze(&self, text: &str, keywords: &BTreeSet<String>) -> Result<Analysis, AnalyzeError> {
        let messages = [
            Message::system(prompts::ANALYSIS_SYSTEM_PROMPT),
            Message::user(prompts::analysis_prompt(text, keywords)),
        ];
        let response = self
            .chat(&messages, 0.3, 400)
            .await
            .map_err(|e| AnalyzeError::Request(format!("{e:#}")))?;
        parse_analysis(&response)
    }
}

#[async_trait]
impl Narrator for LlmClient {
    async fn narrate(&self, digest: &ReportDigest) -> Result<String, AnalyzeError> {
        let messages = [
            Message::system(prompts::REPORT_SYSTEM_PROMPT),
            Message::user(prompts::report_prompt(digest)),
        ];
        let response = self
            .chat(&messages, 0.7, 2000)
            .await
            .map_err(|e| AnalyzeError::Request(format!("{e:#}")))?;
        Ok(strip_think(&response).trim().to_string())
    }
}

static JSON_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("json object pattern is valid"));
static LOOSE_SCORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"score["\s:]*([0-9.]+)"#).expect("score pattern is valid"));

#[derive(Deserialize)]
struct RawAnalysis {
    score: f64,
    #[serde(default)]
    summary: String,
}

/// Read `{"score", "summary"}` out of a model reply, tolerating code fences,
/// reasoning blocks and prose around the object. Falls back to a bare
/// `score: 0.7` style mention.
pub fn parse_analysis(response: &str) -> Result<Analysis, AnalyzeError> {
    let cleaned = strip_think(response);

    if let Some(object) = JSON_OBJECT.find(&cleaned) {
        if let Ok(raw) = serde_json::from_str::<RawAnalysis>(object.as_str()) {
            return Ok(Analysis {
                score: raw.score,
                summary: raw.summary.trim().to_string(),
            });
        }
    }

    let lower = cleaned.to_lowercase();
    let score = LOOSE_SCORE
        .captures(&lower)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().trim_end_matches('.').parse::<f64>().ok())
        .ok_or_else(|| AnalyzeError::Malformed(truncate(&cleaned, 200)))?;

    Ok(Analysis {
        score,
        summary: truncate(cleaned.trim(), 500),
    })
}

/// Drop `<think>...</think>` blocks emitted by reasoning models.
fn strip_think(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
