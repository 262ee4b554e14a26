//! OpenAI 兼容 HTTP 传输
//!
//! 直接用 reqwest 调用 `{base_url}/chat/completions`：需要拿到原始状态码、错误体、Retry-After 与 reasoning_content，
//! 这些信息交给 RequestExecutor 做重试与分类。支持 DeepSeek、OpenAI、自建代理等任意兼容端点。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::{HeaderValue, RETRY_AFTER};

use crate::llm::{ChatCompletionRequest, ChatCompletionResponse, ChatTransport, TokenUsageSink, TransportError};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Token 使用统计（累计值，另按模型分别累计）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
    per_model: Arc<Mutex<HashMap<String, (u64, u64)>>>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }

    /// 某个模型的 (prompt, completion) 累计
    pub fn for_model(&self, model: &str) -> (u64, u64) {
        self.per_model
            .lock()
            .map(|m| m.get(model).copied().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl TokenUsageSink for TokenUsage {
    fn record(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) {
        self.add(prompt_tokens, completion_tokens);
        if let Ok(mut per_model) = self.per_model.lock() {
            let entry = per_model.entry(model.to_string()).or_default();
            entry.0 += prompt_tokens;
            entry.1 += completion_tokens;
        }
    }
}

/// OpenAI 兼容传输：持有 reqwest Client、完整 endpoint 与 API key
pub struct OpenAiTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl OpenAiTransport {
    /// base_url 为空时使用 OpenAI 官方地址；api_key 为空时回退 OPENAI_API_KEY
    pub fn new(base_url: Option<&str>, api_key: Option<&str>) -> Self {
        let base = base_url
            .filter(|u| !u.trim().is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.is_empty());
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/chat/completions", base),
            api_key,
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

#[async_trait]
impl ChatTransport for OpenAiTransport {
    async fn send(&self, request: &ChatCompletionRequest) -> Result<ChatCompletionResponse, TransportError> {
        let mut builder = self.client.post(&self.endpoint).json(&request.to_wire_json());
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder.send().await.map_err(|e| TransportError::Network {
            message: e.to_string(),
            timed_out: e.is_timeout(),
        })?;

        let status = resp.status();
        let retry_after_secs = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
        let body = resp.text().await.map_err(|e| TransportError::Network {
            message: format!("failed reading response body: {}", e),
            timed_out: e.is_timeout(),
        })?;

        if !status.is_success() {
            tracing::debug!(status = status.as_u16(), endpoint = %self.endpoint, "chat completion returned error status");
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
                retry_after_secs,
            });
        }

        ChatCompletionResponse::from_wire_json(&body).map_err(|e| TransportError::Decode(e.to_string()))
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Retry-After：整数秒或 HTTP 日期
pub fn parse_retry_after_seconds(header: Option<&HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    let delta = retry_at.signed_duration_since(Utc::now()).num_seconds();
    Some(delta.max(0) as u64)
}
