//! Request Executor：单次 chat-completion 调用 + 有界重试 + 错误分类
//!
//! 先跑 Preprocessor，再经 ChatTransport 发请求（带超时）。
//! 可重试：无响应的网络错误（含本地超时）、HTTP 429、HTTP ≥500；其余状态码与用户中断一律不重试。
//! 退避为指数式（1s、2s、4s…），只发生在两次尝试之间；429 带 Retry-After 时以服务端为准。
//! 最终失败时把原始错误分类为 LlmError。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{ErrorDetail, LlmError};
use crate::llm::preprocess::preprocess;
use crate::llm::{ChatCompletionRequest, ChatCompletionResponse, ChatTransport, TokenUsageSink, TransportError};

/// 默认总尝试次数
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// 退避基数
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
/// 默认单次请求超时
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// 服务端 Retry-After 的上限（除非本轮退避本身更长）
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// 重试策略：max_retries 为总尝试次数（含首次）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_delay,
        }
    }

    /// 第 n 次尝试（从 1 计）失败后的等待时间：base * 2^(n-1)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(2u32.saturating_pow(exponent))
    }
}

/// 单次请求内的重试进度，不持久化
#[derive(Debug, Clone, Copy)]
pub struct RetryState {
    pub current_attempt: u32,
    pub max_retries: u32,
}

impl RetryState {
    fn new(config: &RetryConfig) -> Self {
        Self {
            current_attempt: 0,
            max_retries: config.max_retries.max(1),
        }
    }

    fn exhausted(&self) -> bool {
        self.current_attempt >= self.max_retries
    }
}

pub struct RequestExecutor {
    transport: Arc<dyn ChatTransport>,
    retry: RetryConfig,
    request_timeout: Duration,
    usage_sink: Option<Arc<dyn TokenUsageSink>>,
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            transport,
            retry: RetryConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            usage_sink: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_usage_sink(mut self, sink: Arc<dyn TokenUsageSink>) -> Self {
        self.usage_sink = Some(sink);
        self
    }

    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    /// 使用默认重试策略
    pub async fn chat_completion(
        &self,
        request: ChatCompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatCompletionResponse, LlmError> {
        let retry = self.retry;
        self.chat_completion_with_retry(request, &retry, cancel).await
    }

    pub async fn chat_completion_with_retry(
        &self,
        mut request: ChatCompletionRequest,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> Result<ChatCompletionResponse, LlmError> {
        request.messages = preprocess(&request.messages, &request.model);
        let mut state = RetryState::new(retry);

        loop {
            state.current_attempt += 1;
            if cancel.is_cancelled() {
                tracing::debug!("chat completion interrupted before attempt {}", state.current_attempt);
                return Err(LlmError::Interrupted);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("chat completion interrupted in flight");
                    return Err(LlmError::Interrupted);
                }
                r = tokio::time::timeout(self.request_timeout, self.transport.send(&request)) => r,
            };

            let err = match outcome {
                Ok(Ok(response)) => {
                    if response.is_truncated_empty() {
                        return Err(LlmError::TokenLimit(ErrorDetail::new(
                            self.endpoint(),
                            "response truncated by max_tokens before any content or tool call",
                        )));
                    }
                    self.record_usage(&request.model, &response);
                    return Ok(response);
                }
                Ok(Err(e)) => e,
                Err(_) => TransportError::Network {
                    message: format!("no response within {}s", self.request_timeout.as_secs()),
                    timed_out: true,
                },
            };

            if !is_retryable(&err) || state.exhausted() {
                let classified = classify(&err, self.endpoint());
                tracing::warn!(
                    attempt = state.current_attempt,
                    max_retries = state.max_retries,
                    kind = classified.kind(),
                    "chat completion failed: {}",
                    classified
                );
                return Err(classified);
            }

            let delay = match &err {
                TransportError::Http {
                    status: 429,
                    retry_after_secs: Some(secs),
                    ..
                } => {
                    let cap = retry.delay_after(state.current_attempt).max(MAX_RETRY_AFTER);
                    Duration::from_secs(*secs).min(cap)
                }
                _ => retry.delay_after(state.current_attempt),
            };
            tracing::warn!(
                attempt = state.current_attempt,
                max_retries = state.max_retries,
                delay_ms = delay.as_millis() as u64,
                "retrying chat completion after: {}",
                err
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("chat completion interrupted during backoff");
                    return Err(LlmError::Interrupted);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn record_usage(&self, model: &str, response: &ChatCompletionResponse) {
        let (Some(sink), Some(usage)) = (&self.usage_sink, response.usage) else {
            return;
        };
        let recorded = std::panic::catch_unwind(AssertUnwindSafe(|| {
            sink.record(model, usage.prompt_tokens, usage.completion_tokens)
        }));
        if recorded.is_err() {
            tracing::warn!("token usage sink panicked; ignoring");
        }
    }
}

pub fn is_retryable(err: &TransportError) -> bool {
    match err {
        TransportError::Network { .. } => true,
        TransportError::Http { status, .. } => *status == 429 || *status >= 500,
        TransportError::Decode(_) => false,
    }
}

const CONTEXT_LENGTH_MARKERS: &[&str] = &[
    "context_length_exceeded",
    "maximum context length",
    "context length",
    "context window",
    "prompt is too long",
    "input is too long",
    "too many tokens in the prompt",
];

const TOKEN_LIMIT_MARKERS: &[&str] = &[
    "max_tokens",
    "max_completion_tokens",
    "token limit",
    "maximum number of tokens",
];

/// 从错误体中取出可读信息：优先 error.message，否则截断原文
pub fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(ToString::to_string))
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}

/// 把最后一次原始失败映射为 LlmError
pub fn classify(err: &TransportError, endpoint: &str) -> LlmError {
    match err {
        TransportError::Network { message, timed_out } => {
            let detail = ErrorDetail::new(endpoint, message.clone());
            if *timed_out {
                LlmError::Timeout(detail)
            } else {
                LlmError::Network(detail)
            }
        }
        TransportError::Decode(message) => LlmError::Api(ErrorDetail::new(endpoint, message.clone())),
        TransportError::Http {
            status,
            body,
            retry_after_secs,
        } => {
            let detail = ErrorDetail::new(endpoint, extract_error_message(body))
                .with_status(*status)
                .with_body(body.clone());
            let lower = body.to_lowercase();
            match *status {
                429 => LlmError::RateLimited {
                    detail,
                    retry_after_secs: *retry_after_secs,
                },
                413 => LlmError::ContextLengthExceeded(detail),
                400..=499 if CONTEXT_LENGTH_MARKERS.iter().any(|m| lower.contains(m)) => {
                    LlmError::ContextLengthExceeded(detail)
                }
                400 | 422 if TOKEN_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) => {
                    LlmError::TokenLimit(detail)
                }
                401 => LlmError::Authentication(detail),
                403 => LlmError::Forbidden(detail),
                404 => LlmError::NotFound(detail),
                s if s >= 500 => LlmError::ServerError(detail),
                _ => LlmError::Api(detail),
            }
        }
    }
}
