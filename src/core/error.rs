//! 错误类型
//!
//! LlmError：Request Executor 重试耗尽后的分类结果，携带状态码 / endpoint / 原始错误体，供上层决定恢复策略；
//! AgentError：编排循环向调用方抛出的错误。模型输出格式错误不在此列，它们在循环内部转为纠正反馈。

use thiserror::Error;

/// 一次失败请求的结构化细节
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    pub status: Option<u16>,
    pub endpoint: String,
    /// 服务端返回的原始错误体
    pub body: Option<String>,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: None,
            endpoint: endpoint.into(),
            body: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// 模型请求的错误分类
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("Request timed out ({})", .0.endpoint)]
    Timeout(ErrorDetail),

    #[error("Rate limited (HTTP 429): {}", .detail.message)]
    RateLimited {
        detail: ErrorDetail,
        retry_after_secs: Option<u64>,
    },

    #[error("Context length exceeded: {}", .0.message)]
    ContextLengthExceeded(ErrorDetail),

    #[error("Token limit reached: {}", .0.message)]
    TokenLimit(ErrorDetail),

    #[error("Authentication failed (HTTP 401): {}", .0.message)]
    Authentication(ErrorDetail),

    #[error("Forbidden (HTTP 403): {}", .0.message)]
    Forbidden(ErrorDetail),

    #[error("Not found (HTTP 404): {}", .0.message)]
    NotFound(ErrorDetail),

    #[error("Server error (HTTP {}): {}", .0.status.unwrap_or(500), .0.message)]
    ServerError(ErrorDetail),

    #[error("Network error: {}", .0.message)]
    Network(ErrorDetail),

    #[error("API error: {}", .0.message)]
    Api(ErrorDetail),

    /// 用户中断：不重试、不计入错误统计
    #[error("Request interrupted")]
    Interrupted,
}

impl LlmError {
    pub fn detail(&self) -> Option<&ErrorDetail> {
        match self {
            LlmError::Timeout(d)
            | LlmError::ContextLengthExceeded(d)
            | LlmError::TokenLimit(d)
            | LlmError::Authentication(d)
            | LlmError::Forbidden(d)
            | LlmError::NotFound(d)
            | LlmError::ServerError(d)
            | LlmError::Network(d)
            | LlmError::Api(d) => Some(d),
            LlmError::RateLimited { detail, .. } => Some(detail),
            LlmError::Interrupted => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        self.detail().and_then(|d| d.status)
    }

    pub fn is_context_length(&self) -> bool {
        matches!(self, LlmError::ContextLengthExceeded(_))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, LlmError::Interrupted)
    }

    /// 错误类别名（日志 / 事件用）
    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::Timeout(_) => "timeout",
            LlmError::RateLimited { .. } => "rate_limit",
            LlmError::ContextLengthExceeded(_) => "context_length_exceeded",
            LlmError::TokenLimit(_) => "token_limit",
            LlmError::Authentication(_) => "authentication",
            LlmError::Forbidden(_) => "forbidden",
            LlmError::NotFound(_) => "not_found",
            LlmError::ServerError(_) => "server_error",
            LlmError::Network(_) => "network",
            LlmError::Api(_) => "api",
            LlmError::Interrupted => "interrupted",
        }
    }
}

/// 编排循环对外的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 用户取消：绕过所有重试与恢复路径
    #[error("Cancelled by user")]
    Cancelled,

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Plan error: {0}")]
    PlanError(String),
}

impl AgentError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgentError::Cancelled | AgentError::Llm(LlmError::Interrupted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_accessors() {
        let err = LlmError::ServerError(
            ErrorDetail::new("http://x/v1/chat/completions", "boom")
                .with_status(503)
                .with_body("{\"error\":\"boom\"}"),
        );
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.kind(), "server_error");
        assert!(err.to_string().contains("503"));
        assert_eq!(err.detail().and_then(|d| d.body.as_deref()), Some("{\"error\":\"boom\"}"));
    }

    #[test]
    fn test_interrupted_is_cancellation() {
        assert!(LlmError::Interrupted.detail().is_none());
        assert!(AgentError::from(LlmError::Interrupted).is_cancelled());
        assert!(!AgentError::ConfigError("x".into()).is_cancelled());
    }
}
