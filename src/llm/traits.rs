//! LLM 传输抽象
//!
//! ChatTransport 只负责「发一次请求」：不重试、不分类；重试、退避与错误分类由 RequestExecutor 统一完成。
//! 后端（OpenAI 兼容 HTTP / Scripted Mock）实现该 trait。

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::{ChatCompletionRequest, ChatCompletionResponse};

/// 单次请求的原始失败
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// 服务端返回了非 2xx 响应
    #[error("HTTP {status}: {body}")]
    Http {
        status: u16,
        body: String,
        retry_after_secs: Option<u64>,
    },
    /// 未拿到任何响应（连接失败、DNS、超时等）
    #[error("network error: {message}")]
    Network { message: String, timed_out: bool },
    /// 2xx 但响应体无法解析
    #[error("malformed response: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        TransportError::Http {
            status,
            body: body.into(),
            retry_after_secs: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        TransportError::Network {
            message: message.into(),
            timed_out: false,
        }
    }
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// 发送一次 chat-completion 请求
    async fn send(&self, request: &ChatCompletionRequest) -> Result<ChatCompletionResponse, TransportError>;

    /// 请求地址（写入错误细节）
    fn endpoint(&self) -> &str;
}

/// Token 用量汇报：fire-and-forget，实现不得阻塞，也无法让主调用失败
pub trait TokenUsageSink: Send + Sync {
    fn record(&self, model: &str, prompt_tokens: u64, completion_tokens: u64);
}
