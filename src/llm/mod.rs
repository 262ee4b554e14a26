//! LLM 层：传输抽象与实现（OpenAI 兼容 HTTP / Mock）、请求预处理、带重试的 Request Executor

pub mod executor;
pub mod mock;
pub mod openai;
pub mod preprocess;
pub mod traits;
pub mod types;

pub use executor::{RequestExecutor, RetryConfig, RetryState};
pub use mock::{EchoTransport, ScriptedTransport};
pub use openai::{OpenAiTransport, TokenUsage};
pub use preprocess::preprocess;
pub use traits::{ChatTransport, TokenUsageSink, TransportError};
pub use types::{ChatCompletionRequest, ChatCompletionResponse, Choice, ToolChoice, Usage};
