//! Context Compaction：把一段过长的对话交给 Summarizer 压缩成一条摘要
//!
//! 由 Recovery Coordinator 在上下文溢出时调用；system 消息不参与摘要，由调用方原样保留。

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::llm::{ChatCompletionRequest, RequestExecutor};
use crate::memory::{Message, Role};

/// 单条消息写入 transcript 的最大字符数
const MAX_CHARS_PER_MESSAGE: usize = 2000;

const SUMMARY_PROMPT: &str = "You compress conversations between a user, an assistant and its tools. \
Write a concise summary that keeps: the user's goal, decisions made, facts and file names discovered, \
tool results that still matter, and what remains to be done. Plain text, no preamble.";

#[derive(Debug, Clone)]
pub struct CompactionOptions {
    pub model: String,
    pub max_tokens: u32,
    /// 额外关注点（追加到摘要指令）
    pub focus: Option<String>,
}

impl CompactionOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: 1024,
            focus: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    pub success: bool,
    pub summary_text: String,
    pub original_count: usize,
    pub new_count: usize,
}

impl CompactionResult {
    pub fn failed(original_count: usize) -> Self {
        Self {
            success: false,
            summary_text: String::new(),
            original_count,
            new_count: original_count,
        }
    }
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn compact(
        &self,
        messages: &[Message],
        options: &CompactionOptions,
        cancel: &CancellationToken,
    ) -> CompactionResult;
}

/// 把对话渲染为纯文本 transcript（跳过 system）
pub fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for m in messages.iter().filter(|m| m.role != Role::System) {
        let label = match m.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool result",
            Role::System => continue,
        };
        let mut body: String = m.content.chars().take(MAX_CHARS_PER_MESSAGE).collect();
        for tc in &m.tool_calls {
            if !body.is_empty() {
                body.push(' ');
            }
            body.push_str(&format!("[called {}({})]", tc.name, tc.raw_arguments));
        }
        out.push_str(&format!("{}: {}\n", label, body));
    }
    out
}

/// 用同一个模型端点生成摘要
pub struct LlmSummarizer {
    executor: Arc<RequestExecutor>,
}

impl LlmSummarizer {
    pub fn new(executor: Arc<RequestExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn compact(
        &self,
        messages: &[Message],
        options: &CompactionOptions,
        cancel: &CancellationToken,
    ) -> CompactionResult {
        let original_count = messages.len();
        let transcript = render_transcript(messages);
        if transcript.trim().is_empty() {
            return CompactionResult::failed(original_count);
        }

        let mut instructions = SUMMARY_PROMPT.to_string();
        if let Some(focus) = &options.focus {
            instructions.push_str("\nFocus on: ");
            instructions.push_str(focus);
        }
        let request = ChatCompletionRequest::new(
            options.model.clone(),
            vec![Message::system(instructions), Message::user(transcript)],
        )
        .with_sampling(0.0, options.max_tokens);

        match self.executor.chat_completion(request, cancel).await {
            Ok(resp) => {
                let summary = resp
                    .first()
                    .map(|c| c.message.content.trim().to_string())
                    .unwrap_or_default();
                if summary.is_empty() {
                    tracing::warn!("summarizer returned an empty summary");
                    return CompactionResult::failed(original_count);
                }
                let kept_system = messages.iter().filter(|m| m.role == Role::System).count();
                tracing::info!(original_count, summary_len = summary.len(), "conversation compacted");
                CompactionResult {
                    success: true,
                    summary_text: summary,
                    original_count,
                    new_count: kept_system + 1,
                }
            }
            Err(e) => {
                if !e.is_interrupted() {
                    tracing::warn!("compaction request failed: {}", e);
                }
                CompactionResult::failed(original_count)
            }
        }
    }
}
