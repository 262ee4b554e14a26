//! Recovery Coordinator
//!
//! 根据 LlmError 类型返回 RecoveryAction；上下文溢出时回滚最近一次工具交换、压缩历史并重建最小对话；
//! 另外提供三种终止兜底：无工具调用超限、final answer 工具失败超限、解析失败超限。
//! 计数器放在 InvocationCounters 中，随单次编排调用创建与销毁。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::LlmError;
use crate::memory::{CompactionOptions, ConversationState, Message, Role, Summarizer};

/// 默认上限
pub const DEFAULT_MAX_NO_TOOL_CALL_RETRIES: u32 = 3;
pub const DEFAULT_MAX_FINAL_ANSWER_FAILURES: u32 = 3;
pub const DEFAULT_MAX_PARSE_FAILURES: u32 = 3;

/// 错误到恢复动作的映射
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 压缩上下文后重试同一轮
    CompactAndRetry,
    /// 原样抛给调用方
    Propagate,
    /// 用户中断，立即退出
    Abort,
}

pub fn classify(err: &LlmError) -> RecoveryAction {
    match err {
        LlmError::ContextLengthExceeded(_) => RecoveryAction::CompactAndRetry,
        LlmError::Interrupted => RecoveryAction::Abort,
        _ => RecoveryAction::Propagate,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryLimits {
    pub max_no_tool_call_retries: u32,
    pub max_final_answer_failures: u32,
    pub max_parse_failures: u32,
}

impl Default for RecoveryLimits {
    fn default() -> Self {
        Self {
            max_no_tool_call_retries: DEFAULT_MAX_NO_TOOL_CALL_RETRIES,
            max_final_answer_failures: DEFAULT_MAX_FINAL_ANSWER_FAILURES,
            max_parse_failures: DEFAULT_MAX_PARSE_FAILURES,
        }
    }
}

/// 单次调用的恢复计数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationCounters {
    pub context_recovered: bool,
    pub no_tool_call_retries: u32,
    pub final_answer_failures: u32,
}

/// 无工具调用时的决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoToolCallDecision {
    /// 追加纠正指令后继续
    Retry(String),
    /// 以该文本作为最终答案结束
    Fallback(String),
}

/// final answer 工具失败时的决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalAnswerDecision {
    Retry,
    Fallback(String),
}

pub struct RecoveryCoordinator {
    summarizer: Option<Arc<dyn Summarizer>>,
    options: CompactionOptions,
    limits: RecoveryLimits,
}

impl RecoveryCoordinator {
    pub fn new(summarizer: Option<Arc<dyn Summarizer>>, options: CompactionOptions, limits: RecoveryLimits) -> Self {
        Self {
            summarizer,
            options,
            limits,
        }
    }

    pub fn limits(&self) -> &RecoveryLimits {
        &self.limits
    }

    /// 上下文溢出恢复：每次调用只尝试一次。成功时 state 被替换为「前导 system + 一条摘要」；
    /// 第二次溢出、没有 Summarizer、压缩失败时返回原错误。
    pub async fn recover_context_overflow(
        &self,
        state: &mut ConversationState,
        counters: &mut InvocationCounters,
        err: LlmError,
        cancel: &CancellationToken,
    ) -> Result<(), LlmError> {
        if counters.context_recovered {
            tracing::warn!("context length exceeded again after compaction; giving up");
            return Err(err);
        }
        counters.context_recovered = true;
        let Some(summarizer) = &self.summarizer else {
            return Err(err);
        };

        let removed = state.rollback_last_exchange();
        tracing::info!(removed, remaining = state.len(), "context overflow: compacting conversation");

        let result = summarizer.compact(state.messages(), &self.options, cancel).await;
        if cancel.is_cancelled() {
            return Err(LlmError::Interrupted);
        }
        if !result.success {
            tracing::warn!("compaction failed; propagating context length error");
            return Err(err);
        }

        let mut rebuilt: Vec<Message> = state
            .messages()
            .iter()
            .take_while(|m| m.role == Role::System)
            .cloned()
            .collect();
        rebuilt.push(Message::user(format!(
            "Summary of the conversation so far:\n\n{}\n\nContinue the task from here.",
            result.summary_text
        )));
        tracing::info!(
            original_count = result.original_count,
            new_count = rebuilt.len(),
            "conversation rebuilt from summary"
        );
        state.set_messages(rebuilt);
        Ok(())
    }

    /// 模型没有调用工具：未超限时给出纠正指令，超限后用最后的文本兜底
    pub fn on_no_tool_call(
        &self,
        counters: &mut InvocationCounters,
        text: &str,
        state: &ConversationState,
        tool_names: &[String],
        terminal_names: &[String],
    ) -> NoToolCallDecision {
        counters.no_tool_call_retries += 1;
        if counters.no_tool_call_retries > self.limits.max_no_tool_call_retries {
            let fallback = if text.trim().is_empty() {
                state
                    .last_assistant_text()
                    .unwrap_or("I was unable to produce an answer.")
                    .to_string()
            } else {
                text.trim().to_string()
            };
            tracing::warn!(
                retries = counters.no_tool_call_retries - 1,
                "model kept answering without tool calls; using its text as the final answer"
            );
            return NoToolCallDecision::Fallback(fallback);
        }
        let finish = if terminal_names.is_empty() {
            String::new()
        } else {
            format!(" When you are done, call `{}`.", terminal_names.join("` or `"))
        };
        NoToolCallDecision::Retry(format!(
            "You must respond by calling exactly one of the available tools: {}.{}",
            tool_names.join(", "),
            finish
        ))
    }

    /// 交付型终止工具失败
    pub fn on_final_answer_failure(
        &self,
        counters: &mut InvocationCounters,
        best_effort: impl FnOnce() -> String,
    ) -> FinalAnswerDecision {
        counters.final_answer_failures += 1;
        if counters.final_answer_failures > self.limits.max_final_answer_failures {
            tracing::warn!(
                failures = counters.final_answer_failures,
                "final answer tool keeps failing; delivering best-effort message"
            );
            FinalAnswerDecision::Fallback(best_effort())
        } else {
            FinalAnswerDecision::Retry
        }
    }
}

/// 解析 / Schema 失败达到上限时的中止说明
pub fn parse_failure_abort_message(tool: &str, reason: &str) -> String {
    format!(
        "Stopped: the model repeatedly produced invalid tool calls (last: '{}', {}). \
         Try again or switch to a different model.",
        tool, reason
    )
}
