//! 编排过程事件：用于 UI 展示模型调用、工具调用、观察与恢复动作

use serde::Serialize;

use crate::core::LoopPhase;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// 迭代计数更新
    StepUpdate { step: usize, max_steps: usize },
    /// 阶段变化
    Phase { phase: LoopPhase },
    /// 模型的可见文本或推理内容（预览）
    ThinkingContent { text: String },
    /// 调用工具
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        tool: String,
        preview: String,
    },
    ToolFailure { tool: String, reason: String },
    /// 校验拒绝的调用（纠正反馈已写回对话）
    Rejected { tool: String, reason: String },
    /// 恢复动作（CompactAndRetry / NoToolCallFallback 等）
    Recovery { action: String, detail: String },
    /// 注入了一条排队的用户消息
    QueuedMessage { text: String },
    /// 循环结束
    Done { termination: String },
    Error { text: String },
}
