//! 编排循环阶段
//!
//! AwaitingModelResponse → {ToolCallReceived, NoToolCallReceived} → Dispatched → AwaitingModelResponse，
//! 终态 Completed / Aborted。只用于事件与日志，循环本身不依赖它做分支。

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LoopPhase {
    AwaitingModelResponse,
    ToolCallReceived,
    NoToolCallReceived,
    Dispatched,
    Completed,
    Aborted,
}

impl LoopPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopPhase::Completed | LoopPhase::Aborted)
    }

    /// 合法的下一阶段
    pub fn can_transition_to(&self, next: LoopPhase) -> bool {
        use LoopPhase::*;
        match (self, next) {
            (Completed | Aborted, _) => false,
            (_, Aborted) => true,
            (AwaitingModelResponse, ToolCallReceived | NoToolCallReceived | AwaitingModelResponse) => true,
            (ToolCallReceived, Dispatched | Completed | AwaitingModelResponse) => true,
            (NoToolCallReceived, AwaitingModelResponse | Completed) => true,
            (Dispatched, AwaitingModelResponse | Completed) => true,
            _ => false,
        }
    }
}

/// 单次调用的阶段跟踪
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    phase: LoopPhase,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self {
            phase: LoopPhase::AwaitingModelResponse,
        }
    }
}

impl PhaseTracker {
    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    /// 非法迁移只记录警告
    pub fn transition(&mut self, next: LoopPhase) {
        if !self.phase.can_transition_to(next) {
            tracing::warn!(from = ?self.phase, to = ?next, "unexpected loop phase transition");
        }
        self.phase = next;
    }
}
