//! 会话监管：中断管理与排队的用户消息
//!
//! 持有 CancellationToken，用户 Ctrl+C 时取消当前编排调用；运行中输入的用户消息按 FIFO 排队，
//! 编排循环每轮最多取出一条注入对话，不丢弃、不乱序。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

/// 会话级生命周期管理；clone 共享同一令牌与队列
#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    /// 用户 Cancel 时触发
    cancel_token: CancellationToken,
    queued: Arc<Mutex<VecDeque<String>>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            queued: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发取消（用户 Ctrl+C）
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 创建子 token（用于单个委派任务）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// 运行中的用户输入排队
    pub fn enqueue_message(&self, text: impl Into<String>) {
        self.queue().push_back(text.into());
    }

    /// 取出最早的一条
    pub fn next_queued_message(&self) -> Option<String> {
        self.queue().pop_front()
    }

    pub fn queued_len(&self) -> usize {
        self.queue().len()
    }

    /// 锁中毒时队列内容仍然有效，继续使用
    fn queue(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.queued.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("message queue lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_is_fifo() {
        let s = SessionSupervisor::new();
        s.enqueue_message("first");
        s.clone().enqueue_message("second");
        assert_eq!(s.queued_len(), 2);
        assert_eq!(s.next_queued_message().as_deref(), Some("first"));
        assert_eq!(s.next_queued_message().as_deref(), Some("second"));
        assert_eq!(s.next_queued_message(), None);
    }

    #[test]
    fn test_queue_survives_poisoned_lock() {
        let s = SessionSupervisor::new();
        s.enqueue_message("before");
        let queued = s.queued.clone();
        let _ = std::thread::spawn(move || {
            let _guard = queued.lock().unwrap();
            panic!("writer crashed");
        })
        .join();
        assert!(s.queued.is_poisoned());

        s.enqueue_message("after");
        assert_eq!(s.queued_len(), 2);
        assert_eq!(s.next_queued_message().as_deref(), Some("before"));
        assert_eq!(s.next_queued_message().as_deref(), Some("after"));
    }

    #[test]
    fn test_child_token_follows_parent() {
        let s = SessionSupervisor::new();
        let child = s.child_token();
        s.cancel();
        assert!(child.is_cancelled());
        assert!(s.is_cancelled());
    }
}
