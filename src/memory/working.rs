//! 中期记忆：当前目标、Manager 笔记、委派任务清单
//!
//! 由 Manager 的 remember / forget / delegate_task 工具修改；rebuild 模式下每轮重新拼入 system prompt，
//! 因此模型看到的永远是最新状态，无需手动同步。

use std::collections::BTreeMap;

/// 委派任务的状态
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DelegationStatus {
    Running,
    Succeeded,
    Failed,
}

impl DelegationStatus {
    fn label(&self) -> &'static str {
        match self {
            DelegationStatus::Running => "running",
            DelegationStatus::Succeeded => "done",
            DelegationStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Delegation {
    pub task: String,
    pub status: DelegationStatus,
    pub summary: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct WorkingMemory {
    pub goal: Option<String>,
    notes: BTreeMap<String, String>,
    delegations: Vec<Delegation>,
}

impl WorkingMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_goal(&mut self, goal: impl Into<String>) {
        self.goal = Some(goal.into());
    }

    /// 写入（或覆盖）一条笔记
    pub fn remember(&mut self, key: impl Into<String>, content: impl Into<String>) {
        self.notes.insert(key.into(), content.into());
    }

    /// 删除笔记，返回是否存在
    pub fn forget(&mut self, key: &str) -> bool {
        self.notes.remove(key).is_some()
    }

    pub fn note(&self, key: &str) -> Option<&str> {
        self.notes.get(key).map(String::as_str)
    }

    pub fn notes_len(&self) -> usize {
        self.notes.len()
    }

    /// 登记一个委派任务，返回其下标
    pub fn start_delegation(&mut self, task: impl Into<String>) -> usize {
        self.delegations.push(Delegation {
            task: task.into(),
            status: DelegationStatus::Running,
            summary: None,
        });
        self.delegations.len() - 1
    }

    pub fn finish_delegation(&mut self, index: usize, succeeded: bool, summary: impl Into<String>) {
        if let Some(d) = self.delegations.get_mut(index) {
            d.status = if succeeded {
                DelegationStatus::Succeeded
            } else {
                DelegationStatus::Failed
            };
            d.summary = Some(summary.into());
        }
    }

    pub fn delegations(&self) -> &[Delegation] {
        &self.delegations
    }

    pub fn clear(&mut self) {
        self.goal = None;
        self.notes.clear();
        self.delegations.clear();
    }

    /// 构建 Prompt 片段（Current Goal / Notes / Delegated tasks）
    pub fn to_prompt_section(&self) -> String {
        let mut s = String::new();
        if let Some(goal) = &self.goal {
            s.push_str(&format!("## Current Goal\n{}\n\n", goal));
        }
        if !self.notes.is_empty() {
            s.push_str("## Notes\n");
            for (key, content) in &self.notes {
                s.push_str(&format!("- {}: {}\n", key, content));
            }
            s.push('\n');
        }
        if !self.delegations.is_empty() {
            s.push_str("## Delegated tasks\n");
            for (i, d) in self.delegations.iter().enumerate() {
                s.push_str(&format!("{}. [{}] {}", i + 1, d.status.label(), d.task));
                if let Some(summary) = &d.summary {
                    s.push_str(&format!(" -> {}", summary));
                }
                s.push('\n');
            }
            s.push('\n');
        }
        s
    }
}
