//! Manager：监督型循环
//!
//! 工具：delegate_task / report_to_user / request_approval / ask_user / remember / forget。
//! 以 rebuild 模式运行：每轮从 WorkingMemory 重新拼 system prompt，笔记与委派状态始终是最新的。
//! report_to_user 是内联终止工具，一次汇报即结束本轮周期。
//! run_periodic 按固定间隔触发周期，直到取消。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::interaction::{ask_user_definition, handle_interception, request_approval_definition};
use crate::core::{AgentError, InterceptionChannel, RecoveryCoordinator};
use crate::llm::RequestExecutor;
use crate::memory::{Message, WorkingMemory};
use crate::react::{run_tool_loop, LoopConfig, LoopEvent, LoopOutcome, LoopSession, MessageMode, TerminalTool};
use crate::tools::{parse_args, ToolDefinition, ToolDispatcher, ToolOutcome};

pub const DELEGATE_TASK_TOOL: &str = "delegate_task";
pub const REPORT_TO_USER_TOOL: &str = "report_to_user";
pub const REMEMBER_TOOL: &str = "remember";
pub const FORGET_TOOL: &str = "forget";

const MANAGER_PROMPT: &str = "You are a manager. You do not do the work yourself: break the goal into tasks \
and hand each one to a worker with delegate_task. Keep durable facts with remember and drop stale ones with forget. \
Ask for approval before anything destructive or irreversible. When you have something worth telling the user, \
call report_to_user once; that ends this cycle.";

/// 接受 Manager 委派的下级 agent
#[async_trait]
pub trait Delegate: Send + Sync {
    /// 执行任务并返回结果摘要
    async fn delegate(&self, task: &str, cancel: &CancellationToken) -> Result<String, AgentError>;
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DelegateTaskArgs {
    /// Self-contained description of the task for the worker
    pub task: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReportToUserArgs {
    /// The report for the user
    pub message: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RememberArgs {
    /// Short name of the note
    pub key: String,
    /// What to remember
    pub content: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ForgetArgs {
    /// Name of the note to drop
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub model: String,
    pub max_iterations: usize,
    pub poll_interval: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ManagerConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_iterations: 20,
            poll_interval: Duration::from_secs(60),
            temperature: 0.2,
            max_tokens: 4096,
        }
    }
}

/// Manager 工具的调度：笔记、委派与人工交互
struct ManagerDispatcher {
    memory: Arc<Mutex<WorkingMemory>>,
    delegate: Arc<dyn Delegate>,
    channel: Option<InterceptionChannel>,
    cancel: CancellationToken,
}

impl ManagerDispatcher {
    fn with_memory<T>(&self, f: impl FnOnce(&mut WorkingMemory) -> T) -> Result<T, String> {
        self.memory
            .lock()
            .map(|mut m| f(&mut *m))
            .map_err(|_| "working memory unavailable".to_string())
    }

    async fn delegate_task(&self, args: Value) -> Result<String, String> {
        let args: DelegateTaskArgs = parse_args(args)?;
        let idx = self.with_memory(|m| m.start_delegation(args.task.clone()))?;
        tracing::info!(task = %args.task, "delegating task");
        let result = self.delegate.delegate(&args.task, &self.cancel).await;
        match result {
            Ok(summary) => {
                self.with_memory(|m| m.finish_delegation(idx, true, summary.clone()))?;
                Ok(summary)
            }
            Err(e) => {
                let reason = e.to_string();
                self.with_memory(|m| m.finish_delegation(idx, false, reason.clone()))?;
                Err(format!("Delegated task failed: {}", reason))
            }
        }
    }
}

#[async_trait]
impl ToolDispatcher for ManagerDispatcher {
    async fn invoke(&self, name: &str, args: Map<String, Value>) -> ToolOutcome {
        if let Some(channel) = &self.channel {
            if let Some(outcome) = handle_interception(channel, name, &args, &self.cancel).await {
                return outcome;
            }
        }
        let args = Value::Object(args);
        let result = match name {
            DELEGATE_TASK_TOOL => self.delegate_task(args).await,
            REMEMBER_TOOL => parse_args::<RememberArgs>(args).and_then(|a| {
                self.with_memory(|m| m.remember(a.key.clone(), a.content))?;
                Ok(format!("Remembered '{}'.", a.key))
            }),
            FORGET_TOOL => parse_args::<ForgetArgs>(args).and_then(|a| {
                if self.with_memory(|m| m.forget(&a.key))? {
                    Ok(format!("Forgot '{}'.", a.key))
                } else {
                    Err(format!("No note named '{}'.", a.key))
                }
            }),
            other => Err(format!("Unknown tool: {}", other)),
        };
        match result {
            Ok(output) => ToolOutcome::ok(output),
            Err(e) => ToolOutcome::err(e),
        }
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = vec![
            ToolDefinition::for_args::<DelegateTaskArgs>(
                DELEGATE_TASK_TOOL,
                "Hand a task to a worker agent and wait for its result.",
            ),
            ToolDefinition::for_args::<ReportToUserArgs>(
                REPORT_TO_USER_TOOL,
                "Report to the user. Ends the current cycle.",
            ),
            ToolDefinition::for_args::<RememberArgs>(REMEMBER_TOOL, "Store or overwrite a note in working memory."),
            ToolDefinition::for_args::<ForgetArgs>(FORGET_TOOL, "Remove a note from working memory."),
        ];
        if self.channel.is_some() {
            defs.push(request_approval_definition());
            defs.push(ask_user_definition());
        }
        defs
    }
}

pub struct Manager {
    executor: Arc<RequestExecutor>,
    recovery: Arc<RecoveryCoordinator>,
    delegate: Arc<dyn Delegate>,
    channel: Option<InterceptionChannel>,
    memory: Arc<Mutex<WorkingMemory>>,
    config: ManagerConfig,
    event_tx: Option<UnboundedSender<LoopEvent>>,
}

impl Manager {
    pub fn new(
        executor: Arc<RequestExecutor>,
        recovery: Arc<RecoveryCoordinator>,
        delegate: Arc<dyn Delegate>,
        channel: Option<InterceptionChannel>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            executor,
            recovery,
            delegate,
            channel,
            memory: Arc::new(Mutex::new(WorkingMemory::new())),
            config,
            event_tx: None,
        }
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 共享的工作记忆（跨周期保留）
    pub fn memory(&self) -> Arc<Mutex<WorkingMemory>> {
        self.memory.clone()
    }

    /// 运行一个周期：直到 report_to_user、兜底或迭代上限
    pub async fn run_cycle(&self, goal: &str, cancel: &CancellationToken) -> Result<LoopOutcome, AgentError> {
        if let Ok(mut m) = self.memory.lock() {
            m.set_goal(goal);
        }
        let dispatcher = ManagerDispatcher {
            memory: self.memory.clone(),
            delegate: self.delegate.clone(),
            channel: self.channel.clone(),
            cancel: cancel.clone(),
        };
        let config = LoopConfig::new(self.config.model.clone(), dispatcher.definitions())
            .with_terminal(TerminalTool::inline(REPORT_TO_USER_TOOL, "message"))
            .with_max_iterations(self.config.max_iterations)
            .with_sampling(self.config.temperature, self.config.max_tokens);

        let memory = self.memory.clone();
        let goal_text = goal.to_string();
        let builder = move |loop_messages: &[Message]| {
            let section = memory.lock().map(|m| m.to_prompt_section()).unwrap_or_default();
            let mut messages = vec![
                Message::system(format!("{}\n\n{}", MANAGER_PROMPT, section)),
                Message::user(goal_text.clone()),
            ];
            messages.extend_from_slice(loop_messages);
            messages
        };
        let mode = MessageMode::Rebuild(Box::new(builder));

        let mut session = LoopSession::new(&self.executor, &dispatcher, &self.recovery, cancel.clone());
        if let Some(tx) = &self.event_tx {
            session = session.with_event_tx(tx);
        }
        run_tool_loop(&session, &config, &mode, Vec::new()).await
    }

    /// 周期性运行，直到取消；每个周期的结果交给 on_report。返回完成的周期数。
    pub async fn run_periodic<F>(&self, goal: &str, cancel: &CancellationToken, mut on_report: F) -> Result<usize, AgentError>
    where
        F: FnMut(LoopOutcome) + Send,
    {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut cycles = 0usize;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(cycles, "manager stopped");
                    return Ok(cycles);
                }
                _ = interval.tick() => {
                    match self.run_cycle(goal, cancel).await {
                        Ok(outcome) => {
                            cycles += 1;
                            on_report(outcome);
                        }
                        Err(e) if e.is_cancelled() => return Ok(cycles),
                        Err(e) => {
                            cycles += 1;
                            tracing::warn!("manager cycle failed: {}", e);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Worker;

    #[async_trait]
    impl Delegate for Worker {
        async fn delegate(&self, task: &str, _cancel: &CancellationToken) -> Result<String, AgentError> {
            if task.contains("fail") {
                Err(AgentError::PlanError("worker gave up".into()))
            } else {
                Ok(format!("done: {}", task))
            }
        }
    }

    fn dispatcher() -> ManagerDispatcher {
        ManagerDispatcher {
            memory: Arc::new(Mutex::new(WorkingMemory::new())),
            delegate: Arc::new(Worker),
            channel: None,
            cancel: CancellationToken::new(),
        }
    }

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_remember_and_forget_update_memory() {
        let d = dispatcher();
        let out = d
            .invoke(REMEMBER_TOOL, args(serde_json::json!({"key": "db", "content": "postgres"})))
            .await;
        assert!(out.success);
        assert_eq!(d.memory.lock().unwrap().note("db"), Some("postgres"));
        assert!(d.invoke(FORGET_TOOL, args(serde_json::json!({"key": "db"}))).await.success);
        assert!(!d.invoke(FORGET_TOOL, args(serde_json::json!({"key": "db"}))).await.success);
    }

    #[tokio::test]
    async fn test_delegation_status_is_tracked() {
        let d = dispatcher();
        assert!(d.invoke(DELEGATE_TASK_TOOL, args(serde_json::json!({"task": "build"}))).await.success);
        assert!(!d.invoke(DELEGATE_TASK_TOOL, args(serde_json::json!({"task": "fail now"}))).await.success);
        let memory = d.memory.lock().unwrap();
        assert_eq!(memory.delegations().len(), 2);
        assert!(memory.to_prompt_section().contains("build"));
    }

    #[test]
    fn test_interaction_tools_only_with_channel() {
        let names: Vec<String> = dispatcher().definitions().into_iter().map(|d| d.name).collect();
        assert!(!names.contains(&"ask_user".to_string()));
        assert!(names.contains(&REPORT_TO_USER_TOOL.to_string()));
    }
}
