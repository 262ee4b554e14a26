//! Headless Agent 运行时
//!
//! create_agent_components 从配置构建 RequestExecutor / ToolRegistry / RecoveryCoordinator，
//! ExecutorAgent 以 final_answer 为交付型终止工具跑通用循环，同时作为 Manager 的下级（Delegate）。
//! 前端（CLI 或其他）只需持有 AgentComponents 与可选的 InterceptionChannel。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, InteractiveDispatcher, InterceptionChannel, RecoveryCoordinator, SessionSupervisor};
use crate::llm::{ChatTransport, EchoTransport, OpenAiTransport, RequestExecutor, TokenUsage};
use crate::memory::{CompactionOptions, LlmSummarizer, Message, Summarizer};
use crate::react::{
    run_tool_loop, Delegate, LoopConfig, LoopEvent, LoopOutcome, LoopSession, Manager, ManagerConfig,
    MessageMode, Planner, PlannerConfig, TerminalTool,
};
use crate::tools::{
    parse_args, EchoTool, ListFilesTool, ParameterSchema, ReadFileTool, Tool, ToolDispatcher, ToolExecutor,
    ToolRegistry,
};

pub const FINAL_ANSWER_TOOL: &str = "final_answer";

const EXECUTOR_PROMPT: &str = "You are a capable assistant that completes tasks by calling tools. \
Call exactly one tool per turn. Inspect files with list_files and read_file before drawing conclusions. \
When the task is done, call final_answer with the complete answer for the user.";

/// 交付给用户的最终回答；空消息视为失败，让模型重试
#[derive(Debug, Deserialize, JsonSchema)]
pub struct FinalAnswerArgs {
    /// The complete answer for the user
    pub message: String,
}

pub struct FinalAnswerTool;

#[async_trait]
impl Tool for FinalAnswerTool {
    fn name(&self) -> &str {
        FINAL_ANSWER_TOOL
    }

    fn description(&self) -> &str {
        "Deliver the final answer to the user. Call this once the task is complete."
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::for_type::<FinalAnswerArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: FinalAnswerArgs = parse_args(args)?;
        if args.message.trim().is_empty() {
            return Err("final answer message must not be empty".to_string());
        }
        Ok(args.message)
    }
}

/// 按配置选择传输层：有 API key 走 OpenAI 兼容端点，否则使用本地 EchoTransport
pub fn create_transport_from_config(cfg: &AppConfig) -> Arc<dyn ChatTransport> {
    let key = cfg.llm.resolved_api_key();
    if cfg.llm.provider == "mock" || key.is_none() {
        tracing::warn!("no API key configured; using the local echo transport");
        return Arc::new(EchoTransport);
    }
    tracing::info!(model = %cfg.llm.model, "using OpenAI-compatible transport");
    Arc::new(OpenAiTransport::new(cfg.llm.base_url.as_deref(), key.as_deref()))
}

/// 默认工具集：echo、list_files、read_file（限制在 workspace 内）、final_answer
pub fn default_registry(workspace: &Path) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    tools.register(ListFilesTool::new(workspace));
    tools.register(ReadFileTool::new(workspace));
    tools.register(FinalAnswerTool);
    tools
}

/// 预构建的组件，可被 Planner / Manager / Executor 共享
pub struct AgentComponents {
    pub config: AppConfig,
    pub executor: Arc<RequestExecutor>,
    pub recovery: Arc<RecoveryCoordinator>,
    pub tools: ToolExecutor,
    pub usage: Arc<TokenUsage>,
    pub channel: Option<InterceptionChannel>,
}

/// 从配置构建组件；transport 由调用方提供（测试中为 ScriptedTransport）
pub fn create_agent_components(
    cfg: AppConfig,
    transport: Arc<dyn ChatTransport>,
    channel: Option<InterceptionChannel>,
) -> AgentComponents {
    let usage = Arc::new(TokenUsage::default());
    let executor = Arc::new(
        RequestExecutor::new(transport)
            .with_retry(cfg.retry.to_retry_config())
            .with_timeout(Duration::from_secs(cfg.llm.timeouts.request))
            .with_usage_sink(usage.clone()),
    );
    let summarizer: Arc<dyn Summarizer> = Arc::new(LlmSummarizer::new(executor.clone()));
    let recovery = Arc::new(RecoveryCoordinator::new(
        Some(summarizer),
        CompactionOptions::new(cfg.llm.model.clone()),
        cfg.engine.recovery_limits(),
    ));
    let tools = ToolExecutor::new(default_registry(&cfg.tools.workspace()), cfg.tools.tool_timeout_secs);

    AgentComponents {
        config: cfg,
        executor,
        recovery,
        tools,
        usage,
        channel,
    }
}

impl AgentComponents {
    pub fn planner(&self) -> Planner {
        let mut config = PlannerConfig::new(self.config.llm.model.clone());
        config.max_rounds = self.config.planner.max_rounds;
        config.max_attempts = self.config.planner.max_attempts;
        config.temperature = self.config.llm.temperature;
        config.max_tokens = self.config.llm.max_tokens;
        Planner::new(self.executor.clone(), self.recovery.clone(), self.channel.clone(), config)
    }

    pub fn executor_agent(&self) -> ExecutorAgent {
        ExecutorAgent {
            executor: self.executor.clone(),
            recovery: self.recovery.clone(),
            tools: Arc::new(self.tools.clone()),
            channel: self.channel.clone(),
            config: self.executor_loop_config(),
            supervisor: None,
            event_tx: None,
        }
    }

    pub fn manager(&self) -> Manager {
        let mut config = ManagerConfig::new(self.config.llm.model.clone());
        config.max_iterations = self.config.manager.max_iterations;
        config.poll_interval = Duration::from_secs(self.config.manager.poll_interval_secs);
        config.temperature = self.config.llm.temperature;
        config.max_tokens = self.config.llm.max_tokens;
        Manager::new(
            self.executor.clone(),
            self.recovery.clone(),
            Arc::new(self.executor_agent()),
            self.channel.clone(),
            config,
        )
    }

    fn executor_loop_config(&self) -> LoopConfig {
        LoopConfig::new(self.config.llm.model.clone(), Vec::new())
            .with_max_iterations(self.config.engine.max_iterations)
            .with_sampling(self.config.llm.temperature, self.config.llm.max_tokens)
            .with_terminal(TerminalTool::delivered(FINAL_ANSWER_TOOL, "message"))
    }
}

/// 执行型 agent：registry 中的工具 + final_answer
pub struct ExecutorAgent {
    executor: Arc<RequestExecutor>,
    recovery: Arc<RecoveryCoordinator>,
    tools: Arc<ToolExecutor>,
    channel: Option<InterceptionChannel>,
    config: LoopConfig,
    supervisor: Option<SessionSupervisor>,
    event_tx: Option<mpsc::UnboundedSender<LoopEvent>>,
}

impl ExecutorAgent {
    pub fn with_supervisor(mut self, supervisor: SessionSupervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn with_event_tx(mut self, tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 对单个任务跑通用循环
    pub async fn run(&self, task: &str, cancel: &CancellationToken) -> Result<LoopOutcome, AgentError> {
        let dispatcher: Arc<dyn ToolDispatcher> = match &self.channel {
            Some(channel) => Arc::new(InteractiveDispatcher::new(
                self.tools.clone(),
                channel.clone(),
                cancel.clone(),
            )),
            None => self.tools.clone(),
        };
        let mut config = self.config.clone();
        config.tools = dispatcher.definitions();

        let mut session = LoopSession::new(&self.executor, dispatcher.as_ref(), &self.recovery, cancel.clone());
        if let Some(supervisor) = &self.supervisor {
            session = session.with_supervisor(supervisor);
        }
        if let Some(tx) = &self.event_tx {
            session = session.with_event_tx(tx);
        }
        let initial = vec![Message::system(EXECUTOR_PROMPT), Message::user(task)];
        run_tool_loop(&session, &config, &MessageMode::AppendInPlace, initial).await
    }
}

#[async_trait]
impl Delegate for ExecutorAgent {
    async fn delegate(&self, task: &str, cancel: &CancellationToken) -> Result<String, AgentError> {
        let outcome = self.run(task, cancel).await?;
        tracing::info!(
            termination = outcome.termination.as_str(),
            tool_calls = outcome.tool_call_history.len(),
            "delegated task finished"
        );
        Ok(outcome.message)
    }
}
