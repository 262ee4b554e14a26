//! 通用工具调用循环
//!
//! 每轮：（rebuild 模式下重建消息）-> 注入一条排队的用户消息 -> 以 tool_choice=required 请求模型 ->
//! 上下文溢出交给 Recovery Coordinator 压缩后重试（不消耗迭代）-> 有工具调用则校验、调度、写回结果 ->
//! 无工具调用则纠正或兜底。终止工具成功即结束。
//! Planner / Manager / Executor 三处调用各自提供工具目录与终止规则。
//! 可选 event_tx：向 UI 推送 StepUpdate / ToolCall / Observation / Recovery / Done。

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::recovery::{classify, parse_failure_abort_message, FinalAnswerDecision, NoToolCallDecision};
use crate::core::{
    AgentError, InvocationCounters, LlmError, LoopPhase, PhaseTracker, RecoveryAction, RecoveryCoordinator,
    SessionSupervisor,
};
use crate::llm::{ChatCompletionRequest, RequestExecutor, ToolChoice};
use crate::memory::{ConversationState, Message};
use crate::react::LoopEvent;
use crate::tools::{ToolCallValidator, ToolDefinition, ToolDispatcher, ValidatedCall, ValidationFailure, Verdict};

/// 默认迭代上限
pub const DEFAULT_MAX_ITERATIONS: usize = 30;
/// 内联终止工具收到后写回的 tool 结果
pub const TERMINAL_ACK: &str = "Received.";
/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;
/// 思考内容展示最大字符数
const THINKING_PREVIEW_CHARS: usize = 800;

/// 每轮根据循环自身产生的消息重建完整消息数组
pub type MessageBuilder = Box<dyn Fn(&[Message]) -> Vec<Message> + Send + Sync>;

pub enum MessageMode {
    /// 在同一个消息数组上追加
    AppendInPlace,
    /// 状态只保存循环产生的消息，每轮由 builder 拼出完整请求
    Rebuild(MessageBuilder),
}

/// 终止工具如何结束循环
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalKind {
    /// 不调度，直接读取参数中的字段作为最终消息
    Inline { message_field: String },
    /// 正常调度；成功后以该字段为最终消息，失败计入 final answer 失败次数
    Delivered { message_field: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalTool {
    pub name: String,
    pub kind: TerminalKind,
}

impl TerminalTool {
    pub fn inline(name: impl Into<String>, message_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TerminalKind::Inline {
                message_field: message_field.into(),
            },
        }
    }

    pub fn delivered(name: impl Into<String>, message_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TerminalKind::Delivered {
                message_field: message_field.into(),
            },
        }
    }
}

/// 单次循环调用的配置
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub model: String,
    /// 提供给模型的完整工具目录（含终止工具）
    pub tools: Vec<ToolDefinition>,
    pub terminal_tools: Vec<TerminalTool>,
    pub max_iterations: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    /// final answer 工具持续失败时交付的消息；None 时使用最近的 assistant 文本
    pub final_answer_fallback: Option<String>,
}

impl LoopConfig {
    pub fn new(model: impl Into<String>, tools: Vec<ToolDefinition>) -> Self {
        Self {
            model: model.into(),
            tools,
            terminal_tools: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            temperature: 0.2,
            max_tokens: 4096,
            final_answer_fallback: None,
        }
    }

    pub fn with_terminal(mut self, terminal: TerminalTool) -> Self {
        self.terminal_tools.push(terminal);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_final_answer_fallback(mut self, message: impl Into<String>) -> Self {
        self.final_answer_fallback = Some(message.into());
        self
    }

    fn terminal(&self, name: &str) -> Option<&TerminalTool> {
        self.terminal_tools.iter().find(|t| t.name == name)
    }
}

/// 一次非终止工具调用的记录（只追加）
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub tool: String,
    pub args: Value,
    pub result: String,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// 终止工具成功
    Completed,
    /// 模型持续不调用工具，以其文本作答
    NoToolCallFallback,
    /// final answer 工具持续失败，交付兜底消息
    FinalAnswerFallback,
    /// 解析 / Schema 失败达到上限
    ParseFailureAbort,
    /// 迭代次数用尽
    BudgetExhausted,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Completed => "completed",
            Termination::NoToolCallFallback => "no_tool_call_fallback",
            Termination::FinalAnswerFallback => "final_answer_fallback",
            Termination::ParseFailureAbort => "parse_failure_abort",
            Termination::BudgetExhausted => "budget_exhausted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub message: String,
    pub tool_call_history: Vec<ToolCallRecord>,
    /// 不含解析失败噪声的完整消息
    pub all_messages: Vec<Message>,
    pub termination: Termination,
    /// 结束循环的终止工具调用
    pub terminal_call: Option<ValidatedCall>,
}

/// 循环依赖的协作者
pub struct LoopSession<'a> {
    pub executor: &'a RequestExecutor,
    pub dispatcher: &'a dyn ToolDispatcher,
    pub recovery: &'a RecoveryCoordinator,
    pub cancel_token: CancellationToken,
    /// 可选：排队的用户消息
    pub supervisor: Option<&'a SessionSupervisor>,
    /// 可选：事件推送通道
    pub event_tx: Option<&'a UnboundedSender<LoopEvent>>,
}

impl<'a> LoopSession<'a> {
    pub fn new(
        executor: &'a RequestExecutor,
        dispatcher: &'a dyn ToolDispatcher,
        recovery: &'a RecoveryCoordinator,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            executor,
            dispatcher,
            recovery,
            cancel_token,
            supervisor: None,
            event_tx: None,
        }
    }

    pub fn with_supervisor(mut self, supervisor: &'a SessionSupervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn with_event_tx(mut self, tx: &'a UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn send(&self, ev: LoopEvent) {
        if let Some(t) = self.event_tx {
            let _ = t.send(ev);
        }
    }

    fn check_cancelled(&self) -> Result<(), AgentError> {
        if self.cancel_token.is_cancelled() {
            tracing::debug!("tool loop cancelled");
            self.send(LoopEvent::Error {
                text: "Cancelled by user".to_string(),
            });
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }
}

fn preview(text: &str, max: usize) -> String {
    let p: String = text.chars().take(max).collect();
    if text.chars().count() > max {
        format!("{}...", p)
    } else {
        p
    }
}

fn failure_reason(failure: &ValidationFailure) -> String {
    match failure {
        ValidationFailure::UnknownTool { name, .. } => format!("unknown tool '{}'", name),
        ValidationFailure::MalformedArguments { error, .. } => format!("malformed arguments: {}", error),
        ValidationFailure::SchemaViolation(v) => format!("{} schema violation(s)", v.len()),
    }
}

/// 运行一次循环直到终止工具、兜底或迭代上限
pub async fn run_tool_loop(
    session: &LoopSession<'_>,
    config: &LoopConfig,
    mode: &MessageMode,
    initial: Vec<Message>,
) -> Result<LoopOutcome, AgentError> {
    session.check_cancelled()?;

    let limits = *session.recovery.limits();
    let mut state = ConversationState::new(initial);
    let mut counters = InvocationCounters::default();
    let mut validator = ToolCallValidator::with_ceiling(&config.tools, limits.max_parse_failures);
    let mut history: Vec<ToolCallRecord> = Vec::new();
    let mut phase = PhaseTracker::default();
    let tool_names: Vec<String> = config.tools.iter().map(|t| t.name.clone()).collect();
    let terminal_names: Vec<String> = config.terminal_tools.iter().map(|t| t.name.clone()).collect();
    let mut last_delivery_attempt: Option<String> = None;

    let finish = |state: &ConversationState,
                  history: Vec<ToolCallRecord>,
                  message: String,
                  termination: Termination,
                  terminal_call: Option<ValidatedCall>| {
        tracing::info!(termination = termination.as_str(), tool_calls = history.len(), "tool loop finished");
        session.send(LoopEvent::Done {
            termination: termination.as_str().to_string(),
        });
        LoopOutcome {
            message,
            tool_call_history: history,
            all_messages: state.without_noise(),
            termination,
            terminal_call,
        }
    };

    let mut iteration = 0usize;
    while iteration < config.max_iterations {
        session.check_cancelled()?;

        if let Some(text) = session.supervisor.and_then(|s| s.next_queued_message()) {
            session.send(LoopEvent::QueuedMessage { text: preview(&text, THINKING_PREVIEW_CHARS) });
            state.push(Message::user(text));
        }

        let messages = match mode {
            MessageMode::AppendInPlace => state.messages().to_vec(),
            MessageMode::Rebuild(builder) => builder(state.messages()),
        };

        phase.transition(LoopPhase::AwaitingModelResponse);
        session.send(LoopEvent::StepUpdate {
            step: iteration + 1,
            max_steps: config.max_iterations,
        });
        let request = ChatCompletionRequest::new(config.model.clone(), messages)
            .with_tools(config.tools.clone(), ToolChoice::Required)
            .with_sampling(config.temperature, config.max_tokens);

        let response = match session.executor.chat_completion(request, &session.cancel_token).await {
            Ok(r) => r,
            Err(e) => match classify(&e) {
                RecoveryAction::Abort => {
                    session.check_cancelled()?;
                    return Err(AgentError::Cancelled);
                }
                RecoveryAction::CompactAndRetry => {
                    session.send(LoopEvent::Recovery {
                        action: "CompactAndRetry".to_string(),
                        detail: e.to_string(),
                    });
                    match session
                        .recovery
                        .recover_context_overflow(&mut state, &mut counters, e, &session.cancel_token)
                        .await
                    {
                        Ok(()) => continue,
                        Err(LlmError::Interrupted) => return Err(AgentError::Cancelled),
                        Err(original) => {
                            session.send(LoopEvent::Error {
                                text: original.to_string(),
                            });
                            return Err(original.into());
                        }
                    }
                }
                RecoveryAction::Propagate => {
                    session.send(LoopEvent::Error { text: e.to_string() });
                    return Err(e.into());
                }
            },
        };
        session.check_cancelled()?;
        iteration += 1;

        let mut assistant = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .unwrap_or_else(|| Message::assistant(""));
        let visible = if assistant.content.trim().is_empty() {
            assistant.reasoning.clone().unwrap_or_default()
        } else {
            assistant.content.clone()
        };
        if !visible.trim().is_empty() {
            session.send(LoopEvent::ThinkingContent {
                text: preview(&visible, THINKING_PREVIEW_CHARS),
            });
        }

        if assistant.tool_calls.is_empty() {
            phase.transition(LoopPhase::NoToolCallReceived);
            let text = assistant.content.clone();
            if !text.trim().is_empty() {
                state.push(assistant);
            }
            match session
                .recovery
                .on_no_tool_call(&mut counters, &text, &state, &tool_names, &terminal_names)
            {
                NoToolCallDecision::Retry(instruction) => {
                    session.send(LoopEvent::Recovery {
                        action: "NoToolCallRetry".to_string(),
                        detail: instruction.clone(),
                    });
                    state.push(Message::user(instruction));
                    continue;
                }
                NoToolCallDecision::Fallback(message) => {
                    phase.transition(LoopPhase::Completed);
                    return Ok(finish(&state, history, message, Termination::NoToolCallFallback, None));
                }
            }
        }

        if assistant.tool_calls.len() > 1 {
            tracing::warn!(
                count = assistant.tool_calls.len(),
                kept = %assistant.tool_calls[0].name,
                "model returned several tool calls; only the first is processed"
            );
            assistant.tool_calls.truncate(1);
        }
        let call = assistant.tool_calls[0].clone();
        phase.transition(LoopPhase::ToolCallReceived);

        let valid = match validator.validate(&call) {
            Verdict::Valid(v) => v,
            Verdict::Rejected { name, feedback, failure } => {
                session.send(LoopEvent::Rejected {
                    tool: name,
                    reason: failure_reason(&failure),
                });
                state.push(assistant.mark_noise());
                state.push(Message::tool(call.id.clone(), feedback).mark_noise());
                phase.transition(LoopPhase::AwaitingModelResponse);
                continue;
            }
            Verdict::CeilingReached { name, failure } => {
                let message = parse_failure_abort_message(&name, &failure_reason(&failure));
                tracing::warn!(tool = %name, "parse failure ceiling reached; aborting loop");
                phase.transition(LoopPhase::Aborted);
                return Ok(finish(&state, history, message, Termination::ParseFailureAbort, None));
            }
        };

        assistant.tool_calls[0].name = valid.name.clone();
        state.push(assistant);

        if let Some(terminal) = config.terminal(&valid.name) {
            match &terminal.kind {
                TerminalKind::Inline { message_field } => {
                    let message = valid
                        .args
                        .get(message_field)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    state.push(Message::tool(valid.id.clone(), TERMINAL_ACK));
                    phase.transition(LoopPhase::Completed);
                    return Ok(finish(&state, history, message, Termination::Completed, Some(valid)));
                }
                TerminalKind::Delivered { message_field } => {
                    phase.transition(LoopPhase::Dispatched);
                    let outcome = session.dispatcher.invoke(&valid.name, valid.args.clone()).await;
                    session.check_cancelled()?;
                    state.push(Message::tool(valid.id.clone(), outcome.to_message_content()));
                    let attempted = valid
                        .args
                        .get(message_field)
                        .and_then(Value::as_str)
                        .map(ToString::to_string);
                    if outcome.success {
                        let message = attempted.or(outcome.output).unwrap_or_default();
                        phase.transition(LoopPhase::Completed);
                        return Ok(finish(&state, history, message, Termination::Completed, Some(valid)));
                    }
                    session.send(LoopEvent::ToolFailure {
                        tool: valid.name.clone(),
                        reason: outcome.error.clone().unwrap_or_default(),
                    });
                    if attempted.as_deref().is_some_and(|a| !a.trim().is_empty()) {
                        last_delivery_attempt = attempted;
                    }
                    let decision = session.recovery.on_final_answer_failure(&mut counters, || {
                        config
                            .final_answer_fallback
                            .clone()
                            .or_else(|| last_delivery_attempt.clone())
                            .or_else(|| state.last_assistant_text().map(ToString::to_string))
                            .unwrap_or_else(|| "I was unable to deliver a final answer.".to_string())
                    });
                    match decision {
                        FinalAnswerDecision::Retry => continue,
                        FinalAnswerDecision::Fallback(message) => {
                            phase.transition(LoopPhase::Completed);
                            return Ok(finish(&state, history, message, Termination::FinalAnswerFallback, None));
                        }
                    }
                }
            }
        }

        phase.transition(LoopPhase::Dispatched);
        let args = Value::Object(valid.args.clone());
        session.send(LoopEvent::ToolCall {
            tool: valid.name.clone(),
            args: args.clone(),
        });
        let outcome = session.dispatcher.invoke(&valid.name, valid.args).await;
        session.check_cancelled()?;

        let content = outcome.to_message_content();
        if outcome.success {
            session.send(LoopEvent::Observation {
                tool: valid.name.clone(),
                preview: preview(&content, OBSERVATION_PREVIEW_CHARS),
            });
        } else {
            session.send(LoopEvent::ToolFailure {
                tool: valid.name.clone(),
                reason: outcome.error.clone().unwrap_or_default(),
            });
        }
        state.push(Message::tool(valid.id, content.clone()));
        history.push(ToolCallRecord {
            tool: valid.name,
            args,
            result: content,
            success: outcome.success,
        });
    }

    tracing::warn!(max_iterations = config.max_iterations, "tool loop reached its iteration limit");
    let message = state
        .last_assistant_text()
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("Stopped after reaching the iteration limit ({}).", config.max_iterations));
    phase.transition(LoopPhase::Aborted);
    Ok(finish(&state, history, message, Termination::BudgetExhausted, None))
}
