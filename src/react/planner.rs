//! Planner：澄清 → 计划
//!
//! 外层最多 max_rounds 轮澄清，每轮包一个最多 max_attempts 次模型调用的通用循环。
//! 工具：ask_clarifying_question / create_plan / respond_directly，三者都是内联终止工具。
//! 提问经 Interception Channel 转给用户；没有通道或处于最后一轮时不提供提问工具，模型只能直接出计划。
//! 全部轮次用尽时退化为「以请求原文为唯一步骤」的计划。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, InterceptionChannel, RecoveryCoordinator};
use crate::llm::RequestExecutor;
use crate::memory::Message;
use crate::react::{run_tool_loop, LoopConfig, LoopSession, MessageMode, TerminalTool, Termination};
use crate::tools::{parse_args, ToolDefinition, ToolDispatcher, ToolOutcome};

pub const ASK_CLARIFYING_QUESTION_TOOL: &str = "ask_clarifying_question";
pub const CREATE_PLAN_TOOL: &str = "create_plan";
pub const RESPOND_DIRECTLY_TOOL: &str = "respond_directly";

/// 兜底计划里请求原文的最大长度
const FALLBACK_REQUEST_CHARS: usize = 200;

const PLANNER_PROMPT: &str = "You turn a user's request into an executable plan. \
If the request is ambiguous and a question would materially change the plan, call ask_clarifying_question. \
If the request needs no work (a greeting, a simple factual answer), call respond_directly. \
Otherwise call create_plan with a short summary and concrete, ordered steps. Always answer with exactly one tool call.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub summary: String,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    Plan(Plan),
    /// 无需计划，直接回复
    Direct(String),
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AskClarifyingQuestionArgs {
    /// One focused question for the user
    pub question: String,
    /// Suggested answers
    pub options: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreatePlanArgs {
    /// One-sentence summary of the plan
    pub summary: String,
    /// Ordered, concrete steps
    pub steps: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RespondDirectlyArgs {
    /// The reply to the user
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub model: String,
    pub max_rounds: usize,
    pub max_attempts: usize,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl PlannerConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_rounds: 5,
            max_attempts: 3,
            temperature: 0.2,
            max_tokens: 4096,
        }
    }
}

/// Planner 的工具都是内联终止工具，不会真正调度
struct InlineOnly;

#[async_trait]
impl ToolDispatcher for InlineOnly {
    async fn invoke(&self, name: &str, _args: Map<String, Value>) -> ToolOutcome {
        ToolOutcome::err(format!("Tool '{}' is not available while planning", name))
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }
}

/// 请求原文作为唯一步骤的兜底计划
pub fn fallback_plan(request: &str) -> Plan {
    let text: String = request.trim().chars().take(FALLBACK_REQUEST_CHARS).collect();
    Plan {
        summary: text.clone(),
        steps: vec![text],
    }
}

pub struct Planner {
    executor: Arc<RequestExecutor>,
    recovery: Arc<RecoveryCoordinator>,
    channel: Option<InterceptionChannel>,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(
        executor: Arc<RequestExecutor>,
        recovery: Arc<RecoveryCoordinator>,
        channel: Option<InterceptionChannel>,
        config: PlannerConfig,
    ) -> Self {
        Self {
            executor,
            recovery,
            channel,
            config,
        }
    }

    fn round_config(&self, can_ask: bool) -> LoopConfig {
        let mut tools = vec![
            ToolDefinition::for_args::<CreatePlanArgs>(CREATE_PLAN_TOOL, "Create the execution plan."),
            ToolDefinition::for_args::<RespondDirectlyArgs>(
                RESPOND_DIRECTLY_TOOL,
                "Reply to the user directly when no plan is needed.",
            ),
        ];
        if can_ask {
            tools.push(ToolDefinition::for_args::<AskClarifyingQuestionArgs>(
                ASK_CLARIFYING_QUESTION_TOOL,
                "Ask the user one clarifying question before planning.",
            ));
        }
        let mut config = LoopConfig::new(self.config.model.clone(), tools)
            .with_terminal(TerminalTool::inline(CREATE_PLAN_TOOL, "summary"))
            .with_terminal(TerminalTool::inline(RESPOND_DIRECTLY_TOOL, "message"))
            .with_max_iterations(self.config.max_attempts)
            .with_sampling(self.config.temperature, self.config.max_tokens);
        if can_ask {
            config = config.with_terminal(TerminalTool::inline(ASK_CLARIFYING_QUESTION_TOOL, "question"));
        }
        config
    }

    pub async fn plan(&self, request: &str, cancel: &CancellationToken) -> Result<PlanOutcome, AgentError> {
        let dispatcher = InlineOnly;
        let session = LoopSession::new(&self.executor, &dispatcher, &self.recovery, cancel.clone());
        let mut conversation = vec![Message::system(PLANNER_PROMPT), Message::user(request)];

        for round in 0..self.config.max_rounds {
            let last_round = round + 1 == self.config.max_rounds;
            let can_ask = self.channel.is_some() && !last_round;
            let config = self.round_config(can_ask);
            let outcome = run_tool_loop(&session, &config, &MessageMode::AppendInPlace, conversation.clone()).await?;

            match outcome.termination {
                Termination::Completed => {}
                Termination::NoToolCallFallback => return Ok(PlanOutcome::Direct(outcome.message)),
                Termination::ParseFailureAbort => {
                    tracing::warn!("planner aborted on invalid tool calls; using fallback plan");
                    return Ok(PlanOutcome::Plan(fallback_plan(request)));
                }
                Termination::FinalAnswerFallback | Termination::BudgetExhausted => {
                    tracing::info!(round = round + 1, "planning round ended without a decision");
                    conversation = outcome.all_messages;
                    continue;
                }
            }

            let Some(call) = outcome.terminal_call else {
                conversation = outcome.all_messages;
                continue;
            };
            match call.name.as_str() {
                CREATE_PLAN_TOOL => {
                    let args: CreatePlanArgs =
                        parse_args(Value::Object(call.args)).map_err(AgentError::PlanError)?;
                    let steps: Vec<String> = args
                        .steps
                        .into_iter()
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                    let steps = if steps.is_empty() {
                        vec![args.summary.clone()]
                    } else {
                        steps
                    };
                    tracing::info!(steps = steps.len(), "plan created");
                    return Ok(PlanOutcome::Plan(Plan {
                        summary: args.summary,
                        steps,
                    }));
                }
                RESPOND_DIRECTLY_TOOL => return Ok(PlanOutcome::Direct(outcome.message)),
                ASK_CLARIFYING_QUESTION_TOOL => {
                    let args: AskClarifyingQuestionArgs =
                        parse_args(Value::Object(call.args)).map_err(AgentError::PlanError)?;
                    let Some(channel) = &self.channel else {
                        conversation = outcome.all_messages;
                        continue;
                    };
                    let answer = channel
                        .ask(args.question.clone(), args.options.unwrap_or_default(), cancel)
                        .await?;
                    tracing::info!(round = round + 1, "clarifying question answered");
                    conversation = outcome.all_messages;
                    conversation.push(Message::user(format!(
                        "Answer to \"{}\": {}",
                        args.question, answer
                    )));
                }
                other => {
                    return Err(AgentError::PlanError(format!("unexpected terminal tool '{}'", other)));
                }
            }
        }

        tracing::warn!(rounds = self.config.max_rounds, "planner exhausted its rounds; using fallback plan");
        Ok(PlanOutcome::Plan(fallback_plan(request)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_plan_truncates() {
        let request = "x".repeat(500);
        let plan = fallback_plan(&request);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].chars().count(), 200);
    }
}
