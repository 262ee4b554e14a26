//! Interception Channel：编排循环暂停等待人工决定
//!
//! ask / request_approval 生成一个以 UUID 为键的 PendingInteraction（oneshot + 超时任务），
//! 通过通知通道把 InteractionRequest 推给 UI；UI 调 resolve(id, …) 恰好一次完成它。
//! 超时（默认 5 分钟）后自动以默认值完成：审批视为拒绝，提问给出超时说明。取消时移除条目并停止计时。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::tools::{parse_args, ToolDefinition, ToolDispatcher, ToolOutcome};

pub const DEFAULT_INTERACTION_TIMEOUT: Duration = Duration::from_secs(300);

pub const ASK_USER_TOOL: &str = "ask_user";
pub const REQUEST_APPROVAL_TOOL: &str = "request_approval";

/// 提问超时后返回给模型的默认答复
pub const QUESTION_TIMEOUT_ANSWER: &str =
    "The user did not answer within the time limit. Proceed with your best judgement.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InteractionKind {
    Question { question: String, options: Vec<String> },
    Approval { message: String },
}

/// 推给 UI 的待处理请求
#[derive(Debug, Clone, Serialize)]
pub struct InteractionRequest {
    pub id: String,
    #[serde(flatten)]
    pub kind: InteractionKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionResponse {
    Answer(String),
    Approval(bool),
}

impl InteractionResponse {
    fn into_answer(self) -> String {
        match self {
            InteractionResponse::Answer(a) => a,
            InteractionResponse::Approval(true) => "yes".to_string(),
            InteractionResponse::Approval(false) => "no".to_string(),
        }
    }

    fn into_approval(self) -> bool {
        match self {
            InteractionResponse::Approval(b) => b,
            InteractionResponse::Answer(a) => {
                matches!(a.trim().to_ascii_lowercase().as_str(), "y" | "yes" | "approve" | "approved" | "ok")
            }
        }
    }
}

struct PendingInteraction {
    resolver: oneshot::Sender<InteractionResponse>,
    timeout_handle: JoinHandle<()>,
}

struct Inner {
    pending: Mutex<HashMap<String, PendingInteraction>>,
    notify: mpsc::UnboundedSender<InteractionRequest>,
    timeout: Duration,
}

impl Inner {
    fn take(&self, id: &str) -> Option<PendingInteraction> {
        self.pending.lock().ok().and_then(|mut p| p.remove(id))
    }
}

/// 人工决策通道；clone 共享同一张 pending 表
#[derive(Clone)]
pub struct InterceptionChannel {
    inner: Arc<Inner>,
}

impl InterceptionChannel {
    pub fn new(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<InteractionRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                notify: tx,
                timeout,
            }),
        };
        (channel, rx)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// 完成一个待处理请求；未知 id 或已完成返回 false
    pub fn resolve(&self, id: &str, response: InteractionResponse) -> bool {
        resolve_inner(&self.inner, id, response)
    }

    pub async fn ask(
        &self,
        question: impl Into<String>,
        options: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let kind = InteractionKind::Question {
            question: question.into(),
            options,
        };
        let default = InteractionResponse::Answer(QUESTION_TIMEOUT_ANSWER.to_string());
        self.submit(kind, default, cancel).await.map(InteractionResponse::into_answer)
    }

    pub async fn request_approval(
        &self,
        message: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<bool, AgentError> {
        let kind = InteractionKind::Approval {
            message: message.into(),
        };
        self.submit(kind, InteractionResponse::Approval(false), cancel)
            .await
            .map(InteractionResponse::into_approval)
    }

    async fn submit(
        &self,
        kind: InteractionKind,
        default: InteractionResponse,
        cancel: &CancellationToken,
    ) -> Result<InteractionResponse, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let Ok(mut pending) = self.inner.pending.lock() else {
                return Ok(default);
            };
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            let timer_id = id.clone();
            let timer_default = default.clone();
            let timeout = self.inner.timeout;
            let timeout_handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    tracing::info!(id = %timer_id, "interaction timed out; resolving with default");
                    resolve_inner(&inner, &timer_id, timer_default);
                }
            });
            pending.insert(
                id.clone(),
                PendingInteraction {
                    resolver: tx,
                    timeout_handle,
                },
            );
        }

        let request = InteractionRequest {
            id: id.clone(),
            kind,
            created_at: Utc::now(),
        };
        if self.inner.notify.send(request).is_err() {
            tracing::warn!(id = %id, "no interaction listener; using default response");
            if let Some(p) = self.inner.take(&id) {
                p.timeout_handle.abort();
            }
            return Ok(default);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                if let Some(p) = self.inner.take(&id) {
                    p.timeout_handle.abort();
                }
                tracing::debug!(id = %id, "interaction cancelled");
                Err(AgentError::Cancelled)
            }
            r = rx => Ok(r.unwrap_or(default)),
        }
    }
}

fn resolve_inner(inner: &Inner, id: &str, response: InteractionResponse) -> bool {
    match inner.take(id) {
        Some(p) => {
            p.timeout_handle.abort();
            p.resolver.send(response).is_ok()
        }
        None => false,
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AskUserArgs {
    /// The question to ask the user
    pub question: String,
    /// Suggested answers the user can pick from
    pub options: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RequestApprovalArgs {
    /// What you want the user to approve
    pub message: String,
}

pub fn ask_user_definition() -> ToolDefinition {
    ToolDefinition::for_args::<AskUserArgs>(
        ASK_USER_TOOL,
        "Ask the user a question and wait for the answer.",
    )
}

pub fn request_approval_definition() -> ToolDefinition {
    ToolDefinition::for_args::<RequestApprovalArgs>(
        REQUEST_APPROVAL_TOOL,
        "Ask the user to approve an action before you perform it. Returns whether it was approved.",
    )
}

/// 为内部调度器加上 ask_user / request_approval 两个拦截工具
pub struct InteractiveDispatcher {
    inner: Arc<dyn ToolDispatcher>,
    channel: InterceptionChannel,
    cancel: CancellationToken,
}

impl InteractiveDispatcher {
    pub fn new(inner: Arc<dyn ToolDispatcher>, channel: InterceptionChannel, cancel: CancellationToken) -> Self {
        Self { inner, channel, cancel }
    }
}

/// 处理两个拦截工具；其他名称返回 None
pub async fn handle_interception(
    channel: &InterceptionChannel,
    name: &str,
    args: &Map<String, Value>,
    cancel: &CancellationToken,
) -> Option<ToolOutcome> {
    let args = Value::Object(args.clone());
    match name {
        ASK_USER_TOOL => {
            let a: AskUserArgs = match parse_args(args) {
                Ok(a) => a,
                Err(e) => return Some(ToolOutcome::err(e)),
            };
            Some(match channel.ask(a.question, a.options.unwrap_or_default(), cancel).await {
                Ok(answer) => ToolOutcome::ok(answer),
                Err(e) => ToolOutcome::err(e.to_string()),
            })
        }
        REQUEST_APPROVAL_TOOL => {
            let a: RequestApprovalArgs = match parse_args(args) {
                Ok(a) => a,
                Err(e) => return Some(ToolOutcome::err(e)),
            };
            Some(match channel.request_approval(a.message, cancel).await {
                Ok(true) => ToolOutcome::ok("Approved."),
                Ok(false) => ToolOutcome::ok("Not approved. Do not perform the action."),
                Err(e) => ToolOutcome::err(e.to_string()),
            })
        }
        _ => None,
    }
}

#[async_trait]
impl ToolDispatcher for InteractiveDispatcher {
    async fn invoke(&self, name: &str, args: Map<String, Value>) -> ToolOutcome {
        if let Some(outcome) = handle_interception(&self.channel, name, &args, &self.cancel).await {
            return outcome;
        }
        self.inner.invoke(name, args).await
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = self.inner.definitions();
        defs.push(ask_user_definition());
        defs.push(request_approval_definition());
        defs
    }
}
