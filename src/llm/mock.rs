//! Mock 传输（用于测试与无 API key 的本地演示）
//!
//! - ScriptedTransport：按脚本依次返回响应 / 错误，记录收到的请求与时间点；
//! - EchoTransport：无脚本的回显模型，先调 echo，再用终止工具交付结果，便于本地跑通编排流程。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{ChatCompletionRequest, ChatCompletionResponse, ChatTransport, TransportError};
use crate::memory::{Message, Role, ToolCallRequest};

/// 脚本中的一步
pub enum ScriptStep {
    Reply(Result<ChatCompletionResponse, TransportError>),
    /// 永不返回（测试超时与取消）
    Hang,
}

pub struct ScriptedTransport {
    script: Mutex<VecDeque<ScriptStep>>,
    requests: Mutex<Vec<ChatCompletionRequest>>,
    instants: Mutex<Vec<tokio::time::Instant>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Result<ChatCompletionResponse, TransportError>>) -> Self {
        Self::from_steps(replies.into_iter().map(ScriptStep::Reply))
    }

    pub fn from_steps(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            instants: Mutex::new(Vec::new()),
        }
    }

    /// n 次调用都挂起
    pub fn hanging(n: usize) -> Self {
        Self::from_steps((0..n).map(|_| ScriptStep::Hang))
    }

    pub fn push(&self, reply: Result<ChatCompletionResponse, TransportError>) {
        if let Ok(mut s) = self.script.lock() {
            s.push_back(ScriptStep::Reply(reply));
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn requests(&self) -> Vec<ChatCompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_instants(&self) -> Vec<tokio::time::Instant> {
        self.instants.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn send(&self, request: &ChatCompletionRequest) -> Result<ChatCompletionResponse, TransportError> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(request.clone());
        }
        if let Ok(mut i) = self.instants.lock() {
            i.push(tokio::time::Instant::now());
        }
        let step = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match step {
            Some(ScriptStep::Reply(reply)) => reply,
            Some(ScriptStep::Hang) => std::future::pending().await,
            None => Err(TransportError::Decode("mock script exhausted".into())),
        }
    }

    fn endpoint(&self) -> &str {
        "mock://scripted"
    }
}

/// 一条只含单个工具调用的响应
pub fn tool_call_response(id: &str, name: &str, arguments: Value) -> ChatCompletionResponse {
    let raw = match arguments {
        Value::String(s) => s,
        other => other.to_string(),
    };
    ChatCompletionResponse::from_message(
        Message::assistant_with_calls("", vec![ToolCallRequest::new(id, name, raw)]),
        "tool_calls",
    )
}

/// 原样给出 raw arguments（用于构造畸形 JSON）
pub fn raw_tool_call_response(id: &str, name: &str, raw_arguments: &str) -> ChatCompletionResponse {
    ChatCompletionResponse::from_message(
        Message::assistant_with_calls("", vec![ToolCallRequest::new(id, name, raw_arguments)]),
        "tool_calls",
    )
}

/// 纯文本响应（无工具调用）
pub fn text_response(content: &str) -> ChatCompletionResponse {
    ChatCompletionResponse::from_message(Message::assistant(content), "stop")
}

/// 回显模型：工具结果出现后用第一个可用的终止工具交付；否则调 echo
#[derive(Debug, Default)]
pub struct EchoTransport;

const DELIVERY_TOOLS: &[&str] = &["final_answer", "report_to_user", "respond_directly", "create_plan"];

#[async_trait]
impl ChatTransport for EchoTransport {
    async fn send(&self, request: &ChatCompletionRequest) -> Result<ChatCompletionResponse, TransportError> {
        let offered = |name: &str| request.tools.iter().any(|t| t.name == name);
        let last = request.messages.last();
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "(no input)".to_string());
        let id = format!("call_{}", uuid::Uuid::new_v4().simple());

        let after_tool = last.is_some_and(|m| m.role == Role::Tool);
        if !after_tool && offered("echo") {
            return Ok(tool_call_response(&id, "echo", json!({"text": last_user})));
        }

        let content = match last {
            Some(m) if m.role == Role::Tool => m.content.clone(),
            _ => format!("Echo from Mock: {}", last_user),
        };
        match DELIVERY_TOOLS.iter().find(|t| offered(t)) {
            Some(&"create_plan") => Ok(tool_call_response(
                &id,
                "create_plan",
                json!({"summary": content, "steps": [last_user]}),
            )),
            Some(name) => Ok(tool_call_response(&id, name, json!({"message": content}))),
            None => Ok(text_response(&content)),
        }
    }

    fn endpoint(&self) -> &str {
        "mock://echo"
    }
}
