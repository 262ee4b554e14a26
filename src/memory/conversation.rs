//! 对话状态：消息模型与 ConversationState
//!
//! Message 与 chat-completions 的 role/content/tool_calls/tool_call_id 一一对应；
//! ConversationState 由单次编排调用独占，每轮迭代追加，退出时整体返回给调用方。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// 模型提出的一次工具调用；raw_arguments 是未经校验的原始文本
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub raw_arguments: String,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, raw_arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            raw_arguments: raw_arguments.into(),
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// 推理模型返回的思考过程（reasoning_content）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// 解析失败产生的噪声消息：仅供下一轮自我纠正，不进入返回给调用方的历史
    #[serde(skip)]
    pub noise: bool,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            reasoning: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            noise: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// 携带工具调用的 assistant 消息
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, content);
        msg.tool_calls = calls;
        msg
    }

    /// 工具结果消息，tool_call_id 必须对应紧邻的 assistant.tool_calls[].id
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::with_role(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn mark_noise(mut self) -> Self {
        self.noise = true;
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// 单次编排调用持有的可变对话序列
#[derive(Clone, Debug, Default)]
pub struct ConversationState {
    messages: Vec<Message>,
}

impl ConversationState {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn set_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// 回滚最近一次工具交换：弹出末尾所有 tool 消息及触发它们的 assistant 消息。
    /// 返回被移除的条数；末尾不是工具交换时不做任何事。
    pub fn rollback_last_exchange(&mut self) -> usize {
        let before = self.messages.len();
        while matches!(self.messages.last(), Some(m) if m.role == Role::Tool) {
            self.messages.pop();
        }
        if matches!(self.messages.last(), Some(m) if m.role == Role::Assistant && m.has_tool_calls()) {
            self.messages.pop();
        }
        before - self.messages.len()
    }

    /// 去掉解析失败噪声后的历史（返回给调用方 / 持久化用）
    pub fn without_noise(&self) -> Vec<Message> {
        self.messages.iter().filter(|m| !m.noise).cloned().collect()
    }

    /// 最近一条非空 assistant 文本
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content.trim())
            .find(|c| !c.is_empty())
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_pops_tool_results_and_caller() {
        let mut state = ConversationState::new(vec![
            Message::system("sys"),
            Message::user("do it"),
            Message::assistant_with_calls("", vec![ToolCallRequest::new("c1", "ls", "{}")]),
            Message::tool("c1", "a b c"),
        ]);
        assert_eq!(state.rollback_last_exchange(), 2);
        assert_eq!(state.len(), 2);
        assert_eq!(state.messages()[1].role, Role::User);
    }

    #[test]
    fn test_rollback_noop_without_exchange() {
        let mut state = ConversationState::new(vec![Message::user("hi"), Message::assistant("hello")]);
        assert_eq!(state.rollback_last_exchange(), 0);
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_without_noise_filters_marked_pairs() {
        let mut state = ConversationState::default();
        state.push(Message::user("task"));
        state.push(Message::assistant_with_calls("", vec![ToolCallRequest::new("x", "ls", "{bad")]).mark_noise());
        state.push(Message::tool("x", "invalid JSON").mark_noise());
        state.push(Message::assistant("done"));
        let clean = state.without_noise();
        assert_eq!(clean.len(), 2);
        assert!(clean.iter().all(|m| m.role != Role::Tool));
    }

    #[test]
    fn test_last_assistant_text_skips_empty() {
        let state = ConversationState::new(vec![
            Message::assistant("first answer"),
            Message::assistant_with_calls("", vec![ToolCallRequest::new("c", "ls", "{}")]),
            Message::tool("c", "ok"),
        ]);
        assert_eq!(state.last_assistant_text(), Some("first answer"));
    }
}
