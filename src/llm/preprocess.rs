//! 消息预处理：每次请求前规范化对话历史
//!
//! 纯函数，无 I/O。规则：
//! - 除最近一条 assistant 外，剥离推理字段与内联 `<think>…</think>`；
//! - 空 content 的 assistant：最近一条把推理提升为 content（换模型后仍能续聊），更早的直接丢弃推理；
//! - 要求「工具调用消息 content 非空」的模型家族，补一个占位 content；
//! - 丢弃没有对应 assistant.tool_calls 的孤立 tool 消息。
//!
//! 对自身输出再次执行不会产生任何变化。

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::memory::{Message, Role};

/// 这些模型家族拒绝 content 为空的工具调用消息（按模型 id 子串匹配，大小写不敏感）
pub const NON_EMPTY_TOOL_CONTENT_FAMILIES: &[&str] = &["mistral", "moonshot", "kimi", "glm", "minimax"];

/// 补给上述家族的占位 content
pub const TOOL_CALL_PLACEHOLDER: &str = "(calling tool)";

fn think_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>\s*").expect("static think regex"))
}

/// 去掉内联的 `<think>…</think>` 片段
pub fn strip_think_markup(content: &str) -> String {
    if !content.contains("<think>") {
        return content.to_string();
    }
    think_re().replace_all(content, "").trim().to_string()
}

pub fn requires_non_empty_tool_content(model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    NON_EMPTY_TOOL_CONTENT_FAMILIES.iter().any(|f| model.contains(f))
}

pub fn preprocess(messages: &[Message], model: &str) -> Vec<Message> {
    let last_assistant = messages.iter().rposition(|m| m.role == Role::Assistant);
    let placeholder_needed = requires_non_empty_tool_content(model);

    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    // 紧邻的 assistant 发出的 tool_call id；遇到非 tool 消息即重置
    let mut open_calls: HashSet<String> = HashSet::new();

    for (idx, original) in messages.iter().enumerate() {
        let mut msg = original.clone();
        match msg.role {
            Role::Assistant => {
                let reasoning = msg.reasoning.take().filter(|r| !r.trim().is_empty());
                if Some(idx) == last_assistant {
                    if msg.content.trim().is_empty() {
                        if let Some(r) = reasoning {
                            msg.content = r;
                        }
                    } else {
                        msg.reasoning = reasoning;
                    }
                } else {
                    msg.content = strip_think_markup(&msg.content);
                }
                if placeholder_needed && msg.has_tool_calls() && msg.content.trim().is_empty() {
                    msg.content = TOOL_CALL_PLACEHOLDER.to_string();
                }
                open_calls = msg.tool_calls.iter().map(|tc| tc.id.clone()).collect();
            }
            Role::Tool => {
                let paired = msg
                    .tool_call_id
                    .as_deref()
                    .is_some_and(|id| open_calls.contains(id));
                if !paired {
                    tracing::debug!(tool_call_id = ?msg.tool_call_id, "dropping orphaned tool result");
                    continue;
                }
            }
            Role::System | Role::User => open_calls.clear(),
        }
        out.push(msg);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ToolCallRequest;

    fn sample() -> Vec<Message> {
        vec![
            Message::system("sys"),
            Message::user("q1"),
            Message::assistant("<think>old plan</think>answer one").with_reasoning("old reasoning"),
            Message::user("q2"),
            Message::assistant("").with_reasoning("latest reasoning"),
        ]
    }

    #[test]
    fn test_strips_reasoning_except_latest() {
        let out = preprocess(&sample(), "deepseek-chat");
        assert_eq!(out[2].content, "answer one");
        assert!(out[2].reasoning.is_none());
        assert_eq!(out[4].content, "latest reasoning");
    }

    #[test]
    fn test_older_empty_assistant_discards_reasoning() {
        let msgs = vec![
            Message::assistant("").with_reasoning("stale"),
            Message::user("next"),
            Message::assistant("fresh"),
        ];
        let out = preprocess(&msgs, "gpt-4o");
        assert_eq!(out[0].content, "");
        assert!(out[0].reasoning.is_none());
    }

    #[test]
    fn test_latest_keeps_reasoning_when_content_present() {
        let msgs = vec![Message::assistant("visible").with_reasoning("why")];
        let out = preprocess(&msgs, "deepseek-reasoner");
        assert_eq!(out[0].content, "visible");
        assert_eq!(out[0].reasoning.as_deref(), Some("why"));
    }

    #[test]
    fn test_placeholder_for_strict_families() {
        let msgs = vec![
            Message::assistant_with_calls("", vec![ToolCallRequest::new("c1", "ls", "{}")]),
            Message::tool("c1", "ok"),
        ];
        let strict = preprocess(&msgs, "Mistral-Large-2411");
        assert_eq!(strict[0].content, TOOL_CALL_PLACEHOLDER);
        let lenient = preprocess(&msgs, "gpt-4o-mini");
        assert_eq!(lenient[0].content, "");
    }

    #[test]
    fn test_orphaned_tool_results_are_dropped() {
        let msgs = vec![
            Message::user("go"),
            Message::tool("ghost", "nobody asked"),
            Message::assistant_with_calls("", vec![ToolCallRequest::new("c1", "ls", "{}")]),
            Message::tool("c1", "ok"),
            Message::tool("c2", "wrong id"),
            Message::user("again"),
            Message::tool("c1", "late duplicate"),
        ];
        let out = preprocess(&msgs, "gpt-4o");
        let tool_ids: Vec<_> = out
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.clone())
            .collect();
        assert_eq!(tool_ids, vec!["c1".to_string()]);
    }

    #[test]
    fn test_every_tool_message_is_paired_with_preceding_assistant() {
        let msgs = vec![
            Message::assistant_with_calls(
                "",
                vec![ToolCallRequest::new("a", "ls", "{}"), ToolCallRequest::new("b", "cat", "{}")],
            ),
            Message::tool("a", "1"),
            Message::tool("b", "2"),
            Message::tool("z", "3"),
        ];
        let out = preprocess(&msgs, "m");
        let mut ids: HashSet<String> = HashSet::new();
        for m in &out {
            match m.role {
                Role::Assistant => ids = m.tool_calls.iter().map(|t| t.id.clone()).collect(),
                Role::Tool => assert!(ids.contains(m.tool_call_id.as_deref().unwrap())),
                _ => ids.clear(),
            }
        }
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_idempotent() {
        let mut msgs = sample();
        msgs.push(Message::assistant_with_calls("", vec![ToolCallRequest::new("c9", "ls", "{}")]));
        msgs.push(Message::tool("c9", "files"));
        msgs.push(Message::tool("orphan", "x"));
        for model in ["deepseek-reasoner", "kimi-k2"] {
            let once = preprocess(&msgs, model);
            let twice = preprocess(&once, model);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_every_assistant_has_defined_content() {
        let msgs = vec![Message::assistant("<think>only thoughts</think>"), Message::assistant("x")];
        let out = preprocess(&msgs, "m");
        assert_eq!(out[0].content, "");
    }
}
