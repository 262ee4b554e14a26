//! chat-completions 请求 / 响应模型
//!
//! 引擎内部使用 Message / ToolDefinition；只有 HTTP 传输层才需要 to_wire_json / from_wire_json 与具体 JSON 形状打交道。

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value};

use crate::memory::{Message, Role, ToolCallRequest};
use crate::tools::ToolDefinition;

/// tool_choice 取值
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    /// 必须调用某个工具
    Required,
    /// 强制调用指定工具
    Function(String),
}

impl Serialize for ToolChoice {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ToolChoice::Required => serializer.serialize_str("required"),
            ToolChoice::Function(name) => {
                json!({"type": "function", "function": {"name": name}}).serialize(serializer)
            }
        }
    }
}

/// 一次 chat-completion 请求
#[derive(Debug, Clone)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatCompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            tool_choice: None,
            temperature: 0.2,
            max_tokens: 4096,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>, choice: ToolChoice) -> Self {
        self.tools = tools;
        self.tool_choice = Some(choice);
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// 序列化为 OpenAI 兼容的请求体
    pub fn to_wire_json(&self) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": self.messages.iter().map(message_to_wire).collect::<Vec<_>>(),
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        if !self.tools.is_empty() {
            body["tools"] = Value::Array(self.tools.iter().map(ToolDefinition::to_wire).collect());
            if let Some(choice) = &self.tool_choice {
                body["tool_choice"] = serde_json::to_value(choice).unwrap_or(Value::Null);
            }
        }
        body
    }
}

fn message_to_wire(m: &Message) -> Value {
    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut v = json!({"role": role, "content": m.content});
    if m.role == Role::Assistant {
        if let Some(reasoning) = &m.reasoning {
            v["reasoning_content"] = Value::String(reasoning.clone());
        }
        if !m.tool_calls.is_empty() {
            v["tool_calls"] = Value::Array(
                m.tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {"name": tc.name, "arguments": tc.raw_arguments},
                        })
                    })
                    .collect(),
            );
        }
    }
    if let Some(id) = &m.tool_call_id {
        v["tool_call_id"] = Value::String(id.clone());
    }
    v
}

/// Token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct Choice {
    /// role 恒为 Assistant
    pub message: Message,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatCompletionResponse {
    pub choices: Vec<Choice>,
    pub usage: Option<Usage>,
}

impl ChatCompletionResponse {
    /// 便于构造测试响应
    pub fn from_message(message: Message, finish_reason: &str) -> Self {
        Self {
            choices: vec![Choice {
                message,
                finish_reason: Some(finish_reason.to_string()),
            }],
            usage: None,
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.usage = Some(Usage {
            prompt_tokens,
            completion_tokens,
        });
        self
    }

    pub fn first(&self) -> Option<&Choice> {
        self.choices.first()
    }

    /// 输出被 max_tokens 截断且既无文本也无工具调用
    pub fn is_truncated_empty(&self) -> bool {
        match self.first() {
            Some(c) => {
                c.finish_reason.as_deref() == Some("length")
                    && c.message.content.trim().is_empty()
                    && c.message.tool_calls.is_empty()
            }
            None => false,
        }
    }

    /// 解析 OpenAI 兼容的响应体
    pub fn from_wire_json(body: &str) -> Result<Self, serde_json::Error> {
        let wire: WireResponse = serde_json::from_str(body)?;
        let choices = wire
            .choices
            .into_iter()
            .map(|c| {
                let tool_calls = c
                    .message
                    .tool_calls
                    .unwrap_or_default()
                    .into_iter()
                    .map(|tc| {
                        let raw_arguments = match tc.function.arguments {
                            Some(Value::String(s)) => s,
                            Some(Value::Null) | None => String::new(),
                            Some(other) => other.to_string(),
                        };
                        ToolCallRequest {
                            id: tc
                                .id
                                .filter(|id| !id.is_empty())
                                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
                            name: tc.function.name,
                            raw_arguments,
                        }
                    })
                    .collect();
                let mut message =
                    Message::assistant_with_calls(c.message.content.unwrap_or_default(), tool_calls);
                message.reasoning = c.message.reasoning_content.filter(|r| !r.is_empty());
                Choice {
                    message,
                    finish_reason: c.finish_reason,
                }
            })
            .collect();
        Ok(Self {
            choices,
            usage: wire.usage,
        })
    }
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireAssistantMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireAssistantMessage {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: Option<String>,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    arguments: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tool_call_response() {
        let body = r#"{
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{"id": "call_1", "type": "function",
                        "function": {"name": "list_files", "arguments": "{\"directory\":\"/tmp\"}"}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 7, "total_tokens": 19}
        }"#;
        let resp = ChatCompletionResponse::from_wire_json(body).unwrap();
        let choice = resp.first().unwrap();
        assert_eq!(choice.message.content, "");
        assert_eq!(choice.message.tool_calls[0].name, "list_files");
        assert_eq!(choice.message.tool_calls[0].raw_arguments, r#"{"directory":"/tmp"}"#);
        assert_eq!(resp.usage.unwrap().completion_tokens, 7);
    }

    #[test]
    fn test_object_arguments_are_stringified() {
        let body = r#"{"choices":[{"message":{"content":"","tool_calls":[
            {"function":{"name":"echo","arguments":{"text":"hi"}}}]},"finish_reason":"tool_calls"}]}"#;
        let resp = ChatCompletionResponse::from_wire_json(body).unwrap();
        let tc = &resp.first().unwrap().message.tool_calls[0];
        assert!(tc.id.starts_with("call_"));
        assert_eq!(tc.raw_arguments, r#"{"text":"hi"}"#);
    }

    #[test]
    fn test_wire_request_shape() {
        let req = ChatCompletionRequest::new(
            "m",
            vec![
                Message::assistant_with_calls("", vec![ToolCallRequest::new("c1", "echo", "{}")]),
                Message::tool("c1", "ok"),
            ],
        )
        .with_tools(Vec::new(), ToolChoice::Required);
        let wire = req.to_wire_json();
        assert_eq!(wire["messages"][0]["tool_calls"][0]["function"]["name"], "echo");
        assert_eq!(wire["messages"][1]["tool_call_id"], "c1");
        assert!(wire.get("tools").is_none());
        assert_eq!(
            serde_json::to_value(ToolChoice::Function("plan".into())).unwrap()["function"]["name"],
            "plan"
        );
    }

    #[test]
    fn test_truncated_empty_detection() {
        let resp = ChatCompletionResponse::from_message(Message::assistant(""), "length");
        assert!(resp.is_truncated_empty());
        let resp = ChatCompletionResponse::from_message(Message::assistant("partial"), "length");
        assert!(!resp.is_truncated_empty());
    }
}
