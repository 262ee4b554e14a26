//! 工具调用校验：名称清洗、参数解析、Schema 检查、连续失败上限
//!
//! 校验失败不是错误：它变成写回对话的纠正反馈，让模型在下一轮自行修正；
//! 连续失败达到上限（默认 3）时由编排循环受控中止。

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::memory::ToolCallRequest;
use crate::tools::{ParamType, ToolDefinition};

/// 连续失败上限
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;
/// 反馈里引用原始参数的最大长度
const RAW_PREVIEW_CHARS: usize = 500;

fn delimiter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<[|｜][^|｜>]*[|｜]>|</?tool_call>").expect("static delimiter regex")
    })
}

/// 清洗工具名；返回 (清洗后名称, 是否被污染)
pub fn sanitize_tool_name(raw: &str) -> (String, bool) {
    let stripped = delimiter_re().replace_all(raw, "");
    let cleaned = stripped
        .trim()
        .trim_end_matches(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .to_string();
    let contaminated = cleaned != raw;
    (cleaned, contaminated)
}

/// 单个字段的违规
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: String,
    pub expected: ParamType,
    /// None 表示缺失
    pub found: Option<ParamType>,
}

impl FieldViolation {
    fn describe(&self) -> String {
        match self.found {
            None => format!("missing required field '{}' (expected {})", self.field, self.expected.as_str()),
            Some(found) => format!(
                "field '{}' must be {}, got {}",
                self.field,
                self.expected.as_str(),
                found.as_str()
            ),
        }
    }
}

/// 校验失败原因
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationFailure {
    UnknownTool { name: String, available: Vec<String> },
    MalformedArguments { raw: String, error: String, example: Value },
    SchemaViolation(Vec<FieldViolation>),
}

impl ValidationFailure {
    /// 写回给模型的纠正反馈
    pub fn feedback(&self, tool: &str) -> String {
        match self {
            ValidationFailure::UnknownTool { name, available } => format!(
                "Error: unknown tool '{}'. Available tools: {}. Call exactly one of these.",
                name,
                available.join(", ")
            ),
            ValidationFailure::MalformedArguments { raw, error, example } => format!(
                "Error: arguments for '{}' are not a valid JSON object ({}).\nReceived: {}\nExample of a valid call: {}",
                tool, error, raw, example
            ),
            ValidationFailure::SchemaViolation(violations) => {
                let lines: Vec<String> = violations.iter().map(|v| format!("- {}", v.describe())).collect();
                format!(
                    "Error: arguments for '{}' do not match its schema:\n{}\nFix the arguments and call the tool again.",
                    tool,
                    lines.join("\n")
                )
            }
        }
    }
}

fn truncate(raw: &str) -> String {
    if raw.chars().count() > RAW_PREVIEW_CHARS {
        format!("{}...", raw.chars().take(RAW_PREVIEW_CHARS).collect::<String>())
    } else {
        raw.to_string()
    }
}

/// 解析原始参数文本为 JSON 对象；空文本视为 {}
pub fn parse_arguments(raw: &str, def: &ToolDefinition) -> Result<Map<String, Value>, ValidationFailure> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    let malformed = |error: String| ValidationFailure::MalformedArguments {
        raw: truncate(raw),
        error,
        example: def.parameters.example_arguments(),
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(malformed(format!("expected an object, got {}", ParamType::of(&other).as_str()))),
        Err(e) => Err(malformed(e.to_string())),
    }
}

/// 按 Schema 检查参数；可选字段为 null 时视为缺省并移除
pub fn check_schema(mut args: Map<String, Value>, def: &ToolDefinition) -> Result<Map<String, Value>, ValidationFailure> {
    let schema = &def.parameters;
    let mut violations = Vec::new();

    for name in &schema.required {
        let expected = schema
            .properties
            .get(name)
            .map(|p| p.kind)
            .unwrap_or(ParamType::String);
        match args.get(name) {
            None | Some(Value::Null) => violations.push(FieldViolation {
                field: name.clone(),
                expected,
                found: None,
            }),
            _ => {}
        }
    }

    let optional_nulls: Vec<String> = args
        .iter()
        .filter(|(k, v)| v.is_null() && !schema.required.contains(*k))
        .map(|(k, _)| k.clone())
        .collect();
    for k in optional_nulls {
        args.remove(&k);
    }

    for (name, value) in &args {
        let Some(prop) = schema.properties.get(name) else {
            continue;
        };
        if value.is_null() || prop.kind.accepts(value) {
            continue;
        }
        violations.push(FieldViolation {
            field: name.clone(),
            expected: prop.kind,
            found: Some(ParamType::of(value)),
        });
    }

    if violations.is_empty() {
        Ok(args)
    } else {
        Err(ValidationFailure::SchemaViolation(violations))
    }
}

/// 校验通过的调用
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedCall {
    pub id: String,
    pub name: String,
    pub args: Map<String, Value>,
}

/// 有状态的校验器：记录连续失败次数与名称污染次数
#[derive(Debug)]
pub struct ToolCallValidator {
    definitions: HashMap<String, ToolDefinition>,
    max_consecutive_failures: u32,
    consecutive_failures: u32,
    contamination_events: u32,
}

/// 一次校验的结论
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Valid(ValidatedCall),
    /// 失败但未到上限：带上清洗后的名称与反馈
    Rejected { name: String, feedback: String, failure: ValidationFailure },
    /// 连续失败达到上限
    CeilingReached { name: String, failure: ValidationFailure },
}

impl ToolCallValidator {
    pub fn new(definitions: &[ToolDefinition]) -> Self {
        Self::with_ceiling(definitions, DEFAULT_MAX_CONSECUTIVE_FAILURES)
    }

    pub fn with_ceiling(definitions: &[ToolDefinition], max_consecutive_failures: u32) -> Self {
        Self {
            definitions: definitions.iter().map(|d| (d.name.clone(), d.clone())).collect(),
            max_consecutive_failures: max_consecutive_failures.max(1),
            consecutive_failures: 0,
            contamination_events: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn contamination_events(&self) -> u32 {
        self.contamination_events
    }

    fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.keys().cloned().collect();
        names.sort();
        names
    }

    /// 校验单个调用（只做校验，不 dispatch）
    pub fn validate(&mut self, call: &ToolCallRequest) -> Verdict {
        let (name, contaminated) = sanitize_tool_name(&call.name);
        if contaminated {
            self.contamination_events += 1;
            tracing::warn!(raw = %call.name, cleaned = %name, "tool name contaminated by delimiter tokens");
        }

        let result = match self.definitions.get(&name) {
            None => Err(ValidationFailure::UnknownTool {
                name: name.clone(),
                available: self.available(),
            }),
            Some(def) => parse_arguments(&call.raw_arguments, def).and_then(|args| check_schema(args, def)),
        };

        match result {
            Ok(args) => {
                self.consecutive_failures = 0;
                Verdict::Valid(ValidatedCall {
                    id: call.id.clone(),
                    name,
                    args,
                })
            }
            Err(failure) => {
                self.consecutive_failures += 1;
                tracing::warn!(
                    tool = %name,
                    consecutive = self.consecutive_failures,
                    "rejected tool call: {:?}",
                    failure
                );
                if self.consecutive_failures >= self.max_consecutive_failures {
                    Verdict::CeilingReached { name, failure }
                } else {
                    let feedback = failure.feedback(&name);
                    Verdict::Rejected { name, feedback, failure }
                }
            }
        }
    }
}

/// 无状态校验
pub fn validate(call: &ToolCallRequest, def: &ToolDefinition) -> Result<Map<String, Value>, ValidationFailure> {
    let (name, _) = sanitize_tool_name(&call.name);
    if name != def.name {
        return Err(ValidationFailure::UnknownTool {
            name,
            available: vec![def.name.clone()],
        });
    }
    parse_arguments(&call.raw_arguments, def).and_then(|args| check_schema(args, def))
}
