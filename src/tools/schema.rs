//! 工具参数 Schema
//!
//! ToolDefinition 只保留引擎校验所需的子集：required 集合 + 每个字段的类型与描述。
//! 内置工具的参数由带 `#[derive(JsonSchema)]` 的结构体生成（schemars），结构体与 Schema 不会漂移。

use std::collections::{BTreeMap, BTreeSet};

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// JSON 字段类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Null,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
            ParamType::Null => "null",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "string" => ParamType::String,
            "number" => ParamType::Number,
            "integer" => ParamType::Integer,
            "boolean" => ParamType::Boolean,
            "array" => ParamType::Array,
            "object" => ParamType::Object,
            "null" => ParamType::Null,
            _ => return None,
        })
    }

    /// 实际值的类型（整数优先判为 integer）
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ParamType::Null,
            Value::Bool(_) => ParamType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => ParamType::Integer,
            Value::Number(_) => ParamType::Number,
            Value::String(_) => ParamType::String,
            Value::Array(_) => ParamType::Array,
            Value::Object(_) => ParamType::Object,
        }
    }

    /// number 接受整数；integer 不接受小数
    pub fn accepts(&self, value: &Value) -> bool {
        let actual = ParamType::of(value);
        actual == *self || (*self == ParamType::Number && actual == ParamType::Integer)
    }

    /// 用于「示例调用」的占位值
    pub fn example(&self) -> Value {
        match self {
            ParamType::String => json!("..."),
            ParamType::Number => json!(1.0),
            ParamType::Integer => json!(1),
            ParamType::Boolean => json!(true),
            ParamType::Array => json!([]),
            ParamType::Object => json!({}),
            ParamType::Null => Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertySchema {
    pub kind: ParamType,
    pub description: Option<String>,
    /// 数组元素的 Schema；缺省时按字符串数组发送
    pub items: Option<Value>,
}

impl PropertySchema {
    fn to_json(&self) -> Value {
        let mut v = json!({"type": self.kind.as_str()});
        if let Some(d) = &self.description {
            v["description"] = Value::String(d.clone());
        }
        if self.kind == ParamType::Array {
            v["items"] = self.items.clone().unwrap_or_else(|| json!({"type": "string"}));
        }
        v
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSchema {
    pub required: BTreeSet<String>,
    pub properties: BTreeMap<String, PropertySchema>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(self, name: &str, kind: ParamType, description: &str) -> Self {
        let mut s = self.optional(name, kind, description);
        s.required.insert(name.to_string());
        s
    }

    pub fn optional(mut self, name: &str, kind: ParamType, description: &str) -> Self {
        let description = (!description.is_empty()).then(|| description.to_string());
        self.properties.insert(
            name.to_string(),
            PropertySchema {
                kind,
                description,
                items: None,
            },
        );
        self
    }

    /// 数组字段，元素类型为 `item`
    pub fn array(mut self, name: &str, item: ParamType, description: &str, required: bool) -> Self {
        self = self.optional(name, ParamType::Array, description);
        if let Some(p) = self.properties.get_mut(name) {
            p.items = Some(json!({"type": item.as_str()}));
        }
        if required {
            self.required.insert(name.to_string());
        }
        self
    }

    /// 从 JSON Schema 取子集：properties.*.type / description / items、required；
    /// `type: ["string","null"]` 取第一个非 null 类型，无法识别的类型视为 object。
    /// items 里的 `$ref` 就地展开为 definitions 中的定义
    pub fn from_json_schema(schema: &Value) -> Self {
        let mut out = Self::default();
        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            for (name, prop) in props {
                let kind = match prop.get("type") {
                    Some(Value::String(t)) => ParamType::parse(t),
                    Some(Value::Array(ts)) => ts
                        .iter()
                        .filter_map(Value::as_str)
                        .filter(|t| *t != "null")
                        .find_map(ParamType::parse),
                    _ => None,
                }
                .unwrap_or(ParamType::Object);
                let description = prop
                    .get("description")
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                let items = prop.get("items").map(|i| resolve_ref(schema, i));
                out.properties.insert(
                    name.clone(),
                    PropertySchema {
                        kind,
                        description,
                        items,
                    },
                );
            }
        }
        if let Some(req) = schema.get("required").and_then(Value::as_array) {
            out.required = req
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect();
        }
        out
    }

    /// 由参数结构体生成
    pub fn for_type<T: JsonSchema>() -> Self {
        let schema = schema_for!(T);
        let value = serde_json::to_value(&schema).unwrap_or(Value::Null);
        Self::from_json_schema(&value)
    }

    pub fn to_json(&self) -> Value {
        let properties: Map<String, Value> = self
            .properties
            .iter()
            .map(|(name, p)| (name.clone(), p.to_json()))
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": self.required.iter().collect::<Vec<_>>(),
        })
    }

    /// 满足 Schema 的示例参数（只含 required 字段；无 required 时列出全部字段）
    pub fn example_arguments(&self) -> Value {
        let fields: Map<String, Value> = self
            .properties
            .iter()
            .filter(|(name, _)| self.required.is_empty() || self.required.contains(*name))
            .map(|(name, p)| (name.clone(), p.kind.example()))
            .collect();
        Value::Object(fields)
    }
}

fn resolve_ref(root: &Value, node: &Value) -> Value {
    let target = node
        .get("$ref")
        .and_then(Value::as_str)
        .and_then(|r| r.strip_prefix("#/definitions/"))
        .and_then(|name| root.get("definitions").and_then(|d| d.get(name)));
    match target {
        Some(def) => def.clone(),
        None => node.clone(),
    }
}

/// 一个可调用工具的定义（会话内不可变）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: ParameterSchema) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// 参数来自带 JsonSchema 的结构体
    pub fn for_args<T: JsonSchema>(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, description, ParameterSchema::for_type::<T>())
    }

    /// chat-completions `tools[]` 元素
    pub fn to_wire(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters.to_json(),
            }
        })
    }
}
