//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters / execute），由 ToolRegistry 按名注册与查找；
//! ToolExecutor 在调用时加超时并实现 ToolDispatcher，供编排循环使用。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tools::{ParameterSchema, ToolDefinition};

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为已校验的 JSON 对象）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（tool call 中的 function.name）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 Schema；默认无参数
    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::new()
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.parameters())
    }

    /// 执行工具
    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 把已校验的参数反序列化为工具自己的参数结构体
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {}", e))
}

/// 一次工具调用的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }

    /// 写入 tool 消息的文本
    pub fn to_message_content(&self) -> String {
        if self.success {
            self.output.clone().unwrap_or_default()
        } else {
            format!("Error: {}", self.error.as_deref().unwrap_or("tool failed"))
        }
    }
}

/// 编排循环看到的工具调度接口
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn invoke(&self, name: &str, args: Map<String, Value>) -> ToolOutcome;

    /// 本调度器可提供的工具定义
    fn definitions(&self) -> Vec<ToolDefinition>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<String, String> {
        let tool = self.tools.get(name).ok_or_else(|| format!("Unknown tool: {name}"))?;
        tool.execute(args).await
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 按名称排序的定义列表（请求中工具顺序稳定）
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}
