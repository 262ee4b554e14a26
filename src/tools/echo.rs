//! Echo 工具（测试用）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::{parse_args, ParameterSchema, Tool};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EchoArgs {
    /// Text to echo back
    pub text: String,
}

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (for testing)."
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::for_type::<EchoArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: EchoArgs = parse_args(args)?;
        Ok(args.text)
    }
}
