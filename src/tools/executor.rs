//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时，invoke(tool_name, args) 在超时内调用 registry.execute，
//! 超时或失败时转为失败的 ToolOutcome；每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::time::timeout;

use crate::tools::{ToolDefinition, ToolDispatcher, ToolOutcome, ToolRegistry};

/// 工具执行器：对每次调用施加超时
#[derive(Clone)]
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }
}

#[async_trait]
impl ToolDispatcher for ToolExecutor {
    async fn invoke(&self, name: &str, args: Map<String, Value>) -> ToolOutcome {
        let start = Instant::now();
        let args = Value::Object(args);
        let args_preview = args_preview(&args);
        let result = timeout(self.timeout, self.registry.execute(name, args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(content)) => ToolOutcome::ok(content),
            Ok(Err(e)) => ToolOutcome::err(e),
            Err(_) => ToolOutcome::err(format!(
                "Tool '{}' timed out after {}s",
                name,
                self.timeout.as_secs()
            )),
        }
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, Tool};

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "never finishes in time"
        }
        async fn execute(&self, _args: Value) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("late".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_failed_outcome() {
        let mut reg = ToolRegistry::new();
        reg.register(SlowTool);
        let exec = ToolExecutor::new(reg, 5);
        let out = exec.invoke("slow", Map::new()).await;
        assert!(!out.success);
        assert!(out.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_invoke_success_and_unknown() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        let exec = ToolExecutor::new(reg, 5);
        let mut args = Map::new();
        args.insert("text".into(), Value::String("ping".into()));
        assert_eq!(exec.invoke("echo", args).await, ToolOutcome::ok("ping"));
        assert!(!exec.invoke("ghost", Map::new()).await.success);
    }
}
