//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CONDUCTOR__*` 覆盖（双下划线表示嵌套，如 `CONDUCTOR__LLM__MODEL=gpt-4o`）。
//! 没有任何配置文件时全部使用默认值。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::RecoveryLimits;
use crate::llm::RetryConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub retry: RetrySection,
    pub engine: EngineSection,
    pub planner: PlannerSection,
    pub manager: ManagerSection,
    pub interaction: InteractionSection,
    pub tools: ToolsSection,
}

/// [llm] 段：端点、模型、采样参数与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai（任意 OpenAI 兼容端点）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读取 OPENAI_API_KEY
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            temperature: 0.2,
            max_tokens: 4096,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

impl LlmSection {
    /// 配置中的 key，回退到 OPENAI_API_KEY
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 120 }
    }
}

/// [retry] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// 总尝试次数（含首次）
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetrySection {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries, Duration::from_millis(self.base_delay_ms))
    }
}

/// [engine] 段：通用循环的上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_iterations: usize,
    pub max_no_tool_call_retries: u32,
    pub max_parse_failures: u32,
    pub max_final_answer_failures: u32,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            max_no_tool_call_retries: 3,
            max_parse_failures: 3,
            max_final_answer_failures: 3,
        }
    }
}

impl EngineSection {
    pub fn recovery_limits(&self) -> RecoveryLimits {
        RecoveryLimits {
            max_no_tool_call_retries: self.max_no_tool_call_retries,
            max_final_answer_failures: self.max_final_answer_failures,
            max_parse_failures: self.max_parse_failures,
        }
    }
}

/// [planner] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    /// 澄清轮数
    pub max_rounds: usize,
    /// 每轮内最多模型调用次数
    pub max_attempts: usize,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            max_attempts: 3,
        }
    }
}

/// [manager] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerSection {
    pub max_iterations: usize,
    /// 周期性运行的间隔（秒）
    pub poll_interval_secs: u64,
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            poll_interval_secs: 60,
        }
    }
}

/// [interaction] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InteractionSection {
    /// 提问 / 审批无人响应时的超时（秒）
    pub timeout_secs: u64,
}

impl Default for InteractionSection {
    fn default() -> Self {
        Self { timeout_secs: 300 }
    }
}

/// [tools] 段：沙箱根目录、工具超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 沙箱根目录，未设置时用当前目录
    pub workspace_root: Option<PathBuf>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            workspace_root: None,
        }
    }
}

impl ToolsSection {
    pub fn workspace(&self) -> PathBuf {
        self.workspace_root.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}

/// 从 config 目录加载配置，环境变量 CONDUCTOR__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CONDUCTOR__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CONDUCTOR")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.to_retry_config().base_delay, Duration::from_secs(1));
        assert_eq!(cfg.engine.max_iterations, 30);
        assert_eq!(cfg.planner.max_rounds, 5);
        assert_eq!(cfg.manager.max_iterations, 20);
        assert_eq!(cfg.interaction.timeout_secs, 300);
        assert_eq!(cfg.engine.recovery_limits(), RecoveryLimits::default());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[llm]\nmodel = \"deepseek-chat\"\nbase_url = \"https://api.deepseek.com/v1\"\n\n[engine]\nmax_iterations = 12\n\n[planner]\nmax_rounds = 2"
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.llm.model, "deepseek-chat");
        assert_eq!(cfg.llm.base_url.as_deref(), Some("https://api.deepseek.com/v1"));
        assert_eq!(cfg.engine.max_iterations, 12);
        assert_eq!(cfg.engine.max_parse_failures, 3);
        assert_eq!(cfg.planner.max_rounds, 2);
        assert_eq!(cfg.planner.max_attempts, 3);
        assert_eq!(cfg.llm.timeouts.request, 120);
    }
}
