//! Conductor - 工具调用编排引擎
//!
//! 模块划分：
//! - **agent**: 组件装配与执行型 agent（final_answer 交付）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、恢复协调、循环阶段、会话监管、人工交互通道
//! - **llm**: 传输层抽象、请求执行器（重试 / 超时 / 取消）、OpenAI 兼容实现与 Mock
//! - **memory**: 对话状态、工作记忆、上下文压缩
//! - **observability**: tracing 初始化
//! - **react**: 通用工具调用循环、Planner、Manager
//! - **tools**: 工具定义、参数校验、注册表与执行器

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;
