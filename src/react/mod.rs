//! 认知层：通用工具调用循环，以及基于它的 Planner 与 Manager

pub mod events;
pub mod loop_;
pub mod manager;
pub mod planner;

pub use events::LoopEvent;
pub use loop_::{
    run_tool_loop, LoopConfig, LoopOutcome, LoopSession, MessageBuilder, MessageMode, TerminalKind, TerminalTool,
    Termination, ToolCallRecord,
};
pub use manager::{Delegate, Manager, ManagerConfig};
pub use planner::{Plan, PlanOutcome, Planner, PlannerConfig};
