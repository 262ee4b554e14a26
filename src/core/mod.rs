//! 核心编排层：错误与恢复、循环阶段、会话监管、人工交互通道

pub mod error;
pub mod interaction;
pub mod recovery;
pub mod session_supervisor;
pub mod state;

pub use error::{AgentError, ErrorDetail, LlmError};
pub use interaction::{
    InteractionKind, InteractionRequest, InteractionResponse, InteractiveDispatcher, InterceptionChannel,
};
pub use recovery::{InvocationCounters, RecoveryAction, RecoveryCoordinator, RecoveryLimits};
pub use session_supervisor::SessionSupervisor;
pub use state::{LoopPhase, PhaseTracker};
