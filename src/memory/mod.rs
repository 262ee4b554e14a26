//! 记忆层：短期（对话状态）、中期（目标 / 笔记 / 委派）、上下文压缩

pub mod compaction;
pub mod conversation;
pub mod working;

pub use compaction::{CompactionOptions, CompactionResult, LlmSummarizer, Summarizer};
pub use conversation::{ConversationState, Message, Role, ToolCallRequest};
pub use working::{Delegation, DelegationStatus, WorkingMemory};
