pub mod echo;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod schema;
pub mod validator;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use filesystem::{ListFilesTool, ReadFileTool, SafeFs};
pub use registry::{parse_args, Tool, ToolDispatcher, ToolOutcome, ToolRegistry};
pub use schema::{ParamType, ParameterSchema, PropertySchema, ToolDefinition};
pub use validator::{sanitize_tool_name, validate, ToolCallValidator, ValidatedCall, ValidationFailure, Verdict};
