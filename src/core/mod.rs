//! 核心：错误类型、数据模型与主控状态机

pub mod error;
pub mod orchestrator;
pub mod state;

pub use error::AgentError;
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use state::{
    AgentState, EnvironmentKind, InteractionTurn, KnowledgeEntry, RunSummary, Stage, StageSummary,
    Task, TaskStatus, TaskSummary,
};
