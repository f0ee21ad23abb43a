//! Agent 错误类型
//!
//! 只有连接错误与规划层决策彻底失效会终止整个运行；其余错误被吸收为
//! 任务/阶段层面的状态转移（见 Orchestrator）。

use thiserror::Error;

/// 运行级错误（会向 main 传播）与可吸收错误的统一类型
#[derive(Error, Debug)]
pub enum AgentError {
    /// 对端连接丢失/拒绝：当前运行致命，核心不做重连
    #[error("连接错误: {0}")]
    Transport(String),

    /// 规划后端在升级路径用尽后仍无法给出可用决策：运行终止
    #[error("规划决策不可用: {0}")]
    PlanningExhausted(String),

    /// 后台知识管理任务失败或超时：提交点保留旧知识条目，不中断主循环
    #[error("知识管理失败: {0}")]
    KnowledgeManager(String),

    #[error("配置错误: {0}")]
    Config(String),
}
