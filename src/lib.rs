//! Scout - Rust 自主探索智能体
//!
//! 连接一个远程的行式文本服务（MUD、Shell、聊天系统等），在无人监督下
//! 规划阶段与任务、逐轮交互并沉淀知识。
//!
//! 模块划分：
//! - **agents**: Planner（深思后端）、Analyzer（快速后端）、KnowledgeManager（后台知识整理）、Reflector（任务复盘）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 数据模型（Stage/Task/KnowledgeEntry/InteractionTurn）与主状态机 Orchestrator
//! - **journal**: 持久化落盘（逐轮记录、规划记录、阶段知识、经验）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Scripted）与 Reasoner 校验重试适配器
//! - **net**: 对端 Socket 传输与输出清洗
//! - **observability**: 日志初始化

pub mod agents;
pub mod config;
pub mod core;
pub mod journal;
pub mod llm;
pub mod net;
pub mod observability;
