//! 决策节点：规划者 / 分析器 / 知识管理员 / 复盘器

pub mod analyzer;
pub mod knowledge;
pub mod planner;
pub mod reflector;

pub use analyzer::{Analysis, Analyzer, AnalyzerAction};
pub use knowledge::{KnowledgeManager, KnowledgeSnapshot};
pub use planner::{Planner, RecoveryDisposition, StagePlan};
pub use reflector::{Experience, Reflector};
