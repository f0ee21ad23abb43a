//! 持久化落盘
//!
//! 四类产物，全部位于可配置的 journal 目录下：
//! - turns.jsonl: 每轮一条记录（任务、动作、完成/僵局标志）
//! - planner.jsonl: 每次规划者决策一条记录
//! - knowledge/<stage_id>.json: 各阶段当前知识快照（整体替换）
//! - experiences.json: 任务复盘沉淀的经验列表（追加）
//!
//! 磁盘格式不属于核心契约；写入失败由调用方记日志并继续，不中断主循环。

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::Experience;
use crate::core::KnowledgeEntry;

/// 每轮交互的落盘记录
#[derive(Debug, Serialize, Deserialize)]
pub struct TurnRecord {
    pub timestamp: DateTime<Utc>,
    pub stage_id: String,
    pub task_id: String,
    pub action: Option<String>,
    pub completed: bool,
    pub stuck: bool,
    /// 观察内容截断预览
    pub observation: String,
}

/// 每次规划者决策的落盘记录
#[derive(Debug, Serialize, Deserialize)]
pub struct PlannerRecord {
    pub timestamp: DateTime<Utc>,
    pub stage_id: String,
    /// 决策种类：bootstrap / new_stage / execution_plan / recovery / escalate_skip
    pub decision: String,
    pub detail: String,
}

/// 文件日志：root 为 None 时全部操作为 no-op（测试或禁用场景）
#[derive(Debug, Clone)]
pub struct Journal {
    root: Option<PathBuf>,
}

impl Journal {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { root: None }
    }

    pub fn record_turn(&self, record: &TurnRecord) -> anyhow::Result<()> {
        self.append_jsonl("turns.jsonl", record)
    }

    pub fn record_planner(&self, record: &PlannerRecord) -> anyhow::Result<()> {
        self.append_jsonl("planner.jsonl", record)
    }

    /// 保存一个阶段的知识快照（整体覆盖写）
    pub fn save_knowledge(&self, entry: &KnowledgeEntry) -> anyhow::Result<()> {
        let Some(root) = &self.root else { return Ok(()) };
        let dir = root.join("knowledge");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", entry.stage_id));
        std::fs::write(path, serde_json::to_string_pretty(entry)?)?;
        Ok(())
    }

    /// 读取一个阶段已保存的知识快照；不存在时返回 None
    pub fn load_knowledge(&self, stage_id: &str) -> anyhow::Result<Option<KnowledgeEntry>> {
        let Some(root) = &self.root else { return Ok(None) };
        let path = root.join("knowledge").join(format!("{stage_id}.json"));
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    /// 追加经验到 experiences.json（读-改-写）
    pub fn append_experiences(&self, items: &[Experience]) -> anyhow::Result<()> {
        let Some(root) = &self.root else { return Ok(()) };
        if items.is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(root)?;
        let path = root.join("experiences.json");
        let mut all: Vec<Experience> = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            Vec::new()
        };
        all.extend(items.iter().cloned());
        std::fs::write(path, serde_json::to_string_pretty(&all)?)?;
        Ok(())
    }

    fn append_jsonl<T: Serialize>(&self, file: &str, record: &T) -> anyhow::Result<()> {
        let Some(root) = &self.root else { return Ok(()) };
        std::fs::create_dir_all(root)?;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(root.join(file))?;
        writeln!(f, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }
}
