//! 数据模型：阶段 / 任务 / 知识条目 / 交互轮次 / 全局状态
//!
//! AgentState 由主循环独占持有并显式传递；后台知识任务只拿到只读快照，
//! 永远不会持有共享状态的活句柄。

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Active,
    Completed,
    Stuck,
    Skipped,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::Completed => "completed",
            TaskStatus::Stuck => "stuck",
            TaskStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// 一个阶段内的工作单元
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    /// 当前激活期内已消耗的轮数；仅在 Active 状态下递增
    pub attempts: u32,
    /// 规划者制定的执行计划（自由格式结构化文本）
    pub plan: Option<String>,
    /// 完成结果 / 跳过或僵局原因摘要
    pub result: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            attempts: 0,
            plan: None,
            result: None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Skipped)
    }
}

/// 探索的一个有序阶段；只会被标记完成，从不删除
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    pub ordinal: u32,
    pub name: String,
    pub completed: bool,
    pub tasks: Vec<Task>,
}

impl Stage {
    /// 所有任务均已收尾；没有任务的阶段视为已收尾（可直接推进）
    pub fn all_tasks_done(&self) -> bool {
        self.tasks.iter().all(Task::is_done)
    }
}

/// 一个阶段的当前知识快照；整体替换，读者永远看到完整的一致版本
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub stage_id: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

/// 一次交互轮次的记录；只追加，创建后不再修改
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InteractionTurn {
    pub task_id: String,
    pub raw: String,
    pub clean: String,
    /// 本轮发送的输入；None 表示分析节点决定等待观察
    pub action: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// 已识别的交互环境类型（阶段1产物）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    Mud,
    Shell,
    Chat,
    LlmQa,
    Bbs,
    Other,
    NonText,
}

impl EnvironmentKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mud" => Some(Self::Mud),
            "shell" => Some(Self::Shell),
            "chat" => Some(Self::Chat),
            "llm_qa" => Some(Self::LlmQa),
            "bbs" => Some(Self::Bbs),
            "other" => Some(Self::Other),
            "non_text" => Some(Self::NonText),
            _ => None,
        }
    }
}

impl fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Mud => "mud",
            Self::Shell => "shell",
            Self::Chat => "chat",
            Self::LlmQa => "llm_qa",
            Self::Bbs => "bbs",
            Self::Other => "other",
            Self::NonText => "non_text",
        };
        write!(f, "{s}")
    }
}

/// 进程级全局状态：阶段注册表 + 知识映射 + 交互历史 + 环境类型
#[derive(Debug, Default)]
pub struct AgentState {
    pub stages: Vec<Stage>,
    pub knowledge: BTreeMap<String, KnowledgeEntry>,
    pub history: Vec<InteractionTurn>,
    pub environment: Option<EnvironmentKind>,
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加新阶段并返回其 id；序号与 id 由注册表统一编制（S1、S2 ...）
    pub fn push_stage(&mut self, name: impl Into<String>, tasks: Vec<Task>) -> String {
        let ordinal = self.stages.len() as u32 + 1;
        let id = format!("S{ordinal}");
        self.stages.push(Stage {
            id: id.clone(),
            ordinal,
            name: name.into(),
            completed: false,
            tasks,
        });
        id
    }

    /// 当前阶段 = 最后一个阶段（任一时刻恰有一个当前阶段）
    pub fn current_stage(&self) -> Option<&Stage> {
        self.stages.last()
    }

    pub fn current_stage_mut(&mut self) -> Option<&mut Stage> {
        self.stages.last_mut()
    }

    /// 当前激活的任务（全局至多一个）
    pub fn active_task(&self) -> Option<&Task> {
        self.current_stage()?
            .tasks
            .iter()
            .find(|t| t.status == TaskStatus::Active)
    }

    pub fn active_task_mut(&mut self) -> Option<&mut Task> {
        self.current_stage_mut()?
            .tasks
            .iter_mut()
            .find(|t| t.status == TaskStatus::Active)
    }

    /// 当前阶段中被判定僵局、等待规划者处置的任务
    pub fn stuck_task_mut(&mut self) -> Option<&mut Task> {
        self.current_stage_mut()?
            .tasks
            .iter_mut()
            .find(|t| t.status == TaskStatus::Stuck)
    }

    /// 下一个待执行任务：优先残留的 Active（如上次运行被打断），其次首个 Pending
    pub fn next_task_id(&self) -> Option<String> {
        let stage = self.current_stage()?;
        stage
            .tasks
            .iter()
            .find(|t| t.status == TaskStatus::Active)
            .or_else(|| stage.tasks.iter().find(|t| t.status == TaskStatus::Pending))
            .map(|t| t.id.clone())
    }

    /// 激活任务：置 Active、清零尝试计数。同一时刻至多一个 Active。
    pub fn activate_task(&mut self, task_id: &str) -> Option<&Task> {
        debug_assert!(
            self.active_task().map(|t| t.id.as_str()) == Some(task_id)
                || self.active_task().is_none(),
            "激活新任务前不得有其它 Active 任务"
        );
        let stage = self.current_stage_mut()?;
        let task = stage.tasks.iter_mut().find(|t| t.id == task_id)?;
        task.status = TaskStatus::Active;
        task.attempts = 0;
        Some(task)
    }

    /// 提交知识条目：同 stage 的旧条目被整体替换
    pub fn commit_knowledge(&mut self, entry: KnowledgeEntry) {
        self.knowledge.insert(entry.stage_id.clone(), entry);
    }

    pub fn knowledge_for(&self, stage_id: &str) -> Option<&KnowledgeEntry> {
        self.knowledge.get(stage_id)
    }

    pub fn append_turn(&mut self, turn: InteractionTurn) {
        self.history.push(turn);
    }

    /// 最近 n 轮交互
    pub fn recent_turns(&self, n: usize) -> &[InteractionTurn] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }

    /// 最近历史的提示词片段（Client -> Server 视角）
    pub fn recent_history_block(&self, n: usize) -> String {
        let turns = self.recent_turns(n);
        if turns.is_empty() {
            return "暂无。".to_string();
        }
        turns
            .iter()
            .map(|t| {
                let out: String = t.clean.chars().take(50).collect();
                match &t.action {
                    Some(a) => format!("In: {a} | Out: {out}..."),
                    None => format!("(等待) Out: {out}..."),
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// 全量知识的提示词片段：历史阶段 + 当前阶段的全部知识快照
    pub fn knowledge_block(&self) -> String {
        if self.knowledge.is_empty() {
            return "暂无。".to_string();
        }
        let mut out = String::new();
        for stage in &self.stages {
            if let Some(entry) = self.knowledge.get(&stage.id) {
                out.push_str(&format!("### 阶段 {}（{}）\n{}\n", stage.id, stage.name, entry.content));
            }
        }
        if out.is_empty() {
            "暂无。".to_string()
        } else {
            out
        }
    }

    /// 阶段/任务完成情况摘要（运行结束或致命错误时输出）
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            stages: self
                .stages
                .iter()
                .map(|s| StageSummary {
                    id: s.id.clone(),
                    name: s.name.clone(),
                    completed: s.completed,
                    tasks: s
                        .tasks
                        .iter()
                        .map(|t| TaskSummary {
                            id: t.id.clone(),
                            description: t.description.chars().take(60).collect(),
                            status: t.status,
                            result: t.result.clone(),
                        })
                        .collect(),
                })
                .collect(),
            turns: self.history.len(),
        }
    }
}

/// 运行摘要（用于退出时的用户可见总结）
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub stages: Vec<StageSummary>,
    pub turns: usize,
}

#[derive(Debug, Serialize)]
pub struct StageSummary {
    pub id: String,
    pub name: String,
    pub completed: bool,
    pub tasks: Vec<TaskSummary>,
}

#[derive(Debug, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub result: Option<String>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== 运行摘要（共 {} 轮交互）===", self.turns)?;
        for stage in &self.stages {
            let mark = if stage.completed { "✓" } else { " " };
            writeln!(f, "[{mark}] 阶段 {} - {}", stage.id, stage.name)?;
            for task in &stage.tasks {
                writeln!(
                    f,
                    "    [{}] {} ({})",
                    task.id,
                    task.description,
                    task.status
                )?;
                if let Some(result) = &task.result {
                    writeln!(f, "        结果: {result}")?;
                }
            }
        }
        Ok(())
    }
}
