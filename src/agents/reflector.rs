//! Reflector：任务复盘，沉淀可复用经验
//!
//! 任务收尾（完成/跳过/部分接受）后，从该任务的交互轮次中提炼经验条目，
//! 由 Journal 追加到 experiences.json。复盘是尽力而为的增强：后端失效时
//! 返回空列表并告警，不影响主循环推进。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::{InteractionTurn, Task};
use crate::llm::Reasoner;

/// 一条沉淀的经验
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub summary: String,
    pub lesson: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub task_id: String,
    pub stage_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ReflectionResponse {
    #[serde(default)]
    experiences: Vec<ExperienceSeed>,
}

#[derive(Debug, Deserialize)]
struct ExperienceSeed {
    summary: String,
    lesson: String,
    #[serde(default)]
    tags: Vec<String>,
}

pub struct Reflector {
    reasoner: Reasoner,
}

impl Reflector {
    pub fn new(reasoner: Reasoner) -> Self {
        Self { reasoner }
    }

    /// 复盘一个已收尾的任务，返回提炼出的经验（可能为空）
    pub async fn reflect(
        &self,
        task: &Task,
        stage_id: &str,
        turns: &[InteractionTurn],
    ) -> Vec<Experience> {
        let transcript = turns
            .iter()
            .filter(|t| t.task_id == task.id)
            .map(|t| {
                let out: String = t.clean.chars().take(120).collect();
                match &t.action {
                    Some(a) => format!("In: {a} | Out: {out}"),
                    None => format!("(等待) Out: {out}"),
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        if transcript.is_empty() {
            return Vec::new();
        }

        let system = format!(
            "你是一个复盘专家。以下是一个已结束任务的执行记录，请从中提炼值得沉淀的经验。\n\
             \n\
             任务 [{id}]: {desc}\n\
             最终状态: {status}\n\
             结果: {result}\n\
             \n\
             交互记录:\n{transcript}\n\
             \n\
             提炼标准：\n\
             - 只记录对后续探索有复用价值的经验（有效的命令、环境的规则、踩过的坑）。\n\
             - 每条经验包含事实摘要（summary）和可执行的教训（lesson）。\n\
             - 没有值得沉淀的内容时返回空列表，不要硬凑。\n\
             \n\
             严格以 JSON 格式输出：\n\
             {{\n\
                 \"experiences\": [\n\
                     {{\"summary\": \"事实摘要\", \"lesson\": \"教训\", \"tags\": [\"标签\"]}}\n\
                 ]\n\
             }}",
            id = task.id,
            desc = task.description,
            status = task.status,
            result = task.result.as_deref().unwrap_or("无"),
        );

        match self
            .reasoner
            .decide(&system, "请复盘该任务。", |_: &ReflectionResponse| Ok(()))
            .await
        {
            Ok(response) => {
                let experiences: Vec<Experience> = response
                    .experiences
                    .into_iter()
                    .filter(|s| !s.summary.trim().is_empty())
                    .map(|s| Experience {
                        summary: s.summary,
                        lesson: s.lesson,
                        tags: s.tags,
                        task_id: task.id.clone(),
                        stage_id: stage_id.to_string(),
                        created_at: Utc::now(),
                    })
                    .collect();
                if !experiences.is_empty() {
                    info!(task = %task.id, count = experiences.len(), "复盘沉淀经验");
                }
                experiences
            }
            Err(failure) => {
                warn!(task = %task.id, %failure, "复盘决策不可用，跳过");
                Vec::new()
            }
        }
    }
}
