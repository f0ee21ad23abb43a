//! Knowledge Manager：后台知识更新（深思后端）
//!
//! 每轮交互捕获观察后，主循环用只读快照 spawn 一个后台任务；同步屏障处
//! join 回来的结果在主任务上提交。知识条目以阶段为单位整体替换：后端每次
//! 输出的都是该阶段知识的完整新版本，没有增量合并，读者永远看到一致文档。
//! 后台任务失败只保留旧条目，不影响主循环。

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::{AgentError, AgentState, KnowledgeEntry};
use crate::llm::Reasoner;

/// 后台任务的只读输入快照；与共享状态完全解耦
#[derive(Debug, Clone)]
pub struct KnowledgeSnapshot {
    pub stage_id: String,
    pub stage_name: String,
    pub tasks_summary: String,
    pub prior: Option<KnowledgeEntry>,
    pub recent_turns: String,
    pub latest_observation: String,
}

#[derive(Debug, Deserialize)]
struct KnowledgeResponse {
    #[serde(default)]
    kb_focus: String,
    #[serde(default)]
    reasoning: String,
    knowledge: String,
}

/// 知识管理节点；Clone 后可移入后台任务
#[derive(Clone)]
pub struct KnowledgeManager {
    reasoner: Arc<Reasoner>,
}

impl KnowledgeManager {
    pub fn new(reasoner: Arc<Reasoner>) -> Self {
        Self { reasoner }
    }

    /// 从当前状态提取本轮的只读快照
    pub fn snapshot(state: &AgentState, latest_observation: &str, history_window: usize) -> Option<KnowledgeSnapshot> {
        let stage = state.current_stage()?;
        let tasks_summary = stage
            .tasks
            .iter()
            .map(|t| format!("- [{}] {} ({})", t.id, t.description, t.status))
            .collect::<Vec<_>>()
            .join("\n");
        Some(KnowledgeSnapshot {
            stage_id: stage.id.clone(),
            stage_name: stage.name.clone(),
            tasks_summary,
            prior: state.knowledge_for(&stage.id).cloned(),
            recent_turns: state.recent_history_block(history_window),
            latest_observation: latest_observation.to_string(),
        })
    }

    /// 基于快照产出该阶段知识的完整新版本。
    ///
    /// 新信息不足时后端会原样复述已有知识，内容不变；Err 由调用方记日志
    /// 并保留旧条目。
    pub async fn update(&self, snap: KnowledgeSnapshot) -> Result<KnowledgeEntry, AgentError> {
        let prior_content = snap
            .prior
            .as_ref()
            .map(|e| e.content.as_str())
            .unwrap_or("（尚无知识，这是第一次整理）");
        let system = format!(
            "你是一个知识管理员。你的职责是维护当前探索阶段的知识文档。\n\
             \n\
             当前阶段: {stage_id} - {stage_name}\n\
             阶段任务列表:\n{tasks}\n\
             \n\
             该阶段已有的知识文档:\n{prior}\n\
             \n\
             最近的交互历史:\n{turns}\n\
             \n\
             本轮服务器最新输出:\n{obs}\n\
             \n\
             请输出该阶段知识文档的完整新版本：\n\
             - 整合新观察中有价值的信息（命令、规则、环境结构、已验证的事实）。\n\
             - 保留已有知识中仍然有效的内容，修正被新观察推翻的内容。\n\
             - 如果本轮没有新信息，原样输出已有文档即可，不要无中生有。\n\
             - 输出的是完整文档，不是增量补丁。\n\
             \n\
             严格以 JSON 格式输出：\n\
             {{\n\
                 \"kb_focus\": \"本次更新关注的要点\",\n\
                 \"reasoning\": \"取舍理由\",\n\
                 \"knowledge\": \"该阶段知识文档的完整新版本...\"\n\
             }}",
            stage_id = snap.stage_id,
            stage_name = snap.stage_name,
            tasks = snap.tasks_summary,
            prior = prior_content,
            turns = snap.recent_turns,
            obs = snap.latest_observation,
        );

        let response: KnowledgeResponse = self
            .reasoner
            .decide(&system, "请更新本阶段的知识文档。", |r: &KnowledgeResponse| {
                if r.knowledge.trim().is_empty() {
                    Err("knowledge 不能为空".to_string())
                } else {
                    Ok(())
                }
            })
            .await
            .map_err(|failure| AgentError::KnowledgeManager(failure.to_string()))?;

        debug!(stage = %snap.stage_id, focus = %response.kb_focus, reasoning = %response.reasoning, "知识更新完成");

        Ok(KnowledgeEntry {
            stage_id: snap.stage_id,
            content: response.knowledge,
            updated_at: Utc::now(),
        })
    }

    /// 在后台任务中运行一次更新；调用方在同步屏障处 join
    pub fn spawn_update(&self, snap: KnowledgeSnapshot) -> JoinHandle<Result<KnowledgeEntry, AgentError>> {
        let manager = self.clone();
        let stage_id = snap.stage_id.clone();
        tokio::spawn(async move {
            let result = manager.update(snap).await;
            if let Err(reason) = &result {
                warn!(stage = %stage_id, %reason, "后台知识更新失败，保留旧条目");
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Task;
    use crate::llm::ScriptedLlm;
    use std::time::Duration;

    fn manager(llm: ScriptedLlm) -> KnowledgeManager {
        KnowledgeManager::new(Arc::new(Reasoner::new(
            Arc::new(llm),
            3,
            Duration::from_secs(5),
        )))
    }

    fn state() -> AgentState {
        let mut state = AgentState::new();
        state.push_stage("环境识别", vec![Task::new("S1-T1", "观察输出")]);
        state
    }

    #[tokio::test]
    async fn test_update_produces_full_entry() {
        let m = manager(ScriptedLlm::new([
            r#"{"kb_focus": "欢迎信息", "reasoning": "首轮观察", "knowledge": "服务器是中文 MUD，入口提示输入名字。"}"#,
        ]));
        let snap = KnowledgeManager::snapshot(&state(), "请输入名字:", 10).unwrap();
        let entry = m.update(snap).await.unwrap();
        assert_eq!(entry.stage_id, "S1");
        assert!(entry.content.contains("MUD"));
    }

    #[tokio::test]
    async fn test_no_new_info_keeps_content_identical() {
        // 后端原样复述已有文档：整体替换后内容不变（更新是幂等的）
        let existing = "已知：这是中文 MUD。";
        let m = manager(ScriptedLlm::new([format!(
            r#"{{"kb_focus": "无新信息", "reasoning": "本轮无进展", "knowledge": "{existing}"}}"#
        )]));
        let mut s = state();
        s.commit_knowledge(KnowledgeEntry {
            stage_id: "S1".into(),
            content: existing.into(),
            updated_at: Utc::now(),
        });
        let snap = KnowledgeManager::snapshot(&s, "", 10).unwrap();
        let entry = m.update(snap).await.unwrap();
        assert_eq!(entry.content, existing);
    }

    #[tokio::test]
    async fn test_backend_failure_surfaces_as_knowledge_error() {
        let m = manager(ScriptedLlm::new(["bad", "bad", "bad"]));
        let snap = KnowledgeManager::snapshot(&state(), "x", 10).unwrap();
        let err = m.update(snap).await.unwrap_err();
        assert!(matches!(err, AgentError::KnowledgeManager(_)));
    }

    #[tokio::test]
    async fn test_spawned_update_joins_with_result() {
        let m = manager(ScriptedLlm::new([
            r#"{"knowledge": "后台整理的知识"}"#,
        ]));
        let snap = KnowledgeManager::snapshot(&state(), "obs", 10).unwrap();
        let handle = m.spawn_update(snap);
        let entry = handle.await.unwrap().unwrap();
        assert_eq!(entry.content, "后台整理的知识");
    }
}
