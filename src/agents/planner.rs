//! Planner：阶段任务制定、执行计划与僵局处置（深思后端）
//!
//! 独立于交互循环之外，只在任务切换 / 阶段推进 / 僵局恢复时被调用。
//! 阶段1是固定的引导任务（环境识别）；此后每个阶段的任务列表与名称由
//! 深思后端在同一个响应中给出。决策后端失效时按升级策略处理：任务级
//! 失败跳过推进，阶段级失败终止运行——绝不死锁。

use serde::Deserialize;
use tracing::{info, warn};

use crate::core::{AgentError, AgentState, Task};
use crate::llm::{DecisionFailure, Reasoner};

/// 新阶段规划产物；tasks 为空表示规划者判定探索目标已全部达成
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub name: String,
    pub tasks: Vec<Task>,
}

impl StagePlan {
    pub fn is_mission_complete(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// 僵局任务的恢复处置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDisposition {
    /// 简化重试：改写任务描述、清零尝试计数、重新排队
    RetrySimplified { description: String },
    /// 跳过（非关键任务或环境不支持）
    Skip { summary: String },
    /// 部分接受：核心目标其实已达成，标记完成
    PartialAccept { summary: String },
}

#[derive(Debug, Deserialize)]
struct NextStageResponse {
    stage_name: String,
    #[serde(default)]
    status_summary: String,
    #[serde(default)]
    gap_analysis: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    mission_complete: bool,
    #[serde(default)]
    tasks: Vec<TaskSeed>,
}

#[derive(Debug, Deserialize)]
struct TaskSeed {
    #[serde(default)]
    id: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct PlanResponse {
    plan: String,
}

#[derive(Debug, Deserialize)]
struct RecoveryResponse {
    action: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    new_description: String,
    #[serde(default)]
    result_summary: String,
}

/// 规划者：持有深思后端的决策适配器
pub struct Planner {
    reasoner: Reasoner,
}

impl Planner {
    pub fn new(reasoner: Reasoner) -> Self {
        Self { reasoner }
    }

    /// 阶段1固定引导任务：先确认文本环境，再识别环境类型
    pub fn bootstrap_stage() -> (String, Vec<Task>) {
        let tasks = vec![
            Task::new(
                "S1-T1",
                "观察服务器的初始输出，判断这个socket连接是否基于文本的交互环境。\
                 如果收到二进制数据或无法解码的内容，则判定为非文本环境。",
            ),
            Task::new(
                "S1-T2",
                "如果确认是文本环境，进一步分析这是什么类型的交互环境。\
                 可能的类型包括：文字MUD游戏、聊天系统、Linux Shell、\
                 大模型问答接口、BBS论坛、或其他类型。\
                 根据文本的格式、提示符、欢迎信息等特征进行判断。",
            ),
        ];
        ("环境识别".to_string(), tasks)
    }

    /// 为下一个阶段制定名称与任务列表。
    ///
    /// 规划层没有可用的升级路径：深思后端在此处彻底失效即终止运行。
    pub async fn next_stage(&self, state: &AgentState) -> Result<StagePlan, AgentError> {
        let next_ordinal = state.stages.len() as u32 + 1;
        let system = format!(
            "你是一个智能规划者。你的职责是根据已完成的工作和已有知识，为新阶段制定合理的任务列表。\n\
             \n\
             环境类型: {env}\n\
             \n\
             已完成的阶段及任务（进度总结）:\n{progress}\n\
             \n\
             当前知识库（已获取的信息）:\n{kb}\n\
             \n\
             你的任务是：\n\
             1. 总结在这个特定的交互环境中，我们已经完成了什么，取得了什么成果。\n\
             2. 分析还有什么重要的目标没有完成。\n\
             3. 基于以上分析，推断第 {ordinal} 阶段应该执行的进阶任务，并为该阶段命名。\n\
             4. 如果探索目标已经全部达成、没有有价值的进阶任务，设置 mission_complete=true 并给出空任务列表。\n\
             \n\
             任务要求：\n\
             - 进阶性：不要重复已完成的任务，要在已有基础上深入。\n\
             - 具体性：任务应该是具体的、可执行的、可验证的。\n\
             - 数量：每个阶段 2-5 个任务为宜。\n\
             \n\
             严格以 JSON 格式输出：\n\
             {{\n\
                 \"stage_name\": \"这个阶段的名称\",\n\
                 \"status_summary\": \"我们已经完成了X，取得了Y...\",\n\
                 \"gap_analysis\": \"还有Z没做...\",\n\
                 \"reasoning\": \"因此本阶段的重点是...\",\n\
                 \"mission_complete\": true/false,\n\
                 \"tasks\": [\n\
                     {{\"id\": \"S{ordinal}-T1\", \"description\": \"任务描述...\"}},\n\
                     {{\"id\": \"S{ordinal}-T2\", \"description\": \"任务描述...\"}}\n\
                 ]\n\
             }}",
            env = state
                .environment
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            progress = completed_stage_block(state),
            kb = state.knowledge_block(),
            ordinal = next_ordinal,
        );

        let response: NextStageResponse = self
            .reasoner
            .decide(
                &system,
                &format!("请为第 {next_ordinal} 阶段制定任务。"),
                |r: &NextStageResponse| {
                    if r.stage_name.trim().is_empty() {
                        return Err("stage_name 不能为空".to_string());
                    }
                    if !r.mission_complete && r.tasks.is_empty() {
                        return Err("未宣告完成时 tasks 不能为空".to_string());
                    }
                    Ok(())
                },
            )
            .await
            .map_err(|failure| AgentError::PlanningExhausted(failure.to_string()))?;

        info!(
            stage = %response.stage_name,
            tasks = response.tasks.len(),
            summary = %response.status_summary,
            gap = %response.gap_analysis,
            reasoning = %response.reasoning,
            "新阶段规划完成"
        );

        let tasks = if response.mission_complete {
            Vec::new()
        } else {
            response
                .tasks
                .into_iter()
                .enumerate()
                .map(|(i, seed)| {
                    let id = if seed.id.trim().is_empty() {
                        format!("S{next_ordinal}-T{}", i + 1)
                    } else {
                        seed.id
                    };
                    Task::new(id, seed.description)
                })
                .collect()
        };

        Ok(StagePlan {
            name: response.stage_name,
            tasks,
        })
    }

    /// 为具体任务制定执行计划（不依赖当轮服务器输出，由规划者提前制定）
    pub async fn execution_plan(
        &self,
        task: &Task,
        state: &AgentState,
    ) -> Result<String, DecisionFailure> {
        let (stage_id, stage_name) = state
            .current_stage()
            .map(|s| (s.id.as_str(), s.name.as_str()))
            .unwrap_or(("?", "未知"));
        let system = format!(
            "你是一个任务规划专家。请为以下任务制定一个具体的执行计划。\n\
             \n\
             当前阶段: {stage_id} - {stage_name}\n\
             任务: {desc}\n\
             \n\
             知识库:\n{kb}\n\
             \n\
             请制定一个简明的执行计划，说明分析节点应该关注什么、期望什么结果、如何判断任务完成。\n\
             \n\
             严格以 JSON 格式输出：\n\
             {{\"plan\": \"具体的执行计划描述...\"}}",
            desc = task.description,
            kb = state.knowledge_block(),
        );

        let response: PlanResponse = self
            .reasoner
            .decide(
                &system,
                &format!("请为任务 {} 制定执行计划。", task.id),
                |r: &PlanResponse| {
                    if r.plan.trim().is_empty() {
                        Err("plan 不能为空".to_string())
                    } else {
                        Ok(())
                    }
                },
            )
            .await?;

        Ok(response.plan)
    }

    /// 为僵局任务给出处置。后端失效时保守跳过，保证循环永不因此停摆。
    pub async fn recover(
        &self,
        task: &Task,
        stuck_reason: &str,
        state: &AgentState,
    ) -> RecoveryDisposition {
        let stage_id = state
            .current_stage()
            .map(|s| s.id.as_str())
            .unwrap_or("?");
        let system = format!(
            "你是一个项目经理。当前阶段（{stage_id}）的一个任务陷入了僵局，分析节点经过多次尝试仍无法完成。\n\
             请根据情况决定如何处理该任务。\n\
             \n\
             任务信息:\n\
             ID: {id}\n\
             描述: {desc}\n\
             原计划: {plan}\n\
             \n\
             僵局原因 / 当前状态:\n{reason}\n\
             \n\
             相关知识库上下文:\n{kb}\n\
             \n\
             决策选项:\n\
             1. \"skip\": 如果该任务对当前阶段目标不是非做不可，或者环境显然不支持，选择跳过。\n\
             2. \"completed\": 如果虽然报错但核心目标其实已经达成（部分完成），或者僵局原因显示其实已经拿到了想要的信息，标记为完成。\n\
             3. \"retry\": 如果该任务非常关键，必须完成。你需要修改任务描述（简化或换个角度），以便重新尝试。\n\
             \n\
             严格以 JSON 格式输出：\n\
             {{\n\
                 \"action\": \"skip\" | \"completed\" | \"retry\",\n\
                 \"reasoning\": \"决策理由...\",\n\
                 \"new_description\": \"如果选择 retry，请提供修改后的任务描述；否则同原描述\",\n\
                 \"result_summary\": \"如果选择 skip 或 completed，请提供任务结果摘要（基于僵局原因）\"\n\
             }}",
            id = task.id,
            desc = task.description,
            plan = task.plan.as_deref().unwrap_or("无"),
            reason = stuck_reason,
            kb = state.knowledge_block(),
        );

        let response: Result<RecoveryResponse, _> = self
            .reasoner
            .decide(&system, "请决策如何处理僵局任务。", |r: &RecoveryResponse| {
                match r.action.as_str() {
                    "skip" | "completed" => Ok(()),
                    "retry" => {
                        if r.new_description.trim().is_empty() {
                            Err("retry 时必须提供 new_description".to_string())
                        } else {
                            Ok(())
                        }
                    }
                    other => Err(format!("action 必须是 skip/completed/retry，而不是 {other:?}")),
                }
            })
            .await;

        match response {
            Ok(r) => {
                info!(task = %task.id, action = %r.action, reasoning = %r.reasoning, "僵局处置");
                match r.action.as_str() {
                    "retry" => RecoveryDisposition::RetrySimplified {
                        description: r.new_description,
                    },
                    "completed" => RecoveryDisposition::PartialAccept {
                        summary: non_empty_or(&r.result_summary, stuck_reason),
                    },
                    _ => RecoveryDisposition::Skip {
                        summary: non_empty_or(&r.result_summary, stuck_reason),
                    },
                }
            }
            Err(failure) => {
                warn!(task = %task.id, %failure, "僵局处置决策不可用，保守跳过");
                RecoveryDisposition::Skip {
                    summary: format!("(异常跳过) {stuck_reason}"),
                }
            }
        }
    }
}

/// 已完成阶段的进度总结片段
fn completed_stage_block(state: &AgentState) -> String {
    let completed: Vec<_> = state.stages.iter().filter(|s| s.completed).collect();
    if completed.is_empty() {
        return "无（这是第一个需要规划的阶段）".to_string();
    }
    let mut out = String::new();
    for stage in completed {
        out.push_str(&format!("\n### 阶段 {}: {}\n", stage.id, stage.name));
        for task in &stage.tasks {
            let desc: String = task.description.chars().take(80).collect();
            out.push_str(&format!(
                "- [{}] {} ({}): {}\n",
                task.id,
                desc,
                task.status,
                task.result.as_deref().unwrap_or("无"),
            ));
        }
    }
    out
}

fn non_empty_or(primary: &str, fallback: &str) -> String {
    if primary.trim().is_empty() {
        fallback.to_string()
    } else {
        primary.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskStatus;
    use crate::llm::ScriptedLlm;
    use std::sync::Arc;
    use std::time::Duration;

    fn planner(llm: ScriptedLlm) -> Planner {
        Planner::new(Reasoner::new(Arc::new(llm), 3, Duration::from_secs(5)))
    }

    #[test]
    fn test_bootstrap_stage_shape() {
        let (name, tasks) = Planner::bootstrap_stage();
        assert_eq!(name, "环境识别");
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));
    }

    #[tokio::test]
    async fn test_next_stage_parses_tasks() {
        let p = planner(ScriptedLlm::new([
            r#"{"stage_name": "登录与基础命令", "tasks": [{"id": "S2-T1", "description": "创建角色"}, {"description": "尝试 help"}]}"#,
        ]));
        let plan = p.next_stage(&AgentState::new()).await.unwrap();
        assert_eq!(plan.name, "登录与基础命令");
        assert_eq!(plan.tasks.len(), 2);
        // 缺失 id 时按序补齐
        assert_eq!(plan.tasks[1].id, "S1-T2");
        assert!(!plan.is_mission_complete());
    }

    #[tokio::test]
    async fn test_next_stage_mission_complete() {
        let p = planner(ScriptedLlm::new([
            r#"{"stage_name": "收尾", "mission_complete": true, "tasks": []}"#,
        ]));
        let plan = p.next_stage(&AgentState::new()).await.unwrap();
        assert!(plan.is_mission_complete());
    }

    #[tokio::test]
    async fn test_next_stage_exhaustion_is_fatal() {
        let p = planner(ScriptedLlm::new(["bad", "bad", "bad"]));
        let err = p.next_stage(&AgentState::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::PlanningExhausted(_)));
    }

    #[tokio::test]
    async fn test_recover_retry_resets_description() {
        let p = planner(ScriptedLlm::new([
            r#"{"action": "retry", "new_description": "只尝试 help 命令", "reasoning": "原任务太宽"}"#,
        ]));
        let task = Task::new("S2-T1", "全面探索命令系统");
        let disp = p.recover(&task, "多轮无进展", &AgentState::new()).await;
        assert_eq!(
            disp,
            RecoveryDisposition::RetrySimplified {
                description: "只尝试 help 命令".into()
            }
        );
    }

    #[tokio::test]
    async fn test_recover_falls_back_to_skip_on_failure() {
        let p = planner(ScriptedLlm::new(["bad", "bad", "bad"]));
        let task = Task::new("S2-T1", "探索");
        let disp = p.recover(&task, "原因", &AgentState::new()).await;
        assert!(matches!(disp, RecoveryDisposition::Skip { .. }));
    }
}
