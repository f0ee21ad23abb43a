//! Analyzer：逐轮交互决策（快速后端）
//!
//! 输入当前任务与计划、清洗后的观察、全量知识与最近历史，输出一个动作决策。
//! 只返回决策、不直接改共享状态；尝试计数与僵局阈值由 Orchestrator 负责。
//! "无进展"由后端在结构化输出中用显式布尔字段 no_progress 表达，而非从
//! 自由文本推断。

use serde::Deserialize;
use tracing::{info, warn};

use crate::core::{AgentState, EnvironmentKind, Task};
use crate::llm::Reasoner;

/// 分析节点给出的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyzerAction {
    /// 向对端发送一行输入
    SendInput(String),
    /// 本轮不发送，等待下一次观察
    Wait,
    /// 判定当前任务完成
    MarkComplete { result: String },
    /// 判定当前任务无进展（显式僵局信号）
    MarkStuck { reason: String },
}

/// 一次分析的完整产出
#[derive(Debug, Clone)]
pub struct Analysis {
    pub action: AnalyzerAction,
    pub analysis: String,
    /// 阶段1环境识别任务可能给出的环境类型
    pub environment: Option<EnvironmentKind>,
}

/// 后端结构化响应
#[derive(Debug, Deserialize)]
struct AnalyzerResponse {
    analysis: String,
    #[serde(default)]
    next_payload: String,
    #[serde(default)]
    task_completed: bool,
    #[serde(default)]
    task_result: String,
    #[serde(default)]
    no_progress: bool,
    #[serde(default)]
    stuck_reason: String,
    #[serde(default)]
    environment_type: Option<String>,
}

/// 分析器：持有快速后端的决策适配器与历史窗口大小
pub struct Analyzer {
    reasoner: Reasoner,
    history_window: usize,
}

impl Analyzer {
    pub fn new(reasoner: Reasoner, history_window: usize) -> Self {
        Self {
            reasoner,
            history_window,
        }
    }

    /// 决定下一步动作。
    ///
    /// 决策后端彻底失效（重试预算用尽）时降级为等待观察——该失败会被
    /// Orchestrator 计入尝试次数，不中断主循环。
    pub async fn decide(&self, task: &Task, state: &AgentState, observation: &str) -> Analysis {
        let system = self.build_system_prompt(task, state, observation);
        let user = format!(
            "服务器说：{observation}。根据任务 [{}]，你的下一步行动是什么？",
            task.id
        );

        let response: AnalyzerResponse = match self
            .reasoner
            .decide(&system, &user, |r: &AnalyzerResponse| {
                if r.analysis.trim().is_empty() {
                    Err("analysis 字段不能为空".to_string())
                } else {
                    Ok(())
                }
            })
            .await
        {
            Ok(r) => r,
            Err(failure) => {
                warn!(task = %task.id, %failure, "分析决策不可用，降级为等待观察");
                return Analysis {
                    action: AnalyzerAction::Wait,
                    analysis: format!("分析决策不可用: {failure}"),
                    environment: None,
                };
            }
        };

        let environment = response
            .environment_type
            .as_deref()
            .filter(|s| !s.is_empty() && *s != "null")
            .and_then(EnvironmentKind::parse);
        if let Some(env) = environment {
            info!(task = %task.id, %env, "识别环境类型");
        }

        let action = if response.task_completed {
            AnalyzerAction::MarkComplete {
                result: non_empty_or(&response.task_result, &response.analysis),
            }
        } else if response.no_progress {
            AnalyzerAction::MarkStuck {
                reason: non_empty_or(&response.stuck_reason, &response.analysis),
            }
        } else if response.next_payload.is_empty() {
            AnalyzerAction::Wait
        } else {
            AnalyzerAction::SendInput(response.next_payload.clone())
        };

        Analysis {
            action,
            analysis: response.analysis,
            environment,
        }
    }

    fn build_system_prompt(&self, task: &Task, state: &AgentState, observation: &str) -> String {
        let stage = state.current_stage();
        let (stage_id, stage_name) = stage
            .map(|s| (s.id.as_str(), s.name.as_str()))
            .unwrap_or(("?", "未知"));
        let plan = task.plan.as_deref().unwrap_or("无特定计划");

        format!(
            "你是一个自主智能体，正在通过 Socket 连接与远程服务器交互。\n\
             \n\
             当前阶段: {stage_id} - {stage_name}\n\
             当前任务 [{task_id}]: {task_desc}\n\
             执行计划: {plan}\n\
             本任务已尝试轮数: {attempts}\n\
             \n\
             当前知识库:\n{kb}\n\
             \n\
             交互历史 (Client -> Server):\n{history}\n\
             \n\
             服务器的最后输出是：\"{observation}\"\n\
             \n\
             你的任务：\n\
             1. 分析服务器的响应，判断它与当前任务的关系。注意有些输出并非输入的直接响应，可能是服务器的自然输出或者是之前输入的延迟响应，需要仔细辨别。\n\
             2. 根据执行计划，决定下一步应该发送什么命令。当陷入困境时，查看帮助系统。\n\
             3. 判断当前任务是否已经完成（有足够信息得出结论）。\n\
             4. 如果多轮尝试都没有取得任何实质进展，明确给出 no_progress=true 并说明原因。\n\
             5. 如果任务涉及环境识别，给出环境类型。\n\
             \n\
             严格以 JSON 格式输出：\n\
             {{\n\
                 \"analysis\": \"你的详细分析...\",\n\
                 \"next_payload\": \"下一步要发送的具体字符串；决定等待时留空\",\n\
                 \"task_completed\": true/false,\n\
                 \"task_result\": \"如果任务完成，简要总结结果；否则为空\",\n\
                 \"no_progress\": true/false,\n\
                 \"stuck_reason\": \"如果 no_progress 为 true，说明僵局原因与已取得的部分成果；否则为空\",\n\
                 \"environment_type\": \"如果识别了环境类型填写(mud/shell/chat/llm_qa/bbs/other/non_text)，否则填 null\"\n\
             }}",
            task_id = task.id,
            task_desc = task.description,
            attempts = task.attempts,
            kb = state.knowledge_block(),
            history = state.recent_history_block(self.history_window),
        )
    }
}

fn non_empty_or(primary: &str, fallback: &str) -> String {
    if primary.trim().is_empty() {
        fallback.to_string()
    } else {
        primary.to_string()
    }
}
