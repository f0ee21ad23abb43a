//! Orchestrator：主控状态机
//!
//! 状态流转: Planning -> Observing -> Analyzing -> Acting -> Syncing ->
//! {Observing | Planning}。唯一干净的终态是 Planning 处再无剩余阶段。
//!
//! 并发模型：单主控任务 + 每轮恰好一个后台知识任务。后台任务在观察捕获后
//! 立即 spawn（不等待），在 Syncing 处 join 并由主任务提交结果——下一轮的
//! 分析器与随后被调用的规划者因此永远看到一致的最新知识。通过"上一轮句柄
//! 已 join 是 spawn 新句柄的前置条件"保证任一时刻至多一个在途后台任务。
//!
//! 错误策略：连接丢失与规划层彻底失效向上传播终止运行；分析失败降级为
//! 等待、执行计划失败跳过任务、恢复决策失败按跳过处置、后台知识失败保留
//! 旧条目——全部吸收，不中断主循环。

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agents::{Analyzer, AnalyzerAction, KnowledgeManager, Planner, RecoveryDisposition, Reflector};
use crate::core::{AgentError, AgentState, EnvironmentKind, KnowledgeEntry, RunSummary, Task, TaskStatus};
use crate::journal::{Journal, PlannerRecord, TurnRecord};
use crate::net::{PeerTransport, Sanitizer};

/// 主循环参数
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// 单任务尝试轮数上限；达到后本任务被判僵局并交回规划者
    pub stuck_threshold: u32,
    /// 提示词中携带的最近历史轮数
    pub history_window: usize,
    /// 相邻两轮之间的间隔
    pub turn_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stuck_threshold: 50,
            history_window: 50,
            turn_delay: Duration::from_secs(1),
        }
    }
}

/// 在途的后台知识任务（每轮至多一个）
struct KnowledgeJob {
    stage_id: String,
    handle: JoinHandle<Result<KnowledgeEntry, AgentError>>,
}

pub struct Orchestrator {
    transport: Box<dyn PeerTransport>,
    sanitizer: Sanitizer,
    planner: Planner,
    analyzer: Analyzer,
    knowledge: KnowledgeManager,
    reflector: Option<Reflector>,
    journal: Journal,
    cfg: OrchestratorConfig,
    cancel: CancellationToken,
    state: AgentState,
    pending_kb: Option<KnowledgeJob>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Box<dyn PeerTransport>,
        sanitizer: Sanitizer,
        planner: Planner,
        analyzer: Analyzer,
        knowledge: KnowledgeManager,
        journal: Journal,
        cfg: OrchestratorConfig,
    ) -> Self {
        Self {
            transport,
            sanitizer,
            planner,
            analyzer,
            knowledge,
            reflector: None,
            journal,
            cfg,
            cancel: CancellationToken::new(),
            state: AgentState::new(),
            pending_kb: None,
        }
    }

    pub fn with_reflector(mut self, reflector: Reflector) -> Self {
        self.reflector = Some(reflector);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// 当前运行摘要（致命错误退出时由 main 打印）
    pub fn summary(&self) -> RunSummary {
        self.state.summary()
    }

    /// 运行到干净终态（无剩余阶段）、取消、或致命错误
    pub async fn run(&mut self) -> Result<RunSummary, AgentError> {
        info!("主循环启动");
        loop {
            if self.cancel.is_cancelled() {
                info!("收到取消信号，优雅退出");
                self.drain_pending_kb().await;
                break;
            }

            if !self.plan_step().await? {
                info!("规划者判定探索完成");
                break;
            }

            if let Err(e) = self.turn().await {
                // 退出前后台任务必须 join 完成，绝不中途强杀
                self.drain_pending_kb().await;
                return Err(e);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(self.cfg.turn_delay) => {}
            }
        }
        Ok(self.state.summary())
    }

    /// Planning：处置僵局、推进阶段、激活下一个任务。
    ///
    /// 返回 false 表示到达终态（无剩余阶段或非文本环境）。
    async fn plan_step(&mut self) -> Result<bool, AgentError> {
        if self.state.stages.is_empty() {
            let (name, tasks) = Planner::bootstrap_stage();
            let stage_id = self.state.push_stage(name.clone(), tasks);
            info!(%stage_id, %name, "引导阶段建立");
            self.record_planner(&stage_id, "bootstrap", &name);
        }

        loop {
            if self.state.active_task().is_some() {
                return Ok(true);
            }

            if let Some(disposition) = self.handle_stuck_task().await {
                self.apply_disposition(disposition).await;
                continue;
            }

            if self.state.environment == Some(EnvironmentKind::NonText) {
                info!("非文本环境，探索无法继续");
                return Ok(false);
            }

            // 阶段推进：当前阶段任务全部收尾后规划下一阶段
            let stage_done = self
                .state
                .current_stage()
                .map(|s| s.all_tasks_done())
                .unwrap_or(false);
            if stage_done {
                if let Some(stage) = self.state.current_stage_mut() {
                    stage.completed = true;
                }
                let plan = self.planner.next_stage(&self.state).await?;
                if plan.is_mission_complete() {
                    return Ok(false);
                }
                let stage_id = self.state.push_stage(plan.name.clone(), plan.tasks);
                info!(%stage_id, name = %plan.name, "进入新阶段");
                self.record_planner(&stage_id, "new_stage", &plan.name);
                continue;
            }

            let Some(task_id) = self.state.next_task_id() else {
                // 不可达：未收尾的任务只会是 Pending（Active/Stuck 已在上方分支处理），
                // 而空任务列表的阶段已由上面的推进分支消化
                return Ok(false);
            };

            if self.prepare_and_activate(&task_id).await {
                return Ok(true);
            }
        }
    }

    /// 为任务制定执行计划并激活；计划失败时跳过该任务，返回 false
    async fn prepare_and_activate(&mut self, task_id: &str) -> bool {
        let Some(task) = self
            .state
            .current_stage()
            .and_then(|s| s.tasks.iter().find(|t| t.id == task_id))
            .cloned()
        else {
            return false;
        };

        let stage_id = self
            .state
            .current_stage()
            .map(|s| s.id.clone())
            .unwrap_or_default();

        let plan = if let Some(plan) = task.plan.clone() {
            plan
        } else {
            match self.planner.execution_plan(&task, &self.state).await {
                Ok(plan) => {
                    self.record_planner(&stage_id, "execution_plan", &format!("{task_id}: {plan}"));
                    plan
                }
                Err(failure) => {
                    // 任务级升级路径：计划定不出来就跳过该任务，循环不停摆
                    warn!(%task_id, %failure, "执行计划决策不可用，跳过任务");
                    self.record_planner(&stage_id, "escalate_skip", &format!("{task_id}: {failure}"));
                    if let Some(t) = self.find_task_mut(task_id) {
                        t.status = TaskStatus::Skipped;
                        t.result = Some(format!("(规划失败跳过) {failure}"));
                    }
                    return false;
                }
            }
        };

        if let Some(t) = self.find_task_mut(task_id) {
            t.plan = Some(plan);
        }
        self.state.activate_task(task_id);
        info!(%task_id, "任务激活");
        true
    }

    /// 有僵局任务时请规划者给出处置
    async fn handle_stuck_task(&mut self) -> Option<RecoveryDisposition> {
        let task = self
            .state
            .current_stage()?
            .tasks
            .iter()
            .find(|t| t.status == TaskStatus::Stuck)
            .cloned()?;
        let reason = task.result.clone().unwrap_or_else(|| "多轮无进展".to_string());
        Some(self.planner.recover(&task, &reason, &self.state).await)
    }

    async fn apply_disposition(&mut self, disposition: RecoveryDisposition) {
        let Some(task) = self.state.stuck_task_mut() else { return };
        let task_id = task.id.clone();
        let stage_id = self
            .state
            .current_stage()
            .map(|s| s.id.clone())
            .unwrap_or_default();

        let (detail, finished) = {
            let Some(task) = self.state.stuck_task_mut() else { return };
            match disposition {
                RecoveryDisposition::RetrySimplified { description } => {
                    task.description = description.clone();
                    task.status = TaskStatus::Pending;
                    task.attempts = 0;
                    task.plan = None;
                    task.result = None;
                    (format!("retry: {description}"), false)
                }
                RecoveryDisposition::Skip { summary } => {
                    task.status = TaskStatus::Skipped;
                    task.result = Some(summary.clone());
                    (format!("skip: {summary}"), true)
                }
                RecoveryDisposition::PartialAccept { summary } => {
                    task.status = TaskStatus::Completed;
                    task.result = Some(summary.clone());
                    (format!("completed: {summary}"), true)
                }
            }
        };
        self.record_planner(&stage_id, "recovery", &format!("{task_id}: {detail}"));
        if finished {
            self.reflect_on(&task_id).await;
        }
    }

    /// Observing -> Analyzing -> Acting -> Syncing 的一整轮
    async fn turn(&mut self) -> Result<(), AgentError> {
        let Some(task) = self.state.active_task().cloned() else {
            return Ok(());
        };
        let stage_id = self
            .state
            .current_stage()
            .map(|s| s.id.clone())
            .unwrap_or_default();

        // Observing：读超时视为对端静默，照常走完本轮
        let raw = self.transport.receive().await?.unwrap_or_default();
        let clean = self.sanitizer.clean(&raw);
        debug!(task = %task.id, observation = %clean, "观察");

        // 观察捕获后立即启动本轮的后台知识任务（不等待）。
        // 上一轮句柄已在 Syncing 处 join，这里必然无在途任务。
        debug_assert!(self.pending_kb.is_none(), "spawn 前必须无在途后台知识任务");
        if let Some(snap) = KnowledgeManager::snapshot(&self.state, &clean, self.cfg.history_window) {
            self.pending_kb = Some(KnowledgeJob {
                stage_id: snap.stage_id.clone(),
                handle: self.knowledge.spawn_update(snap),
            });
        }

        // Analyzing
        let analysis = self.analyzer.decide(&task, &self.state, &clean).await;
        if let Some(env) = analysis.environment {
            self.state.environment = Some(env);
        }

        // 达到阈值的这一轮：除非分析器明确判定完成，一律转僵局
        let action = if task.attempts >= self.cfg.stuck_threshold
            && !matches!(analysis.action, AnalyzerAction::MarkComplete { .. })
        {
            AnalyzerAction::MarkStuck {
                reason: format!(
                    "连续 {} 轮未完成任务。最后分析: {}",
                    task.attempts, analysis.analysis
                ),
            }
        } else if self.state.environment == Some(EnvironmentKind::NonText) {
            AnalyzerAction::MarkComplete {
                result: "确认是非文本环境，无法继续交互".to_string(),
            }
        } else {
            analysis.action
        };

        // Acting
        let mut sent: Option<String> = None;
        let mut completed = false;
        let mut stuck = false;
        match &action {
            AnalyzerAction::SendInput(payload) => {
                self.transport.send(payload).await?;
                info!(task = %task.id, input = %payload, "发送输入");
                sent = Some(payload.clone());
            }
            AnalyzerAction::Wait => {
                debug!(task = %task.id, "本轮等待观察");
            }
            AnalyzerAction::MarkComplete { result } => {
                info!(task = %task.id, %result, "任务完成");
                completed = true;
                if let Some(t) = self.state.active_task_mut() {
                    t.status = TaskStatus::Completed;
                    t.result = Some(result.clone());
                }
            }
            AnalyzerAction::MarkStuck { reason } => {
                warn!(task = %task.id, %reason, "任务陷入僵局");
                stuck = true;
                if let Some(t) = self.state.active_task_mut() {
                    t.status = TaskStatus::Stuck;
                    t.result = Some(reason.clone());
                }
            }
        }

        // 尝试计数只在非终结轮递增（阈值判断用的是递增前的值）
        if !completed && !stuck {
            if let Some(t) = self.state.active_task_mut() {
                t.attempts += 1;
            }
        }

        self.state.append_turn(crate::core::InteractionTurn {
            task_id: task.id.clone(),
            raw,
            clean: clean.clone(),
            action: sent.clone(),
            timestamp: Utc::now(),
        });

        if let Err(e) = self.journal.record_turn(&TurnRecord {
            timestamp: Utc::now(),
            stage_id,
            task_id: task.id.clone(),
            action: sent,
            completed,
            stuck,
            observation: clean.chars().take(200).collect(),
        }) {
            warn!(error = %e, "轮次落盘失败");
        }

        // Syncing：join 本轮后台任务并在主任务上提交
        self.drain_pending_kb().await;

        if completed {
            self.reflect_on(&task.id).await;
        }
        Ok(())
    }

    /// 同步屏障：等待在途后台知识任务并提交其结果；失败保留旧条目
    async fn drain_pending_kb(&mut self) {
        let Some(job) = self.pending_kb.take() else { return };
        match job.handle.await {
            Ok(Ok(entry)) => {
                if let Err(e) = self.journal.save_knowledge(&entry) {
                    warn!(stage = %entry.stage_id, error = %e, "知识快照落盘失败");
                }
                self.state.commit_knowledge(entry);
            }
            Ok(Err(reason)) => {
                debug!(stage = %job.stage_id, %reason, "保留旧知识条目");
            }
            Err(e) => {
                error!(stage = %job.stage_id, error = %e, "后台知识任务异常退出");
            }
        }
    }

    /// 任务收尾后的复盘（可选增强）
    async fn reflect_on(&mut self, task_id: &str) {
        let Some(reflector) = &self.reflector else { return };
        let Some((task, stage_id)) = self.state.current_stage().and_then(|s| {
            s.tasks
                .iter()
                .find(|t| t.id == task_id)
                .map(|t| (t.clone(), s.id.clone()))
        }) else {
            return;
        };
        let experiences = reflector.reflect(&task, &stage_id, &self.state.history).await;
        if let Err(e) = self.journal.append_experiences(&experiences) {
            warn!(error = %e, "经验落盘失败");
        }
    }

    fn find_task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.state
            .current_stage_mut()?
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
    }

    fn record_planner(&self, stage_id: &str, decision: &str, detail: &str) {
        if let Err(e) = self.journal.record_planner(&PlannerRecord {
            timestamp: Utc::now(),
            stage_id: stage_id.to_string(),
            decision: decision.to_string(),
            detail: detail.to_string(),
        }) {
            warn!(error = %e, "规划决策落盘失败");
        }
    }
}
