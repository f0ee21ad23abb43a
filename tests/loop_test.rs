//! 主循环集成测试
//!
//! 全部决策节点用 ScriptedLlm 脚本化，传输用 ScriptedTransport，
//! 端到端验证状态机流转、僵局升级、同步屏障与落盘。

use std::sync::Arc;
use std::time::Duration;

use scout::agents::{Analyzer, KnowledgeManager, Planner};
use scout::core::{Orchestrator, OrchestratorConfig, TaskStatus};
use scout::journal::Journal;
use scout::llm::{Reasoner, ScriptedLlm};
use scout::net::{Sanitizer, ScriptedTransport};

fn reasoner(llm: ScriptedLlm) -> Reasoner {
    Reasoner::new(Arc::new(llm), 3, Duration::from_secs(5))
}

fn cfg(stuck_threshold: u32) -> OrchestratorConfig {
    OrchestratorConfig {
        stuck_threshold,
        history_window: 10,
        turn_delay: Duration::ZERO,
    }
}

fn build(
    transport: ScriptedTransport,
    planner_llm: ScriptedLlm,
    analyzer_llm: ScriptedLlm,
    kb_llm: ScriptedLlm,
    journal: Journal,
    cfg: OrchestratorConfig,
) -> Orchestrator {
    Orchestrator::new(
        Box::new(transport),
        Sanitizer::new(&[]).unwrap(),
        Planner::new(reasoner(planner_llm)),
        Analyzer::new(reasoner(analyzer_llm), 10),
        KnowledgeManager::new(Arc::new(reasoner(kb_llm))),
        journal,
        cfg,
    )
}

/// 端到端：登录提示 -> 发送名字 -> 识别 MUD -> 第二阶段打招呼 -> 收尾
#[tokio::test]
async fn test_say_hello_scenario() {
    let transport = ScriptedTransport::new([
        "\u{1b}[1m欢迎来到迷雾城\u{1b}[0m\n请输入名字:",
        "你好，scout！你现在在城门口。",
        "城门口。出口：北、东。门卫站在这里。",
        "你对门卫说：hello",
        "门卫说：你好，旅行者。",
    ]);
    let sent = transport.sent();

    let planner_llm = ScriptedLlm::new([
        // S1-T1 / S1-T2 的执行计划
        r#"{"plan": "观察初始输出，确认是否文本环境"}"#,
        r#"{"plan": "根据横幅与提示符判断环境类型"}"#,
        // 第二阶段
        r#"{"stage_name": "基础互动", "status_summary": "已识别环境", "tasks": [{"id": "S2-T1", "description": "向环境中的角色打招呼并观察反应"}]}"#,
        r#"{"plan": "发送 say hello 并确认有回应"}"#,
        // 收尾
        r#"{"stage_name": "收尾", "mission_complete": true, "tasks": []}"#,
    ]);
    let analyzer_llm = ScriptedLlm::new([
        r#"{"analysis": "中文欢迎语与输入提示，先提交名字", "next_payload": "scout"}"#,
        r#"{"analysis": "登录成功，确认文本环境", "task_completed": true, "task_result": "文本环境"}"#,
        r#"{"analysis": "描述房间与出口，MUD 特征明显", "task_completed": true, "task_result": "确认为 MUD", "environment_type": "mud"}"#,
        r#"{"analysis": "门卫在场，打招呼", "next_payload": "say hello"}"#,
        r#"{"analysis": "门卫回应了问候", "task_completed": true, "task_result": "打招呼得到回应"}"#,
    ]);
    let kb_llm = ScriptedLlm::new([
        r#"{"knowledge": "入口要求输入名字"}"#,
        r#"{"knowledge": "入口要求输入名字；名字 scout 已接受"}"#,
        r#"{"knowledge": "中文 MUD；入口要求输入名字"}"#,
        r#"{"knowledge": "say <内容> 可以与 NPC 对话"}"#,
        r#"{"knowledge": "say <内容> 可以与 NPC 对话；门卫会回应问候"}"#,
    ]);

    let mut orch = build(
        transport,
        planner_llm,
        analyzer_llm,
        kb_llm,
        Journal::disabled(),
        cfg(50),
    );
    let summary = orch.run().await.unwrap();

    assert_eq!(summary.turns, 5);
    assert_eq!(summary.stages.len(), 2);
    assert!(summary.stages.iter().all(|s| s.completed));
    assert!(summary
        .stages
        .iter()
        .flat_map(|s| &s.tasks)
        .all(|t| t.status == TaskStatus::Completed));
    let sent = sent.lock().unwrap();
    assert_eq!(*sent, vec!["scout".to_string(), "say hello".to_string()]);
    // 第二阶段的知识独立于第一阶段
    assert!(orch.state().knowledge_for("S1").is_some());
    assert!(orch.state().knowledge_for("S2").is_some());
}

/// 僵局升级发生在计数首次到达阈值的那一轮，且该轮不发送输入
#[tokio::test]
async fn test_stuck_routes_at_exact_threshold_turn() {
    let transport = ScriptedTransport::new(["同样的提示符>", "同样的提示符>", "同样的提示符>"]);
    let sent = transport.sent();

    let planner_llm = ScriptedLlm::new([
        r#"{"plan": "尝试交互"}"#,
        r#"{"action": "skip", "result_summary": "无响应环境，跳过"}"#,
        r#"{"plan": "判断类型"}"#,
        r#"{"stage_name": "收尾", "mission_complete": true, "tasks": []}"#,
    ]);
    // 第 3 条决策是非终结的，但那一轮计数已达阈值，必须被覆盖为僵局
    let analyzer_llm = ScriptedLlm::new([
        r#"{"analysis": "试 help", "next_payload": "help"}"#,
        r#"{"analysis": "再试 look", "next_payload": "look"}"#,
        r#"{"analysis": "再试 quit", "next_payload": "quit"}"#,
        r#"{"analysis": "放弃，直接判定", "task_completed": true, "task_result": "other", "environment_type": "other"}"#,
    ]);
    let kb_llm = ScriptedLlm::new([
        r#"{"knowledge": "k1"}"#,
        r#"{"knowledge": "k2"}"#,
        r#"{"knowledge": "k3"}"#,
        r#"{"knowledge": "k4"}"#,
    ]);

    let mut orch = build(
        transport,
        planner_llm,
        analyzer_llm,
        kb_llm,
        Journal::disabled(),
        cfg(2),
    );
    let summary = orch.run().await.unwrap();

    let tasks = &summary.stages[0].tasks;
    assert_eq!(tasks[0].status, TaskStatus::Skipped);
    assert_eq!(tasks[1].status, TaskStatus::Completed);
    // 阈值 2：第 1、2 轮发送，第 3 轮（attempts==2）被覆盖为僵局，quit 未发出
    let sent = sent.lock().unwrap();
    assert_eq!(*sent, vec!["help".to_string(), "look".to_string()]);
}

/// 同步屏障：慢速后台知识任务在下一轮分析之前提交，分析器看到最新知识
#[tokio::test]
async fn test_kb_barrier_commits_before_next_analysis() {
    let transport = ScriptedTransport::new(["第一轮输出", "第二轮输出", "第三轮输出"]);

    let planner_llm = ScriptedLlm::new([
        r#"{"plan": "观察"}"#,
        r#"{"plan": "判断类型"}"#,
        r#"{"stage_name": "收尾", "mission_complete": true, "tasks": []}"#,
    ]);
    let analyzer_llm = ScriptedLlm::new([
        r#"{"analysis": "继续观察", "next_payload": "look"}"#,
        r#"{"analysis": "信息足够", "task_completed": true, "task_result": "完成"}"#,
        r#"{"analysis": "类型确定", "task_completed": true, "task_result": "other", "environment_type": "other"}"#,
    ]);
    let analyzer_prompts = analyzer_llm.prompts();
    // 后台任务刻意放慢：屏障必须等它 join 完再进入下一轮
    let kb_llm = ScriptedLlm::new([
        r#"{"knowledge": "屏障验证标记-第一轮知识"}"#,
        r#"{"knowledge": "第二轮知识"}"#,
        r#"{"knowledge": "第三轮知识"}"#,
    ])
    .with_delay(Duration::from_millis(50));

    let mut orch = build(
        transport,
        planner_llm,
        analyzer_llm,
        kb_llm,
        Journal::disabled(),
        cfg(50),
    );
    orch.run().await.unwrap();

    // 第 2 轮分析器的提示词必须已包含第 1 轮后台任务提交的知识
    let prompts = analyzer_prompts.lock().unwrap();
    assert!(prompts.len() >= 2);
    assert!(prompts[1].contains("屏障验证标记-第一轮知识"));
}

/// 落盘：轮次 JSONL、阶段知识快照与规划记录都写入 journal 目录
#[tokio::test]
async fn test_journal_artifacts_written() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new(["hi"]);

    let planner_llm = ScriptedLlm::new([
        r#"{"plan": "观察"}"#,
        r#"{"plan": "判断"}"#,
        r#"{"stage_name": "收尾", "mission_complete": true, "tasks": []}"#,
    ]);
    let analyzer_llm = ScriptedLlm::new([
        r#"{"analysis": "ok", "task_completed": true, "task_result": "文本环境"}"#,
        r#"{"analysis": "ok", "task_completed": true, "task_result": "chat", "environment_type": "chat"}"#,
    ]);
    let kb_llm = ScriptedLlm::new([
        r#"{"knowledge": "入口知识"}"#,
        r#"{"knowledge": "入口知识 v2"}"#,
    ]);

    let mut orch = build(
        transport,
        planner_llm,
        analyzer_llm,
        kb_llm,
        Journal::new(dir.path()),
        cfg(50),
    );
    orch.run().await.unwrap();

    assert!(dir.path().join("turns.jsonl").exists());
    assert!(dir.path().join("planner.jsonl").exists());
    let kb = std::fs::read_to_string(dir.path().join("knowledge/S1.json")).unwrap();
    assert!(kb.contains("入口知识"));
}
