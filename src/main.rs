//! Scout - 自主探索智能体
//!
//! 入口：初始化日志与配置、连接对端、装配决策节点与主状态机并运行。
//! Ctrl-C 触发优雅退出（在途后台知识任务照常 join）。运行以致命错误
//! 结束时打印已有进度摘要并以非零码退出。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use scout::agents::{Analyzer, KnowledgeManager, Planner, Reflector};
use scout::config::load_config;
use scout::core::{Orchestrator, OrchestratorConfig};
use scout::journal::Journal;
use scout::llm::{create_deepseek_client, Reasoner};
use scout::net::{default_noise_patterns, Sanitizer, TcpTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    scout::observability::init();

    let cfg = load_config(None).context("加载配置失败")?;
    info!(host = %cfg.peer.host, port = cfg.peer.port, "Scout 启动");

    // 两个决策后端：快速（逐轮分析）与深思（规划/知识/复盘）
    let fast = Arc::new(create_deepseek_client(
        &cfg.llm.chat_model,
        cfg.llm.base_url.as_deref(),
    ));
    let deliberate = Arc::new(create_deepseek_client(
        &cfg.llm.reasoner_model,
        cfg.llm.base_url.as_deref(),
    ));

    let fast_reasoner = |budget, secs| {
        Reasoner::new(fast.clone(), budget, Duration::from_secs(secs))
    };
    let deliberate_reasoner = |budget, secs| {
        Reasoner::new(deliberate.clone(), budget, Duration::from_secs(secs))
    };

    let analyzer = Analyzer::new(
        fast_reasoner(cfg.llm.retry_budget, cfg.llm.chat_timeout_secs),
        cfg.app.history_window,
    );
    let planner = Planner::new(deliberate_reasoner(
        cfg.llm.retry_budget,
        cfg.llm.reasoner_timeout_secs,
    ));
    let knowledge = KnowledgeManager::new(Arc::new(deliberate_reasoner(
        cfg.llm.retry_budget,
        cfg.llm.reasoner_timeout_secs,
    )));

    let mut noise = default_noise_patterns();
    noise.extend(cfg.observer.noise_patterns.iter().cloned());
    let sanitizer = Sanitizer::new(&noise).context("噪音正则无效")?;

    let transport = TcpTransport::connect(
        &cfg.peer.host,
        cfg.peer.port,
        Duration::from_secs(cfg.peer.connect_timeout_secs),
        Duration::from_secs(cfg.peer.read_timeout_secs),
        Duration::from_secs(cfg.peer.write_timeout_secs),
    )
    .await
    .context("连接对端失败")?;

    let journal = match &cfg.app.journal_dir {
        Some(dir) => Journal::new(dir),
        None => Journal::disabled(),
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("收到 Ctrl-C，准备优雅退出");
                cancel.cancel();
            }
        });
    }

    let orchestrator_cfg: OrchestratorConfig = cfg.app.orchestrator_config();
    let mut orchestrator = Orchestrator::new(
        Box::new(transport),
        sanitizer,
        planner,
        analyzer,
        knowledge,
        journal,
        orchestrator_cfg,
    )
    .with_cancel(cancel);

    if cfg.app.reflection {
        orchestrator = orchestrator.with_reflector(Reflector::new(deliberate_reasoner(
            cfg.llm.retry_budget,
            cfg.llm.reasoner_timeout_secs,
        )));
    }

    match orchestrator.run().await {
        Ok(summary) => {
            println!("{summary}");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "运行以致命错误结束");
            println!("{}", orchestrator.summary());
            Err(e.into())
        }
    }
}
