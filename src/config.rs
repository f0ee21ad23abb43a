//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SCOUT__*` 覆盖（双下划线表示
//! 嵌套，如 `SCOUT__PEER__HOST=example.com`）。API Key 不进配置文件，
//! 只从 DEEPSEEK_API_KEY 环境变量读取。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::OrchestratorConfig;
use crate::llm::{DEEPSEEK_CHAT, DEEPSEEK_REASONER, DEFAULT_RETRY_BUDGET};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub peer: PeerSection,
    pub observer: ObserverSection,
    pub llm: LlmSection,
}

/// [app] 段：落盘目录与主循环参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// 落盘根目录，未设置时禁用持久化
    pub journal_dir: Option<PathBuf>,
    /// 提示词中携带的最近历史轮数
    pub history_window: usize,
    /// 相邻两轮之间的间隔（毫秒）
    pub turn_delay_ms: u64,
    /// 单任务尝试轮数上限
    pub stuck_threshold: u32,
    /// 是否启用任务复盘（经验沉淀）
    pub reflection: bool,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            journal_dir: Some(PathBuf::from("journal")),
            history_window: 50,
            turn_delay_ms: 1000,
            stuck_threshold: 50,
            reflection: true,
        }
    }
}

impl AppSection {
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            stuck_threshold: self.stuck_threshold,
            history_window: self.history_window,
            turn_delay: Duration::from_millis(self.turn_delay_ms),
        }
    }
}

/// [peer] 段：目标服务地址与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeerSection {
    pub host: String,
    pub port: u16,
    /// 建连超时（秒）
    pub connect_timeout_secs: u64,
    /// 单轮读窗口（秒）；窗口内无输出视为对端静默
    pub read_timeout_secs: u64,
    /// 单次写超时（秒）；超时视为连接丢失
    pub write_timeout_secs: u64,
}

impl Default for PeerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
            connect_timeout_secs: 10,
            read_timeout_secs: 8,
            write_timeout_secs: 10,
        }
    }
}

/// [observer] 段：输出清洗
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ObserverSection {
    /// 额外的噪音行正则（叠加在内置规则之上）
    pub noise_patterns: Vec<String>,
}

/// [llm] 段：决策后端与重试预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 快速后端模型（逐轮分析）
    pub chat_model: String,
    /// 深思后端模型（规划/知识/复盘）
    pub reasoner_model: String,
    /// 自定义 OpenAI 兼容端点；未设置时用 DeepSeek 官方端点
    pub base_url: Option<String>,
    /// 结构化决策的重试预算
    pub retry_budget: usize,
    /// 快速后端单次调用超时（秒）
    pub chat_timeout_secs: u64,
    /// 深思后端单次调用超时（秒）
    pub reasoner_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            chat_model: DEEPSEEK_CHAT.to_string(),
            reasoner_model: DEEPSEEK_REASONER.to_string(),
            base_url: None,
            retry_budget: DEFAULT_RETRY_BUDGET,
            chat_timeout_secs: 60,
            reasoner_timeout_secs: 180,
        }
    }
}

/// 从 config 目录加载配置，环境变量 SCOUT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SCOUT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SCOUT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.stuck_threshold, 50);
        assert_eq!(cfg.llm.retry_budget, 3);
        assert_eq!(cfg.peer.port, 4000);
        assert!(cfg.app.journal_dir.is_some());
    }

    #[test]
    fn test_orchestrator_config_mapping() {
        let mut section = AppSection::default();
        section.turn_delay_ms = 250;
        section.stuck_threshold = 7;
        let oc = section.orchestrator_config();
        assert_eq!(oc.turn_delay, Duration::from_millis(250));
        assert_eq!(oc.stuck_threshold, 7);
    }
}
