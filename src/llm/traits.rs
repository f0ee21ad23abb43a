//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Scripted）实现 LlmClient。
//! json_mode 为 true 时要求后端启用 JSON 输出约束（response_format）。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// LLM 调用错误
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("API 调用失败: {0}")]
    Api(String),

    #[error("后端返回空内容")]
    Empty,
}

/// LLM 客户端 trait：单次非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], json_mode: bool) -> Result<String, LlmError>;
}
