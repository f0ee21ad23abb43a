//! Scripted LLM 客户端（用于测试，无需 API）
//!
//! 按入队顺序逐条返回预置的回复，并记录每次调用收到的完整提示词，
//! 便于在测试中断言某次决策确实看到了某段上下文。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{ChatMessage, LlmClient, LlmError};

/// 预置回复客户端：每次 complete 弹出一条回复；脚本耗尽时返回 Api 错误
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
    /// 每次调用前的人工延迟（模拟慢后端，用于并发/屏障测试）
    delay: Option<Duration>,
    /// 每次调用收到的提示词（system + user 拼接），供测试断言
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedLlm {
    pub fn new(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            delay: None,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 设定每次调用前的延迟
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 获取提示词记录的共享句柄
    pub fn prompts(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.prompts)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, messages: &[ChatMessage], _json_mode: bool) -> Result<String, LlmError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n---\n");
        self.prompts.lock().unwrap().push(prompt);

        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::Api("脚本回复已耗尽".to_string()))
    }
}
