//! Reasoner 适配器：结构化决策的校验与有界重试
//!
//! 包装一个 LlmClient：JSON 模式调用 -> 提取 JSON -> serde 解析 -> 业务校验。
//! 任一环节失败则将失败原因写入下一次尝试的上下文再试，最多 retry_budget 次；
//! 用尽后返回类型化失败（Malformed / Timeout），由 Planner/Analyzer 自行升级处置，
//! 不向上抛异常。每次后端调用都带超时。

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

use crate::llm::{ChatMessage, LlmClient};

/// 决策失败（重试预算用尽后的类型化结果）
///
/// 超时与不合规输出混合出现时，按最后一次尝试的失败种类归类；
/// 两种失败走同一条升级路径，种类只影响日志与报错文案。
#[derive(Error, Debug, Clone)]
pub enum DecisionFailure {
    #[error("{attempts} 次尝试后输出仍不合规: {last_error}")]
    Malformed { attempts: usize, last_error: String },

    #[error("{attempts} 次尝试均超时")]
    Timeout { attempts: usize },
}

/// 默认重试预算
pub const DEFAULT_RETRY_BUDGET: usize = 3;

/// 决策适配器：一个后端 + 重试预算 + 单次调用超时
pub struct Reasoner {
    llm: Arc<dyn LlmClient>,
    retry_budget: usize,
    timeout: Duration,
}

impl Reasoner {
    pub fn new(llm: Arc<dyn LlmClient>, retry_budget: usize, timeout: Duration) -> Self {
        Self {
            llm,
            retry_budget: retry_budget.max(1),
            timeout,
        }
    }

    /// 请求一个结构化决策。
    ///
    /// validate 返回 Err(原因) 表示形状合法但内容不可用（如必填字段为空），
    /// 原因同样会反馈进下一次尝试。
    pub async fn decide<T, F>(
        &self,
        system: &str,
        user: &str,
        validate: F,
    ) -> Result<T, DecisionFailure>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> Result<(), String>,
    {
        let mut failures: Vec<String> = Vec::new();
        let mut timed_out_last = false;

        for attempt in 1..=self.retry_budget {
            let mut user_content = user.to_string();
            if !failures.is_empty() {
                // 携带此前失败原因，让后端在重试时修正输出
                user_content.push_str("\n\n此前的输出存在问题，请修正后重新严格按要求输出 JSON：\n");
                for (i, reason) in failures.iter().enumerate() {
                    user_content.push_str(&format!("- 第 {} 次失败: {}\n", i + 1, reason));
                }
            }

            let messages = [ChatMessage::system(system), ChatMessage::user(user_content)];

            let raw = match tokio::time::timeout(self.timeout, self.llm.complete(&messages, true)).await {
                Ok(Ok(raw)) => raw,
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "LLM 调用失败");
                    timed_out_last = false;
                    failures.push(format!("调用失败: {e}"));
                    continue;
                }
                Err(_) => {
                    warn!(attempt, timeout_secs = self.timeout.as_secs(), "LLM 调用超时");
                    timed_out_last = true;
                    failures.push("调用超时".to_string());
                    continue;
                }
            };

            let json_str = match extract_json(&raw) {
                Some(s) => s,
                None => {
                    timed_out_last = false;
                    failures.push(format!("输出中找不到 JSON 对象: {}", preview(&raw)));
                    continue;
                }
            };

            let parsed: T = match serde_json::from_str(json_str) {
                Ok(v) => v,
                Err(e) => {
                    timed_out_last = false;
                    failures.push(format!("JSON 解析失败: {e}"));
                    continue;
                }
            };

            match validate(&parsed) {
                Ok(()) => return Ok(parsed),
                Err(reason) => {
                    timed_out_last = false;
                    failures.push(format!("校验未通过: {reason}"));
                }
            }
        }

        if timed_out_last {
            Err(DecisionFailure::Timeout {
                attempts: self.retry_budget,
            })
        } else {
            Err(DecisionFailure::Malformed {
                attempts: self.retry_budget,
                last_error: failures.last().cloned().unwrap_or_default(),
            })
        }
    }
}

/// 从 LLM 输出中提取 JSON 对象文本（```json 围栏或首个 { 到末个 }）
fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let inner = rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim());
        return Some(inner);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&trimmed[start..=end])
}

fn preview(s: &str) -> String {
    s.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Verdict {
        value: String,
    }

    fn reasoner(llm: ScriptedLlm, budget: usize) -> Reasoner {
        Reasoner::new(Arc::new(llm), budget, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_valid_on_first_attempt() {
        let r = reasoner(ScriptedLlm::new([r#"{"value": "ok"}"#]), 3);
        let verdict: Verdict = r.decide("sys", "user", |_| Ok(())).await.unwrap();
        assert_eq!(verdict.value, "ok");
    }

    #[tokio::test]
    async fn test_recovers_within_budget() {
        // retry_budget - 1 次无效输出后跟一次有效输出：应返回有效结果
        let r = reasoner(
            ScriptedLlm::new(["not json", "{broken", r#"{"value": "late"}"#]),
            3,
        );
        let verdict: Verdict = r.decide("sys", "user", |_| Ok(())).await.unwrap();
        assert_eq!(verdict.value, "late");
    }

    #[tokio::test]
    async fn test_exhausts_after_exactly_budget_attempts() {
        let llm = ScriptedLlm::new(["bad", "bad", "bad", "bad", "bad"]);
        let r = Reasoner::new(Arc::new(llm), 3, Duration::from_secs(5));
        let result: Result<Verdict, _> = r.decide("sys", "user", |_| Ok(())).await;
        match result {
            Err(DecisionFailure::Malformed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failure_reason_fed_back() {
        let llm = ScriptedLlm::new(["oops", r#"{"value": "fixed"}"#]);
        let prompts = llm.prompts();
        let r = reasoner(llm, 3);
        let verdict: Verdict = r.decide("sys", "user", |_| Ok(())).await.unwrap();
        assert_eq!(verdict.value, "fixed");
        let recorded = prompts.lock().unwrap();
        assert_eq!(recorded.len(), 2);
        // 第二次调用的提示词必须携带第一次的失败原因
        assert!(recorded[1].contains("第 1 次失败"));
    }

    #[tokio::test]
    async fn test_validator_rejection_counts_as_attempt() {
        let r = reasoner(
            ScriptedLlm::new([r#"{"value": ""}"#, r#"{"value": "filled"}"#]),
            3,
        );
        let verdict: Verdict = r
            .decide("sys", "user", |p: &Verdict| {
                if p.value.is_empty() {
                    Err("value 不能为空".to_string())
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(verdict.value, "filled");
    }

    #[tokio::test]
    async fn test_mixed_failures_classified_by_last_attempt() {
        // 第一次超时、第二次输出不合规：按最后一次归类为 Malformed
        struct SlowThenGarbage {
            calls: std::sync::atomic::AtomicUsize,
        }

        #[async_trait::async_trait]
        impl crate::llm::LlmClient for SlowThenGarbage {
            async fn complete(
                &self,
                _messages: &[crate::llm::ChatMessage],
                _json_mode: bool,
            ) -> Result<String, crate::llm::LlmError> {
                if self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok("too late".to_string())
                } else {
                    Ok("not json".to_string())
                }
            }
        }

        let llm = SlowThenGarbage {
            calls: std::sync::atomic::AtomicUsize::new(0),
        };
        let r = Reasoner::new(Arc::new(llm), 2, Duration::from_millis(5));
        let result: Result<Verdict, _> = r.decide("sys", "user", |_| Ok(())).await;
        match result {
            Err(DecisionFailure::Malformed { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_typed_failure() {
        let llm = ScriptedLlm::new(["never", "never"]).with_delay(Duration::from_millis(50));
        let r = Reasoner::new(Arc::new(llm), 2, Duration::from_millis(5));
        let result: Result<Verdict, _> = r.decide("sys", "user", |_| Ok(())).await;
        match result {
            Err(DecisionFailure::Timeout { attempts }) => assert_eq!(attempts, 2),
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_json_fenced_and_bare() {
        assert_eq!(
            extract_json("```json\n{\"a\": 1}\n```"),
            Some("{\"a\": 1}")
        );
        assert_eq!(extract_json("前缀 {\"a\": 1} 后缀"), Some("{\"a\": 1}"));
        assert_eq!(extract_json("没有对象"), None);
    }
}
