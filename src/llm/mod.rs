//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Scripted）与决策适配器

pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod reasoner;
pub mod traits;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use mock::ScriptedLlm;
pub use openai::OpenAiClient;
pub use reasoner::{DecisionFailure, Reasoner, DEFAULT_RETRY_BUDGET};
pub use traits::{ChatMessage, LlmClient, LlmError, Role};
