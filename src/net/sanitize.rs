//! 输出清洗（Observer）
//!
//! 把对端原始输出还原为干净文本：剥离 ANSI 转义序列、不可打印控制字符
//! （Telnet 协商残留）以及配置的已知噪音行。纯函数：同一配置下结果确定。

use regex::Regex;

use crate::core::AgentError;

/// 默认噪音行模式（来自实际环境中观察到的干扰输出）
pub fn default_noise_patterns() -> Vec<String> {
    vec![
        // 服务端编译告警行
        r"(?m)^.*编译时段错误.*line \d+: Warning: Unu.*$".to_string(),
        // Telnet 协商残留的乱码行
        r"(?m)^.*VF\*Z.*$".to_string(),
    ]
}

/// 文本清洗器：ANSI 正则 + 噪音行正则集合
#[derive(Debug)]
pub struct Sanitizer {
    ansi: Regex,
    noise: Vec<Regex>,
}

impl Sanitizer {
    pub fn new(noise_patterns: &[String]) -> Result<Self, AgentError> {
        let ansi = Regex::new(r"\x1B(?:[@-Z\\\-_]|\[[0-?]*[ -/]*[@-~])")
            .map_err(|e| AgentError::Config(format!("ANSI 正则编译失败: {e}")))?;
        let noise = noise_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| AgentError::Config(format!("噪音模式 {p:?} 编译失败: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { ansi, noise })
    }

    /// 清洗一段原始输出
    pub fn clean(&self, raw: &str) -> String {
        let no_ansi = self.ansi.replace_all(raw, "");

        // 去除不可打印字符，保留换行
        let mut printable: String = no_ansi
            .chars()
            .filter(|&ch| ch == '\n' || (ch as u32 >= 32 && ch as u32 != 127))
            .collect();

        for pattern in &self.noise {
            printable = pattern.replace_all(&printable, "").into_owned();
        }

        printable.trim().to_string()
    }
}
