//! 从模型输出中提取 JSON
//!
//! 模型常把 JSON 包在 ```json ... ``` 里或前后附带说明文字；先取代码块，再取首个 '{' 到最后一个 '}'。

use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;

use crate::core::AgentError;

static FENCED: OnceLock<Option<Regex>> = OnceLock::new();

fn fenced_block() -> Option<&'static Regex> {
    FENCED
        .get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").ok())
        .as_ref()
}

/// 提取 JSON 对象文本片段；找不到 '{' 时返回 None
pub fn extract_json_block(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    let candidate = fenced_block()
        .and_then(|re| re.captures(trimmed))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or(trimmed);

    let start = candidate.find('{')?;
    let end = candidate.rfind('}')?;
    (end > start).then(|| &candidate[start..=end])
}

/// 提取并反序列化
pub fn parse_json_output<T: DeserializeOwned>(output: &str) -> Result<T, AgentError> {
    let block = extract_json_block(output)
        .ok_or_else(|| AgentError::JsonParse(format!("no JSON object in output: {}", preview(output))))?;
    serde_json::from_str(block).map_err(|e| AgentError::JsonParse(format!("{}: {}", e, preview(block))))
}

fn preview(s: &str) -> String {
    let mut p: String = s.chars().take(120).collect();
    if s.chars().count() > 120 {
        p.push_str("...");
    }
    p
}

/// 把 [0,1] 外的值夹回区间；NaN 视为 0
pub fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_extract_plain_object() {
        assert_eq!(extract_json_block(r#"{"a": 1}"#), Some(r#"{"a": 1}"#));
    }

    #[test]
    fn test_extract_fenced_with_prose() {
        let out = "Here you go:\n```json\n{\"intent\": \"search\"}\n```\nHope that helps {really}";
        assert_eq!(extract_json_block(out), Some("{\"intent\": \"search\"}"));
    }

    #[test]
    fn test_extract_surrounded_by_text() {
        let out = "Sure! {\"score\": 0.9} done";
        let v: Value = parse_json_output(out).unwrap();
        assert_eq!(v["score"], 0.9);
    }

    #[test]
    fn test_no_json_is_error() {
        assert!(matches!(
            parse_json_output::<Value>("just words"),
            Err(AgentError::JsonParse(_))
        ));
    }

    #[test]
    fn test_clamp_unit() {
        assert_eq!(clamp_unit(1.7), 1.0);
        assert_eq!(clamp_unit(-0.2), 0.0);
        assert_eq!(clamp_unit(f32::NAN), 0.0);
        assert_eq!(clamp_unit(0.42), 0.42);
    }
}
