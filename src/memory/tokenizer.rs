//! 分词与关键词打分
//!
//! 中英文混合分词：含 CJK 时用 jieba-rs，纯英文按空白与标点切分。
//! keyword_score 供关键词检索后端与向量后端的降级路径共用。

use std::sync::OnceLock;

use jieba_rs::Jieba;

/// 全局 Jieba 实例（延迟初始化）
static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

/// 判断字符是否为 CJK（中日韩）字符
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}' |
        '\u{3040}'..='\u{309F}' |
        '\u{30A0}'..='\u{30FF}'
    )
}

/// 判断文本是否包含 CJK 字符
pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// 切词（小写，去标点）；不过滤短词
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        get_jieba()
            .cut(text, false)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| s.chars().any(|c| c.is_alphanumeric()))
            .collect()
    } else {
        text.split_whitespace()
            .map(|s| {
                s.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// 是否计入命中：英文词需长于 2 个字符，CJK 词不限
fn is_significant(term: &str) -> bool {
    term.chars().count() > 2 || term.chars().any(is_cjk)
}

/// 关键词重叠分数：命中的有效词数 / 查询总词数，范围 [0, 1]
pub fn keyword_score(query: &str, content: &str) -> f32 {
    let terms = tokenize(query);
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = content.to_lowercase();
    let hits = terms
        .iter()
        .filter(|t| is_significant(t) && haystack.contains(t.as_str()))
        .count();
    hits as f32 / terms.len() as f32
}
