//! 命令行输入解析：行首前缀 → 本轮开关或内置命令
//!
//! 前缀可叠加，如 `/voice /as Ada 介绍一下你自己`。
//! 另有等待输入与等待一轮完成时响应中断的两个辅助函数。

use std::future::Future;

use tokio::io::{AsyncBufRead, Lines};
use tokio_util::sync::CancellationToken;

use crate::core::TurnOptions;

/// 一行输入的解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    Message {
        text: String,
        options: TurnOptions,
        /// 边生成边输出
        stream: bool,
    },
    /// 把一段文本加入知识库
    AddDocument { text: String },
    ShowSummary,
    ShowMemory,
    ShowStats,
    Help,
    Quit,
    Empty,
}

pub const HELP: &str = "\
Prefixes (combinable, apply to one message):
  /voice <text>        voice-friendly reply
  /resume <text>       resume mode (professional scope, more context)
  /as <name> <text>    answer as <name>
  /stream <text>       print the reply as it is generated
Commands:
  /add <text>          add a document to the knowledge base
  /summary  /memory  /stats  /help  /quit";

/// 解析一行输入
pub fn parse_line(line: &str) -> CliCommand {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return CliCommand::Empty;
    }
    match trimmed.to_lowercase().as_str() {
        "/quit" | "/exit" | "quit" | "exit" => return CliCommand::Quit,
        "/summary" => return CliCommand::ShowSummary,
        "/memory" => return CliCommand::ShowMemory,
        "/stats" => return CliCommand::ShowStats,
        "/help" => return CliCommand::Help,
        _ => {}
    }
    if let Some(text) = strip_prefix_word(trimmed, "/add") {
        if text.is_empty() {
            return CliCommand::Empty;
        }
        return CliCommand::AddDocument {
            text: text.to_string(),
        };
    }

    let mut options = TurnOptions::default();
    let mut stream = false;
    let mut rest = trimmed;
    loop {
        if let Some(r) = strip_prefix_word(rest, "/stream") {
            stream = true;
            rest = r;
        } else if let Some(r) = strip_prefix_word(rest, "/voice") {
            options.voice_mode = true;
            rest = r;
        } else if let Some(r) = strip_prefix_word(rest, "/resume") {
            options.resume_mode = true;
            rest = r;
        } else if let Some(r) = strip_prefix_word(rest, "/as") {
            let mut parts = r.splitn(2, char::is_whitespace);
            match parts.next().filter(|n| !n.is_empty()) {
                Some(name) => {
                    options.identity = Some(name.to_string());
                    rest = parts.next().unwrap_or("").trim_start();
                }
                None => {
                    rest = r;
                    break;
                }
            }
        } else {
            break;
        }
    }

    if rest.is_empty() {
        return CliCommand::Empty;
    }
    CliCommand::Message {
        text: rest.to_string(),
        options,
        stream,
    }
}

/// 读取下一行；interrupt 先完成（如 Ctrl-C）时按输入结束处理
pub async fn next_input<R, I>(lines: &mut Lines<R>, interrupt: I) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    I: Future<Output = ()>,
{
    tokio::select! {
        line = lines.next_line() => line,
        _ = interrupt => Ok(None),
    }
}

/// 等待一轮完成；interrupt 先完成时取消 cancel 并等这一轮收尾
pub async fn run_cancellable<T, F, I>(turn: F, cancel: &CancellationToken, interrupt: I) -> T
where
    F: Future<Output = T>,
    I: Future<Output = ()>,
{
    tokio::pin!(turn);
    tokio::select! {
        out = &mut turn => out,
        _ = interrupt => {
            cancel.cancel();
            turn.await
        }
    }
}

/// 大小写不敏感地去掉整词前缀；后面必须是空白或行尾
fn strip_prefix_word<'a>(s: &'a str, word: &str) -> Option<&'a str> {
    let head = s.get(..word.len())?;
    if !head.eq_ignore_ascii_case(word) {
        return None;
    }
    let tail = &s[word.len()..];
    if tail.is_empty() || tail.starts_with(char::is_whitespace) {
        Some(tail.trim_start())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(line: &str) -> (String, TurnOptions) {
        match parse_line(line) {
            CliCommand::Message { text, options, .. } => (text, options),
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_message() {
        let (text, options) = message("  Tell me about your projects ");
        assert_eq!(text, "Tell me about your projects");
        assert_eq!(options, TurnOptions::default());
    }

    #[test]
    fn test_stacked_prefixes() {
        let (text, options) = message("/voice /as Ada what do you do?");
        assert_eq!(text, "what do you do?");
        assert!(options.voice_mode);
        assert_eq!(options.identity.as_deref(), Some("Ada"));
        assert!(!options.resume_mode);
    }

    #[test]
    fn test_resume_prefix() {
        let (text, options) = message("/RESUME summarize my backend work");
        assert!(options.resume_mode);
        assert_eq!(text, "summarize my backend work");
    }

    #[test]
    fn test_commands() {
        assert_eq!(parse_line("/quit"), CliCommand::Quit);
        assert_eq!(parse_line("exit"), CliCommand::Quit);
        assert_eq!(parse_line("/summary"), CliCommand::ShowSummary);
        assert_eq!(parse_line("/memory"), CliCommand::ShowMemory);
        assert_eq!(parse_line("   "), CliCommand::Empty);
        assert_eq!(parse_line("/voice"), CliCommand::Empty);
    }

    #[test]
    fn test_stream_prefix_and_add_command() {
        match parse_line("/stream /voice hi there") {
            CliCommand::Message { text, options, stream } => {
                assert!(stream);
                assert!(options.voice_mode);
                assert_eq!(text, "hi there");
            }
            other => panic!("expected message, got {:?}", other),
        }
        assert!(matches!(parse_line("hi"), CliCommand::Message { stream: false, .. }));
        assert_eq!(
            parse_line("/add I maintain a Kubernetes operator"),
            CliCommand::AddDocument {
                text: "I maintain a Kubernetes operator".to_string()
            }
        );
        assert_eq!(parse_line("/add"), CliCommand::Empty);
    }

    #[tokio::test]
    async fn test_next_input_reads_lines() {
        use tokio::io::AsyncBufReadExt;

        let mut lines = tokio::io::BufReader::new(&b"hello\n"[..]).lines();
        let line = next_input(&mut lines, std::future::pending()).await.unwrap();
        assert_eq!(line.as_deref(), Some("hello"));
        assert_eq!(next_input(&mut lines, std::future::pending()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_interrupt_at_idle_prompt_ends_input() {
        use tokio::io::AsyncBufReadExt;

        // 写端保持打开：读端一直等不到输入
        let (reader, _writer) = tokio::io::duplex(64);
        let mut lines = tokio::io::BufReader::new(reader).lines();
        let line = next_input(&mut lines, std::future::ready(())).await.unwrap();
        assert_eq!(line, None);
    }

    #[tokio::test]
    async fn test_interrupt_cancels_running_turn() {
        let cancel = CancellationToken::new();
        let watched = cancel.clone();
        let turn = async move {
            watched.cancelled().await;
            "cancelled"
        };
        let out = run_cancellable(turn, &cancel, std::future::ready(())).await;
        assert_eq!(out, "cancelled");
        assert!(cancel.is_cancelled());

        let quiet = CancellationToken::new();
        let out = run_cancellable(async { "done" }, &quiet, std::future::pending()).await;
        assert_eq!(out, "done");
        assert!(!quiet.is_cancelled());
    }

    #[test]
    fn test_prefix_must_be_whole_word() {
        let (text, options) = message("/voiceover is a word");
        assert_eq!(text, "/voiceover is a word");
        assert!(!options.voice_mode);
    }
}
