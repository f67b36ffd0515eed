//! Companion 命令行入口：初始化日志、构建编排器，逐行读取 stdin 并回复
//!
//! 用法：companion [config.toml]；Ctrl-C 取消正在处理的一轮，空闲时 Ctrl-C 退出。

use std::path::PathBuf;

use anyhow::Context;
use companion::cli::{next_input, parse_line, run_cancellable, CliCommand, HELP};
use companion::core::{create_orchestrator, AgentError, PipelineResponse};
use companion::rag::Document;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

fn render(result: Result<PipelineResponse, AgentError>, streamed: bool) -> String {
    match result {
        Ok(response) => {
            let mut out = if streamed {
                "\n".to_string()
            } else {
                format!("{}\n", response.text)
            };
            if response.metadata.is_degraded() {
                tracing::debug!(degradations = ?response.metadata.degradations, "degraded reply");
            }
            if response.metadata.error {
                out.push_str("(the reply above is a fallback; the model could not be reached)\n");
            }
            out
        }
        Err(AgentError::Cancelled) => "\n(cancelled)\n".to_string(),
        Err(e) => format!("error: {}\n", e),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    companion::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let orchestrator = create_orchestrator(config_path)
        .await
        .context("Failed to build orchestrator")?;

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    stdout
        .write_all(b"companion ready. /help for commands.\n> ")
        .await?;
    stdout.flush().await?;

    while let Some(line) = next_input(&mut lines, interrupted())
        .await
        .context("Failed to read stdin")?
    {
        let output = match parse_line(&line) {
            CliCommand::Quit => break,
            CliCommand::Empty => String::new(),
            CliCommand::Help => format!("{}\n", HELP),
            CliCommand::ShowSummary => match orchestrator.conversation_summary().await {
                Some(s) => format!("{}\n", s),
                None => "(no summary yet)\n".to_string(),
            },
            CliCommand::ShowMemory => {
                let insights = orchestrator.memory_insights().await;
                format!("{}\n", serde_json::to_string_pretty(&insights)?)
            }
            CliCommand::ShowStats => {
                let stats = orchestrator.backend_stats().await;
                let session = orchestrator.session_metadata().await;
                format!(
                    "backends: {}\n{}\n{}\n",
                    orchestrator.backend_chain().join(" -> "),
                    serde_json::to_string_pretty(&stats)?,
                    serde_json::to_string_pretty(&session)?
                )
            }
            CliCommand::AddDocument { text } => {
                let doc = Document::new(uuid::Uuid::new_v4().to_string(), text).with_source("cli");
                if orchestrator.add_documents(vec![doc]).await {
                    "(added)\n".to_string()
                } else {
                    "(could not add document)\n".to_string()
                }
            }
            CliCommand::Message {
                text,
                options,
                stream: false,
            } => {
                let cancel = CancellationToken::new();
                let turn = orchestrator.process_message(&text, options, cancel.clone());
                render(run_cancellable(turn, &cancel, interrupted()).await, false)
            }
            CliCommand::Message {
                text,
                options,
                stream: true,
            } => {
                let cancel = CancellationToken::new();
                let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                let printer = tokio::spawn(async move {
                    let mut out = tokio::io::stdout();
                    while let Some(piece) = rx.recv().await {
                        out.write_all(piece.as_bytes()).await?;
                        out.flush().await?;
                    }
                    Ok::<_, std::io::Error>(())
                });
                let turn = orchestrator.process_message_stream(&text, options, cancel.clone(), tx);
                let result = run_cancellable(turn, &cancel, interrupted()).await;
                printer.await.context("stream printer panicked")??;
                render(result, true)
            }
        };
        stdout.write_all(output.as_bytes()).await?;
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
    }

    orchestrator.wait_for_background().await;
    Ok(())
}
