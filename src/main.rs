//! Conductor 命令行入口
//!
//! 用法：conductor [run|plan|manage] <task...>
//! 提问与审批在终端上回答；Ctrl+C 取消当前会话。

use std::time::Duration;

use anyhow::{bail, Context};
use conductor::agent::{create_agent_components, create_transport_from_config};
use conductor::config::load_config;
use conductor::core::{InteractionKind, InteractionRequest, InteractionResponse, InterceptionChannel};
use conductor::react::{LoopEvent, PlanOutcome};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const USAGE: &str = "usage: conductor [run|plan|manage] <task...>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Run,
    Plan,
    Manage,
}

fn parse_args(args: &[String]) -> anyhow::Result<(Mode, String)> {
    let (mode, rest) = match args.first().map(String::as_str) {
        Some("run") => (Mode::Run, &args[1..]),
        Some("plan") => (Mode::Plan, &args[1..]),
        Some("manage") => (Mode::Manage, &args[1..]),
        Some(_) => (Mode::Run, args),
        None => bail!(USAGE),
    };
    let task = rest.join(" ");
    if task.trim().is_empty() {
        bail!(USAGE);
    }
    Ok((mode, task))
}

/// 在终端上逐个回答提问 / 审批
async fn answer_interactions(channel: InterceptionChannel, mut rx: mpsc::UnboundedReceiver<InteractionRequest>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(request) = rx.recv().await {
        match &request.kind {
            InteractionKind::Question { question, options } => {
                eprintln!("? {}", question);
                if !options.is_empty() {
                    eprintln!("  options: {}", options.join(" / "));
                }
            }
            InteractionKind::Approval { message } => eprintln!("! approve? {} [y/N]", message),
        }
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("failed to read answer: {}", e);
                break;
            }
        };
        let response = match request.kind {
            InteractionKind::Question { .. } => InteractionResponse::Answer(line.trim().to_string()),
            InteractionKind::Approval { .. } => {
                InteractionResponse::Approval(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
            }
        };
        if !channel.resolve(&request.id, response) {
            tracing::debug!(id = %request.id, "interaction already settled");
        }
    }
}

fn log_events(mut rx: mpsc::UnboundedReceiver<LoopEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                LoopEvent::ToolCall { tool, args } => eprintln!("-> {} {}", tool, args),
                LoopEvent::Observation { tool, preview } => eprintln!("<- {}: {}", tool, preview),
                LoopEvent::ToolFailure { tool, reason } => eprintln!("x  {}: {}", tool, reason),
                other => tracing::debug!(?other, "loop event"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    conductor::observability::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (mode, task) = parse_args(&args)?;
    let cfg = load_config(None).context("Failed to load config")?;

    let (channel, requests) = InterceptionChannel::new(Duration::from_secs(cfg.interaction.timeout_secs));
    tokio::spawn(answer_interactions(channel.clone(), requests));

    let transport = create_transport_from_config(&cfg);
    let components = create_agent_components(cfg, transport, Some(channel));

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling...");
            ctrl_c.cancel();
        }
    });

    match mode {
        Mode::Run => {
            let (tx, rx) = mpsc::unbounded_channel();
            log_events(rx);
            let agent = components.executor_agent().with_event_tx(tx);
            let outcome = agent.run(&task, &cancel).await.context("Run failed")?;
            println!("{}", outcome.message);
            tracing::info!(termination = outcome.termination.as_str(), "run finished");
        }
        Mode::Plan => match components.planner().plan(&task, &cancel).await.context("Planning failed")? {
            PlanOutcome::Plan(plan) => {
                println!("{}", plan.summary);
                for (i, step) in plan.steps.iter().enumerate() {
                    println!("{}. {}", i + 1, step);
                }
            }
            PlanOutcome::Direct(reply) => println!("{}", reply),
        },
        Mode::Manage => {
            let (tx, rx) = mpsc::unbounded_channel();
            log_events(rx);
            let manager = components.manager().with_event_tx(tx);
            let cycles = manager
                .run_periodic(&task, &cancel, |outcome| println!("[report] {}", outcome.message))
                .await
                .context("Manager failed")?;
            tracing::info!(cycles, "manager stopped");
        }
    }

    let (prompt, completion, total) = components.usage.get();
    tracing::info!(prompt, completion, total, "token usage");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args_modes() {
        assert_eq!(parse_args(&args(&["plan", "a", "b"])).unwrap(), (Mode::Plan, "a b".to_string()));
        assert_eq!(parse_args(&args(&["manage", "x"])).unwrap().0, Mode::Manage);
        assert_eq!(parse_args(&args(&["hello", "there"])).unwrap(), (Mode::Run, "hello there".to_string()));
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["run"])).is_err());
    }
}
