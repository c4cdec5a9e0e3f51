//! `copilot ask`: one grounded question from the command line.
//!
//! The answer text goes to stdout, followed by the numbered sources it may
//! cite. Citation warnings go to stderr so stdout stays the answer.

use anyhow::Result;
use futures::StreamExt;
use std::io::Write;

use research_copilot_core::models::EvidenceItem;
use research_copilot_core::stream::{StreamEvent, StreamState};

use crate::app::build_copilot;
use crate::config::Config;

const PREVIEW_CHARS: usize = 240;

pub async fn run_ask(config: &Config, question: &str, top_k: Option<usize>, stream: bool) -> Result<()> {
    if question.trim().is_empty() {
        anyhow::bail!("question must not be empty");
    }
    let copilot = build_copilot(config).await?;

    if stream {
        return run_streamed(&copilot, question, top_k).await;
    }

    let response = copilot.ask(question, None, top_k).await?;
    let answer = &response.answer;

    println!("{}", answer.text().trim_end());
    println!();
    print_sources(answer.evidence());
    println!("status: {}", answer.status());
    if let Some(warning) = answer.warning() {
        eprintln!("warning: {}", warning);
    }
    Ok(())
}

async fn run_streamed(
    copilot: &research_copilot_core::Copilot,
    question: &str,
    top_k: Option<usize>,
) -> Result<()> {
    let mut events = copilot.ask_stream(question, None, top_k).await?;
    let mut evidence: Vec<EvidenceItem> = Vec::new();
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Evidence(items) => evidence = items,
            StreamEvent::Delta(text) => {
                print!("{}", text);
                stdout.flush()?;
            }
            StreamEvent::Terminal(outcome) => {
                println!();
                println!();
                print_sources(&evidence);
                println!("status: {}", outcome.state.name());
                match outcome.state {
                    StreamState::CompleteWithWarning { invalid } if invalid.is_empty() => {
                        eprintln!("warning: answer cites no evidence");
                    }
                    StreamState::CompleteWithWarning { invalid } => {
                        eprintln!("warning: answer cites unknown sources {:?}", invalid);
                    }
                    StreamState::Failed { reason } => {
                        anyhow::bail!("stream failed: {}", reason);
                    }
                    StreamState::Complete | StreamState::Streaming => {}
                }
            }
        }
    }
    Ok(())
}

fn print_sources(evidence: &[EvidenceItem]) {
    if evidence.is_empty() {
        return;
    }
    println!("Sources:");
    for item in evidence {
        match item.chunk.page {
            Some(page) => println!(
                "  [{}] {} | page {} [{:.2}]",
                item.rank, item.chunk.source, page, item.score
            ),
            None => println!("  [{}] {} [{:.2}]", item.rank, item.chunk.source, item.score),
        }
        println!(
            "      \"{}\"",
            item.preview(PREVIEW_CHARS).replace('\n', " ").trim()
        );
    }
    println!();
}
